use rusqlite::ErrorCode;

/// Top-level metadb error type.
///
/// All fallible operations in `metadb-core` return [`Result<T, MetadbError>`](Result).
/// Each variant wraps a domain-specific error enum, so callers can match on
/// the error source and ask for its [`FailureClass`].
#[derive(thiserror::Error, Debug)]
pub enum MetadbError {
    /// Error from the metadata store (`SQLite` operations, migrations).
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The input record is malformed or fails validation.
    #[error("Graph error: {0}")]
    Graph(#[from] metadb_graph::GraphError),

    /// Error while driving an ingestion (id remapping, retries).
    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    /// Error in configuration parsing or validation.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The downstream notifier could not be set up or used.
    #[error("Notify error: {0}")]
    Notify(String),
}

/// How the ingestion path should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureClass {
    /// Bad input. Never retried, nothing written.
    Input,
    /// Storage hiccup. The whole record is retried from a clean transaction.
    Transient,
    /// Anything else. Aborted without retry.
    Fatal,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }
}

impl MetadbError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Graph(_) | Self::Config(_) => FailureClass::Input,
            Self::Store(e) => e.class(),
            Self::Ingest(e) => e.class(),
            Self::Notify(_) => FailureClass::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

/// Errors from the SQLite-backed metadata store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Underlying `SQLite` operation failed.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema migration failed (version mismatch or DDL error).
    #[error("Migration failed: {0}")]
    Migration(String),

    /// JSON serialization/deserialization of metadata failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The connection is closed or otherwise unusable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A statement that must yield a row yielded none.
    #[error("Missing row: {0}")]
    MissingRow(String),
}

impl StoreError {
    /// Classify by driver error code rather than by error type.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Unavailable(_) => FailureClass::Transient,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => match err.code {
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure => FailureClass::Transient,
                _ => FailureClass::Fatal,
            },
            Self::Sqlite(_) | Self::Migration(_) | Self::Serialization(_) | Self::MissingRow(_) => {
                FailureClass::Fatal
            }
        }
    }
}

/// Errors raised by the ingestion path itself.
#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    /// An arc endpoint has no store id after the callable batch was written.
    #[error("Local id {0} has no store id")]
    UnmappedLocalId(u64),

    /// Every attempt failed with a transient error.
    #[error("Gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<MetadbError>,
    },
}

impl IngestError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::UnmappedLocalId(_) => FailureClass::Fatal,
            Self::RetriesExhausted { .. } => FailureClass::Transient,
        }
    }
}

/// Errors in metadb configuration parsing and validation.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The configuration file does not exist at the expected path.
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Configuration values are present but semantically invalid.
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// Configuration file syntax could not be parsed (TOML error).
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Convenience alias for `Result<T, MetadbError>`.
pub type Result<T> = std::result::Result<T, MetadbError>;
