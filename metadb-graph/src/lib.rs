pub mod callgraph;
pub mod uri;
pub mod validate;

pub use callgraph::{ChaType, Constraint, Dependency, ExtendedCallGraph, LocalId};
pub use uri::{EntityKind, FastenUri, UriError};
pub use validate::{ArcRejection, ArcReport, ValidatedGraph, validate};

/// Error type for call-graph parsing and validation.
///
/// Every variant is an input error: retrying the same record cannot succeed.
#[derive(thiserror::Error, Debug)]
pub enum GraphError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Record is not a JSON object")]
    NotAnObject,

    #[error("Missing or empty required field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid URI '{uri}': {source}")]
    InvalidUri {
        uri: String,
        #[source]
        source: UriError,
    },

    #[error("Invalid version constraint '{0}'")]
    InvalidConstraint(String),

    #[error("Invalid local id '{0}'")]
    InvalidLocalId(String),

    #[error("Local id {0} is defined more than once")]
    DuplicateLocalId(LocalId),
}

pub type Result<T> = std::result::Result<T, GraphError>;
