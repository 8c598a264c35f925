use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Typed ID wrappers ──────────────────────────────────────────────

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

typed_id!(PackageId);
typed_id!(PackageVersionId);
typed_id!(ModuleId);
typed_id!(FileId);
typed_id!(CallableId);

/// Metadata documents are JSON objects.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Convert a millisecond epoch timestamp into a UTC datetime.
pub fn timestamp_from_millis(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.and_then(DateTime::from_timestamp_millis)
}

// ── Write-side rows ────────────────────────────────────────────────

/// Unset optional fields never overwrite values already stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPackage {
    pub package_name: String,
    pub forge: String,
    pub project_name: Option<String>,
    pub repository: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl NewPackage {
    pub fn new(package_name: impl Into<String>, forge: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            forge: forge.into(),
            project_name: None,
            repository: None,
            created_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPackageVersion {
    pub package_id: PackageId,
    pub generator: String,
    pub version: String,
    pub created_at: Option<DateTime<Utc>>,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDependency {
    pub package_version_id: PackageVersionId,
    pub dependency_id: PackageId,
    pub version_range: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewModule {
    pub package_version_id: PackageVersionId,
    pub namespace: String,
    pub sha256: Option<Vec<u8>>,
    pub created_at: Option<DateTime<Utc>>,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewFile {
    pub package_version_id: PackageVersionId,
    pub path: String,
    pub checksum: Option<Vec<u8>>,
    pub created_at: Option<DateTime<Utc>>,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCallable {
    /// `None` for external callables.
    pub module_id: Option<ModuleId>,
    pub fasten_uri: String,
    pub is_resolved_call: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub metadata: Option<Metadata>,
}

impl NewCallable {
    pub fn internal(module_id: ModuleId, uri: impl Into<String>) -> Self {
        Self {
            module_id: Some(module_id),
            fasten_uri: uri.into(),
            is_resolved_call: true,
            created_at: None,
            metadata: None,
        }
    }

    pub fn external(uri: impl Into<String>) -> Self {
        Self {
            module_id: None,
            fasten_uri: uri.into(),
            is_resolved_call: false,
            created_at: None,
            metadata: None,
        }
    }
}

/// An edge between two stored callables. Only store ids reach this type.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEdge {
    pub source: CallableId,
    pub target: CallableId,
    pub metadata: Metadata,
}

// ── Read-side rows ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageRecord {
    pub id: PackageId,
    pub package_name: String,
    pub forge: String,
    pub project_name: Option<String>,
    pub repository: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageVersionRecord {
    pub id: PackageVersionId,
    pub package_id: PackageId,
    pub generator: String,
    pub version: String,
    pub created_at: Option<DateTime<Utc>>,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyRecord {
    pub package_version_id: PackageVersionId,
    pub dependency_id: PackageId,
    pub version_range: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleRecord {
    pub id: ModuleId,
    pub package_version_id: PackageVersionId,
    pub namespace: String,
    pub sha256: Option<Vec<u8>>,
    pub created_at: Option<DateTime<Utc>>,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRecord {
    pub id: FileId,
    pub package_version_id: PackageVersionId,
    pub path: String,
    pub checksum: Option<Vec<u8>>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallableRecord {
    pub id: CallableId,
    pub module_id: Option<ModuleId>,
    pub fasten_uri: String,
    pub is_resolved_call: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeRecord {
    pub source: CallableId,
    pub target: CallableId,
    pub metadata: Metadata,
}

/// Row counts per table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub packages: u64,
    pub package_versions: u64,
    pub dependencies: u64,
    pub modules: u64,
    pub files: u64,
    pub callables: u64,
    pub edges: u64,
    /// Database file size in bytes (0 for in-memory stores).
    pub db_size_bytes: u64,
}

impl StoreStats {
    /// Rows in every table except the size field.
    pub fn total_rows(&self) -> u64 {
        self.packages
            + self.package_versions
            + self.dependencies
            + self.modules
            + self.files
            + self.callables
            + self.edges
    }
}
