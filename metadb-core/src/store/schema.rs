/// Current schema version.
pub const SCHEMA_VERSION: &str = "1";

/// Name of the scalar function used to merge edge metadata on conflict.
pub const MERGE_FUNCTION: &str = "json_merge_shallow";

/// Full SQL schema for the metadata database.
///
/// JSON documents and the `version_range` array are stored as JSON text,
/// timestamps as RFC 3339 text, digests as BLOBs.
pub const SCHEMA_SQL: &str = r"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS metadb_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS packages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    package_name TEXT NOT NULL,
    forge TEXT NOT NULL,
    project_name TEXT,
    repository TEXT,
    created_at TEXT,
    UNIQUE(package_name, forge)
);

CREATE TABLE IF NOT EXISTS package_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    package_id INTEGER NOT NULL REFERENCES packages(id),
    cg_generator TEXT NOT NULL,
    version TEXT NOT NULL,
    created_at TEXT,
    metadata TEXT,
    UNIQUE(package_id, cg_generator, version)
);
CREATE INDEX IF NOT EXISTS idx_pv_package ON package_versions(package_id);

CREATE TABLE IF NOT EXISTS dependencies (
    package_version_id INTEGER NOT NULL REFERENCES package_versions(id),
    dependency_id INTEGER NOT NULL REFERENCES packages(id),
    version_range TEXT NOT NULL DEFAULT '[]',
    UNIQUE(package_version_id, dependency_id, version_range)
);
CREATE INDEX IF NOT EXISTS idx_dep_dependency ON dependencies(dependency_id);

CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    package_version_id INTEGER NOT NULL REFERENCES package_versions(id),
    path TEXT NOT NULL,
    checksum BLOB,
    created_at TEXT,
    metadata TEXT,
    UNIQUE(package_version_id, path)
);

CREATE TABLE IF NOT EXISTS modules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    package_version_id INTEGER NOT NULL REFERENCES package_versions(id),
    namespaces TEXT NOT NULL,
    sha256 BLOB,
    created_at TEXT,
    metadata TEXT,
    UNIQUE(package_version_id, namespaces)
);

CREATE TABLE IF NOT EXISTS module_contents (
    module_id INTEGER NOT NULL REFERENCES modules(id),
    file_id INTEGER NOT NULL REFERENCES files(id),
    UNIQUE(module_id, file_id)
);

CREATE TABLE IF NOT EXISTS callables (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    module_id INTEGER REFERENCES modules(id),
    fasten_uri TEXT NOT NULL,
    is_resolved_call INTEGER NOT NULL,
    created_at TEXT,
    metadata TEXT,
    UNIQUE(fasten_uri, is_resolved_call)
);
CREATE INDEX IF NOT EXISTS idx_callables_module ON callables(module_id);

CREATE TABLE IF NOT EXISTS edges (
    source_id INTEGER NOT NULL REFERENCES callables(id),
    target_id INTEGER NOT NULL REFERENCES callables(id),
    metadata TEXT NOT NULL DEFAULT '{}',
    UNIQUE(source_id, target_id)
);
CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id);
";

/// Tables counted by `stats()`, in reporting order.
pub const COUNTED_TABLES: [&str; 7] = [
    "packages",
    "package_versions",
    "dependencies",
    "modules",
    "files",
    "callables",
    "edges",
];
