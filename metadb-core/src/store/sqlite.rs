use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::debug;

use crate::error::StoreError;
use crate::types::{
    CallableId, CallableRecord, DependencyRecord, EdgeRecord, FileId, FileRecord, Metadata,
    ModuleId, ModuleRecord, NewCallable, NewDependency, NewEdge, NewFile, NewModule, NewPackage,
    NewPackageVersion, PackageId, PackageRecord, PackageVersionId, PackageVersionRecord,
    StoreStats,
};

use super::MetadataStore;
use super::schema;

/// Default busy timeout for connections opened without an explicit one.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// SQLite-backed implementation of `MetadataStore`.
///
/// One connection per store. Workers that ingest concurrently each open
/// their own store on the same database file.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
    db_path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    pub fn open(path: &Path) -> crate::error::Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_timeout(path: &Path, busy_timeout: Duration) -> crate::error::Result<Self> {
        let conn = Connection::open(path).map_err(StoreError::Sqlite)?;
        Self::initialize(&conn, busy_timeout)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            db_path: Some(path.to_path_buf()),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> crate::error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StoreError::Sqlite)?;
        Self::initialize(&conn, DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            db_path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Close the connection. Later calls fail with [`StoreError::Unavailable`].
    pub fn close(&self) -> crate::error::Result<()> {
        let mut guard = self.conn.lock().expect("metadb store mutex poisoned");
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
        }
        Ok(())
    }

    fn initialize(conn: &Connection, busy_timeout: Duration) -> crate::error::Result<()> {
        // Set before anything else so concurrent openers wait instead of failing.
        conn.busy_timeout(busy_timeout)
            .map_err(StoreError::Sqlite)?;

        conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(StoreError::Sqlite)?;

        // Try WAL mode; silently ignored for in-memory
        let _ = conn.execute_batch("PRAGMA journal_mode = WAL;");

        register_functions(conn).map_err(StoreError::Sqlite)?;

        conn.execute_batch(schema::SCHEMA_SQL)
            .map_err(StoreError::Sqlite)?;

        conn.execute(
            "INSERT OR IGNORE INTO metadb_meta (key, value) VALUES ('schema_version', ?1)",
            params![schema::SCHEMA_VERSION],
        )
        .map_err(StoreError::Sqlite)?;

        let version: String = conn
            .query_row(
                "SELECT value FROM metadb_meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)?;
        if version != schema::SCHEMA_VERSION {
            return Err(StoreError::Migration(format!(
                "database schema version {version}, expected {}",
                schema::SCHEMA_VERSION
            ))
            .into());
        }

        Ok(())
    }

    /// Run `f` against the open connection.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> crate::error::Result<T> {
        let guard = self.conn.lock().expect("metadb store mutex poisoned");
        let conn = guard
            .as_ref()
            .ok_or_else(|| StoreError::Unavailable("connection is closed".into()))?;
        Ok(f(conn)?)
    }

    fn db_size_bytes(&self) -> u64 {
        self.db_path
            .as_deref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map_or(0, |m| m.len())
    }
}

// ── Scalar functions ───────────────────────────────────────────────

fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        schema::MERGE_FUNCTION,
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let old: Option<String> = ctx.get(0)?;
            let new: Option<String> = ctx.get(1)?;
            merge_metadata(old.as_deref(), new.as_deref())
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))
        },
    )
}

/// Shallow union of two JSON object documents; keys from `new` win.
///
/// A missing or non-object side contributes nothing; if either side is not
/// an object the new document replaces the old one.
pub fn merge_metadata(old: Option<&str>, new: Option<&str>) -> Result<String, serde_json::Error> {
    let parse = |text: Option<&str>| -> Result<serde_json::Value, serde_json::Error> {
        match text {
            Some(t) => serde_json::from_str(t),
            None => Ok(serde_json::Value::Object(Metadata::new())),
        }
    };
    let merged = match (parse(old)?, parse(new)?) {
        (serde_json::Value::Object(mut old), serde_json::Value::Object(new)) => {
            old.extend(new);
            serde_json::Value::Object(old)
        }
        (_, new) => new,
    };
    serde_json::to_string(&merged)
}

// ── Row helpers ────────────────────────────────────────────────────

fn timestamp_text(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.to_rfc3339())
}

fn parse_timestamp(text: Option<String>) -> Option<DateTime<Utc>> {
    text.and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn metadata_text(metadata: Option<&Metadata>) -> Result<Option<String>, StoreError> {
    Ok(metadata.map(serde_json::to_string).transpose()?)
}

fn parse_metadata(text: Option<String>) -> Option<Metadata> {
    text.and_then(|t| serde_json::from_str(&t).ok())
}

fn opt_text(text: Option<String>) -> Value {
    text.map_or(Value::Null, Value::Text)
}

fn row_to_callable(row: &rusqlite::Row<'_>) -> rusqlite::Result<CallableRecord> {
    Ok(CallableRecord {
        id: CallableId(row.get("id")?),
        module_id: row.get::<_, Option<i64>>("module_id")?.map(ModuleId),
        fasten_uri: row.get("fasten_uri")?,
        is_resolved_call: row.get("is_resolved_call")?,
        created_at: parse_timestamp(row.get("created_at")?),
        metadata: parse_metadata(row.get("metadata")?),
    })
}

fn row_to_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<EdgeRecord> {
    let metadata: String = row.get("metadata")?;
    Ok(EdgeRecord {
        source: CallableId(row.get("source_id")?),
        target: CallableId(row.get("target_id")?),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
    })
}

fn placeholders(rows: usize, columns: usize) -> String {
    let row = format!("({})", vec!["?"; columns].join(","));
    vec![row; rows].join(",")
}

const CALLABLE_UPSERT_TAIL: &str = "
    ON CONFLICT(fasten_uri, is_resolved_call) DO UPDATE SET
        created_at = COALESCE(excluded.created_at, callables.created_at),
        metadata = COALESCE(excluded.metadata, callables.metadata)";

#[async_trait::async_trait]
impl MetadataStore for SqliteStore {
    // ── Packages ───────────────────────────────────────────────────

    async fn upsert_package(&self, package: &NewPackage) -> crate::error::Result<PackageId> {
        self.with_conn(|conn| {
            let id: i64 = conn
                .prepare_cached(
                    "INSERT INTO packages (package_name, forge, project_name, repository, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(package_name, forge) DO UPDATE SET
                        project_name = COALESCE(excluded.project_name, packages.project_name),
                        repository = COALESCE(excluded.repository, packages.repository),
                        created_at = COALESCE(excluded.created_at, packages.created_at)
                     RETURNING id",
                )?
                .query_row(
                    params![
                        package.package_name,
                        package.forge,
                        package.project_name,
                        package.repository,
                        timestamp_text(package.created_at),
                    ],
                    |row| row.get(0),
                )?;
            Ok(PackageId(id))
        })
    }

    async fn get_package(
        &self,
        package_name: &str,
        forge: &str,
    ) -> crate::error::Result<Option<PackageRecord>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, package_name, forge, project_name, repository, created_at
                     FROM packages WHERE package_name = ?1 AND forge = ?2",
                    params![package_name, forge],
                    |row| {
                        Ok(PackageRecord {
                            id: PackageId(row.get(0)?),
                            package_name: row.get(1)?,
                            forge: row.get(2)?,
                            project_name: row.get(3)?,
                            repository: row.get(4)?,
                            created_at: parse_timestamp(row.get(5)?),
                        })
                    },
                )
                .optional()?)
        })
    }

    async fn upsert_package_version(
        &self,
        version: &NewPackageVersion,
    ) -> crate::error::Result<PackageVersionId> {
        let metadata = metadata_text(version.metadata.as_ref())?;
        self.with_conn(|conn| {
            let id: i64 = conn
                .prepare_cached(
                    "INSERT INTO package_versions (package_id, cg_generator, version, created_at, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(package_id, cg_generator, version) DO UPDATE SET
                        created_at = COALESCE(excluded.created_at, package_versions.created_at),
                        metadata = COALESCE(excluded.metadata, package_versions.metadata)
                     RETURNING id",
                )?
                .query_row(
                    params![
                        version.package_id.0,
                        version.generator,
                        version.version,
                        timestamp_text(version.created_at),
                        metadata,
                    ],
                    |row| row.get(0),
                )?;
            Ok(PackageVersionId(id))
        })
    }

    async fn get_package_version(
        &self,
        package_id: PackageId,
        generator: &str,
        version: &str,
    ) -> crate::error::Result<Option<PackageVersionRecord>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, package_id, cg_generator, version, created_at, metadata
                     FROM package_versions
                     WHERE package_id = ?1 AND cg_generator = ?2 AND version = ?3",
                    params![package_id.0, generator, version],
                    |row| {
                        Ok(PackageVersionRecord {
                            id: PackageVersionId(row.get(0)?),
                            package_id: PackageId(row.get(1)?),
                            generator: row.get(2)?,
                            version: row.get(3)?,
                            created_at: parse_timestamp(row.get(4)?),
                            metadata: parse_metadata(row.get(5)?),
                        })
                    },
                )
                .optional()?)
        })
    }

    // ── Dependencies ───────────────────────────────────────────────

    async fn insert_dependency(&self, dependency: &NewDependency) -> crate::error::Result<bool> {
        let range = serde_json::to_string(&dependency.version_range).map_err(StoreError::from)?;
        self.with_conn(|conn| {
            let inserted = conn
                .prepare_cached(
                    "INSERT INTO dependencies (package_version_id, dependency_id, version_range)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(package_version_id, dependency_id, version_range) DO NOTHING",
                )?
                .execute(params![
                    dependency.package_version_id.0,
                    dependency.dependency_id.0,
                    range
                ])?;
            if inserted == 0 {
                debug!(
                    package_version_id = %dependency.package_version_id,
                    dependency_id = %dependency.dependency_id,
                    "Dependency already recorded"
                );
            }
            Ok(inserted > 0)
        })
    }

    async fn list_dependencies(
        &self,
        package_version_id: PackageVersionId,
    ) -> crate::error::Result<Vec<DependencyRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT package_version_id, dependency_id, version_range FROM dependencies
                 WHERE package_version_id = ?1 ORDER BY rowid",
            )?;
            let rows = stmt.query_map(params![package_version_id.0], |row| {
                let range: String = row.get(2)?;
                Ok(DependencyRecord {
                    package_version_id: PackageVersionId(row.get(0)?),
                    dependency_id: PackageId(row.get(1)?),
                    version_range: serde_json::from_str(&range).unwrap_or_default(),
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    // ── Modules and files ──────────────────────────────────────────

    async fn upsert_module(&self, module: &NewModule) -> crate::error::Result<ModuleId> {
        let metadata = metadata_text(module.metadata.as_ref())?;
        self.with_conn(|conn| {
            let id: i64 = conn
                .prepare_cached(
                    "INSERT INTO modules (package_version_id, namespaces, sha256, created_at, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(package_version_id, namespaces) DO UPDATE SET
                        sha256 = COALESCE(excluded.sha256, modules.sha256),
                        created_at = COALESCE(excluded.created_at, modules.created_at),
                        metadata = COALESCE(excluded.metadata, modules.metadata)
                     RETURNING id",
                )?
                .query_row(
                    params![
                        module.package_version_id.0,
                        module.namespace,
                        module.sha256,
                        timestamp_text(module.created_at),
                        metadata,
                    ],
                    |row| row.get(0),
                )?;
            Ok(ModuleId(id))
        })
    }

    async fn get_module(
        &self,
        package_version_id: PackageVersionId,
        namespace: &str,
    ) -> crate::error::Result<Option<ModuleRecord>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, package_version_id, namespaces, sha256, created_at, metadata
                     FROM modules WHERE package_version_id = ?1 AND namespaces = ?2",
                    params![package_version_id.0, namespace],
                    |row| {
                        Ok(ModuleRecord {
                            id: ModuleId(row.get(0)?),
                            package_version_id: PackageVersionId(row.get(1)?),
                            namespace: row.get(2)?,
                            sha256: row.get(3)?,
                            created_at: parse_timestamp(row.get(4)?),
                            metadata: parse_metadata(row.get(5)?),
                        })
                    },
                )
                .optional()?)
        })
    }

    async fn upsert_file(&self, file: &NewFile) -> crate::error::Result<FileId> {
        let metadata = metadata_text(file.metadata.as_ref())?;
        self.with_conn(|conn| {
            let id: i64 = conn
                .prepare_cached(
                    "INSERT INTO files (package_version_id, path, checksum, created_at, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(package_version_id, path) DO UPDATE SET
                        checksum = COALESCE(excluded.checksum, files.checksum),
                        created_at = COALESCE(excluded.created_at, files.created_at),
                        metadata = COALESCE(excluded.metadata, files.metadata)
                     RETURNING id",
                )?
                .query_row(
                    params![
                        file.package_version_id.0,
                        file.path,
                        file.checksum,
                        timestamp_text(file.created_at),
                        metadata,
                    ],
                    |row| row.get(0),
                )?;
            Ok(FileId(id))
        })
    }

    async fn get_file(
        &self,
        package_version_id: PackageVersionId,
        path: &str,
    ) -> crate::error::Result<Option<FileRecord>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, package_version_id, path, checksum, created_at
                     FROM files WHERE package_version_id = ?1 AND path = ?2",
                    params![package_version_id.0, path],
                    |row| {
                        Ok(FileRecord {
                            id: FileId(row.get(0)?),
                            package_version_id: PackageVersionId(row.get(1)?),
                            path: row.get(2)?,
                            checksum: row.get(3)?,
                            created_at: parse_timestamp(row.get(4)?),
                        })
                    },
                )
                .optional()?)
        })
    }

    async fn link_module_file(
        &self,
        module_id: ModuleId,
        file_id: FileId,
    ) -> crate::error::Result<()> {
        self.with_conn(|conn| {
            conn.prepare_cached(
                "INSERT INTO module_contents (module_id, file_id) VALUES (?1, ?2)
                 ON CONFLICT(module_id, file_id) DO NOTHING",
            )?
            .execute(params![module_id.0, file_id.0])?;
            Ok(())
        })
    }

    // ── Callables ──────────────────────────────────────────────────

    async fn upsert_callable(&self, callable: &NewCallable) -> crate::error::Result<CallableId> {
        let metadata = metadata_text(callable.metadata.as_ref())?;
        self.with_conn(|conn| {
            let sql = format!(
                "INSERT INTO callables (module_id, fasten_uri, is_resolved_call, created_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5) {CALLABLE_UPSERT_TAIL} RETURNING id"
            );
            let id: i64 = conn.prepare_cached(&sql)?.query_row(
                params![
                    callable.module_id.map(|m| m.0),
                    callable.fasten_uri,
                    callable.is_resolved_call,
                    timestamp_text(callable.created_at),
                    metadata,
                ],
                |row| row.get(0),
            )?;
            Ok(CallableId(id))
        })
    }

    async fn upsert_callables_batch(
        &self,
        callables: &[NewCallable],
    ) -> crate::error::Result<Vec<CallableId>> {
        if callables.is_empty() {
            return Ok(Vec::new());
        }

        let mut values: Vec<Value> = Vec::with_capacity(callables.len() * 5);
        for callable in callables {
            values.push(callable.module_id.map_or(Value::Null, |m| Value::Integer(m.0)));
            values.push(Value::Text(callable.fasten_uri.clone()));
            values.push(Value::Integer(i64::from(callable.is_resolved_call)));
            values.push(opt_text(timestamp_text(callable.created_at)));
            values.push(opt_text(metadata_text(callable.metadata.as_ref())?));
        }
        let sql = format!(
            "INSERT INTO callables (module_id, fasten_uri, is_resolved_call, created_at, metadata)
             VALUES {} {CALLABLE_UPSERT_TAIL}
             RETURNING id, fasten_uri, is_resolved_call",
            placeholders(callables.len(), 5)
        );

        self.with_conn(|conn| {
            // RETURNING order is unspecified, so ids are matched back by natural key.
            let mut by_key: HashMap<(String, bool), i64> = HashMap::with_capacity(callables.len());
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, bool>(2)?))
            })?;
            for row in rows {
                let (id, uri, resolved) = row?;
                by_key.insert((uri, resolved), id);
            }

            callables
                .iter()
                .map(|c| {
                    by_key
                        .get(&(c.fasten_uri.clone(), c.is_resolved_call))
                        .map(|&id| CallableId(id))
                        .ok_or_else(|| StoreError::MissingRow(format!("callable {}", c.fasten_uri)))
                })
                .collect()
        })
    }

    async fn get_callable(
        &self,
        fasten_uri: &str,
        is_resolved_call: bool,
    ) -> crate::error::Result<Option<CallableRecord>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM callables WHERE fasten_uri = ?1 AND is_resolved_call = ?2",
                    params![fasten_uri, is_resolved_call],
                    row_to_callable,
                )
                .optional()?)
        })
    }

    async fn list_module_callables(
        &self,
        module_id: ModuleId,
    ) -> crate::error::Result<Vec<CallableRecord>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT * FROM callables WHERE module_id = ?1 ORDER BY id")?;
            let rows = stmt.query_map(params![module_id.0], row_to_callable)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    // ── Edges ──────────────────────────────────────────────────────

    async fn upsert_edges_batch(&self, edges: &[NewEdge]) -> crate::error::Result<usize> {
        if edges.is_empty() {
            return Ok(0);
        }

        let mut values: Vec<Value> = Vec::with_capacity(edges.len() * 3);
        for edge in edges {
            values.push(Value::Integer(edge.source.0));
            values.push(Value::Integer(edge.target.0));
            values.push(Value::Text(
                serde_json::to_string(&edge.metadata).map_err(StoreError::from)?,
            ));
        }
        // Rows of one statement are applied in order, so a later duplicate
        // merges over an earlier one.
        let sql = format!(
            "INSERT INTO edges (source_id, target_id, metadata) VALUES {}
             ON CONFLICT(source_id, target_id) DO UPDATE SET
                metadata = {}(edges.metadata, excluded.metadata)",
            placeholders(edges.len(), 3),
            schema::MERGE_FUNCTION
        );

        self.with_conn(|conn| Ok(conn.execute(&sql, params_from_iter(values))?))
    }

    async fn get_edge(
        &self,
        source: CallableId,
        target: CallableId,
    ) -> crate::error::Result<Option<EdgeRecord>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT source_id, target_id, metadata FROM edges
                     WHERE source_id = ?1 AND target_id = ?2",
                    params![source.0, target.0],
                    row_to_edge,
                )
                .optional()?)
        })
    }

    async fn edges_from(&self, source: CallableId) -> crate::error::Result<Vec<EdgeRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT source_id, target_id, metadata FROM edges
                 WHERE source_id = ?1 ORDER BY target_id",
            )?;
            let rows = stmt.query_map(params![source.0], row_to_edge)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    // ── Transactions ──────────────────────────────────────────────

    async fn begin_transaction(&self) -> crate::error::Result<()> {
        self.with_conn(|conn| Ok(conn.execute_batch("BEGIN IMMEDIATE")?))
    }

    async fn commit_transaction(&self) -> crate::error::Result<()> {
        self.with_conn(|conn| Ok(conn.execute_batch("COMMIT")?))
    }

    async fn rollback_transaction(&self) -> crate::error::Result<()> {
        self.with_conn(|conn| Ok(conn.execute_batch("ROLLBACK")?))
    }

    // ── Metrics ────────────────────────────────────────────────────

    async fn stats(&self) -> crate::error::Result<StoreStats> {
        let counts = self.with_conn(|conn| {
            let mut counts = [0u64; schema::COUNTED_TABLES.len()];
            for (slot, table) in counts.iter_mut().zip(schema::COUNTED_TABLES) {
                *slot = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })?;
            }
            Ok(counts)
        })?;
        let [packages, package_versions, dependencies, modules, files, callables, edges] = counts;
        Ok(StoreStats {
            packages,
            package_versions,
            dependencies,
            modules,
            files,
            callables,
            edges,
            db_size_bytes: self.db_size_bytes(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FailureClass, MetadbError};

    async fn seed_version(store: &SqliteStore) -> PackageVersionId {
        let package_id = store
            .upsert_package(&NewPackage::new("p", "mvn"))
            .await
            .unwrap();
        store
            .upsert_package_version(&NewPackageVersion {
                package_id,
                generator: "G".into(),
                version: "1.0.0".into(),
                created_at: None,
                metadata: None,
            })
            .await
            .unwrap()
    }

    fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), serde_json::Value::from(*v)))
            .collect()
    }

    #[tokio::test]
    async fn package_upsert_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let id1 = store.upsert_package(&NewPackage::new("p", "mvn")).await.unwrap();
        let id2 = store.upsert_package(&NewPackage::new("p", "mvn")).await.unwrap();
        assert_eq!(id1, id2);
        assert_eq!(store.stats().await.unwrap().packages, 1);

        let other = store.upsert_package(&NewPackage::new("p", "pypi")).await.unwrap();
        assert_ne!(id1, other);
    }

    #[tokio::test]
    async fn package_upsert_keeps_known_optional_fields() {
        let store = SqliteStore::in_memory().unwrap();
        let mut package = NewPackage::new("p", "mvn");
        package.repository = Some("https://example.org/p.git".into());
        store.upsert_package(&package).await.unwrap();

        store.upsert_package(&NewPackage::new("p", "mvn")).await.unwrap();
        let fetched = store.get_package("p", "mvn").await.unwrap().unwrap();
        assert_eq!(fetched.repository.as_deref(), Some("https://example.org/p.git"));

        package.project_name = Some("P".into());
        store.upsert_package(&package).await.unwrap();
        let fetched = store.get_package("p", "mvn").await.unwrap().unwrap();
        assert_eq!(fetched.project_name.as_deref(), Some("P"));
    }

    #[tokio::test]
    async fn version_upsert_updates_timestamp_in_place() {
        let store = SqliteStore::in_memory().unwrap();
        let package_id = store.upsert_package(&NewPackage::new("p", "mvn")).await.unwrap();
        let mut version = NewPackageVersion {
            package_id,
            generator: "G".into(),
            version: "1.0.0".into(),
            created_at: DateTime::from_timestamp(100, 0),
            metadata: None,
        };
        let id1 = store.upsert_package_version(&version).await.unwrap();
        version.created_at = DateTime::from_timestamp(200, 0);
        let id2 = store.upsert_package_version(&version).await.unwrap();
        assert_eq!(id1, id2);

        let fetched = store
            .get_package_version(package_id, "G", "1.0.0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.created_at.unwrap().timestamp(), 200);
        assert_eq!(store.stats().await.unwrap().package_versions, 1);
    }

    #[tokio::test]
    async fn identical_dependency_is_a_noop() {
        let store = SqliteStore::in_memory().unwrap();
        let pv = seed_version(&store).await;
        let dep = store.upsert_package(&NewPackage::new("dep", "mvn")).await.unwrap();
        let row = NewDependency {
            package_version_id: pv,
            dependency_id: dep,
            version_range: vec!["[1.0..2.0]".into()],
        };
        assert!(store.insert_dependency(&row).await.unwrap());
        assert!(!store.insert_dependency(&row).await.unwrap());

        let widened = NewDependency {
            version_range: vec!["[1.0..3.0]".into()],
            ..row
        };
        assert!(store.insert_dependency(&widened).await.unwrap());

        let deps = store.list_dependencies(pv).await.unwrap();
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].version_range, vec!["[1.0..2.0]".to_string()]);
    }

    #[tokio::test]
    async fn module_upsert_updates_metadata() {
        let store = SqliteStore::in_memory().unwrap();
        let pv = seed_version(&store).await;
        let mut module = NewModule {
            package_version_id: pv,
            namespace: "/ns/C".into(),
            sha256: None,
            created_at: None,
            metadata: Some(meta(&[("a", "1")])),
        };
        let id1 = store.upsert_module(&module).await.unwrap();
        module.metadata = Some(meta(&[("b", "2")]));
        module.sha256 = Some(vec![7; 32]);
        let id2 = store.upsert_module(&module).await.unwrap();
        assert_eq!(id1, id2);

        let fetched = store.get_module(pv, "/ns/C").await.unwrap().unwrap();
        assert_eq!(fetched.metadata, Some(meta(&[("b", "2")])));
        assert_eq!(fetched.sha256, Some(vec![7; 32]));
    }

    #[tokio::test]
    async fn file_link_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let pv = seed_version(&store).await;
        let module = store
            .upsert_module(&NewModule {
                package_version_id: pv,
                namespace: "/ns/C".into(),
                sha256: None,
                created_at: None,
                metadata: None,
            })
            .await
            .unwrap();
        let file = NewFile {
            package_version_id: pv,
            path: "C.java".into(),
            checksum: None,
            created_at: None,
            metadata: None,
        };
        let f1 = store.upsert_file(&file).await.unwrap();
        let f2 = store.upsert_file(&file).await.unwrap();
        assert_eq!(f1, f2);
        store.link_module_file(module, f1).await.unwrap();
        store.link_module_file(module, f1).await.unwrap();
        assert_eq!(store.get_file(pv, "C.java").await.unwrap().unwrap().id, f1);
        assert_eq!(store.stats().await.unwrap().files, 1);
    }

    #[tokio::test]
    async fn callable_batch_preserves_input_order() {
        let store = SqliteStore::in_memory().unwrap();
        let pv = seed_version(&store).await;
        let module = store
            .upsert_module(&NewModule {
                package_version_id: pv,
                namespace: "/ns/C".into(),
                sha256: None,
                created_at: None,
                metadata: None,
            })
            .await
            .unwrap();

        // Pre-existing row lands in the middle of the batch.
        let existing = store
            .upsert_callable(&NewCallable::internal(module, "/ns/C.b()V"))
            .await
            .unwrap();

        let batch: Vec<NewCallable> = ["/ns/C.c()V", "/ns/C.b()V", "/ns/C.a()V"]
            .into_iter()
            .map(|uri| NewCallable::internal(module, uri))
            .collect();
        let ids = store.upsert_callables_batch(&batch).await.unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[1], existing);

        for (callable, id) in batch.iter().zip(&ids) {
            let fetched = store
                .get_callable(&callable.fasten_uri, true)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(fetched.id, *id);
            assert_eq!(fetched.module_id, Some(module));
        }
        assert_eq!(store.list_module_callables(module).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn resolved_flag_is_part_of_callable_key() {
        let store = SqliteStore::in_memory().unwrap();
        let external = store
            .upsert_callable(&NewCallable::external("/dep/X.y()V"))
            .await
            .unwrap();
        let again = store
            .upsert_callable(&NewCallable::external("/dep/X.y()V"))
            .await
            .unwrap();
        assert_eq!(external, again);

        let pv = seed_version(&store).await;
        let module = store
            .upsert_module(&NewModule {
                package_version_id: pv,
                namespace: "/dep/X".into(),
                sha256: None,
                created_at: None,
                metadata: None,
            })
            .await
            .unwrap();
        let internal = store
            .upsert_callable(&NewCallable::internal(module, "/dep/X.y()V"))
            .await
            .unwrap();
        assert_ne!(external, internal);
        assert_eq!(store.stats().await.unwrap().callables, 2);
    }

    #[tokio::test]
    async fn edge_metadata_is_merged() {
        let store = SqliteStore::in_memory().unwrap();
        let a = store.upsert_callable(&NewCallable::external("/x/A.a()V")).await.unwrap();
        let b = store.upsert_callable(&NewCallable::external("/x/B.b()V")).await.unwrap();

        let first = NewEdge {
            source: a,
            target: b,
            metadata: meta(&[("k1", "v1")]),
        };
        let second = NewEdge {
            source: a,
            target: b,
            metadata: meta(&[("k2", "v2")]),
        };
        store.upsert_edges_batch(&[first]).await.unwrap();
        store.upsert_edges_batch(&[second]).await.unwrap();

        let edge = store.get_edge(a, b).await.unwrap().unwrap();
        assert_eq!(edge.metadata, meta(&[("k1", "v1"), ("k2", "v2")]));
        assert_eq!(store.stats().await.unwrap().edges, 1);
        assert!(store.get_edge(b, a).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_edges_in_one_batch_last_wins() {
        let store = SqliteStore::in_memory().unwrap();
        let a = store.upsert_callable(&NewCallable::external("/x/A.a()V")).await.unwrap();
        let b = store.upsert_callable(&NewCallable::external("/x/B.b()V")).await.unwrap();
        let edges = [
            NewEdge {
                source: a,
                target: b,
                metadata: meta(&[("k", "first"), ("x", "1")]),
            },
            NewEdge {
                source: a,
                target: b,
                metadata: meta(&[("k", "second")]),
            },
        ];
        store.upsert_edges_batch(&edges).await.unwrap();
        let edge = store.get_edge(a, b).await.unwrap().unwrap();
        assert_eq!(edge.metadata, meta(&[("k", "second"), ("x", "1")]));
        assert_eq!(store.edges_from(a).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = SqliteStore::in_memory().unwrap();
        store.begin_transaction().await.unwrap();
        store.upsert_package(&NewPackage::new("p", "mvn")).await.unwrap();
        store.rollback_transaction().await.unwrap();
        assert_eq!(store.stats().await.unwrap().total_rows(), 0);

        store.begin_transaction().await.unwrap();
        store.upsert_package(&NewPackage::new("p", "mvn")).await.unwrap();
        store.commit_transaction().await.unwrap();
        assert_eq!(store.stats().await.unwrap().packages, 1);
    }

    #[tokio::test]
    async fn closed_store_is_transient() {
        let store = SqliteStore::in_memory().unwrap();
        store.close().unwrap();
        let err = store
            .upsert_package(&NewPackage::new("p", "mvn"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadbError::Store(StoreError::Unavailable(_))));
        assert_eq!(err.class(), FailureClass::Transient);
    }

    #[tokio::test]
    async fn reopens_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.upsert_package(&NewPackage::new("p", "mvn")).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.packages, 1);
        assert!(stats.db_size_bytes > 0);
        assert_eq!(store.path(), Some(path.as_path()));
    }

    #[test]
    fn merge_new_value_wins() {
        let merged = merge_metadata(Some(r#"{"a":1,"b":2}"#), Some(r#"{"b":3,"c":4}"#)).unwrap();
        assert_eq!(merged, r#"{"a":1,"b":3,"c":4}"#);
    }

    #[test]
    fn merge_is_shallow() {
        let merged = merge_metadata(Some(r#"{"a":{"x":1}}"#), Some(r#"{"a":{"y":2}}"#)).unwrap();
        assert_eq!(merged, r#"{"a":{"y":2}}"#);
    }

    #[test]
    fn merge_handles_missing_sides() {
        assert_eq!(merge_metadata(None, Some(r#"{"a":1}"#)).unwrap(), r#"{"a":1}"#);
        assert_eq!(merge_metadata(Some(r#"{"a":1}"#), None).unwrap(), r#"{"a":1}"#);
        assert_eq!(merge_metadata(Some("[1]"), Some(r#"{"a":1}"#)).unwrap(), r#"{"a":1}"#);
        assert!(merge_metadata(Some("{"), Some("{}")).is_err());
    }

    #[test]
    fn placeholder_rows() {
        assert_eq!(placeholders(2, 3), "(?,?,?),(?,?,?)");
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_object() -> impl Strategy<Value = Metadata> {
        proptest::collection::btree_map("[a-e]", 0i64..5, 0..5)
            .prop_map(|m| m.into_iter().map(|(k, v)| (k, v.into())).collect())
    }

    proptest! {
        /// Every key of either side survives, and new values win on collision.
        #[test]
        fn merge_is_key_union(old in arb_object(), new in arb_object()) {
            let old_text = serde_json::to_string(&old).unwrap();
            let new_text = serde_json::to_string(&new).unwrap();
            let merged: Metadata =
                serde_json::from_str(&merge_metadata(Some(&old_text), Some(&new_text)).unwrap())
                    .unwrap();
            for (k, v) in &new {
                prop_assert_eq!(merged.get(k), Some(v));
            }
            for (k, v) in &old {
                if !new.contains_key(k) {
                    prop_assert_eq!(merged.get(k), Some(v));
                }
            }
            prop_assert!(merged.keys().all(|k| old.contains_key(k) || new.contains_key(k)));
        }
    }
}
