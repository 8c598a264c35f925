use crate::types::{
    CallableId, CallableRecord, DependencyRecord, EdgeRecord, FileId, FileRecord, ModuleId,
    ModuleRecord, NewCallable, NewDependency, NewEdge, NewFile, NewModule, NewPackage,
    NewPackageVersion, PackageId, PackageRecord, PackageVersionId, PackageVersionRecord,
    StoreStats,
};

/// The metadata store abstraction. Ingestion reads and writes through this trait.
///
/// Every write is a single atomic upsert keyed on the entity's natural key, so
/// concurrent writers targeting the same key never produce duplicates.
#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    // ── Packages ───────────────────────────────────────────────────

    /// Insert or update a package keyed on `(package_name, forge)`.
    async fn upsert_package(&self, package: &NewPackage) -> crate::error::Result<PackageId>;

    async fn get_package(
        &self,
        package_name: &str,
        forge: &str,
    ) -> crate::error::Result<Option<PackageRecord>>;

    /// Insert or update a version keyed on `(package_id, generator, version)`.
    async fn upsert_package_version(
        &self,
        version: &NewPackageVersion,
    ) -> crate::error::Result<PackageVersionId>;

    async fn get_package_version(
        &self,
        package_id: PackageId,
        generator: &str,
        version: &str,
    ) -> crate::error::Result<Option<PackageVersionRecord>>;

    // ── Dependencies ───────────────────────────────────────────────

    /// Record a dependency. Returns `false` when the identical row already exists.
    async fn insert_dependency(&self, dependency: &NewDependency) -> crate::error::Result<bool>;

    async fn list_dependencies(
        &self,
        package_version_id: PackageVersionId,
    ) -> crate::error::Result<Vec<DependencyRecord>>;

    // ── Modules and files ──────────────────────────────────────────

    /// Insert or update a module keyed on `(package_version_id, namespace)`.
    async fn upsert_module(&self, module: &NewModule) -> crate::error::Result<ModuleId>;

    async fn get_module(
        &self,
        package_version_id: PackageVersionId,
        namespace: &str,
    ) -> crate::error::Result<Option<ModuleRecord>>;

    /// Insert or update a source file keyed on `(package_version_id, path)`.
    async fn upsert_file(&self, file: &NewFile) -> crate::error::Result<FileId>;

    async fn get_file(
        &self,
        package_version_id: PackageVersionId,
        path: &str,
    ) -> crate::error::Result<Option<FileRecord>>;

    /// Link a module to the file that defines it. Idempotent.
    async fn link_module_file(&self, module_id: ModuleId, file_id: FileId)
    -> crate::error::Result<()>;

    // ── Callables ──────────────────────────────────────────────────

    /// Insert or update a callable keyed on `(fasten_uri, is_resolved_call)`.
    async fn upsert_callable(&self, callable: &NewCallable) -> crate::error::Result<CallableId>;

    /// Upsert many callables in one statement. Ids come back in input order.
    ///
    /// Callers bound the slice length; see [`crate::config::MAX_BATCH_SIZE`].
    async fn upsert_callables_batch(
        &self,
        callables: &[NewCallable],
    ) -> crate::error::Result<Vec<CallableId>>;

    async fn get_callable(
        &self,
        fasten_uri: &str,
        is_resolved_call: bool,
    ) -> crate::error::Result<Option<CallableRecord>>;

    async fn list_module_callables(
        &self,
        module_id: ModuleId,
    ) -> crate::error::Result<Vec<CallableRecord>>;

    // ── Edges ──────────────────────────────────────────────────────

    /// Upsert many edges in one statement, merging metadata on repeated keys.
    /// Within one call, a later duplicate wins on colliding metadata keys.
    async fn upsert_edges_batch(&self, edges: &[NewEdge]) -> crate::error::Result<usize>;

    async fn get_edge(
        &self,
        source: CallableId,
        target: CallableId,
    ) -> crate::error::Result<Option<EdgeRecord>>;

    async fn edges_from(&self, source: CallableId) -> crate::error::Result<Vec<EdgeRecord>>;

    // ── Transactions ───────────────────────────────────────────────

    /// Start a write transaction, taking the writer lock up front.
    async fn begin_transaction(&self) -> crate::error::Result<()>;

    async fn commit_transaction(&self) -> crate::error::Result<()>;

    async fn rollback_transaction(&self) -> crate::error::Result<()>;

    // ── Metrics ────────────────────────────────────────────────────

    async fn stats(&self) -> crate::error::Result<StoreStats>;
}
