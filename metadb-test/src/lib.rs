// Integration test utilities and record fixtures for metadb.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use metadb_core::error::{Result, StoreError};
use metadb_core::store::{MetadataStore, SqliteStore};
use metadb_core::types::{
    CallableId, CallableRecord, DependencyRecord, EdgeRecord, FileId, FileRecord, ModuleId,
    ModuleRecord, NewCallable, NewDependency, NewEdge, NewFile, NewModule, NewPackage,
    NewPackageVersion, PackageId, PackageRecord, PackageVersionId, PackageVersionRecord,
    StoreStats,
};
use serde_json::{Map, Value, json};

// ── Record fixtures ───────────────────────────────────────────────

/// Builds call-graph records in the exchange format.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    product: String,
    forge: String,
    version: String,
    generator: String,
    timestamp: Option<i64>,
    depset: Vec<Value>,
    cha: Map<String, Value>,
    internal: Vec<(u64, u64)>,
    external: Vec<(u64, String, Map<String, Value>)>,
}

impl RecordBuilder {
    pub fn new(product: &str, version: &str) -> Self {
        Self {
            product: product.into(),
            forge: "mvn".into(),
            version: version.into(),
            generator: "OPAL".into(),
            timestamp: None,
            depset: Vec::new(),
            cha: Map::new(),
            internal: Vec::new(),
            external: Vec::new(),
        }
    }

    #[must_use]
    pub fn generator(mut self, generator: &str) -> Self {
        self.generator = generator.into();
        self
    }

    #[must_use]
    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn dependency(mut self, product: &str, constraints: &[&str]) -> Self {
        self.depset.push(json!([{
            "product": product,
            "forge": self.forge,
            "constraints": constraints,
        }]));
        self
    }

    /// Add a type with `(local id, address)` methods.
    #[must_use]
    pub fn class(mut self, namespace: &str, methods: &[(u64, &str)]) -> Self {
        let methods: Map<String, Value> = methods
            .iter()
            .map(|(id, uri)| (id.to_string(), Value::from(*uri)))
            .collect();
        let file = namespace.rsplit('/').next().unwrap_or(namespace);
        self.cha.insert(
            namespace.into(),
            json!({
                "methods": methods,
                "superClasses": ["/java.lang/Object"],
                "superInterfaces": [],
                "sourceFile": format!("{file}.java"),
            }),
        );
        self
    }

    #[must_use]
    pub fn call(mut self, source: u64, target: u64) -> Self {
        self.internal.push((source, target));
        self
    }

    #[must_use]
    pub fn external_call(mut self, source: u64, target: &str, metadata: Value) -> Self {
        let metadata = metadata.as_object().cloned().unwrap_or_default();
        self.external.push((source, target.into(), metadata));
        self
    }

    pub fn build(&self) -> Value {
        let internal: Vec<Value> = self
            .internal
            .iter()
            .map(|(s, t)| json!([s, t]))
            .collect();
        let external: Vec<Value> = self
            .external
            .iter()
            .map(|(s, t, m)| json!([s.to_string(), t, m]))
            .collect();
        json!({
            "product": self.product,
            "forge": self.forge,
            "version": self.version,
            "generator": self.generator,
            "timestamp": self.timestamp.unwrap_or(-1),
            "depset": self.depset,
            "cha": self.cha,
            "graph": {"internalCalls": internal, "externalCalls": external},
        })
    }

    pub fn to_json(&self) -> String {
        self.build().to_string()
    }
}

/// A record with `methods` methods in one type and a call from each method
/// to the next.
pub fn chain_record(product: &str, methods: u64) -> RecordBuilder {
    let uris: Vec<String> = (0..methods).map(|i| format!("/ns/C.m{i}()V")).collect();
    let entries: Vec<(u64, &str)> = (0..methods).zip(uris.iter().map(String::as_str)).collect();
    let mut builder = RecordBuilder::new(product, "1.0.0").class("/ns/C", &entries);
    for i in 1..methods {
        builder = builder.call(i - 1, i);
    }
    builder
}

// ── Stores ────────────────────────────────────────────────────────

/// A database file in a temporary directory, removed on drop.
#[derive(Debug)]
pub struct TempDatabase {
    pub dir: tempfile::TempDir,
}

impl TempDatabase {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create tempdir"),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().join("metadata.db")
    }

    pub fn open(&self) -> SqliteStore {
        open_store(&self.path())
    }
}

impl Default for TempDatabase {
    fn default() -> Self {
        Self::new()
    }
}

pub fn open_store(path: &Path) -> SqliteStore {
    SqliteStore::open(path).expect("open store")
}

/// Where a [`FlakyStore`] injects its failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// The first write of every record.
    Package,
    /// The last write of every record, after everything else is staged.
    Edges,
}

/// Wraps a store and fails with a transient error at one point, either on
/// every transaction or only on the first few.
#[derive(Debug)]
pub struct FlakyStore<S> {
    inner: S,
    point: FailPoint,
    failures: Option<u32>,
    injected: AtomicU32,
    transactions: AtomicU32,
}

impl<S: MetadataStore> FlakyStore<S> {
    pub fn always(inner: S, point: FailPoint) -> Self {
        Self {
            inner,
            point,
            failures: None,
            injected: AtomicU32::new(0),
            transactions: AtomicU32::new(0),
        }
    }

    pub fn times(inner: S, point: FailPoint, failures: u32) -> Self {
        Self {
            failures: Some(failures),
            ..Self::always(inner, point)
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Transactions started so far.
    pub fn transactions(&self) -> u32 {
        self.transactions.load(Ordering::SeqCst)
    }

    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }

    fn trip(&self, point: FailPoint) -> Result<()> {
        if point != self.point {
            return Ok(());
        }
        let so_far = self.injected.load(Ordering::SeqCst);
        if self.failures.is_some_and(|limit| so_far >= limit) {
            return Ok(());
        }
        self.injected.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("injected failure".into()).into())
    }
}

#[async_trait::async_trait]
impl<S: MetadataStore + 'static> MetadataStore for FlakyStore<S> {
    async fn upsert_package(&self, package: &NewPackage) -> Result<PackageId> {
        self.trip(FailPoint::Package)?;
        self.inner.upsert_package(package).await
    }

    async fn get_package(&self, package_name: &str, forge: &str) -> Result<Option<PackageRecord>> {
        self.inner.get_package(package_name, forge).await
    }

    async fn upsert_package_version(&self, version: &NewPackageVersion) -> Result<PackageVersionId> {
        self.inner.upsert_package_version(version).await
    }

    async fn get_package_version(
        &self,
        package_id: PackageId,
        generator: &str,
        version: &str,
    ) -> Result<Option<PackageVersionRecord>> {
        self.inner
            .get_package_version(package_id, generator, version)
            .await
    }

    async fn insert_dependency(&self, dependency: &NewDependency) -> Result<bool> {
        self.inner.insert_dependency(dependency).await
    }

    async fn list_dependencies(
        &self,
        package_version_id: PackageVersionId,
    ) -> Result<Vec<DependencyRecord>> {
        self.inner.list_dependencies(package_version_id).await
    }

    async fn upsert_module(&self, module: &NewModule) -> Result<ModuleId> {
        self.inner.upsert_module(module).await
    }

    async fn get_module(
        &self,
        package_version_id: PackageVersionId,
        namespace: &str,
    ) -> Result<Option<ModuleRecord>> {
        self.inner.get_module(package_version_id, namespace).await
    }

    async fn upsert_file(&self, file: &NewFile) -> Result<FileId> {
        self.inner.upsert_file(file).await
    }

    async fn get_file(
        &self,
        package_version_id: PackageVersionId,
        path: &str,
    ) -> Result<Option<FileRecord>> {
        self.inner.get_file(package_version_id, path).await
    }

    async fn link_module_file(&self, module_id: ModuleId, file_id: FileId) -> Result<()> {
        self.inner.link_module_file(module_id, file_id).await
    }

    async fn upsert_callable(&self, callable: &NewCallable) -> Result<CallableId> {
        self.inner.upsert_callable(callable).await
    }

    async fn upsert_callables_batch(&self, callables: &[NewCallable]) -> Result<Vec<CallableId>> {
        self.inner.upsert_callables_batch(callables).await
    }

    async fn get_callable(
        &self,
        fasten_uri: &str,
        is_resolved_call: bool,
    ) -> Result<Option<CallableRecord>> {
        self.inner.get_callable(fasten_uri, is_resolved_call).await
    }

    async fn list_module_callables(&self, module_id: ModuleId) -> Result<Vec<CallableRecord>> {
        self.inner.list_module_callables(module_id).await
    }

    async fn upsert_edges_batch(&self, edges: &[NewEdge]) -> Result<usize> {
        self.trip(FailPoint::Edges)?;
        self.inner.upsert_edges_batch(edges).await
    }

    async fn get_edge(&self, source: CallableId, target: CallableId) -> Result<Option<EdgeRecord>> {
        self.inner.get_edge(source, target).await
    }

    async fn edges_from(&self, source: CallableId) -> Result<Vec<EdgeRecord>> {
        self.inner.edges_from(source).await
    }

    async fn begin_transaction(&self) -> Result<()> {
        self.transactions.fetch_add(1, Ordering::SeqCst);
        self.inner.begin_transaction().await
    }

    async fn commit_transaction(&self) -> Result<()> {
        self.inner.commit_transaction().await
    }

    async fn rollback_transaction(&self) -> Result<()> {
        self.inner.rollback_transaction().await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.inner.stats().await
    }
}

/// Share a concrete store as a trait object.
pub fn shared<S: MetadataStore + 'static>(store: S) -> (Arc<S>, Arc<dyn MetadataStore>) {
    let concrete = Arc::new(store);
    let dynamic: Arc<dyn MetadataStore> = concrete.clone();
    (concrete, dynamic)
}
