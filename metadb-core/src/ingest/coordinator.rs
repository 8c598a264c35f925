// Ingestion coordinator: one record in, one transaction out.
//
// Validation happens before any transaction is opened. Everything from the
// package upsert to the last edge chunk runs inside a single transaction
// driven by `TransactionRetry`, so a record is either fully committed or
// leaves no rows behind.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use metadb_graph::validate::ValidatedGraph;
use metadb_graph::{ArcReport, ExtendedCallGraph};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::MetadbConfig;
use crate::notify::{NoopNotifier, Notifier, StoredNotification};
use crate::store::MetadataStore;
use crate::types::{
    CallableId, NewCallable, NewDependency, NewFile, NewModule, NewPackage, NewPackageVersion,
    PackageId, PackageVersionId, timestamp_from_millis,
};

use super::batch::{BatchWriter, EdgeEndpoint, PendingCallable, PendingEdge};
use super::retry::TransactionRetry;

/// Where an ingestion is, or where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStage {
    Validating,
    UpsertingPackage,
    UpsertingDependencies,
    UpsertingModulesAndInternals,
    ResolvingExternals,
    WritingEdges,
    Committed,
    Failed,
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validating => "validating",
            Self::UpsertingPackage => "upserting_package",
            Self::UpsertingDependencies => "upserting_dependencies",
            Self::UpsertingModulesAndInternals => "upserting_modules_and_internals",
            Self::ResolvingExternals => "resolving_externals",
            Self::WritingEdges => "writing_edges",
            Self::Committed => "committed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What a successful ingestion produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub artifact: String,
    pub package_id: PackageId,
    pub package_version_id: PackageVersionId,
    pub modules: usize,
    pub internal_callables: usize,
    pub external_callables: usize,
    pub edges: usize,
    pub arcs: ArcReport,
    /// Transaction attempts used, including the successful one.
    pub attempts: u32,
}

/// Ids and counts from one committed transaction.
#[derive(Debug, Clone, Copy)]
struct Written {
    package_id: PackageId,
    package_version_id: PackageVersionId,
    modules: usize,
    internal_callables: usize,
    external_callables: usize,
    edges: usize,
}

/// Drives one record at a time through validation and the write stages.
pub struct IngestionCoordinator {
    store: Arc<dyn MetadataStore>,
    writer: BatchWriter,
    retry: TransactionRetry,
    notifier: Arc<dyn Notifier>,
}

impl fmt::Debug for IngestionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestionCoordinator")
            .field("writer", &self.writer)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl IngestionCoordinator {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self {
            store,
            writer: BatchWriter::default(),
            retry: TransactionRetry::default(),
            notifier: Arc::new(NoopNotifier),
        }
    }

    pub fn from_config(store: Arc<dyn MetadataStore>, config: &MetadbConfig) -> Self {
        Self::new(store)
            .with_writer(BatchWriter::new(config.ingest.batch_size))
            .with_retry(TransactionRetry::from_config(&config.ingest))
    }

    #[must_use]
    pub fn with_writer(mut self, writer: BatchWriter) -> Self {
        self.writer = writer;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: TransactionRetry) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    /// Parse, validate and store one record given as JSON text.
    pub async fn ingest_json(&self, text: &str) -> crate::error::Result<IngestReport> {
        let graph = ExtendedCallGraph::from_json(text).inspect_err(|e| {
            warn!(stage = %IngestStage::Validating, error = %e, "Rejecting record");
        })?;
        self.ingest(&graph).await
    }

    pub async fn ingest(&self, graph: &ExtendedCallGraph) -> crate::error::Result<IngestReport> {
        let validated = metadb_graph::validate(graph).inspect_err(|e| {
            warn!(
                artifact = %graph.artifact(),
                stage = %IngestStage::Validating,
                error = %e,
                "Rejecting record"
            );
        })?;
        self.ingest_validated(&validated).await
    }

    /// Store an already validated record. Returns the store id of its package
    /// in the report.
    pub async fn ingest_validated(
        &self,
        graph: &ValidatedGraph,
    ) -> crate::error::Result<IngestReport> {
        let artifact = graph.artifact();
        if graph.report.rejected_count() > 0 {
            warn!(
                artifact = %artifact,
                rejected = graph.report.rejected_count(),
                accepted = graph.report.accepted,
                "Dropped inadmissible arcs"
            );
        }

        let outcome = self
            .retry
            .run(self.store.as_ref(), &artifact, || self.write_record(graph))
            .await;

        let (written, attempts) = match outcome {
            Ok(ok) => ok,
            Err(e) => {
                error!(
                    artifact = %artifact,
                    stage = %IngestStage::Failed,
                    class = e.class().as_str(),
                    error = %e,
                    "Ingestion failed"
                );
                return Err(e);
            }
        };

        info!(
            artifact = %artifact,
            package_id = %written.package_id,
            attempt = attempts,
            edges = written.edges,
            stage = %IngestStage::Committed,
            "Record committed"
        );

        let notification = StoredNotification {
            product: graph.product.clone(),
            forge: graph.forge.clone(),
            version: graph.version.clone(),
            generator: graph.generator.clone(),
            package_id: written.package_id,
            package_version_id: written.package_version_id,
        };
        if let Err(e) = self.notifier.notify(&notification).await {
            warn!(artifact = %artifact, error = %e, "Stored notification not delivered");
        }

        Ok(IngestReport {
            artifact,
            package_id: written.package_id,
            package_version_id: written.package_version_id,
            modules: written.modules,
            internal_callables: written.internal_callables,
            external_callables: written.external_callables,
            edges: written.edges,
            arcs: graph.report.clone(),
            attempts,
        })
    }

    /// One attempt at writing the record. Runs inside the caller's transaction.
    async fn write_record(&self, graph: &ValidatedGraph) -> crate::error::Result<Written> {
        let mut stage = IngestStage::UpsertingPackage;
        let result = self.write_stages(graph, &mut stage).await;
        if let Err(e) = &result {
            debug!(artifact = %graph.artifact(), stage = %stage, error = %e, "Attempt failed");
        }
        result
    }

    async fn write_stages(
        &self,
        graph: &ValidatedGraph,
        stage: &mut IngestStage,
    ) -> crate::error::Result<Written> {
        let store = self.store.as_ref();
        let created_at = timestamp_from_millis(graph.timestamp_millis);

        *stage = IngestStage::UpsertingPackage;
        let package_id = store
            .upsert_package(&NewPackage::new(&graph.product, &graph.forge))
            .await?;
        let package_version_id = store
            .upsert_package_version(&NewPackageVersion {
                package_id,
                generator: graph.generator.clone(),
                version: graph.version.clone(),
                created_at,
                metadata: None,
            })
            .await?;

        *stage = IngestStage::UpsertingDependencies;
        for dep in &graph.dependencies {
            let dependency_id = store
                .upsert_package(&NewPackage::new(&dep.product, &dep.forge))
                .await?;
            store
                .insert_dependency(&NewDependency {
                    package_version_id,
                    dependency_id,
                    version_range: dep.constraints.clone(),
                })
                .await?;
        }

        *stage = IngestStage::UpsertingModulesAndInternals;
        let mut pending = Vec::with_capacity(graph.method_count());
        for module in &graph.modules {
            let module_id = store
                .upsert_module(&NewModule {
                    package_version_id,
                    namespace: module.namespace.clone(),
                    sha256: None,
                    created_at,
                    metadata: module.metadata.as_object().cloned(),
                })
                .await?;
            if let Some(path) = &module.source_file {
                let file_id = store
                    .upsert_file(&NewFile {
                        package_version_id,
                        path: path.clone(),
                        checksum: None,
                        created_at,
                        metadata: None,
                    })
                    .await?;
                store.link_module_file(module_id, file_id).await?;
            }
            pending.extend(module.methods.iter().map(|method| PendingCallable {
                local_id: method.local_id,
                callable: NewCallable {
                    created_at,
                    ..NewCallable::internal(module_id, &method.uri)
                },
            }));
        }
        let id_map = self.writer.write_callables(store, &pending).await?;

        *stage = IngestStage::ResolvingExternals;
        let mut externals: HashMap<&str, CallableId> = HashMap::new();
        for arc in &graph.external_arcs {
            if !externals.contains_key(arc.target.as_str()) {
                let id = store
                    .upsert_callable(&NewCallable::external(&arc.target))
                    .await?;
                externals.insert(arc.target.as_str(), id);
            }
        }

        *stage = IngestStage::WritingEdges;
        let internal = graph.internal_arcs.iter().map(|arc| PendingEdge {
            source: EdgeEndpoint::Local(arc.source),
            target: EdgeEndpoint::Local(arc.target),
            metadata: crate::types::Metadata::new(),
        });
        let external = graph.external_arcs.iter().map(|arc| PendingEdge {
            source: EdgeEndpoint::Local(arc.source),
            target: EdgeEndpoint::Stored(externals[arc.target.as_str()]),
            metadata: arc.metadata.clone(),
        });
        let edges: Vec<PendingEdge> = internal.chain(external).collect();
        let written_edges = self.writer.write_edges(store, &id_map, &edges).await?;

        debug!(
            artifact = %graph.artifact(),
            callables = id_map.len(),
            externals = externals.len(),
            edges = written_edges,
            "All stages written"
        );

        Ok(Written {
            package_id,
            package_version_id,
            modules: graph.modules.len(),
            internal_callables: pending.len(),
            external_callables: externals.len(),
            edges: edges.len(),
        })
    }
}
