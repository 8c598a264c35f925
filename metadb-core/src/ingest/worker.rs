// Worker pool: N workers, each owning its own store connection and
// coordinator, pull records from a shared queue one at a time.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, PoisonError};

use metadb_graph::ArcReport;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::MetadbConfig;
use crate::error::{FailureClass, Result};
use crate::notify::{NoopNotifier, Notifier};
use crate::progress::{NoopReporter, ProgressReporter};
use crate::store::MetadataStore;
use crate::types::PackageId;

use super::coordinator::{IngestReport, IngestionCoordinator};

/// One unit of work: a record's JSON text plus a label for logs and reports.
#[derive(Debug, Clone)]
pub struct IngestJob {
    pub label: String,
    pub text: String,
}

impl IngestJob {
    pub fn new(label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            text: text.into(),
        }
    }
}

/// Result of one job as recorded in the pool summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub label: String,
    pub package_id: Option<PackageId>,
    pub failure: Option<FailureClass>,
    pub message: Option<String>,
}

/// Aggregate over every job a pool processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolSummary {
    pub succeeded: usize,
    pub failed: BTreeMap<FailureClass, usize>,
    pub arcs: ArcReport,
    pub outcomes: Vec<JobOutcome>,
}

impl PoolSummary {
    pub fn failed_count(&self) -> usize {
        self.failed.values().sum()
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed_count()
    }

    fn record(&mut self, label: String, result: &Result<IngestReport>) {
        let outcome = match result {
            Ok(report) => {
                self.succeeded += 1;
                self.arcs.merge(&report.arcs);
                JobOutcome {
                    label,
                    package_id: Some(report.package_id),
                    failure: None,
                    message: None,
                }
            }
            Err(e) => {
                let class = e.class();
                *self.failed.entry(class).or_default() += 1;
                JobOutcome {
                    label,
                    package_id: None,
                    failure: Some(class),
                    message: Some(e.to_string()),
                }
            }
        };
        self.outcomes.push(outcome);
    }

    /// A job whose worker died before it could report a result.
    fn record_lost(&mut self, label: String, message: &str) {
        *self.failed.entry(FailureClass::Fatal).or_default() += 1;
        self.outcomes.push(JobOutcome {
            label,
            package_id: None,
            failure: Some(FailureClass::Fatal),
            message: Some(message.to_string()),
        });
    }

    fn absorb(&mut self, other: Self) {
        self.succeeded += other.succeeded;
        for (class, count) in other.failed {
            *self.failed.entry(class).or_default() += count;
        }
        self.arcs.merge(&other.arcs);
        self.outcomes.extend(other.outcomes);
    }
}

/// What a worker has finished so far, plus the record it is working on.
/// Lives outside the worker task so it survives a panic.
#[derive(Debug, Default)]
struct WorkerLedger {
    summary: PoolSummary,
    in_flight: Option<String>,
}

type SharedLedger = Arc<std::sync::Mutex<WorkerLedger>>;

/// Processes records strictly one after another.
#[derive(Debug)]
pub struct IngestWorker {
    id: usize,
    coordinator: IngestionCoordinator,
}

impl IngestWorker {
    pub fn new(id: usize, coordinator: IngestionCoordinator) -> Self {
        Self { id, coordinator }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub async fn process(&self, job: &IngestJob) -> Result<IngestReport> {
        debug!(worker = self.id, label = %job.label, "Processing record");
        self.coordinator.ingest_json(&job.text).await
    }

    /// Drain `queue`, one record at a time, until it is empty.
    async fn drain(
        &self,
        queue: &Mutex<VecDeque<IngestJob>>,
        ledger: &std::sync::Mutex<WorkerLedger>,
        progress: &dyn ProgressReporter,
    ) {
        loop {
            let Some(job) = queue.lock().await.pop_front() else {
                break;
            };
            {
                let mut ledger = ledger.lock().unwrap_or_else(PoisonError::into_inner);
                ledger.in_flight = Some(job.label.clone());
            }
            let result = self.process(&job).await;
            let failure = result.as_ref().err().map(ToString::to_string);
            progress.record_done(&job.label, failure.as_deref());
            {
                let mut ledger = ledger.lock().unwrap_or_else(PoisonError::into_inner);
                ledger.in_flight = None;
                ledger.summary.record(job.label, &result);
            }
        }
    }
}

/// Builds one store per worker.
pub type StoreFactory = Arc<dyn Fn() -> Result<Arc<dyn MetadataStore>> + Send + Sync>;

/// Builds one notifier per worker.
pub type NotifierFactory = Arc<dyn Fn() -> Arc<dyn Notifier> + Send + Sync>;

/// Runs several [`IngestWorker`]s over a shared job queue.
pub struct WorkerPool {
    config: MetadbConfig,
    stores: StoreFactory,
    notifiers: NotifierFactory,
    progress: Arc<dyn ProgressReporter>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.config.ingest.workers)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Every worker gets its own store from `stores`; two workers must never
    /// share a connection, since each holds a transaction open per record.
    pub fn new(config: MetadbConfig, stores: StoreFactory) -> Self {
        Self {
            config,
            stores,
            notifiers: Arc::new(|| Arc::new(NoopNotifier) as Arc<dyn Notifier>),
            progress: Arc::new(NoopReporter),
        }
    }

    #[must_use]
    pub fn with_notifiers(mut self, notifiers: NotifierFactory) -> Self {
        self.notifiers = notifiers;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn workers(&self) -> usize {
        self.config.ingest.workers.max(1)
    }

    /// Process every job and return the aggregate summary.
    ///
    /// Fails only if a worker cannot be set up; per-record failures are
    /// reported in the summary. Every job appears in the summary exactly
    /// once: if a worker panics, its in-flight record and any records left
    /// in the queue are counted as fatal failures.
    pub async fn run(&self, jobs: Vec<IngestJob>) -> Result<PoolSummary> {
        let total = jobs.len();
        let workers = self.workers().min(total.max(1));

        // Open every store before spawning so setup errors surface early.
        let mut built = Vec::with_capacity(workers);
        for id in 0..workers {
            let store = (self.stores)()?;
            let notifier = (self.notifiers)();
            notifier.init().await?;
            let coordinator = IngestionCoordinator::from_config(store, &self.config)
                .with_notifier(notifier);
            built.push(IngestWorker::new(id, coordinator));
        }

        info!(jobs = total, workers, "Starting ingestion");
        self.progress.begin(u64::try_from(total).unwrap_or(u64::MAX));

        let queue = Arc::new(Mutex::new(VecDeque::from(jobs)));
        let mut handles = Vec::with_capacity(workers);
        for worker in built {
            let queue = Arc::clone(&queue);
            let ledger = SharedLedger::default();
            let task_ledger = Arc::clone(&ledger);
            let progress = Arc::clone(&self.progress);
            let handle = tokio::spawn(async move {
                worker.drain(&queue, &task_ledger, progress.as_ref()).await;
                if let Err(e) = worker.coordinator.notifier().close().await {
                    warn!(worker = worker.id(), error = %e, "Notifier close failed");
                }
            });
            handles.push((handle, ledger));
        }

        let mut summary = PoolSummary::default();
        for (id, (handle, ledger)) in handles.into_iter().enumerate() {
            let joined = handle.await;
            let ledger =
                std::mem::take(&mut *ledger.lock().unwrap_or_else(PoisonError::into_inner));
            if let Err(e) = joined {
                error!(worker = id, error = %e, "Ingestion worker panicked");
                if let Some(label) = ledger.in_flight {
                    let reason = "worker panicked while ingesting this record";
                    self.lose(&mut summary, label, reason);
                }
            }
            summary.absorb(ledger.summary);
        }

        let leftover: Vec<IngestJob> = queue.lock().await.drain(..).collect();
        if !leftover.is_empty() {
            error!(
                jobs = leftover.len(),
                "Records left unprocessed after every worker stopped"
            );
        }
        for job in leftover {
            self.lose(&mut summary, job.label, "not processed: no worker left to take it");
        }
        self.progress.end();

        info!(
            succeeded = summary.succeeded,
            failed = summary.failed_count(),
            arcs_accepted = summary.arcs.accepted,
            arcs_rejected = summary.arcs.rejected_count(),
            "Ingestion finished"
        );
        Ok(summary)
    }

    fn lose(&self, summary: &mut PoolSummary, label: String, message: &str) {
        self.progress.record_done(&label, Some(message));
        summary.record_lost(label, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::StoredNotification;
    use crate::store::SqliteStore;

    #[derive(Debug)]
    struct ExplodingNotifier;

    #[async_trait::async_trait]
    impl Notifier for ExplodingNotifier {
        async fn notify(&self, _notification: &StoredNotification) -> Result<()> {
            panic!("notifier blew up");
        }
    }

    fn record(product: &str) -> String {
        format!(
            r#"{{"product": "{product}", "forge": "mvn", "version": "1", "generator": "G",
                "depset": [], "cha": {{"/ns/C": {{"methods": {{"1": "/ns/C.m()V"}}}}}},
                "graph": {{"internalCalls": [], "externalCalls": [["1", "//dep/x/X.y()V", {{}}]]}}}}"#
        )
    }

    #[tokio::test]
    async fn single_worker_processes_in_order() {
        let store: Arc<dyn MetadataStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let shared = Arc::clone(&store);
        let factory: StoreFactory = Arc::new(move || Ok(Arc::clone(&shared)));
        let pool = WorkerPool::new(MetadbConfig::default(), factory);

        let jobs = vec![
            IngestJob::new("a", record("a")),
            IngestJob::new("bad", "{not json"),
            IngestJob::new("b", record("b")),
        ];
        let summary = pool.run(jobs).await.unwrap();

        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed[&FailureClass::Input], 1);
        assert_eq!(summary.total(), 3);
        assert_eq!(summary.arcs.accepted, 2);
        let labels: Vec<&str> = summary.outcomes.iter().map(|o| o.label.as_str()).collect();
        assert_eq!(labels, ["a", "bad", "b"]);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.packages, 2);
        // Callables are keyed by address, so both records share theirs.
        assert_eq!(stats.callables, 2);
    }

    #[tokio::test]
    async fn empty_queue_is_fine() {
        let factory: StoreFactory = Arc::new(|| -> Result<_> {
            let store: Arc<dyn MetadataStore> = Arc::new(SqliteStore::in_memory()?);
            Ok(store)
        });
        let summary = WorkerPool::new(MetadbConfig::default(), factory)
            .run(Vec::new())
            .await
            .unwrap();
        assert_eq!(summary, PoolSummary::default());
    }

    #[tokio::test]
    async fn panicking_worker_loses_no_jobs() {
        let store: Arc<dyn MetadataStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let shared = Arc::clone(&store);
        let factory: StoreFactory = Arc::new(move || Ok(Arc::clone(&shared)));
        let notifiers: NotifierFactory =
            Arc::new(|| Arc::new(ExplodingNotifier) as Arc<dyn Notifier>);
        let pool = WorkerPool::new(MetadbConfig::default(), factory).with_notifiers(notifiers);

        let jobs = vec![
            IngestJob::new("a", record("a")),
            IngestJob::new("b", record("b")),
        ];
        let summary = pool.run(jobs).await.unwrap();

        assert_eq!(summary.total(), 2);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.failed[&FailureClass::Fatal], 2);
        let labels: Vec<&str> = summary.outcomes.iter().map(|o| o.label.as_str()).collect();
        assert_eq!(labels, ["a", "b"]);
        assert!(
            summary.outcomes[0]
                .message
                .as_deref()
                .is_some_and(|m| m.contains("panicked"))
        );
    }
}
