//! Ingestion path: batch writer, transaction retry, coordinator and workers.

pub mod batch;
pub mod coordinator;
pub mod retry;
pub mod worker;

pub use batch::{BatchWriter, EdgeEndpoint, IdMap, PendingCallable, PendingEdge};
pub use coordinator::{IngestReport, IngestStage, IngestionCoordinator};
pub use retry::TransactionRetry;
pub use worker::{
    IngestJob, IngestWorker, JobOutcome, NotifierFactory, PoolSummary, StoreFactory, WorkerPool,
};
