//! metadb core library: metadata store, batch writer and ingestion.
//!
//! The main entry point is [`ingest::IngestionCoordinator`], which validates
//! one call-graph record and writes it through a [`store::MetadataStore`]
//! inside a single retried transaction. [`ingest::WorkerPool`] runs several
//! coordinators concurrently.

pub mod config;
pub mod error;
pub mod ingest;
pub mod notify;
pub mod progress;
pub mod store;
pub mod types;
