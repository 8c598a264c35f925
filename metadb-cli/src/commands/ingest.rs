use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use tracing::info;

use metadb_core::ingest::{IngestJob, PoolSummary, StoreFactory, WorkerPool};
use metadb_core::progress::{IndicatifReporter, ProgressReporter};
use metadb_core::store::{MetadataStore, SqliteStore};

use super::PartialFailure;

#[derive(Args, Debug)]
pub struct IngestArgs {
    /// Record files or glob patterns (e.g. "graphs/*.json")
    #[arg(required = true)]
    pub inputs: Vec<String>,

    /// Config file
    #[arg(long, default_value = "metadb.toml")]
    pub config: PathBuf,

    /// Database location (overrides the config file)
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Number of concurrent workers (overrides the config file)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: IngestArgs, quiet: bool) -> anyhow::Result<()> {
    let config = super::load_config(&args.config, args.db, args.workers)?;
    let files = super::expand_inputs(&args.inputs)?;

    let mut jobs = Vec::with_capacity(files.len());
    for path in &files {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read record file: {}", path.display()))?;
        jobs.push(IngestJob::new(path.display().to_string(), text));
    }

    let db_path = config.store.path.clone();
    info!(files = jobs.len(), db = %db_path.display(), workers = config.ingest.workers, "Loaded record files");
    let busy_timeout = Duration::from_millis(config.store.busy_timeout_ms);

    // Open once up front so a bad path fails before any worker starts.
    SqliteStore::open_with_timeout(&db_path, busy_timeout)
        .with_context(|| format!("Cannot open database: {}", db_path.display()))?;

    let factory_path = db_path.clone();
    let stores: StoreFactory = Arc::new(move || -> metadb_core::error::Result<_> {
        let store: Arc<dyn MetadataStore> =
            Arc::new(SqliteStore::open_with_timeout(&factory_path, busy_timeout)?);
        Ok(store)
    });

    let progress: Arc<dyn ProgressReporter> = if quiet || args.json {
        Arc::new(IndicatifReporter::hidden())
    } else {
        Arc::new(IndicatifReporter::new())
    };

    let summary = WorkerPool::new(config, stores)
        .with_progress(progress)
        .run(jobs)
        .await
        .with_context(|| format!("Cannot start ingestion into database: {}", db_path.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else if !quiet {
        print_summary(&summary);
    }

    let failed = summary.failed_count();
    if failed == 0 {
        Ok(())
    } else if summary.succeeded > 0 {
        Err(PartialFailure {
            failed,
            total: summary.total(),
        }
        .into())
    } else {
        anyhow::bail!("No records were ingested ({failed} failed)")
    }
}

fn print_summary(summary: &PoolSummary) {
    println!(
        "Ingested {} of {} records",
        summary.succeeded,
        summary.total()
    );
    for (class, count) in &summary.failed {
        println!("  failed ({}): {count}", class.as_str());
    }
    println!(
        "  arcs: {} accepted, {} rejected",
        summary.arcs.accepted,
        summary.arcs.rejected_count()
    );
    for (reason, count) in &summary.arcs.rejected {
        println!("    {:<22} {count:>6}", reason.as_str());
    }
    for outcome in summary.outcomes.iter().filter(|o| o.failure.is_some()) {
        if let Some(message) = &outcome.message {
            println!("  {}: {message}", outcome.label);
        }
    }
}
