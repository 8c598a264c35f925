use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use metadb_core::store::{MetadataStore, SqliteStore};

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Config file
    #[arg(long, default_value = "metadb.toml")]
    pub config: PathBuf,

    /// Database location (overrides the config file)
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Print counts as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: StatusArgs) -> anyhow::Result<()> {
    let config = super::load_config(&args.config, args.db, None)?;
    let db_path = &config.store.path;
    if !db_path.exists() {
        anyhow::bail!(
            "Database not found: {}. Run `metadb init` first.",
            db_path.display()
        );
    }

    let store = SqliteStore::open(db_path)
        .with_context(|| format!("Cannot open database: {}", db_path.display()))?;
    let stats = store.stats().await.context("Failed to read database stats")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("metadb status");
    println!();
    println!("  Database: {}", db_path.display());
    if stats.db_size_bytes > 0 {
        println!("  Size:     {}", super::format_bytes(stats.db_size_bytes));
    }
    println!();
    let rows = [
        ("packages", stats.packages),
        ("package_versions", stats.package_versions),
        ("dependencies", stats.dependencies),
        ("modules", stats.modules),
        ("files", stats.files),
        ("callables", stats.callables),
        ("edges", stats.edges),
    ];
    for (table, count) in rows {
        println!("    {table:<20} {count:>8}");
    }
    println!("    {:<20} {:>8}", "total", stats.total_rows());
    Ok(())
}
