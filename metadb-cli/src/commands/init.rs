use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Args;

use metadb_core::config::MetadbConfig;
use metadb_core::store::SqliteStore;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Config file to write
    #[arg(long, default_value = "metadb.toml")]
    pub config: PathBuf,

    /// Database location recorded in the new config
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Overwrite an existing config file
    #[arg(long)]
    pub force: bool,
}

#[allow(clippy::unused_async)]
pub async fn run(args: InitArgs) -> anyhow::Result<()> {
    if args.config.exists() && !args.force {
        anyhow::bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            args.config.display()
        );
    }

    let mut config = MetadbConfig::default();
    if let Some(db) = args.db {
        config.store.path = db;
    }
    let text = config
        .to_toml_string()
        .context("Cannot serialize default config")?;
    std::fs::write(&args.config, text)
        .with_context(|| format!("Cannot write config: {}", args.config.display()))?;

    let db_path = &config.store.path;
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Cannot create database directory: {}", parent.display()))?;
    }
    let store = SqliteStore::open_with_timeout(
        db_path,
        Duration::from_millis(config.store.busy_timeout_ms),
    )
    .with_context(|| format!("Cannot open database: {}", db_path.display()))?;
    store.close().context("Cannot close database")?;

    println!("Wrote {}", args.config.display());
    println!("Database ready at {}", db_path.display());
    Ok(())
}
