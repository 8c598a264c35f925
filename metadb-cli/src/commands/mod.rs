pub mod ingest;
pub mod init;
pub mod status;
pub mod validate;

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Subcommand;

use metadb_core::config::MetadbConfig;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write a config file and create an empty database
    Init(init::InitArgs),
    /// Ingest call-graph records into the database
    Ingest(ingest::IngestArgs),
    /// Check records against the address rules without writing anything
    Validate(validate::ValidateArgs),
    /// Show row counts for every table
    Status(status::StatusArgs),
}

pub async fn run(cmd: Command, quiet: bool) -> anyhow::Result<()> {
    match cmd {
        Command::Init(args) => init::run(args).await,
        Command::Ingest(args) => ingest::run(args, quiet).await,
        Command::Validate(args) => validate::run(args),
        Command::Status(args) => status::run(args).await,
    }
}

/// Some records were stored and some were not.
#[derive(Debug)]
pub struct PartialFailure {
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} records failed", self.failed, self.total)
    }
}

impl std::error::Error for PartialFailure {}

/// Load `config` (defaults if the file is absent) and apply CLI overrides.
pub fn load_config(
    config: &Path,
    db: Option<PathBuf>,
    workers: Option<usize>,
) -> anyhow::Result<MetadbConfig> {
    let mut loaded = MetadbConfig::load_or_default(config)
        .with_context(|| format!("Cannot load config: {}", config.display()))?;
    if let Some(db) = db {
        loaded.store.path = db;
    }
    if let Some(workers) = workers {
        loaded.ingest.workers = workers;
    }
    loaded
        .validate()
        .with_context(|| format!("Invalid config after overrides: {}", config.display()))?;
    Ok(loaded)
}

/// Expand file arguments: existing paths are taken as-is, anything else is
/// treated as a glob pattern. Order is preserved and duplicates are dropped.
pub fn expand_inputs(patterns: &[String]) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for pattern in patterns {
        let direct = PathBuf::from(pattern);
        if direct.is_file() {
            if !files.contains(&direct) {
                files.push(direct);
            }
            continue;
        }
        let paths =
            glob::glob(pattern).with_context(|| format!("Invalid file pattern: {pattern}"))?;
        let mut matched = false;
        for path in paths.flatten().filter(|p| p.is_file()) {
            matched = true;
            if !files.contains(&path) {
                files.push(path);
            }
        }
        if !matched {
            anyhow::bail!("No input files match: {pattern}");
        }
    }
    Ok(files)
}

#[allow(clippy::cast_precision_loss)]
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(
            &dir.path().join("missing.toml"),
            Some(dir.path().join("x.db")),
            Some(3),
        )
        .unwrap();
        assert_eq!(config.store.path, dir.path().join("x.db"));
        assert_eq!(config.ingest.workers, 3);
    }

    #[test]
    fn zero_workers_override_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(&dir.path().join("missing.toml"), None, Some(0)).unwrap_err();
        assert!(format!("{err:#}").contains("workers"));
    }

    #[test]
    fn expand_dedups_and_globs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), "{}").unwrap();
        std::fs::write(dir.path().join("b.json"), "{}").unwrap();
        std::fs::write(dir.path().join("c.txt"), "").unwrap();

        let a = dir.path().join("a.json").display().to_string();
        let pattern = dir.path().join("*.json").display().to_string();
        let files = expand_inputs(&[a, pattern]).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a.json"));
        assert!(files[1].ends_with("b.json"));
    }

    #[test]
    fn unmatched_pattern_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("*.json").display().to_string();
        assert!(expand_inputs(&[pattern]).is_err());
    }

    #[test]
    fn bytes_format() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
    }
}
