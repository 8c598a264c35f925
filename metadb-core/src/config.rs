use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Largest chunk that keeps a five-column multi-row insert under `SQLite`'s
/// 32766 bound-parameter limit.
pub const MAX_BATCH_SIZE: usize = 6553;

/// Top-level metadb configuration, matching `metadb.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadbConfig {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub ingest: IngestSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("metadata.db"),
            busy_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSection {
    pub batch_size: usize,
    /// Total attempts per record, including the first.
    pub retry_limit: u32,
    pub retry_backoff_ms: u64,
    pub workers: usize,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            batch_size: 4096,
            retry_limit: 3,
            retry_backoff_ms: 50,
            workers: 1,
        }
    }
}

impl MetadbConfig {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Read a config file if present, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::NotFound(_)) => Ok(Self::default()),
            other => other,
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ingest = &self.ingest;
        if !(1..=MAX_BATCH_SIZE).contains(&ingest.batch_size) {
            return Err(ConfigError::Invalid(format!(
                "ingest.batch_size must be between 1 and {MAX_BATCH_SIZE}, got {}",
                ingest.batch_size
            )));
        }
        if ingest.retry_limit == 0 {
            return Err(ConfigError::Invalid(
                "ingest.retry_limit must be at least 1".into(),
            ));
        }
        if ingest.workers == 0 {
            return Err(ConfigError::Invalid(
                "ingest.workers must be at least 1".into(),
            ));
        }
        if self.store.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("store.path must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = MetadbConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ingest.batch_size, 4096);
        assert_eq!(config.ingest.retry_limit, 3);
        assert_eq!(config.store.path, PathBuf::from("metadata.db"));
    }

    #[test]
    fn partial_sections_fill_defaults() {
        let config = MetadbConfig::from_toml_str(
            r#"
            [ingest]
            workers = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.ingest.workers, 4);
        assert_eq!(config.ingest.batch_size, 4096);
        assert_eq!(config.store.busy_timeout_ms, 5000);
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let err = MetadbConfig::from_toml_str("[ingest]\nbatch_size = 7000\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_retry_limit_is_rejected() {
        let err = MetadbConfig::from_toml_str("[ingest]\nretry_limit = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        let err = MetadbConfig::from_toml_str("[ingest\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file() {
        let err = MetadbConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
        assert!(MetadbConfig::load_or_default(Path::new("/definitely/not/here.toml")).is_ok());
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = MetadbConfig::default();
        config.ingest.workers = 3;
        let text = config.to_toml_string().unwrap();
        let back = MetadbConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.ingest.workers, 3);
    }
}
