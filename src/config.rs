use crate::persistence::RetryPolicy;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of every environment override, e.g. `USERSCRIPT_BRIDGE_PERSIST_RETRIES`
pub const ENV_PREFIX: &str = "USERSCRIPT_BRIDGE_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] figment::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where script records are kept between runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    File,
}

/// Configuration for the background service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageBackend,
    /// Snapshot path for the `file` backend
    pub storage_path: Option<PathBuf>,
    pub persist_retries: u32,
    pub persist_retry_delay_ms: u64,
    /// Capacity of the icon-state change channel
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageBackend::Memory,
            storage_path: None,
            persist_retries: 3,
            persist_retry_delay_ms: 50,
            event_buffer: 64,
        }
    }
}

impl Config {
    /// Defaults overridden by `USERSCRIPT_BRIDGE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::figment(None).extract::<Self>()?.validated()
    }

    /// Defaults, then the TOML file at `path`, then the environment
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::figment(Some(path.as_ref()))
            .extract::<Self>()?
            .validated()
    }

    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX))
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.storage == StorageBackend::File && self.storage_path.is_none() {
            return Err(ConfigError::Invalid(
                "storage_path is required for the file backend".to_string(),
            ));
        }
        Ok(self)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.persist_retries,
            delay: Duration::from_millis(self.persist_retry_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.retry_policy().retries, 3);
        assert_eq!(config.retry_policy().delay, Duration::from_millis(50));
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "storage = \"file\"\nstorage_path = \"/tmp/scripts.json\"\npersist_retries = 5"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.storage, StorageBackend::File);
        assert_eq!(config.storage_path, Some(PathBuf::from("/tmp/scripts.json")));
        assert_eq!(config.persist_retries, 5);
        assert_eq!(config.event_buffer, 64);
    }

    #[test]
    fn test_file_backend_requires_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "storage = \"file\"").unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
