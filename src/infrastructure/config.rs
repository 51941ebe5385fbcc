//! Layered configuration for the importer
//!
//! Resolution order, later sources win: built-in defaults, then
//! `config/default.toml`, then `config/{RUN_ENV}.toml`, then environment
//! variables prefixed `BULK_IMPORTER` (`__` as the section separator, e.g.
//! `BULK_IMPORTER__ENGINE__WORKER_LIMIT=8`).

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

use crate::domain::job::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    FileLoad(#[from] config::ConfigError),

    #[error("invalid configuration: {message}")]
    Validation { message: String },
}

/// Engine-wide dispatch and validation knobs. Per-job configuration can
/// override `worker_limit` and the retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub worker_limit: usize,
    /// Bound of the parser-to-validator channel during the validation phase
    pub channel_capacity: usize,
    pub unit_timeout_ms: u64,
    /// Units persisted per batch during the validation phase
    pub validation_batch_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            worker_limit: 4,
            channel_capacity: 256,
            unit_timeout_ms: 30_000,
            validation_batch_size: 200,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// sqlite connection url; defaults to a file under the local data dir
    pub url: Option<String>,
}

impl DatabaseSettings {
    pub fn resolve_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bulk-importer");
        format!("sqlite:{}", dir.join("importer.db").display())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordServiceSettings {
    pub base_url: String,
    pub request_timeout_ms: u64,
}

impl Default for RecordServiceSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Root directory all source file references resolve under
    pub root: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./uploads"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// tracing filter directive, overridable via RUST_LOG
    pub level: String,
    pub dir: PathBuf,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: PathBuf::from("./logs"),
            file_prefix: "bulk-importer".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImporterConfig {
    pub engine: EngineSettings,
    pub retry: RetryPolicy,
    pub database: DatabaseSettings,
    pub record_service: RecordServiceSettings,
    pub storage: StorageSettings,
    pub logging: LoggingConfig,
}

impl ImporterConfig {
    /// Load and validate the layered configuration.
    pub fn load() -> Result<Self, ConfigError> {
        let run_env = std::env::var("RUN_ENV").unwrap_or_else(|_| "default".to_string());

        let config: Self = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_env}")).required(false))
            .add_source(
                Environment::with_prefix("BULK_IMPORTER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.worker_limit == 0 {
            return Err(ConfigError::Validation {
                message: "engine.worker_limit must be at least 1".to_string(),
            });
        }
        if self.engine.channel_capacity == 0 {
            return Err(ConfigError::Validation {
                message: "engine.channel_capacity must be at least 1".to_string(),
            });
        }
        if self.engine.unit_timeout_ms == 0 {
            return Err(ConfigError::Validation {
                message: "engine.unit_timeout_ms must be positive".to_string(),
            });
        }
        if self.engine.validation_batch_size == 0 {
            return Err(ConfigError::Validation {
                message: "engine.validation_batch_size must be at least 1".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation {
                message: "retry.max_attempts must be at least 1".to_string(),
            });
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::Validation {
                message: "retry.backoff_multiplier must be at least 1.0".to_string(),
            });
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Validation {
                message: "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
            });
        }
        if Url::parse(&self.record_service.base_url).is_err() {
            return Err(ConfigError::Validation {
                message: format!(
                    "record_service.base_url is not a valid url: {}",
                    self.record_service.base_url
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let config = ImporterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.worker_limit, 4);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn zero_workers_rejected() {
        let mut config = ImporterConfig::default();
        config.engine.worker_limit = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn inverted_retry_delays_rejected() {
        let mut config = ImporterConfig::default();
        config.retry.base_delay_ms = 5_000;
        config.retry.max_delay_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_base_url_rejected() {
        let mut config = ImporterConfig::default();
        config.record_service.base_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn database_url_falls_back_to_data_dir() {
        let settings = DatabaseSettings { url: None };
        let url = settings.resolve_url();
        assert!(url.starts_with("sqlite:"));
        assert!(url.ends_with("importer.db"));

        let explicit = DatabaseSettings {
            url: Some("sqlite::memory:".to_string()),
        };
        assert_eq!(explicit.resolve_url(), "sqlite::memory:");
    }
}
