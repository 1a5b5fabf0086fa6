//! Configuration system for calltrace
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard path)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Validation

use crate::client::ClientConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

pub const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
pub const VALID_BACKENDS: [&str; 3] = ["jsonl", "http", "memory"];

/// Complete calltrace configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalltraceConfig {
    pub log: LogSettings,
    pub client: ClientSettings,
    pub backend: BackendSettings,
    pub evaluation: EvaluationSettings,
}

/// Log settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Trace client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub entity: String,
    pub project: String,

    /// Events per backend batch
    pub batch_size: usize,

    /// Background flush period
    pub flush_interval_ms: u64,

    /// Queue bound; oldest events are dropped beyond it
    pub max_queue_size: usize,

    /// Delivery attempts per event after the first
    pub max_retries: u32,

    pub request_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        let defaults = ClientConfig::default();
        Self {
            entity: defaults.entity,
            project: defaults.project,
            batch_size: defaults.batch_size,
            flush_interval_ms: defaults.flush_interval.as_millis() as u64,
            max_queue_size: defaults.max_queue_size,
            max_retries: defaults.max_retries,
            request_timeout_ms: defaults.request_timeout.as_millis() as u64,
        }
    }
}

impl ClientSettings {
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            entity: self.entity.clone(),
            project: self.project.clone(),
            batch_size: self.batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            max_queue_size: self.max_queue_size,
            max_retries: self.max_retries,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

/// Backend selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Backend kind: jsonl, http, memory
    pub kind: String,

    /// Call log path (jsonl)
    pub path: String,

    /// Server base URL (http)
    pub url: String,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: "jsonl".to_string(),
            path: "calltrace-calls.jsonl".to_string(),
            url: "http://localhost:8080".to_string(),
        }
    }
}

/// Evaluation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationSettings {
    /// Rows evaluated concurrently
    pub max_concurrency: usize,

    /// Times each row is evaluated
    pub trials: usize,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            trials: 1,
        }
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. CALLTRACE_CONFIG environment variable
    /// 3. $XDG_CONFIG_HOME/calltrace/config.toml
    /// 4. Default values
    ///
    /// Environment overrides are applied on top, then the result is validated.
    pub fn load(&self) -> ConfigResult<CalltraceConfig> {
        let mut config = match self.find_config_file()? {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)?
            }
            None => {
                debug!("No config file found, using defaults");
                CalltraceConfig::default()
            }
        };

        Self::apply_overrides(&mut config, |key| std::env::var(key).ok());
        Self::validate(&config)?;
        Ok(config)
    }

    fn find_config_file(&self) -> ConfigResult<Option<PathBuf>> {
        // An explicit path that does not exist is an error, not a silent fallback
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Ok(Some(path.clone()));
            }
            return Err(ConfigError::NotFound(path.clone()));
        }

        if let Ok(env_path) = std::env::var("CALLTRACE_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Ok(Some(path));
            }
            warn!("CALLTRACE_CONFIG path does not exist: {}", env_path);
        }

        Ok(Self::default_config_path().filter(|path| path.exists()))
    }

    pub fn load_from_file(path: &Path) -> ConfigResult<CalltraceConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: CalltraceConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply `CALLTRACE_*` overrides read through `lookup`
    fn apply_overrides(config: &mut CalltraceConfig, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("CALLTRACE_LOG_LEVEL") {
            config.log.level = val;
        }

        if let Some(val) = lookup("CALLTRACE_ENTITY") {
            config.client.entity = val;
        }
        if let Some(val) = lookup("CALLTRACE_PROJECT") {
            config.client.project = val;
        }
        if let Some(val) = lookup("CALLTRACE_BATCH_SIZE") {
            match val.parse() {
                Ok(size) => config.client.batch_size = size,
                Err(_) => warn!("Ignoring invalid CALLTRACE_BATCH_SIZE: {}", val),
            }
        }

        if let Some(val) = lookup("CALLTRACE_BACKEND") {
            config.backend.kind = val;
        }
        if let Some(val) = lookup("CALLTRACE_BACKEND_PATH") {
            config.backend.path = val;
        }
        if let Some(val) = lookup("CALLTRACE_BACKEND_URL") {
            config.backend.url = val;
        }
    }

    pub fn validate(config: &CalltraceConfig) -> ConfigResult<()> {
        if !VALID_LOG_LEVELS.contains(&config.log.level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.log.level, VALID_LOG_LEVELS
            )));
        }

        if !VALID_BACKENDS.contains(&config.backend.kind.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid backend: {}. Must be one of: {:?}",
                config.backend.kind, VALID_BACKENDS
            )));
        }

        let client = &config.client;
        if client.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "Batch size cannot be 0".to_string(),
            ));
        }
        if client.max_queue_size < client.batch_size {
            return Err(ConfigError::ValidationError(format!(
                "Queue size ({}) must be at least the batch size ({})",
                client.max_queue_size, client.batch_size
            )));
        }
        if client.entity.contains('/') || client.project.contains('/') {
            return Err(ConfigError::ValidationError(
                "Entity and project cannot contain '/'".to_string(),
            ));
        }

        if config.evaluation.max_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "Evaluation concurrency cannot be 0".to_string(),
            ));
        }
        if config.evaluation.trials == 0 {
            return Err(ConfigError::ValidationError(
                "Evaluation trials cannot be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save(config: &CalltraceConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Default config file path for the current user
    pub fn default_config_path() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
            .map(|dir| dir.join("calltrace").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = CalltraceConfig::default();
        assert_eq!(config.log.level, "info");
        assert_eq!(config.client.batch_size, 100);
        assert_eq!(config.client.max_queue_size, 10_000);
        assert_eq!(config.backend.kind, "jsonl");
        assert_eq!(config.evaluation.max_concurrency, 8);
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
            [client]
            project = "chatbot"
        "#;
        let config: CalltraceConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.client.project, "chatbot");
        assert_eq!(config.client.batch_size, 100);
        assert_eq!(config.evaluation.trials, 1);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
            [log]
            level = "debug"

            [client]
            entity = "acme"
            project = "qa"
            batch_size = 10
            flush_interval_ms = 50
            max_queue_size = 100
            max_retries = 5
            request_timeout_ms = 2000

            [backend]
            kind = "http"
            url = "http://traces:9000"

            [evaluation]
            max_concurrency = 2
            trials = 3
        "#;

        let config: CalltraceConfig = toml::from_str(toml_str).unwrap();
        assert!(ConfigLoader::validate(&config).is_ok());

        let client = config.client.to_client_config();
        assert_eq!(client.entity, "acme");
        assert_eq!(client.batch_size, 10);
        assert_eq!(client.flush_interval, Duration::from_millis(50));
        assert_eq!(client.max_retries, 5);
        assert_eq!(client.request_timeout, Duration::from_secs(2));
        assert_eq!(config.backend.url, "http://traces:9000");
        assert_eq!(config.evaluation.trials, 3);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CALLTRACE_LOG_LEVEL", "trace"),
            ("CALLTRACE_PROJECT", "from-env"),
            ("CALLTRACE_BATCH_SIZE", "not-a-number"),
            ("CALLTRACE_BACKEND", "memory"),
            ("CALLTRACE_BACKEND_PATH", "/tmp/calls.jsonl"),
        ]
        .into_iter()
        .collect();

        let mut config = CalltraceConfig::default();
        ConfigLoader::apply_overrides(&mut config, |key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.log.level, "trace");
        assert_eq!(config.client.project, "from-env");
        assert_eq!(config.client.batch_size, 100);
        assert_eq!(config.backend.kind, "memory");
        assert_eq!(config.backend.path, "/tmp/calls.jsonl");
    }

    #[test]
    fn test_validation_errors() {
        let invalid = [
            CalltraceConfig {
                log: LogSettings {
                    level: "loud".to_string(),
                },
                ..Default::default()
            },
            CalltraceConfig {
                backend: BackendSettings {
                    kind: "kafka".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
            CalltraceConfig {
                client: ClientSettings {
                    batch_size: 0,
                    ..Default::default()
                },
                ..Default::default()
            },
            CalltraceConfig {
                client: ClientSettings {
                    batch_size: 50,
                    max_queue_size: 10,
                    ..Default::default()
                },
                ..Default::default()
            },
            CalltraceConfig {
                client: ClientSettings {
                    project: "a/b".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
            CalltraceConfig {
                evaluation: EvaluationSettings {
                    max_concurrency: 0,
                    trials: 1,
                },
                ..Default::default()
            },
            CalltraceConfig {
                evaluation: EvaluationSettings {
                    max_concurrency: 1,
                    trials: 0,
                },
                ..Default::default()
            },
        ];

        for config in &invalid {
            assert!(
                matches!(
                    ConfigLoader::validate(config),
                    Err(ConfigError::ValidationError(_))
                ),
                "{:?} should be invalid",
                config
            );
        }
    }

    #[test]
    fn test_load_from_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = CalltraceConfig::default();
        config.client.project = "saved".to_string();
        ConfigLoader::save(&config, &path).unwrap();

        let loaded = ConfigLoader::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);

        let missing = ConfigLoader::new()
            .with_cli_path(Some(dir.path().join("missing.toml")))
            .load();
        assert!(matches!(missing, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[client\nbatch_size = ").unwrap();
        assert!(matches!(
            ConfigLoader::load_from_file(&path),
            Err(ConfigError::ParseError(_))
        ));
    }
}
