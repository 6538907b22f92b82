//! CLI configuration loading from file and environment variables.

use std::path::PathBuf;

use cellar_db::{DatabaseConfig, Target};
use serde::Deserialize;
use thiserror::Error;

/// Config file used when neither `--config` nor `CELLAR_CONFIG_PATH` is set.
pub const DEFAULT_CONFIG_PATH: &str = "cellar.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Connection pool settings.
    #[serde(default = "default_database")]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Worker queue settings.
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "cellar_db=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Worker queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Pending tasks the queue holds before submitters block.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Number of worker threads.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_database() -> DatabaseConfig {
    DatabaseConfig {
        target: Some(Target::File(PathBuf::from("cellar.db"))),
        ..DatabaseConfig::default()
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_queue_size() -> usize {
    64
}

fn default_workers() -> usize {
    4
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: default_database(),
            logging: LoggingConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            workers: default_workers(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `CELLAR_DB_PATH` sets `database.target` to that file
/// - `CELLAR_POOL_SIZE` overrides `database.pool_size`
/// - `CELLAR_LOG_LEVEL` overrides `logging.level`
/// - `CELLAR_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    load_config_with(path, |key| std::env::var(key).ok())
}

/// [`load_config`] with an explicit environment lookup.
pub fn load_config_with<F>(path: Option<&str>, env: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Some(db_path) = env("CELLAR_DB_PATH") {
        config.database.target = Some(Target::File(PathBuf::from(db_path)));
    }
    if let Some(size) = env("CELLAR_POOL_SIZE") {
        if let Ok(parsed) = size.parse() {
            config.database.pool_size = parsed;
        }
    }
    if let Some(level) = env("CELLAR_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = env("CELLAR_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("absent.toml");
        let config = load_config_with(path.to_str(), no_env).expect("missing file is not an error");

        assert_eq!(
            config.database.target,
            Some(Target::File(PathBuf::from("cellar.db")))
        );
        assert_eq!(config.database.pool_size, 8);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert_eq!(config.worker.queue_size, 64);
        assert_eq!(config.worker.workers, 4);
    }

    #[test]
    fn parses_every_section() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("cellar.toml");
        std::fs::write(
            &path,
            r#"
            [database]
            target = "memory"
            pool_size = 3
            busy_timeout_ms = 100

            [logging]
            level = "debug"
            json = true

            [worker]
            queue_size = 8
            workers = 2
            "#,
        )
        .expect("should write config");

        let config = load_config_with(path.to_str(), no_env).expect("config should parse");
        assert_eq!(config.database.target, Some(Target::Memory));
        assert_eq!(config.database.pool_size, 3);
        assert_eq!(config.database.busy_timeout_ms, 100);
        assert_eq!(config.database.statement_cache_capacity, 64);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert_eq!(config.worker.queue_size, 8);
        assert_eq!(config.worker.workers, 2);
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("cellar.toml");
        std::fs::write(&path, "[database\npool_size = ").expect("should write config");

        let err = load_config_with(path.to_str(), no_env).expect_err("broken toml should fail");
        assert!(matches!(err, ConfigError::Parse(_)), "{err:?}");
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CELLAR_DB_PATH", "/tmp/override.db"),
            ("CELLAR_POOL_SIZE", "12"),
            ("CELLAR_LOG_LEVEL", "warn"),
            ("CELLAR_LOG_JSON", "1"),
        ]);
        let config = load_config_with(None, |key| env.get(key).map(|v| v.to_string()))
            .expect("defaults should load");

        assert_eq!(
            config.database.target,
            Some(Target::File(PathBuf::from("/tmp/override.db")))
        );
        assert_eq!(config.database.pool_size, 12);
        assert_eq!(config.logging.level, "warn");
        assert!(config.logging.json);
    }

    #[test]
    fn unparsable_pool_size_is_ignored() {
        let config = load_config_with(None, |key| {
            (key == "CELLAR_POOL_SIZE").then(|| "lots".to_string())
        })
        .expect("defaults should load");
        assert_eq!(config.database.pool_size, 8);
    }
}
