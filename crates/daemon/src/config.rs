//! Configuration management for the Sharebox daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/sharebox/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("retention_hours must be between 1 and 87600, got {0}")]
    InvalidRetentionHours(u32),

    #[error("interval_minutes must be between 1 and 10080, got {0}")]
    InvalidInterval(u64),

    #[error("retry_delay_secs must be between 1 and 86400, got {0}")]
    InvalidRetryDelay(u64),

    #[error("staging_retention_hours must be between 1 and 8760, got {0}")]
    InvalidStagingRetention(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("data_dir must not be empty")]
    EmptyDataDir,

    #[error("staging_dir {staging_dir:?} must not overlap upload_dir {upload_dir:?}")]
    OverlappingStorageDirs {
        upload_dir: PathBuf,
        staging_dir: PathBuf,
    },
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Sharebox daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Storage locations.
    pub storage: StorageConfig,

    /// Share lifecycle settings.
    pub shares: SharesConfig,

    /// Background eviction settings.
    pub eviction: EvictionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon data (database, uploads, staging).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily log files. Empty logs to stderr only.
    pub log_dir: PathBuf,
}

/// Storage locations. Empty paths are derived from `daemon.data_dir`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the per-share directories.
    pub upload_dir: PathBuf,

    /// Root of the chunked upload staging area.
    pub staging_dir: PathBuf,

    /// Path of the SQLite registry database.
    pub database_path: PathBuf,
}

/// Share lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SharesConfig {
    /// Hours a share stays downloadable once it has a recipient.
    pub retention_hours: u32,
}

/// Background eviction settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvictionConfig {
    /// Run the periodic sweep.
    pub enabled: bool,

    /// Minutes between sweeps.
    pub interval_minutes: u64,

    /// Seconds to wait after a sweep that could not run.
    pub retry_delay_secs: u64,

    /// Hours after which an untouched chunked upload is discarded.
    pub staging_retention_hours: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_dir: PathBuf::new(),
        }
    }
}

impl Default for SharesConfig {
    fn default() -> Self {
        Self {
            retention_hours: 24,
        }
    }
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 60,
            retry_delay_secs: 300, // 5 minutes
            staging_retention_hours: 24,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sharebox")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sharebox")
}

fn or_derived(path: &Path, data_dir: &Path, default: &str) -> PathBuf {
    if path.as_os_str().is_empty() {
        data_dir.join(default)
    } else {
        path.to_path_buf()
    }
}

impl Config {
    /// Directory holding one subdirectory per share.
    pub fn upload_dir(&self) -> PathBuf {
        or_derived(&self.storage.upload_dir, &self.daemon.data_dir, "uploads")
    }

    /// Directory holding chunked upload sessions.
    pub fn staging_dir(&self) -> PathBuf {
        or_derived(&self.storage.staging_dir, &self.daemon.data_dir, "staging")
    }

    /// Path of the registry database.
    pub fn database_path(&self) -> PathBuf {
        or_derived(
            &self.storage.database_path,
            &self.daemon.data_dir,
            "shares.db",
        )
    }

    /// Log directory, if file logging is enabled.
    pub fn log_dir(&self) -> Option<&Path> {
        if self.daemon.log_dir.as_os_str().is_empty() {
            None
        } else {
            Some(&self.daemon.log_dir)
        }
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SHAREBOX_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - SHAREBOX_DATA_DIR: Override the data directory
    /// - SHAREBOX_RETENTION_HOURS: Override share retention
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("SHAREBOX_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(dir) = std::env::var("SHAREBOX_DATA_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding data_dir from environment: {}", dir);
                self.daemon.data_dir = PathBuf::from(dir);
            }
        }

        if let Ok(hours) = std::env::var("SHAREBOX_RETENTION_HOURS") {
            match hours.trim().parse::<u32>() {
                Ok(hours) => {
                    tracing::info!("Overriding retention_hours from environment: {}", hours);
                    self.shares.retention_hours = hours;
                }
                Err(_) if hours.is_empty() => {}
                Err(e) => {
                    tracing::warn!(
                        "Ignoring SHAREBOX_RETENTION_HOURS={:?}: {}",
                        hours,
                        e
                    );
                }
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate retention_hours: 1 hour to 10 years
        let retention = self.shares.retention_hours;
        if !(1..=87_600).contains(&retention) {
            return Err(ConfigError::InvalidRetentionHours(retention));
        }

        // Validate interval_minutes: 1 minute to 1 week
        let interval = self.eviction.interval_minutes;
        if !(1..=10_080).contains(&interval) {
            return Err(ConfigError::InvalidInterval(interval));
        }

        let retry = self.eviction.retry_delay_secs;
        if !(1..=86_400).contains(&retry) {
            return Err(ConfigError::InvalidRetryDelay(retry));
        }

        let staging = self.eviction.staging_retention_hours;
        if !(1..=8_760).contains(&staging) {
            return Err(ConfigError::InvalidStagingRetention(staging));
        }

        if self.daemon.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyDataDir);
        }

        // Each sweep treats unknown entries in its root as garbage
        let upload_dir = self.upload_dir();
        let staging_dir = self.staging_dir();
        if staging_dir.starts_with(&upload_dir) || upload_dir.starts_with(&staging_dir) {
            return Err(ConfigError::OverlappingStorageDirs {
                upload_dir,
                staging_dir,
            });
        }

        // Validate log_level is a known value
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        std::env::remove_var("SHAREBOX_LOG_LEVEL");
        std::env::remove_var("SHAREBOX_DATA_DIR");
        std::env::remove_var("SHAREBOX_RETENTION_HOURS");
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert!(config.daemon.data_dir.to_string_lossy().contains("sharebox"));
        assert!(config.log_dir().is_none());
        assert_eq!(config.shares.retention_hours, 24);
        assert!(config.eviction.enabled);
        assert_eq!(config.eviction.interval_minutes, 60);
        assert_eq!(config.eviction.retry_delay_secs, 300);
        assert_eq!(config.eviction.staging_retention_hours, 24);
    }

    #[test]
    fn test_derived_paths() {
        let mut config = Config::default();
        config.daemon.data_dir = PathBuf::from("/var/lib/sharebox");

        assert_eq!(config.upload_dir(), PathBuf::from("/var/lib/sharebox/uploads"));
        assert_eq!(config.staging_dir(), PathBuf::from("/var/lib/sharebox/staging"));
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/sharebox/shares.db")
        );

        config.storage.upload_dir = PathBuf::from("/srv/files");
        assert_eq!(config.upload_dir(), PathBuf::from("/srv/files"));
    }

    #[test]
    fn test_from_toml_empty() {
        // Empty TOML should use all defaults
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[eviction]
interval_minutes = 5
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.eviction.interval_minutes, 5);
        // Unspecified values keep defaults
        assert!(config.eviction.enabled);
        assert_eq!(config.shares.retention_hours, 24);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
data_dir = "/data/sharebox"
log_level = "warn"
log_dir = "/var/log/sharebox"

[storage]
upload_dir = "/data/files"
staging_dir = "/data/staging"
database_path = "/data/registry.db"

[shares]
retention_hours = 72

[eviction]
enabled = false
interval_minutes = 15
retry_delay_secs = 60
staging_retention_hours = 6
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.data_dir, PathBuf::from("/data/sharebox"));
        assert_eq!(config.log_dir(), Some(Path::new("/var/log/sharebox")));
        assert_eq!(config.database_path(), PathBuf::from("/data/registry.db"));
        assert_eq!(config.staging_dir(), PathBuf::from("/data/staging"));
        assert_eq!(config.shares.retention_hours, 72);
        assert!(!config.eviction.enabled);
        assert_eq!(config.eviction.retry_delay_secs, 60);
        assert_eq!(config.eviction.staging_retention_hours, 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[daemon\nlog_level = ");
        assert!(result.is_err());
        let message = result.unwrap_err().to_string();
        assert!(message.contains("Invalid TOML configuration"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[shares]
retention_hours = "a day"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
[daemon]
log_level = "info"
unknown_field = "ignored"

[unknown_section]
key = "value"
"#;
        assert!(Config::from_toml(toml).is_ok());
    }

    #[test]
    fn test_roundtrip() {
        let mut config = Config::default();
        config.shares.retention_hours = 48;
        config.eviction.enabled = false;

        let toml = config.to_toml().unwrap();
        let parsed = Config::from_toml(&toml).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.daemon.log_level = "trace".to_string();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "not = [valid").unwrap();

        let result = Config::load(&path);
        assert!(result.is_err());
        assert!(format!("{:#}", result.unwrap_err()).contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("sharebox/config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        clear_env();
        std::env::set_var("SHAREBOX_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.log_level, "debug");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_data_dir_and_retention() {
        clear_env();
        std::env::set_var("SHAREBOX_DATA_DIR", "/tmp/sharebox-test");
        std::env::set_var("SHAREBOX_RETENTION_HOURS", "12");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.daemon.data_dir, PathBuf::from("/tmp/sharebox-test"));
        assert_eq!(config.shares.retention_hours, 12);
        assert_eq!(
            config.upload_dir(),
            PathBuf::from("/tmp/sharebox-test/uploads")
        );

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_empty_or_invalid_does_not_override() {
        clear_env();
        std::env::set_var("SHAREBOX_LOG_LEVEL", "");
        std::env::set_var("SHAREBOX_RETENTION_HOURS", "forever");

        let mut config = Config::default();
        let original = config.clone();
        config.apply_env_overrides();
        assert_eq!(config, original);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        clear_env();

        let mut config = Config::default();
        let original = config.clone();
        config.apply_env_overrides();
        assert_eq!(config, original);
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_retention() {
        let mut config = Config::default();
        config.shares.retention_hours = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidRetentionHours(0))
        );

        config.shares.retention_hours = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_eviction_ranges() {
        let mut config = Config::default();
        config.eviction.interval_minutes = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidInterval(0)));

        let mut config = Config::default();
        config.eviction.retry_delay_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidRetryDelay(0)));

        let mut config = Config::default();
        config.eviction.staging_retention_hours = 10_000;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidStagingRetention(10_000))
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.daemon.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_validate_empty_data_dir() {
        let mut config = Config::default();
        config.daemon.data_dir = PathBuf::new();
        assert_eq!(config.validate(), Err(ConfigError::EmptyDataDir));
    }

    #[test]
    fn test_validate_overlapping_storage_dirs() {
        let mut config = Config::default();
        config.daemon.data_dir = PathBuf::from("/var/lib/sharebox");

        config.storage.staging_dir = PathBuf::from("/var/lib/sharebox/uploads/staging");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OverlappingStorageDirs { .. })
        ));

        config.storage.staging_dir = PathBuf::from("/var/lib/sharebox/uploads");
        assert_eq!(
            config.validate(),
            Err(ConfigError::OverlappingStorageDirs {
                upload_dir: PathBuf::from("/var/lib/sharebox/uploads"),
                staging_dir: PathBuf::from("/var/lib/sharebox/uploads"),
            })
        );

        config.storage.staging_dir = PathBuf::new();
        config.storage.upload_dir = PathBuf::from("/var/lib/sharebox/staging/files");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OverlappingStorageDirs { .. })
        ));

        // Siblings sharing a name prefix are fine
        config.storage.upload_dir = PathBuf::from("/var/lib/sharebox/staging-files");
        assert_eq!(config.validate(), Ok(()));
    }
}
