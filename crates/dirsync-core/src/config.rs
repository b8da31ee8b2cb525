//! Configuration module for dirsync.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::newtypes::RemotePrefix;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for dirsync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub initial_sync: InitialSyncConfig,
    pub logging: LoggingConfig,
}

/// Change propagation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// URI of the remote prefix (`s3://bucket/dir`, `file:///srv/dir`, or a path).
    pub remote_dir: String,
    /// Local directory mirrored to the remote prefix.
    pub local_dir: PathBuf,
    /// Milliseconds a path must stay quiet before its change is uploaded.
    pub debounce_ms: u64,
    /// Retries after the first failed attempt of an upload or delete.
    pub max_retries: u32,
    /// Number of concurrent upload workers.
    pub worker_pool_size: usize,
    /// First retry delay in milliseconds; doubles on each retry.
    pub retry_base_delay_ms: u64,
    /// Upper bound on a single retry delay in milliseconds.
    pub retry_max_delay_ms: u64,
    /// Seconds between full local rescans (`0` disables).
    pub rescan_interval_secs: u64,
    /// Run one last full rescan while stopping.
    pub final_rescan: bool,
    /// Seconds `stop()` waits for uploads to drain (`0` waits indefinitely).
    pub drain_timeout_secs: u64,
}

/// Initial remote → local copy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialSyncConfig {
    /// Concurrent downloads.
    pub concurrency: usize,
    /// Attempts per object before the initial sync fails.
    pub attempts: u32,
    /// First retry delay in milliseconds; doubles on each retry.
    pub base_delay_ms: u64,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit newline-delimited JSON instead of human-readable lines.
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/dirsync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("dirsync")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_dir: String::new(),
            local_dir: PathBuf::new(),
            debounce_ms: 2_000,
            max_retries: 5,
            worker_pool_size: 4,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            rescan_interval_secs: 6 * 60,
            final_rescan: true,
            drain_timeout_secs: 0,
        }
    }
}

impl Default for InitialSyncConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            attempts: 3,
            base_delay_ms: 1_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.worker_pool_size"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Largest accepted worker pool.
const MAX_WORKER_POOL_SIZE: usize = 64;

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- sync ---
        if self.sync.remote_dir.trim().is_empty() {
            errors.push(ValidationError {
                field: "sync.remote_dir".into(),
                message: "must be set".into(),
            });
        } else if let Err(err) = RemotePrefix::parse(&self.sync.remote_dir) {
            errors.push(ValidationError {
                field: "sync.remote_dir".into(),
                message: err.to_string(),
            });
        }
        if self.sync.local_dir.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "sync.local_dir".into(),
                message: "must be set".into(),
            });
        }
        if self.sync.worker_pool_size == 0 || self.sync.worker_pool_size > MAX_WORKER_POOL_SIZE {
            errors.push(ValidationError {
                field: "sync.worker_pool_size".into(),
                message: format!("must be in range 1..={MAX_WORKER_POOL_SIZE}"),
            });
        }
        if self.sync.retry_base_delay_ms == 0 {
            errors.push(ValidationError {
                field: "sync.retry_base_delay_ms".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.sync.retry_max_delay_ms < self.sync.retry_base_delay_ms {
            errors.push(ValidationError {
                field: "sync.retry_max_delay_ms".into(),
                message: format!(
                    "retry_max_delay_ms ({}) must not be below retry_base_delay_ms ({})",
                    self.sync.retry_max_delay_ms, self.sync.retry_base_delay_ms
                ),
            });
        }

        // --- initial_sync ---
        if self.initial_sync.concurrency == 0 {
            errors.push(ValidationError {
                field: "initial_sync.concurrency".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.initial_sync.attempts == 0 {
            errors.push(ValidationError {
                field: "initial_sync.attempts".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use dirsync_core::config::ConfigBuilder;
/// use std::path::PathBuf;
///
/// let config = ConfigBuilder::new()
///     .remote_dir("s3://bucket/tfworkdir")
///     .local_dir(PathBuf::from("/tmp/tf"))
///     .debounce_ms(1_000)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Start from an existing configuration, e.g. one loaded from disk.
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    // --- sync ---

    pub fn remote_dir(mut self, uri: impl Into<String>) -> Self {
        self.config.sync.remote_dir = uri.into();
        self
    }

    pub fn local_dir(mut self, dir: PathBuf) -> Self {
        self.config.sync.local_dir = dir;
        self
    }

    pub fn debounce_ms(mut self, ms: u64) -> Self {
        self.config.sync.debounce_ms = ms;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.sync.max_retries = n;
        self
    }

    pub fn worker_pool_size(mut self, n: usize) -> Self {
        self.config.sync.worker_pool_size = n;
        self
    }

    pub fn retry_delays_ms(mut self, base: u64, max: u64) -> Self {
        self.config.sync.retry_base_delay_ms = base;
        self.config.sync.retry_max_delay_ms = max;
        self
    }

    pub fn rescan_interval_secs(mut self, seconds: u64) -> Self {
        self.config.sync.rescan_interval_secs = seconds;
        self
    }

    pub fn final_rescan(mut self, enabled: bool) -> Self {
        self.config.sync.final_rescan = enabled;
        self
    }

    pub fn drain_timeout_secs(mut self, seconds: u64) -> Self {
        self.config.sync.drain_timeout_secs = seconds;
        self
    }

    // --- initial_sync ---

    pub fn initial_sync_concurrency(mut self, n: usize) -> Self {
        self.config.initial_sync.concurrency = n;
        self
    }

    pub fn initial_sync_attempts(mut self, n: u32) -> Self {
        self.config.initial_sync.attempts = n;
        self
    }

    pub fn initial_sync_base_delay_ms(mut self, ms: u64) -> Self {
        self.config.initial_sync.base_delay_ms = ms;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_json(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
