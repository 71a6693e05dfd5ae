//! TOML configuration for speedwatch.
//!
//! Layered: an explicit path, then the `SPEEDWATCH_CONFIG` environment
//! variable, then `/etc/speedwatch/speedwatch.toml`, then compiled-in
//! defaults. Command-line flags are applied on top by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::selection::DiscoveryOptions;

pub const CONFIG_ENV_VAR: &str = "SPEEDWATCH_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/speedwatch/speedwatch.toml";

/// Invalid settings detected before any cycle runs.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("schedule.interval_minutes must be at least 1")]
    ZeroInterval,

    #[error("schedule.trial_timeout_secs must be at least 1")]
    ZeroTimeout,

    #[error("selection.discovery_candidates must be at least 1")]
    ZeroCandidates,

    #[error("provider.speedtest_path must not be empty")]
    EmptyProviderPath,

    #[error("invalid log level '{0}'")]
    BadLogLevel(String),
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MonitorConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve configuration from the usual locations.
    ///
    /// An explicitly requested file must load; the environment and system
    /// locations fall through to defaults with a warning.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SPEEDWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schedule.interval_minutes == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        if self.schedule.trial_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.selection.discovery_candidates == 0 {
            return Err(ConfigError::ZeroCandidates);
        }
        if self.provider.speedtest_path.trim().is_empty() {
            return Err(ConfigError::EmptyProviderPath);
        }
        let level = self.logging.level.to_lowercase();
        if !["trace", "debug", "info", "warn", "error"].contains(&level.as_str()) {
            return Err(ConfigError::BadLogLevel(self.logging.level.clone()));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.schedule.interval_minutes.saturating_mul(60))
    }

    pub fn trial_timeout(&self) -> Duration {
        Duration::from_secs(self.schedule.trial_timeout_secs)
    }

    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            limit: self.selection.discovery_candidates,
            pause: Duration::from_secs(self.selection.discovery_pause_secs),
            trial_timeout: self.trial_timeout(),
        }
    }

    pub fn preference_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.preference_file)
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.database_file)
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the preference cache and the measurement database.
    pub data_dir: PathBuf,
    pub preference_file: String,
    pub database_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/speedwatch"),
            preference_file: crate::selection::cache::PREFERENCE_FILE_NAME.to_string(),
            database_file: "speedwatch.db".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Minutes between cycle starts in continuous mode.
    pub interval_minutes: u64,
    /// Upper bound for one provider call.
    pub trial_timeout_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 10,
            trial_timeout_secs: 120,
        }
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Use the cached best server when no explicit server is given.
    pub optimize: bool,
    /// Candidates trialled by discovery.
    pub discovery_candidates: usize,
    /// Pause between discovery trials (seconds).
    pub discovery_pause_secs: u64,
    /// Consecutive cycles in which the cached server fails while the
    /// provider's own pick succeeds before the preference is invalidated.
    /// Cycles where both fail (host offline) do not count. 0 disables.
    pub failure_threshold: u32,
    /// Run discovery on the cycle after an invalidation.
    pub rediscover_after_invalidate: bool,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            optimize: true,
            discovery_candidates: crate::selection::discovery::DEFAULT_CANDIDATES,
            discovery_pause_secs: 2,
            failure_threshold: 3,
            rediscover_after_invalidate: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Path (or bare command name resolved via `$PATH`) to the Ookla CLI.
    pub speedtest_path: String,
    /// Pass `--accept-license --accept-gdpr` to the CLI.
    pub accept_license: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            speedtest_path: "speedtest".to_string(),
            accept_license: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
