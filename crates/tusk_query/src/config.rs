//! Engine configuration.
//!
//! Loaded from an optional JSON file, then overridden by `TUSK_*` environment variables.
//! Per-profile overrides (`pool_size`, `statement_timeout_secs`) live on `ConnectionOptions`.

use crate::error::TuskError;
use crate::services::credentials::{CredentialBackend, FORCE_KEYCHAIN_ENV};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Pool capacity override.
pub const POOL_MAX_SIZE_ENV: &str = "TUSK_POOL_MAX_SIZE";
/// Acquire wait bound override, in milliseconds.
pub const ACQUIRE_TIMEOUT_ENV: &str = "TUSK_ACQUIRE_TIMEOUT_MS";
/// Row batch size override.
pub const BATCH_SIZE_ENV: &str = "TUSK_BATCH_SIZE";
/// Default statement timeout, in milliseconds. `0` disables it.
pub const STATEMENT_TIMEOUT_ENV: &str = "TUSK_STATEMENT_TIMEOUT_MS";

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Connection pool settings, applied to every profile.
    pub pool: PoolSettings,
    /// Streaming and timeout settings.
    pub execution: ExecutionSettings,
    /// Where passwords are read from.
    pub credentials: CredentialBackend,
}

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum live sessions per profile.
    pub max_size: usize,
    /// How long `acquire` waits for a free session.
    pub acquire_timeout_ms: u64,
    /// Idle sessions older than this are discarded.
    pub idle_timeout_secs: u64,
    /// Idle sessions older than this are pinged before their next lease.
    pub validate_after_secs: u64,
    /// Period of the background idle sweep.
    pub maintenance_interval_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 4,
            acquire_timeout_ms: 30_000,
            idle_timeout_secs: 300,
            validate_after_secs: 60,
            maintenance_interval_secs: 30,
        }
    }
}

impl PoolSettings {
    /// Acquire wait bound.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Idle discard threshold.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Idle validation threshold.
    pub fn validate_after(&self) -> Duration {
        Duration::from_secs(self.validate_after_secs)
    }

    /// Sweep period.
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

/// Streaming and timeout settings for executions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Rows per `Rows` event.
    pub batch_size: usize,
    /// Row count after which `Progress` events are emitted.
    pub large_result_threshold: usize,
    /// Rows between `Progress` events.
    pub progress_interval: usize,
    /// Pending events the channel buffers before the coordinator suspends.
    pub channel_capacity: usize,
    /// Statement timeout, unless the profile sets its own. `None` disables it.
    pub statement_timeout_ms: Option<u64>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            large_result_threshold: 10_000,
            progress_interval: 10_000,
            channel_capacity: 100,
            statement_timeout_ms: None,
        }
    }
}

impl ExecutionSettings {
    /// Statement timeout as a duration.
    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_ms.map(Duration::from_millis)
    }

    /// Copy of these settings with the profile's statement timeout applied.
    pub fn with_statement_timeout_secs(&self, secs: Option<u32>) -> Self {
        let mut settings = self.clone();
        if let Some(secs) = secs {
            settings.statement_timeout_ms = Some(u64::from(secs) * 1000);
        }
        settings
    }
}

impl EngineConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TuskError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TuskError::config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| {
            TuskError::config(format!("Invalid config file {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TUSK_*` environment overrides.
    pub fn apply_env(mut self) -> Result<Self, TuskError> {
        if let Some(max_size) = env_parse(POOL_MAX_SIZE_ENV)? {
            self.pool.max_size = max_size;
        }
        if let Some(timeout) = env_parse(ACQUIRE_TIMEOUT_ENV)? {
            self.pool.acquire_timeout_ms = timeout;
        }
        if let Some(batch_size) = env_parse(BATCH_SIZE_ENV)? {
            self.execution.batch_size = batch_size;
        }
        if let Some(timeout) = env_parse::<u64>(STATEMENT_TIMEOUT_ENV)? {
            self.execution.statement_timeout_ms = (timeout > 0).then_some(timeout);
        }
        if std::env::var(FORCE_KEYCHAIN_ENV).is_ok_and(|v| v == "1") {
            self.credentials = CredentialBackend::Keychain;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject settings that would stall every execution.
    pub fn validate(&self) -> Result<(), TuskError> {
        let checks = [
            (self.pool.max_size, "pool.max_size"),
            (self.execution.batch_size, "execution.batch_size"),
            (self.execution.progress_interval, "execution.progress_interval"),
            (self.execution.channel_capacity, "execution.channel_capacity"),
        ];
        for (value, name) in checks {
            if value == 0 {
                return Err(TuskError::config(format!("{name} must be at least 1")));
            }
        }
        if self.pool.maintenance_interval_secs == 0 {
            return Err(TuskError::config("pool.maintenance_interval_secs must be at least 1"));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, TuskError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| TuskError::config(format!("{key} has invalid value '{value}'"))),
        Err(_) => Ok(None),
    }
}

/// Tusk's data directory (`~/.local/share/tusk`, `~/Library/Application Support/tusk`, ...).
pub fn default_data_dir() -> Result<PathBuf, TuskError> {
    dirs::data_dir()
        .map(|dir| dir.join("tusk"))
        .ok_or_else(|| TuskError::config("Could not determine data directory"))
}

/// Directory for rolling log files.
pub fn log_dir() -> Result<PathBuf, TuskError> {
    Ok(default_data_dir()?.join("logs"))
}
