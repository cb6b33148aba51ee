/*!
 * Configuration types for Helios
 */

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use helios_core_resilience::{CircuitBreakerConfig, PoolConfig, RetryPolicy};

use crate::error::{HeliosError, Result};

/// Top-level service configuration.
///
/// One [`UpstreamProfile`] per dependency on the ingest path. Values load
/// from TOML and can be overridden per field from the environment with
/// `HELIOS_<UPSTREAM>_<KEY>` variables; there are no hidden globals, the
/// composition root receives this struct explicitly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeliosConfig {
    /// Cloud weather API used for reference readings
    #[serde(default)]
    pub cloud_api: UpstreamProfile,

    /// Time-series database, the primary write path
    #[serde(default)]
    pub timeseries: UpstreamProfile,

    /// Hot-reading cache
    #[serde(default)]
    pub cache: UpstreamProfile,

    /// Diagnostic logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Resilience knobs for a single upstream dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamProfile {
    /// Tokens granted per time window
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,

    /// Token refill window in seconds
    #[serde(default = "default_time_window_secs")]
    pub time_window_secs: u64,

    /// Bucket capacity, the maximum burst
    #[serde(default = "default_burst_limit")]
    pub burst_limit: u32,

    /// Consecutive failures before the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Cool-down before the breaker probes recovery, in seconds
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,

    /// Connection pool capacity
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Construction attempts per pooled connection
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Deadline for one pooled operation, in seconds
    #[serde(default = "default_execute_timeout_secs")]
    pub execute_timeout_secs: u64,

    /// Attempt budget for one logical operation
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay in milliseconds
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Upper bound on any retry delay, in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff randomization fraction, in [0, 1)
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,

    /// How long admission may queue before giving up, in milliseconds
    #[serde(default = "default_admission_wait_ms")]
    pub admission_wait_ms: u64,
}

impl Default for UpstreamProfile {
    fn default() -> Self {
        Self {
            rate_limit: default_rate_limit(),
            time_window_secs: default_time_window_secs(),
            burst_limit: default_burst_limit(),
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            pool_size: default_pool_size(),
            retries: default_retries(),
            execute_timeout_secs: default_execute_timeout_secs(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_fraction: default_jitter_fraction(),
            admission_wait_ms: default_admission_wait_ms(),
        }
    }
}

impl UpstreamProfile {
    /// Token refill window as a [`Duration`].
    pub fn time_window(&self) -> Duration {
        Duration::from_secs(self.time_window_secs)
    }

    /// Admission queue deadline as a [`Duration`].
    pub fn admission_wait(&self) -> Duration {
        Duration::from_millis(self.admission_wait_ms)
    }

    /// Breaker settings derived from this profile.
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
        }
    }

    /// Pool settings derived from this profile.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.pool_size,
            create_retries: self.retries,
            execute_timeout: Duration::from_secs(self.execute_timeout_secs),
            ..PoolConfig::default()
        }
    }

    /// Retry policy derived from this profile.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            jitter: self.jitter_fraction,
        }
    }

    fn validate(&self, upstream: &str) -> Result<()> {
        if self.rate_limit == 0 {
            return Err(config_err(upstream, "rate_limit must be positive"));
        }
        if self.time_window_secs == 0 {
            return Err(config_err(upstream, "time_window_secs must be positive"));
        }
        if self.burst_limit == 0 {
            return Err(config_err(upstream, "burst_limit must be positive"));
        }
        if self.failure_threshold == 0 {
            return Err(config_err(upstream, "failure_threshold must be positive"));
        }
        if self.recovery_timeout_secs == 0 {
            return Err(config_err(upstream, "recovery_timeout_secs must be positive"));
        }
        if self.pool_size == 0 {
            return Err(config_err(upstream, "pool_size must be positive"));
        }
        if self.retries == 0 {
            return Err(config_err(upstream, "retries must be positive"));
        }
        if self.execute_timeout_secs == 0 {
            return Err(config_err(upstream, "execute_timeout_secs must be positive"));
        }
        if self.max_attempts == 0 {
            return Err(config_err(upstream, "max_attempts must be positive"));
        }
        if self.base_backoff_ms == 0 {
            return Err(config_err(upstream, "base_backoff_ms must be positive"));
        }
        if !(0.0..1.0).contains(&self.jitter_fraction) {
            return Err(config_err(upstream, "jitter_fraction must be in [0, 1)"));
        }
        Ok(())
    }
}

fn config_err(upstream: &str, detail: &str) -> HeliosError {
    HeliosError::Config(format!("{}: {}", upstream, detail))
}

/// Diagnostic logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level for diagnostic output
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }

    /// Parse from an environment-variable value.
    pub fn parse(raw: &str) -> Option<LogLevel> {
        match raw.to_ascii_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }
}

// Default value functions for serde
fn default_rate_limit() -> u32 {
    100
}

fn default_time_window_secs() -> u64 {
    1
}

fn default_burst_limit() -> u32 {
    150
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    30
}

fn default_pool_size() -> usize {
    5
}

fn default_retries() -> u32 {
    3
}

fn default_execute_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_jitter_fraction() -> f64 {
    0.3
}

fn default_admission_wait_ms() -> u64 {
    5_000
}

impl HeliosConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            HeliosError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: HeliosConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| HeliosError::Config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, contents).map_err(|e| {
            HeliosError::Config(format!("failed to write {}: {}", path.display(), e))
        })?;
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an injectable lookup.
    ///
    /// Recognized names are `HELIOS_<UPSTREAM>_<KEY>` where `<UPSTREAM>` is
    /// `CLOUD_API`, `TIMESERIES`, or `CACHE` and `<KEY>` is any
    /// [`UpstreamProfile`] field in upper case, plus `HELIOS_LOG_LEVEL`.
    /// A value that fails to parse is a configuration error, not a silent
    /// fallback.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        apply_profile_env(&mut self.cloud_api, "HELIOS_CLOUD_API", &lookup)?;
        apply_profile_env(&mut self.timeseries, "HELIOS_TIMESERIES", &lookup)?;
        apply_profile_env(&mut self.cache, "HELIOS_CACHE", &lookup)?;

        if let Some(raw) = lookup("HELIOS_LOG_LEVEL") {
            self.logging.level = LogLevel::parse(&raw).ok_or_else(|| {
                HeliosError::Config(format!("HELIOS_LOG_LEVEL: unrecognized level {:?}", raw))
            })?;
        }
        Ok(())
    }

    /// Fail fast on values the resilience layer would reject at runtime.
    pub fn validate(&self) -> Result<()> {
        self.cloud_api.validate("cloud_api")?;
        self.timeseries.validate("timeseries")?;
        self.cache.validate("cache")?;
        Ok(())
    }
}

fn apply_profile_env<F>(profile: &mut UpstreamProfile, prefix: &str, lookup: &F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    set_from_env(&mut profile.rate_limit, prefix, "RATE_LIMIT", lookup)?;
    set_from_env(&mut profile.time_window_secs, prefix, "TIME_WINDOW_SECS", lookup)?;
    set_from_env(&mut profile.burst_limit, prefix, "BURST_LIMIT", lookup)?;
    set_from_env(&mut profile.failure_threshold, prefix, "FAILURE_THRESHOLD", lookup)?;
    set_from_env(
        &mut profile.recovery_timeout_secs,
        prefix,
        "RECOVERY_TIMEOUT_SECS",
        lookup,
    )?;
    set_from_env(&mut profile.pool_size, prefix, "POOL_SIZE", lookup)?;
    set_from_env(&mut profile.retries, prefix, "RETRIES", lookup)?;
    set_from_env(
        &mut profile.execute_timeout_secs,
        prefix,
        "EXECUTE_TIMEOUT_SECS",
        lookup,
    )?;
    set_from_env(&mut profile.max_attempts, prefix, "MAX_ATTEMPTS", lookup)?;
    set_from_env(&mut profile.base_backoff_ms, prefix, "BASE_BACKOFF_MS", lookup)?;
    set_from_env(&mut profile.max_backoff_ms, prefix, "MAX_BACKOFF_MS", lookup)?;
    set_from_env(&mut profile.jitter_fraction, prefix, "JITTER_FRACTION", lookup)?;
    set_from_env(&mut profile.admission_wait_ms, prefix, "ADMISSION_WAIT_MS", lookup)?;
    Ok(())
}

fn set_from_env<T, F>(slot: &mut T, prefix: &str, key: &str, lookup: &F) -> Result<()>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let name = format!("{}_{}", prefix, key);
    if let Some(raw) = lookup(&name) {
        *slot = raw
            .parse()
            .map_err(|e| HeliosError::Config(format!("{}: {}", name, e)))?;
    }
    Ok(())
}
