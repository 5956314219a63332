/*!
 * Configuration types for Salvo
 *
 * Durations are stored as plain integers (`*_ms`, `*_secs`) so TOML files
 * stay readable; the `to_*` methods build the typed configs used at runtime.
 */

use crate::batch::BatchConfig;
use crate::error::{Result, SalvoError};
use crate::transport::RequestOptions;
use salvo_core_resilience::{
    AcquirePolicy, HalfOpenPolicy, PoolConfig, RateLimitConfig, RetryConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SalvoConfig {
    /// Log level for diagnostic output
    #[serde(default)]
    pub log_level: LogLevel,

    /// Write JSON logs to this file instead of stdout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    /// Shorthand for debug logging
    #[serde(default)]
    pub verbose: bool,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub batch: BatchSettings,

    #[serde(default)]
    pub request: RequestSettings,
}

/// `[retry]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
    pub circuit_breaker_enabled: bool,
    pub circuit_failure_threshold: u32,
    pub circuit_success_threshold: u32,
    pub circuit_recovery_timeout_secs: u64,
    pub half_open_policy: HalfOpenMode,
    pub rate_limit_max_tokens: f64,
    pub rate_limit_refill_per_second: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetrySettings {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay_ms: duration_ms(config.base_delay),
            max_delay_ms: duration_ms(config.max_delay),
            backoff_multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
            circuit_breaker_enabled: config.circuit_breaker_enabled,
            circuit_failure_threshold: config.circuit_failure_threshold,
            circuit_success_threshold: config.circuit_success_threshold,
            circuit_recovery_timeout_secs: config.circuit_recovery_timeout.as_secs(),
            half_open_policy: config.half_open_policy.into(),
            rate_limit_max_tokens: config.rate_limit.max_tokens,
            rate_limit_refill_per_second: config.rate_limit.refill_per_second,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter_factor: self.jitter_factor,
            circuit_breaker_enabled: self.circuit_breaker_enabled,
            circuit_failure_threshold: self.circuit_failure_threshold,
            circuit_recovery_timeout: Duration::from_secs(self.circuit_recovery_timeout_secs),
            circuit_success_threshold: self.circuit_success_threshold,
            half_open_policy: self.half_open_policy.into(),
            rate_limit: RateLimitConfig {
                max_tokens: self.rate_limit_max_tokens,
                refill_per_second: self.rate_limit_refill_per_second,
            },
        }
    }
}

/// Serializable mirror of [`HalfOpenPolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HalfOpenMode {
    /// First failure while half-open re-opens the circuit
    #[default]
    Strict,
    /// Failures while half-open only reset the success streak
    Lenient,
}

impl From<HalfOpenMode> for HalfOpenPolicy {
    fn from(mode: HalfOpenMode) -> Self {
        match mode {
            HalfOpenMode::Strict => HalfOpenPolicy::Strict,
            HalfOpenMode::Lenient => HalfOpenPolicy::Lenient,
        }
    }
}

impl From<HalfOpenPolicy> for HalfOpenMode {
    fn from(policy: HalfOpenPolicy) -> Self {
        match policy {
            HalfOpenPolicy::Strict => HalfOpenMode::Strict,
            HalfOpenPolicy::Lenient => HalfOpenMode::Lenient,
        }
    }
}

/// `[pool]` section
///
/// A zero for any of the `*_secs` durations disables that mechanism.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_connections: usize,
    pub max_per_destination: usize,
    pub idle_timeout_secs: u64,
    pub max_connection_lifetime_secs: u64,
    pub acquire_mode: AcquireMode,
    /// Bound on the wait in `wait` mode
    pub acquire_timeout_ms: u64,
    /// Background sweep period
    pub health_check_interval_secs: u64,
}

/// What `acquire` does when a destination is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AcquireMode {
    /// Block up to `acquire_timeout_ms` for a slot
    #[default]
    Wait,
    /// Return `PoolExhausted` immediately
    FailFast,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let config = PoolConfig::default();
        let (acquire_mode, timeout) = match config.acquire_policy {
            AcquirePolicy::FailFast => (AcquireMode::FailFast, Duration::from_secs(30)),
            AcquirePolicy::Wait(timeout) => (AcquireMode::Wait, timeout),
        };
        Self {
            max_connections: config.max_connections,
            max_per_destination: config.max_per_destination,
            idle_timeout_secs: config.idle_timeout.map_or(0, |d| d.as_secs()),
            max_connection_lifetime_secs: config.max_connection_lifetime.map_or(0, |d| d.as_secs()),
            acquire_mode,
            acquire_timeout_ms: duration_ms(timeout),
            health_check_interval_secs: 60,
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections,
            max_per_destination: self.max_per_destination,
            idle_timeout: secs_or_disabled(self.idle_timeout_secs),
            max_connection_lifetime: secs_or_disabled(self.max_connection_lifetime_secs),
            acquire_policy: match self.acquire_mode {
                AcquireMode::Wait => {
                    AcquirePolicy::Wait(Duration::from_millis(self.acquire_timeout_ms))
                }
                AcquireMode::FailFast => AcquirePolicy::FailFast,
            },
        }
    }

    /// `None` when the background sweeper is disabled
    pub fn health_check_interval(&self) -> Option<Duration> {
        secs_or_disabled(self.health_check_interval_secs)
    }
}

fn secs_or_disabled(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// `[batch]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub concurrency: usize,
    pub retry_count: u32,
    pub show_progress: bool,
    pub retry_base_delay_ms: u64,
    pub progress_interval_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        let config = BatchConfig::default();
        Self {
            concurrency: config.concurrency,
            retry_count: config.retry_count,
            show_progress: config.show_progress,
            retry_base_delay_ms: duration_ms(config.retry_base_delay),
            progress_interval_ms: duration_ms(config.progress_interval),
        }
    }
}

impl BatchSettings {
    pub fn to_batch_config(&self) -> BatchConfig {
        BatchConfig {
            concurrency: self.concurrency,
            retry_count: self.retry_count,
            show_progress: self.show_progress,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            progress_interval: Duration::from_millis(self.progress_interval_ms),
        }
    }
}

/// `[request]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSettings {
    pub timeout_secs: u64,
    pub max_body_bytes: usize,
    pub connect_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Default for RequestSettings {
    fn default() -> Self {
        let options = RequestOptions::default();
        Self {
            timeout_secs: options.timeout.as_secs(),
            max_body_bytes: options.max_body_bytes,
            connect_timeout_secs: 10,
            user_agent: None,
        }
    }
}

impl RequestSettings {
    pub fn to_request_options(&self) -> RequestOptions {
        RequestOptions {
            timeout: Duration::from_secs(self.timeout_secs),
            max_body_bytes: self.max_body_bytes,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
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
}

impl SalvoConfig {
    /// Load configuration from a TOML file and validate it
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: SalvoConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject settings the runtime cannot honour
    pub fn validate(&self) -> Result<()> {
        self.retry
            .to_retry_config()
            .validate()
            .map_err(|e| SalvoError::Config(format!("[retry] {}", e)))?;

        if self.pool.max_connections == 0 || self.pool.max_per_destination == 0 {
            return Err(SalvoError::Config(
                "[pool] max_connections and max_per_destination must be at least 1".to_string(),
            ));
        }
        if self.pool.max_per_destination > self.pool.max_connections {
            return Err(SalvoError::Config(format!(
                "[pool] max_per_destination ({}) exceeds max_connections ({})",
                self.pool.max_per_destination, self.pool.max_connections
            )));
        }

        self.batch.to_batch_config().validate()?;

        if self.request.timeout_secs == 0 {
            return Err(SalvoError::Config(
                "[request] timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Quick retries and a fail-fast pool, for interactive use
    pub fn fast_preset() -> Self {
        Self {
            retry: RetrySettings::from(&RetryConfig::fast()),
            pool: PoolSettings {
                acquire_mode: AcquireMode::FailFast,
                ..Default::default()
            },
            batch: BatchSettings {
                concurrency: get_cpu_count() * 2,
                retry_count: 1,
                retry_base_delay_ms: 250,
                ..Default::default()
            },
            request: RequestSettings {
                timeout_secs: 10,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Slow, persistent retries for throttled upstreams
    pub fn patient_preset() -> Self {
        Self {
            retry: RetrySettings::from(&RetryConfig::patient()),
            pool: PoolSettings {
                acquire_timeout_ms: 120_000,
                ..Default::default()
            },
            batch: BatchSettings {
                concurrency: 2,
                retry_count: 5,
                ..Default::default()
            },
            request: RequestSettings {
                timeout_secs: 120,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        self.retry.to_retry_config()
    }

    pub fn pool_config(&self) -> PoolConfig {
        self.pool.to_pool_config()
    }

    pub fn batch_config(&self) -> BatchConfig {
        self.batch.to_batch_config()
    }

    pub fn request_options(&self) -> RequestOptions {
        self.request.to_request_options()
    }
}

/// Get the number of CPU cores available
pub fn get_cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SalvoConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.batch.retry_base_delay_ms, 1000);
    }

    #[test]
    fn test_presets_are_valid() {
        let fast = SalvoConfig::fast_preset();
        assert!(fast.validate().is_ok());
        assert_eq!(fast.pool_config().acquire_policy, AcquirePolicy::FailFast);
        assert!(fast.batch.concurrency > 0);

        let patient = SalvoConfig::patient_preset();
        assert!(patient.validate().is_ok());
        assert_eq!(patient.retry.max_attempts, 8);
    }

    #[test]
    fn test_retry_settings_round_trip_through_core_config() {
        let settings = RetrySettings {
            half_open_policy: HalfOpenMode::Lenient,
            base_delay_ms: 250,
            ..Default::default()
        };
        let config = settings.to_retry_config();
        assert_eq!(config.base_delay, Duration::from_millis(250));
        assert_eq!(config.half_open_policy, HalfOpenPolicy::Lenient);
        assert_eq!(RetrySettings::from(&config), settings);
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml_str = r#"
            log_level = "debug"

            [retry]
            max_attempts = 5
            half_open_policy = "lenient"

            [pool]
            max_per_destination = 2

            [batch]
            concurrency = 16
        "#;

        let config: SalvoConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.half_open_policy, HalfOpenMode::Lenient);
        // Unspecified keys keep their defaults
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.pool.max_per_destination, 2);
        assert_eq!(config.pool.max_connections, 100);
        assert_eq!(config.batch.concurrency, 16);
        assert_eq!(config.batch.retry_count, 3);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = SalvoConfig::default();
        config.retry.jitter_factor = 2.0;
        assert!(
            matches!(config.validate(), Err(SalvoError::Config(m)) if m.starts_with("[retry]"))
        );

        let mut config = SalvoConfig::default();
        config.pool.max_per_destination = 500;
        assert!(matches!(config.validate(), Err(SalvoError::Config(_))));

        let mut config = SalvoConfig::default();
        config.batch.concurrency = 0;
        assert!(matches!(config.validate(), Err(SalvoError::Config(_))));
    }

    #[test]
    fn test_pool_wait_policy_mapping() {
        let settings = PoolSettings {
            acquire_timeout_ms: 1500,
            ..Default::default()
        };
        assert_eq!(
            settings.to_pool_config().acquire_policy,
            AcquirePolicy::Wait(Duration::from_millis(1500))
        );

        let settings = PoolSettings {
            idle_timeout_secs: 0,
            health_check_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(settings.to_pool_config().idle_timeout, None);
        assert_eq!(settings.health_check_interval(), None);
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_tracing_level(), tracing::Level::ERROR);
        assert_eq!(LogLevel::Trace.to_tracing_level(), tracing::Level::TRACE);
    }

    #[test]
    fn test_cpu_count() {
        let count = get_cpu_count();
        assert!(count > 0, "CPU count should be greater than 0");
    }
}
