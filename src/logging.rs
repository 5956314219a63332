/*!
 * Logging and tracing initialization
 */

use std::fs::File;
use std::path::Path;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::SalvoConfig;
use crate::error::{Result, SalvoError};

/// Initialize structured logging based on configuration
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_logging(config: &SalvoConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(config)))
        .map_err(|e| SalvoError::Config(format!("Failed to create log filter: {}", e)))?;

    if let Some(ref log_path) = config.log_file {
        init_file_logging(log_path, env_filter)
    } else {
        init_stdout_logging(env_filter)
    }
}

/// Filter directives covering both crates at the effective level
pub fn default_directives(config: &SalvoConfig) -> String {
    let level = effective_level(config);
    format!("salvo={level},salvo_core_resilience={level}")
}

fn effective_level(config: &SalvoConfig) -> Level {
    if config.verbose {
        Level::DEBUG
    } else {
        config.log_level.to_tracing_level()
    }
}

fn init_stdout_logging(env_filter: EnvFilter) -> Result<()> {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| SalvoError::Logging(e.to_string()))
}

fn init_file_logging(log_path: &Path, env_filter: EnvFilter) -> Result<()> {
    let file = File::create(log_path)
        .map_err(|e| SalvoError::Logging(format!("Failed to create log file: {}", e)))?;

    // Worker thread names identify batch workers in the JSON output
    let fmt_layer = fmt::layer()
        .with_writer(file)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false)
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| SalvoError::Logging(e.to_string()))
}

/// Initialize logging with custom format for testing
#[cfg(test)]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("salvo=debug"));

        let fmt_layer = fmt::layer().with_test_writer().with_target(false).compact();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .ok();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_default_directives_use_configured_level() {
        let config = SalvoConfig {
            log_level: LogLevel::Warn,
            ..Default::default()
        };
        assert_eq!(
            default_directives(&config),
            "salvo=WARN,salvo_core_resilience=WARN"
        );
    }

    #[test]
    fn test_verbose_overrides_log_level() {
        let config = SalvoConfig {
            log_level: LogLevel::Error,
            verbose: true,
            ..Default::default()
        };
        assert_eq!(effective_level(&config), Level::DEBUG);
    }

    #[test]
    fn test_second_init_reports_error() {
        init_test_logging();
        // A global subscriber is already installed by the test helper
        let result = init_logging(&SalvoConfig::default());
        assert!(matches!(result, Err(SalvoError::Logging(_))));
    }

    #[test]
    fn test_unwritable_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = SalvoConfig {
            log_file: Some(dir.path().join("missing").join("salvo.log")),
            ..Default::default()
        };
        let result = init_logging(&config);
        assert!(matches!(result, Err(SalvoError::Logging(_))));
    }
}
