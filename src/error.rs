/*!
 * Error types for Salvo
 *
 * Per-request failures are always [`ResilienceError`]; they end up in batch
 * result rows and never abort a batch. [`SalvoError`] covers failures to set
 * a run up: configuration, logging, worker pools.
 */

use salvo_core_resilience::{ErrorCategory, ResilienceError};
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SalvoError>;

#[derive(Debug, Error)]
pub enum SalvoError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed configuration file
    #[error("Failed to parse configuration: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// Configuration could not be serialized
    #[error("Failed to serialize configuration: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// Logging could not be initialized
    #[error("Logging error: {0}")]
    Logging(String),

    /// Worker pool could not be built
    #[error("Parallel processing error: {0}")]
    Parallel(String),

    /// Classified failure from the resilience layer
    #[error(transparent)]
    Resilience(#[from] ResilienceError),
}

impl SalvoError {
    /// Category of the underlying resilience error, if any
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            SalvoError::Resilience(e) => Some(e.category()),
            SalvoError::Config(_) | SalvoError::TomlDe(_) | SalvoError::TomlSer(_) => {
                Some(ErrorCategory::Configuration)
            }
            _ => None,
        }
    }

    /// Check if this error is fatal for a run (no point retrying setup)
    pub fn is_fatal(&self) -> bool {
        match self {
            SalvoError::Resilience(e) => !e.is_retryable(),
            _ => true,
        }
    }
}
