//! Error taxonomy shared by every resilience primitive
//!
//! Lower layers (pool, transport) always return one of these precise
//! classifications. Only the retry engine decides what to do with them.

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, ResilienceError>;

/// Classified failure of an outbound operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResilienceError {
    /// Remote end refused the connection
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Connection was reset or aborted mid-flight
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// Host or network could not be reached
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    /// Connection could not be established within the deadline
    #[error("connection timed out after {0:?}")]
    ConnectionTimeout(Duration),

    /// Request was sent but no complete response arrived in time
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// Upstream answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Response body exceeded the configured limit
    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// Request could not be built or addressed
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Any other transport-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Pool is at capacity and the acquire policy is fail-fast
    #[error("resource pool exhausted: {0}")]
    PoolExhausted(String),

    /// Bounded wait for a pooled resource expired
    #[error("timed out after {0:?} waiting for a pooled resource")]
    AcquireTimeout(Duration),

    /// Circuit breaker rejected the call without attempting it
    #[error("circuit breaker is open")]
    CircuitBreakerOpen,

    /// Cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ResilienceError {
    /// Default retry classifier.
    ///
    /// Transient network failures, timeouts, HTTP 408/429 and 5xx are
    /// retryable. Client errors, pool exhaustion and circuit rejection are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ResilienceError::ConnectionRefused(_)
            | ResilienceError::ConnectionReset(_)
            | ResilienceError::NetworkUnreachable(_)
            | ResilienceError::ConnectionTimeout(_)
            | ResilienceError::RequestTimeout(_)
            | ResilienceError::Transport(_) => true,
            ResilienceError::Http { status, .. } => is_retryable_status(*status),
            ResilienceError::BodyTooLarge { .. }
            | ResilienceError::InvalidRequest(_)
            | ResilienceError::PoolExhausted(_)
            | ResilienceError::AcquireTimeout(_)
            | ResilienceError::CircuitBreakerOpen
            | ResilienceError::Cancelled
            | ResilienceError::Config(_) => false,
        }
    }

    /// True when the failure says something about the connection itself,
    /// meaning the client that produced it should not be reused.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            ResilienceError::ConnectionRefused(_)
                | ResilienceError::ConnectionReset(_)
                | ResilienceError::NetworkUnreachable(_)
                | ResilienceError::ConnectionTimeout(_)
                | ResilienceError::Transport(_)
        )
    }

    /// Get error category for logging and result rows
    pub fn category(&self) -> ErrorCategory {
        match self {
            ResilienceError::ConnectionRefused(_)
            | ResilienceError::ConnectionReset(_)
            | ResilienceError::NetworkUnreachable(_)
            | ResilienceError::Transport(_) => ErrorCategory::Network,
            ResilienceError::ConnectionTimeout(_) | ResilienceError::RequestTimeout(_) => {
                ErrorCategory::Timeout
            }
            ResilienceError::Http { status, .. } => match status {
                429 | 503 => ErrorCategory::RateLimited,
                500..=599 => ErrorCategory::Server,
                _ => ErrorCategory::Client,
            },
            ResilienceError::BodyTooLarge { .. } | ResilienceError::InvalidRequest(_) => {
                ErrorCategory::Client
            }
            ResilienceError::PoolExhausted(_) | ResilienceError::AcquireTimeout(_) => {
                ErrorCategory::Pool
            }
            ResilienceError::CircuitBreakerOpen => ErrorCategory::Circuit,
            ResilienceError::Cancelled => ErrorCategory::Cancelled,
            ResilienceError::Config(_) => ErrorCategory::Configuration,
        }
    }
}

/// HTTP statuses worth retrying: request timeout, throttling, and 5xx
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..=599).contains(&status)
}

impl From<io::Error> for ResilienceError {
    fn from(err: io::Error) -> Self {
        use io::ErrorKind::*;
        match err.kind() {
            ConnectionRefused => ResilienceError::ConnectionRefused(err.to_string()),
            ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected => {
                ResilienceError::ConnectionReset(err.to_string())
            }
            TimedOut => ResilienceError::RequestTimeout(Duration::ZERO),
            AddrNotAvailable => ResilienceError::NetworkUnreachable(err.to_string()),
            InvalidInput => ResilienceError::InvalidRequest(err.to_string()),
            _ => ResilienceError::Transport(err.to_string()),
        }
    }
}

/// Coarse classification used in batch result rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Refused, reset, unreachable
    Network,
    /// Connect or request deadline expired
    Timeout,
    /// HTTP 429 / 503
    RateLimited,
    /// Other HTTP 5xx
    Server,
    /// HTTP 4xx and malformed requests
    Client,
    /// Pool exhaustion or acquire timeout
    Pool,
    /// Rejected by an open circuit
    Circuit,
    /// Aborted by a cancellation token
    Cancelled,
    /// Bad configuration
    Configuration,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::Server => "server",
            ErrorCategory::Client => "client",
            ErrorCategory::Pool => "pool",
            ErrorCategory::Circuit => "circuit",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Configuration => "configuration",
        };
        f.write_str(name)
    }
}
