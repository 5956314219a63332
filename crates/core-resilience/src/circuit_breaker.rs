//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when a service
//! is experiencing issues. It has three states:
//! - Closed: Normal operation, requests pass through
//! - Open: Service is unhealthy, requests fail immediately
//! - HalfOpen: Testing if service has recovered
//!
//! The breaker is a passive gate. The retry engine asks [`CircuitBreaker::can_execute`]
//! before a call and reports the terminal outcome through
//! [`CircuitBreaker::on_success`] / [`CircuitBreaker::on_failure`].

use crate::lock_unpoisoned;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    Open,
    /// Circuit is half-open, testing service recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// What a failure during the half-open probation does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HalfOpenPolicy {
    /// A single failure re-opens the circuit and restarts the cooldown
    #[default]
    Strict,
    /// A failure only resets the success streak; the circuit stays half-open
    Lenient,
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of failures while closed before opening the circuit
    pub failure_threshold: u32,
    /// Number of consecutive successes in half-open to close the circuit
    pub success_threshold: u32,
    /// Time since the last failure before an open circuit lets a probe through
    pub recovery_timeout: Duration,
    /// Reaction to failures while half-open
    pub half_open_policy: HalfOpenPolicy,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_policy: HalfOpenPolicy::Strict,
        }
    }
}

/// Snapshot of the breaker for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Time elapsed since the most recent failure, if any
    pub since_last_failure: Option<Duration>,
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
        }
    }
}

/// Three-state failure tracker
///
/// All fields live behind one mutex, so every read-modify-write is atomic
/// with respect to concurrent workers sharing the breaker.
///
/// # Example
/// ```
/// use salvo_core_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
/// use std::time::Duration;
///
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig {
///     failure_threshold: 2,
///     recovery_timeout: Duration::from_secs(60),
///     ..Default::default()
/// });
///
/// breaker.on_failure();
/// breaker.on_failure();
/// assert_eq!(breaker.state(), CircuitState::Open);
/// assert!(!breaker.can_execute());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::new()),
        }
    }

    /// Create a new circuit breaker with default configuration
    pub fn new_default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Get the configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether a call may proceed.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to half-open
    /// here and admits the call.
    pub fn can_execute(&self) -> bool {
        self.can_execute_at(Instant::now())
    }

    fn can_execute_at(&self, now: Instant) -> bool {
        let mut state = lock_unpoisoned(&self.state);

        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = state
                    .last_failure_time
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(Duration::MAX);

                if elapsed > self.config.recovery_timeout {
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    tracing::info!("circuit breaker half-open after {:?}", elapsed);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful terminal outcome
    pub fn on_success(&self) {
        let mut state = lock_unpoisoned(&self.state);

        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.failure_count = 0;
                state.success_count += 1;

                if state.success_count >= self.config.success_threshold {
                    state.state = CircuitState::Closed;
                    state.success_count = 0;
                    tracing::info!("circuit breaker closed");
                }
            }
            CircuitState::Open => {
                // A call admitted before the trip finished late; the cooldown stands
            }
        }
    }

    /// Record a failed terminal outcome
    pub fn on_failure(&self) {
        self.on_failure_at(Instant::now());
    }

    fn on_failure_at(&self, now: Instant) {
        let mut state = lock_unpoisoned(&self.state);
        state.last_failure_time = Some(now);
        state.success_count = 0;

        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;

                if state.failure_count >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    tracing::warn!(
                        failures = state.failure_count,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => match self.config.half_open_policy {
                HalfOpenPolicy::Strict => {
                    state.failure_count += 1;
                    state.state = CircuitState::Open;
                    tracing::warn!("circuit breaker re-opened during half-open probe");
                }
                HalfOpenPolicy::Lenient => {
                    tracing::debug!("half-open probe failed, success streak reset");
                }
            },
            CircuitState::Open => {
                state.failure_count += 1;
            }
        }
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        lock_unpoisoned(&self.state).state
    }

    /// Get a consistent snapshot of every counter
    pub fn status(&self) -> CircuitBreakerStatus {
        let state = lock_unpoisoned(&self.state);
        CircuitBreakerStatus {
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            since_last_failure: state.last_failure_time.map(|at| at.elapsed()),
        }
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let mut state = lock_unpoisoned(&self.state);
        *state = BreakerState::new();
    }
}
