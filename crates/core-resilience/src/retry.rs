//! Retry orchestration
//!
//! [`RetryEngine`] owns one [`RateLimiter`] and, optionally, one
//! [`CircuitBreaker`]. Share the engine (behind an `Arc`) between workers that
//! talk to the same upstream so they share one failure budget and one quota.
//!
//! Per call:
//! 1. An open circuit fails the call with `CircuitBreakerOpen` before any
//!    attempt or token is spent.
//! 2. Every attempt first takes one rate-limit token, sleeping for at most
//!    [`MAX_RATE_LIMIT_WAIT`] when the bucket is dry.
//! 3. Success returns immediately. A failure is either retried after a
//!    jittered backoff or, when not retryable or out of attempts, reported to
//!    the breaker and returned.

use crate::backoff::Backoff;
use crate::cancel::CancellationToken;
use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, HalfOpenPolicy,
};
use crate::error::{ErrorCategory, ResilienceError, Result};
use crate::rate_limiter::{RateLimitConfig, RateLimitStatus, RateLimiter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Longest the engine will wait for a rate-limit token before proceeding anyway
pub const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(5);

/// Retry policy, fixed at engine construction
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first (>= 1)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound for any single backoff
    pub max_delay: Duration,
    /// Growth factor per attempt (> 1.0)
    pub backoff_multiplier: f64,
    /// Relative jitter amplitude (0.0 - 1.0)
    pub jitter_factor: f64,
    /// Gate calls through a circuit breaker
    pub circuit_breaker_enabled: bool,
    /// Failures before the circuit opens
    pub circuit_failure_threshold: u32,
    /// Cooldown before an open circuit admits a probe
    pub circuit_recovery_timeout: Duration,
    /// Consecutive half-open successes needed to close
    pub circuit_success_threshold: u32,
    /// Reaction to failures while half-open
    pub half_open_policy: HalfOpenPolicy,
    /// Token bucket guarding attempts
    pub rate_limit: RateLimitConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            circuit_breaker_enabled: true,
            circuit_failure_threshold: 5,
            circuit_recovery_timeout: Duration::from_secs(30),
            circuit_success_threshold: 3,
            half_open_policy: HalfOpenPolicy::Strict,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl RetryConfig {
    /// Many quick retries, for cheap idempotent calls
    pub fn fast() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            jitter_factor: 0.2,
            ..Default::default()
        }
    }

    /// Few slow retries, for throttled or expensive upstreams
    pub fn patient() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.3,
            circuit_recovery_timeout: Duration::from_secs(60),
            ..Default::default()
        }
    }

    /// Check the invariants the engine relies on
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ResilienceError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !(self.backoff_multiplier > 1.0) {
            return Err(ResilienceError::Config(format!(
                "backoff_multiplier must be greater than 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ResilienceError::Config(format!(
                "jitter_factor must be within 0.0..=1.0, got {}",
                self.jitter_factor
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(ResilienceError::Config(format!(
                "base_delay {:?} exceeds max_delay {:?}",
                self.base_delay, self.max_delay
            )));
        }
        if self.circuit_breaker_enabled
            && (self.circuit_failure_threshold == 0 || self.circuit_success_threshold == 0)
        {
            return Err(ResilienceError::Config(
                "circuit breaker thresholds must be at least 1".to_string(),
            ));
        }
        if !(self.rate_limit.max_tokens >= 1.0) || self.rate_limit.refill_per_second < 0.0 {
            return Err(ResilienceError::Config(format!(
                "rate limit needs at least one token and a non-negative refill rate, got {:?}",
                self.rate_limit
            )));
        }
        Ok(())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            self.base_delay,
            self.max_delay,
            self.backoff_multiplier,
            self.jitter_factor,
        )
    }

    fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_failure_threshold,
            success_threshold: self.circuit_success_threshold,
            recovery_timeout: self.circuit_recovery_timeout,
            half_open_policy: self.half_open_policy,
        }
    }
}

/// Full outcome of one `run` call
#[derive(Debug)]
pub struct Execution<T> {
    pub result: Result<T>,
    /// Number of times the operation was invoked
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Engine-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Calls to `run`/`execute*`
    pub calls: u64,
    /// Operation invocations
    pub attempts: u64,
    /// Backoff sleeps taken
    pub retries: u64,
    pub successes: u64,
    /// Calls that ended in an error after attempting
    pub failures: u64,
    /// Calls rejected by an open circuit
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct EngineCounters {
    calls: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejected: AtomicU64,
}

/// Retry engine
///
/// # Example
/// ```
/// use salvo_core_resilience::{ResilienceError, RetryConfig, RetryEngine};
/// use std::time::Duration;
///
/// let engine = RetryEngine::new(RetryConfig {
///     base_delay: Duration::from_millis(1),
///     ..Default::default()
/// })?;
///
/// let mut calls = 0;
/// let value = engine.execute(|| {
///     calls += 1;
///     if calls < 2 {
///         Err(ResilienceError::ConnectionReset("peer went away".into()))
///     } else {
///         Ok(42)
///     }
/// })?;
///
/// assert_eq!(value, 42);
/// assert_eq!(calls, 2);
/// # Ok::<(), ResilienceError>(())
/// ```
#[derive(Debug)]
pub struct RetryEngine {
    config: RetryConfig,
    backoff: Backoff,
    rate_limiter: RateLimiter,
    circuit_breaker: Option<CircuitBreaker>,
    counters: EngineCounters,
}

impl RetryEngine {
    /// Build an engine, validating the policy
    pub fn new(config: RetryConfig) -> Result<Self> {
        config.validate()?;

        let circuit_breaker = config
            .circuit_breaker_enabled
            .then(|| CircuitBreaker::new(config.circuit_breaker_config()));

        Ok(Self {
            backoff: config.backoff(),
            rate_limiter: RateLimiter::from_config(&config.rate_limit),
            circuit_breaker,
            counters: EngineCounters::default(),
            config,
        })
    }

    /// Run `op` with the default retry classifier
    pub fn execute<T, F>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        self.run(None, op, ResilienceError::is_retryable).result
    }

    /// Run `op`, retrying only errors `retryable` accepts
    pub fn execute_if<T, F, P>(&self, op: F, retryable: P) -> Result<T>
    where
        F: FnMut() -> Result<T>,
        P: Fn(&ResilienceError) -> bool,
    {
        self.run(None, op, retryable).result
    }

    /// Run `op`, aborting between attempts and during sleeps once `cancel` fires
    pub fn execute_cancellable<T, F, P>(
        &self,
        cancel: &CancellationToken,
        op: F,
        retryable: P,
    ) -> Result<T>
    where
        F: FnMut() -> Result<T>,
        P: Fn(&ResilienceError) -> bool,
    {
        self.run(Some(cancel), op, retryable).result
    }

    /// Run `op` and report attempts and elapsed time alongside the result
    pub fn run<T, F, P>(
        &self,
        cancel: Option<&CancellationToken>,
        mut op: F,
        retryable: P,
    ) -> Execution<T>
    where
        F: FnMut() -> Result<T>,
        P: Fn(&ResilienceError) -> bool,
    {
        let start = Instant::now();
        self.counters.calls.fetch_add(1, Ordering::Relaxed);

        let finish = |result: Result<T>, attempts: u32| Execution {
            result,
            attempts,
            elapsed: start.elapsed(),
        };

        if let Some(breaker) = &self.circuit_breaker {
            if !breaker.can_execute() {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("call rejected by open circuit");
                return finish(Err(ResilienceError::CircuitBreakerOpen), 0);
            }
        }

        let mut rng = rand::rng();
        let mut attempt: u32 = 0;

        loop {
            if let Err(e) = self.throttle(cancel) {
                return finish(Err(e), attempt);
            }

            attempt += 1;
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);

            let error = match op() {
                Ok(value) => {
                    if let Some(breaker) = &self.circuit_breaker {
                        breaker.on_success();
                    }
                    self.counters.successes.fetch_add(1, Ordering::Relaxed);
                    return finish(Ok(value), attempt);
                }
                Err(e) => e,
            };

            if error == ResilienceError::Cancelled {
                return finish(Err(error), attempt);
            }

            let exhausted = attempt >= self.config.max_attempts;
            if exhausted || !retryable(&error) {
                // Local pool contention says nothing about upstream health
                if error.category() != ErrorCategory::Pool {
                    if let Some(breaker) = &self.circuit_breaker {
                        breaker.on_failure();
                    }
                }
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    attempts = attempt,
                    category = %error.category(),
                    "giving up: {}",
                    error
                );
                return finish(Err(error), attempt);
            }

            let delay = self.backoff.jittered(attempt - 1, &mut rng);
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                attempt,
                max_attempts = self.config.max_attempts,
                "retrying in {:?} after: {}",
                delay,
                error
            );

            if let Err(e) = pause(cancel, delay) {
                return finish(Err(e), attempt);
            }
        }
    }

    /// Take one token, waiting a bounded time when the bucket is dry
    fn throttle(&self, cancel: Option<&CancellationToken>) -> Result<()> {
        if let Some(token) = cancel {
            token.check()?;
        }
        if self.rate_limiter.try_acquire(1.0) {
            return Ok(());
        }

        let wait = self.rate_limiter.wait_time_for(1.0).min(MAX_RATE_LIMIT_WAIT);
        tracing::debug!("rate limited, waiting {:?}", wait);
        pause(cancel, wait)?;

        // Proceed even if the bucket is still short after the capped wait
        let _ = self.rate_limiter.try_acquire(1.0);
        Ok(())
    }

    /// Get the policy
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Get the circuit breaker, if enabled
    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.circuit_breaker.as_ref()
    }

    /// Snapshot of the rate limiter
    pub fn rate_limit_status(&self) -> RateLimitStatus {
        self.rate_limiter.status()
    }

    /// Snapshot of the circuit breaker, if enabled
    pub fn circuit_breaker_status(&self) -> Option<CircuitBreakerStatus> {
        self.circuit_breaker.as_ref().map(CircuitBreaker::status)
    }

    /// Snapshot of engine counters
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            calls: self.counters.calls.load(Ordering::Relaxed),
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

fn pause(cancel: Option<&CancellationToken>, duration: Duration) -> Result<()> {
    if duration.is_zero() {
        return Ok(());
    }
    match cancel {
        Some(token) => token.sleep(duration),
        None => {
            thread::sleep(duration);
            Ok(())
        }
    }
}
