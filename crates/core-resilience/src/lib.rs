//! Salvo Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! Building blocks for issuing outbound calls under concurrent load without
//! overwhelming, or being dragged down by, the services on the other end:
//!
//! - **Rate Limiter**: Token bucket with lazy refill
//! - **Circuit Breaker**: Three-state failure tracker that fails fast while tripped
//! - **Retry Engine**: Exponential backoff with jitter, gated by the two above
//! - **Resource Pool**: Exclusive per-destination checkouts with health sweeps
//! - **Balanced Pool**: Smooth weighted round-robin across backend replicas
//! - **Cancellation**: Cloneable token that interrupts waits and sleeps
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Wire protocols (HTTP, TLS)
//! - Configuration formats and files
//! - Application-specific payloads
//!
//! Everything here is synchronous and thread-safe. State shared between
//! workers (breaker, bucket, pool bookkeeping) lives behind one mutex per
//! primitive; pooled resources themselves are never shared.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Worker thread                   │
//! └─────────────┬───────────────────────────┘
//!               │ RetryEngine::execute(op)
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast while open
//! └─────────────┬───────────────────────────┘
//!               ▼ per attempt
//! ┌─────────────────────────────────────────┐
//! │       Rate Limiter                      │  ← One token per attempt
//! └─────────────┬───────────────────────────┘
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Resource Pool / Balanced Pool     │  ← Exclusive checkout
//! └─────────────┬───────────────────────────┘
//!               ▼
//!         External Service
//! ```
//!
//! # Usage Example
//!
//! ```
//! use salvo_core_resilience::prelude::*;
//! use std::time::Duration;
//!
//! let engine = RetryEngine::new(RetryConfig {
//!     max_attempts: 3,
//!     base_delay: Duration::from_millis(1),
//!     ..Default::default()
//! })?;
//!
//! let answer = engine.execute_if(
//!     || Ok::<_, ResilienceError>(42),
//!     |e| matches!(e, ResilienceError::Http { status: 503, .. }),
//! )?;
//! assert_eq!(answer, 42);
//! # Ok::<(), ResilienceError>(())
//! ```

pub mod backoff;
pub mod balancer;
pub mod cancel;
pub mod circuit_breaker;
pub mod connection_pool;
pub mod error;
pub mod rate_limiter;
pub mod retry;

// Re-export main types for convenience
pub use backoff::{Backoff, MIN_BACKOFF};
pub use balancer::{Backend, BackendId, BackendStats, BalancedPool, BalancerConfig};
pub use cancel::CancellationToken;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitState, HalfOpenPolicy,
};
pub use connection_pool::{
    AcquirePolicy, Destination, DestinationStats, PoolConfig, PoolStats, PooledHandle,
    ResourceFactory, ResourcePool,
};
pub use error::{is_retryable_status, ErrorCategory, ResilienceError, Result};
pub use rate_limiter::{RateLimitConfig, RateLimitStatus, RateLimiter};
pub use retry::{EngineStats, Execution, RetryConfig, RetryEngine, MAX_RATE_LIMIT_WAIT};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a previous holder panicked
///
/// Every guarded structure here is left consistent between statements, so
/// the data behind a poisoned lock is still valid.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use salvo_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::balancer::{Backend, BackendId, BalancedPool};
    pub use super::cancel::CancellationToken;
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::connection_pool::{
        AcquirePolicy, Destination, PoolConfig, PooledHandle, ResourceFactory, ResourcePool,
    };
    pub use super::error::{ErrorCategory, ResilienceError};
    pub use super::rate_limiter::RateLimiter;
    pub use super::retry::{RetryConfig, RetryEngine};
}
