//! Cooperative cancellation shared by the retry engine, the pool, and batch workers
//!
//! A token is cheap to clone; all clones observe the same flag. Sleeping
//! through [`CancellationToken::sleep`] wakes immediately on cancel, so
//! backoff delays never hold up an aborted batch.

use crate::error::{ResilienceError, Result};
use crate::lock_unpoisoned;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct TokenState {
    cancelled: Mutex<bool>,
    condvar: Condvar,
}

/// Cloneable cancellation flag with interruptible sleeps
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    /// Create a token that has not fired
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token and wake every sleeper
    pub fn cancel(&self) {
        let mut cancelled = lock_unpoisoned(&self.state.cancelled);
        if !*cancelled {
            *cancelled = true;
            tracing::debug!("cancellation requested");
        }
        self.state.condvar.notify_all();
    }

    /// Check whether the token has fired
    pub fn is_cancelled(&self) -> bool {
        *lock_unpoisoned(&self.state.cancelled)
    }

    /// Return `Err(Cancelled)` if the token has fired
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ResilienceError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, returning early with `Cancelled` if the token fires
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        let mut cancelled = lock_unpoisoned(&self.state.cancelled);

        loop {
            if *cancelled {
                return Err(ResilienceError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            cancelled = match self.state.condvar.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_token_starts_clear() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.check(), Err(ResilienceError::Cancelled));
    }

    #[test]
    fn test_sleep_completes_without_cancel() {
        let token = CancellationToken::new();
        let start = Instant::now();
        assert!(token.sleep(Duration::from_millis(20)).is_ok());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_cancel_interrupts_sleep() {
        let token = CancellationToken::new();
        let canceller = token.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });

        let start = Instant::now();
        let result = token.sleep(Duration::from_secs(10));
        handle.join().unwrap();

        assert_eq!(result, Err(ResilienceError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
