//! Exponential backoff with jitter
//!
//! `delay = min(max_delay, base_delay * multiplier^attempt)`, then
//! `delay += (sample - 0.5) * delay * jitter_factor` with `sample` uniform in
//! `[0, 1)`. Jittered delays never drop below one millisecond.

use rand::Rng;
use std::time::Duration;

/// Smallest delay a jittered backoff will produce
pub const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// Backoff schedule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_factor: f64,
}

impl Backoff {
    pub fn new(
        base_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter_factor: f64,
    ) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Delay after the failure of zero-based `attempt`, before jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = self.base_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        duration_from_nanos(nanos.min(self.max_delay.as_nanos() as f64))
    }

    /// Apply jitter using an explicit sample in `[0, 1)`
    pub fn jitter_with(&self, delay: Duration, sample: f64) -> Duration {
        let nanos = delay.as_nanos() as f64;
        let jittered = nanos + (sample - 0.5) * nanos * self.jitter_factor;
        duration_from_nanos(jittered).max(MIN_BACKOFF)
    }

    /// Jittered delay for `attempt` drawing from `rng`
    pub fn jittered<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let sample: f64 = rng.random();
        self.jitter_with(self.delay_for(attempt), sample)
    }
}

fn duration_from_nanos(nanos: f64) -> Duration {
    if nanos.is_nan() || nanos <= 0.0 {
        Duration::ZERO
    } else if nanos >= u64::MAX as f64 {
        Duration::from_nanos(u64::MAX)
    } else {
        Duration::from_nanos(nanos.round() as u64)
    }
}
