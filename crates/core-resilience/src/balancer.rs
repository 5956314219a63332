//! Weighted load balancing over pooled backends
//!
//! Selection is smooth weighted round-robin: every pick adds each eligible
//! backend's weight to its running score, the highest score wins and is
//! lowered by the total weight. Over any `sum(weights)` picks each backend is
//! chosen exactly `weight` times, interleaved rather than in bursts. A backend
//! skipped because it is full or failing takes no part in that round.
//!
//! A backend that fails `failure_threshold` times in a row is ejected for
//! `ejection_cooldown`. If every backend is ejected, all of them become
//! eligible again rather than refusing traffic.

use crate::cancel::CancellationToken;
use crate::connection_pool::{AcquirePolicy, Destination, PooledHandle, ResourcePool};
use crate::error::{ResilienceError, Result};
use crate::lock_unpoisoned;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Index of a backend in the order it was configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(pub usize);

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend-{}", self.0)
    }
}

/// One replica and its share of traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub destination: Destination,
    /// Relative share; zero disables the backend
    pub weight: u32,
}

impl Backend {
    pub fn new(destination: Destination, weight: u32) -> Self {
        Self {
            destination,
            weight,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Consecutive failures before a backend is ejected
    pub failure_threshold: u32,
    /// How long an ejected backend sits out
    pub ejection_cooldown: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            ejection_cooldown: Duration::from_secs(30),
        }
    }
}

/// Per-backend accounting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStats {
    pub id: BackendId,
    pub destination: Destination,
    pub weight: u32,
    /// Times a handle to this backend was handed out
    pub selected: u64,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub ejected: bool,
}

#[derive(Debug, Default)]
struct BackendState {
    current_weight: i64,
    consecutive_failures: u32,
    ejected_until: Option<Instant>,
    selected: u64,
    successes: u64,
    failures: u64,
}

impl BackendState {
    fn is_ejected(&self, now: Instant) -> bool {
        self.ejected_until.is_some_and(|until| now < until)
    }
}

/// One advance of the round-robin, settled after checkout
struct Round {
    order: Vec<BackendId>,
    total: i64,
}

/// Pool front-end that picks a backend per checkout
#[derive(Debug)]
pub struct BalancedPool<T> {
    pool: ResourcePool<T>,
    backends: Vec<Backend>,
    config: BalancerConfig,
    state: Mutex<Vec<BackendState>>,
}

impl<T: Send + 'static> BalancedPool<T> {
    /// Fails with `Config` when no backend has a positive weight
    pub fn new(pool: ResourcePool<T>, backends: Vec<Backend>) -> Result<Self> {
        Self::with_config(pool, backends, BalancerConfig::default())
    }

    pub fn with_config(
        pool: ResourcePool<T>,
        backends: Vec<Backend>,
        config: BalancerConfig,
    ) -> Result<Self> {
        if backends.iter().all(|backend| backend.weight == 0) {
            return Err(ResilienceError::Config(
                "load balancer needs at least one backend with a positive weight".to_string(),
            ));
        }
        if config.failure_threshold == 0 {
            return Err(ResilienceError::Config(
                "ejection failure_threshold must be at least 1".to_string(),
            ));
        }

        let state = backends.iter().map(|_| BackendState::default()).collect();
        Ok(Self {
            pool,
            backends,
            config,
            state: Mutex::new(state),
        })
    }

    pub fn pool(&self) -> &ResourcePool<T> {
        &self.pool
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    pub fn backend(&self, id: BackendId) -> Option<&Backend> {
        self.backends.get(id.0)
    }

    /// Check out a handle from the next backend in weighted order
    ///
    /// Backends without a free slot are skipped and sit out the round. When
    /// no backend can hand out a slot right away but at least one is merely
    /// full, waits on the best-ranked full one according to the pool's policy.
    pub fn acquire_balanced(&self) -> Result<(BackendId, PooledHandle<T>)> {
        self.acquire_inner(None)
    }

    pub fn acquire_balanced_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(BackendId, PooledHandle<T>)> {
        self.acquire_inner(Some(cancel))
    }

    fn acquire_inner(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<(BackendId, PooledHandle<T>)> {
        let round = self.selection_order(Instant::now());
        let mut first_full = None;
        let mut last_error = None;

        for (position, &id) in round.order.iter().enumerate() {
            let destination = &self.backends[id.0].destination;
            match self.pool.try_acquire(destination) {
                Ok(handle) => {
                    self.settle(&round, Some(position));
                    return Ok((id, handle));
                }
                Err(ResilienceError::PoolExhausted(_)) => {
                    tracing::trace!(backend = %id, "backend full, trying next");
                    first_full.get_or_insert(position);
                }
                Err(e) => {
                    tracing::debug!(backend = %id, "backend unavailable: {}", e);
                    self.record_failure(id);
                    last_error = Some(e);
                }
            }
        }

        let waitable = matches!(self.pool.config().acquire_policy, AcquirePolicy::Wait(_));
        let position = match (first_full, last_error) {
            (Some(position), None) => position,
            (Some(position), Some(_)) if waitable => position,
            (_, Some(e)) => {
                self.settle(&round, None);
                return Err(e);
            }
            (None, None) => 0,
        };

        let id = round.order[position];
        let destination = &self.backends[id.0].destination;
        let acquired = match cancel {
            Some(token) => self.pool.acquire_cancellable(destination, token),
            None => self.pool.acquire(destination),
        };
        match acquired {
            Ok(handle) => {
                self.settle(&round, Some(position));
                Ok((id, handle))
            }
            Err(e) => {
                self.settle(&round, None);
                Err(e)
            }
        }
    }

    /// Advance the round-robin once, charging the winner up front
    ///
    /// The winner comes first, the rest by score. [`Self::settle`] corrects
    /// the charge once it is known who actually served.
    fn selection_order(&self, now: Instant) -> Round {
        let mut state = lock_unpoisoned(&self.state);

        let mut eligible: Vec<usize> = (0..self.backends.len())
            .filter(|&i| self.backends[i].weight > 0 && !state[i].is_ejected(now))
            .collect();
        if eligible.is_empty() {
            tracing::warn!("all backends ejected, ignoring ejections");
            eligible = (0..self.backends.len())
                .filter(|&i| self.backends[i].weight > 0)
                .collect();
        }

        let total: i64 = eligible.iter().map(|&i| self.weight_of(i)).sum();
        for &i in &eligible {
            state[i].current_weight += self.weight_of(i);
        }

        // Stable sort keeps configuration order among equal scores
        let mut order = eligible;
        order.sort_by_key(|&i| std::cmp::Reverse(state[i].current_weight));
        state[order[0]].current_weight -= total;

        Round {
            order: order.into_iter().map(BackendId).collect(),
            total,
        }
    }

    /// Close a round once the serving backend is known
    ///
    /// Backends ranked ahead of the one that served were full or failing and
    /// drop out of the round entirely. With no server the round is undone.
    fn settle(&self, round: &Round, served: Option<usize>) {
        let mut state = lock_unpoisoned(&self.state);
        let winner = round.order[0].0;

        match served {
            Some(0) => {}
            Some(position) => {
                let mut skipped_weight = 0;
                for id in &round.order[..position] {
                    let weight = self.weight_of(id.0);
                    state[id.0].current_weight -= weight;
                    skipped_weight += weight;
                }
                state[winner].current_weight += round.total;
                state[round.order[position].0].current_weight -= round.total - skipped_weight;
            }
            None => {
                for id in &round.order {
                    state[id.0].current_weight -= self.weight_of(id.0);
                }
                state[winner].current_weight += round.total;
            }
        }

        if let Some(position) = served {
            state[round.order[position].0].selected += 1;
        }
    }

    fn weight_of(&self, index: usize) -> i64 {
        i64::from(self.backends[index].weight)
    }

    /// Record a successful call against `id`
    pub fn record_success(&self, id: BackendId) {
        let mut state = lock_unpoisoned(&self.state);
        if let Some(backend) = state.get_mut(id.0) {
            backend.successes += 1;
            backend.consecutive_failures = 0;
        }
    }

    /// Record a failed call against `id`, ejecting it at the threshold
    pub fn record_failure(&self, id: BackendId) {
        let now = Instant::now();
        let mut state = lock_unpoisoned(&self.state);
        let Some(backend) = state.get_mut(id.0) else {
            return;
        };

        backend.failures += 1;
        backend.consecutive_failures += 1;
        if backend.consecutive_failures >= self.config.failure_threshold {
            backend.consecutive_failures = 0;
            backend.ejected_until = Some(now + self.config.ejection_cooldown);
            tracing::warn!(
                backend = %id,
                destination = %self.backends[id.0].destination,
                "backend ejected for {:?}",
                self.config.ejection_cooldown
            );
        }
    }

    pub fn backend_stats(&self) -> Vec<BackendStats> {
        let now = Instant::now();
        let state = lock_unpoisoned(&self.state);
        self.backends
            .iter()
            .zip(state.iter())
            .enumerate()
            .map(|(i, (backend, state))| BackendStats {
                id: BackendId(i),
                destination: backend.destination.clone(),
                weight: backend.weight,
                selected: state.selected,
                successes: state.successes,
                failures: state.failures,
                consecutive_failures: state.consecutive_failures,
                ejected: state.is_ejected(now),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_pool::{AcquirePolicy, PoolConfig, ResourceFactory};
    use std::sync::Arc;

    struct Named;

    impl ResourceFactory<String> for Named {
        fn create(&self, destination: &Destination) -> Result<String> {
            if destination.host == "down" {
                return Err(ResilienceError::ConnectionRefused(destination.to_string()));
            }
            Ok(destination.host.clone())
        }

        fn is_healthy(&self, _resource: &String) -> bool {
            true
        }
    }

    fn pool(per_destination: usize) -> ResourcePool<String> {
        ResourcePool::new(
            Arc::new(Named),
            PoolConfig {
                max_per_destination: per_destination,
                acquire_policy: AcquirePolicy::FailFast,
                ..Default::default()
            },
        )
    }

    fn backend(host: &str, weight: u32) -> Backend {
        Backend::new(Destination::new(host, 80), weight)
    }

    fn pick(balancer: &BalancedPool<String>) -> String {
        let (_, handle) = balancer.acquire_balanced().unwrap();
        handle.clone()
    }

    #[test]
    fn test_smooth_weighted_sequence() {
        let balancer = BalancedPool::new(
            pool(10),
            vec![backend("a", 5), backend("b", 1), backend("c", 1)],
        )
        .unwrap();

        let picks: Vec<String> = (0..7).map(|_| pick(&balancer)).collect();
        assert_eq!(picks, vec!["a", "a", "b", "a", "c", "a", "a"]);
    }

    #[test]
    fn test_weights_respected_over_many_rounds() {
        let balancer =
            BalancedPool::new(pool(10), vec![backend("a", 3), backend("b", 1)]).unwrap();
        for _ in 0..400 {
            pick(&balancer);
        }

        let stats = balancer.backend_stats();
        assert_eq!(stats[0].selected, 300);
        assert_eq!(stats[1].selected, 100);
    }

    #[test]
    fn test_zero_weight_never_selected() {
        let balancer =
            BalancedPool::new(pool(10), vec![backend("a", 1), backend("off", 0)]).unwrap();
        for _ in 0..10 {
            assert_eq!(pick(&balancer), "a");
        }
    }

    #[test]
    fn test_rejects_unusable_backend_list() {
        assert!(matches!(
            BalancedPool::new(pool(1), vec![]),
            Err(ResilienceError::Config(_))
        ));
        assert!(matches!(
            BalancedPool::new(pool(1), vec![backend("a", 0)]),
            Err(ResilienceError::Config(_))
        ));
    }

    #[test]
    fn test_full_backend_falls_through() {
        let balancer =
            BalancedPool::new(pool(1), vec![backend("a", 10), backend("b", 1)]).unwrap();

        let (first_id, first) = balancer.acquire_balanced().unwrap();
        assert_eq!(first_id, BackendId(0));

        // "a" still has the higher score but no free slot
        let (second_id, second) = balancer.acquire_balanced().unwrap();
        assert_eq!(second_id, BackendId(1));
        assert_eq!(second.as_str(), "b");

        // Both full and the pool fails fast
        assert!(matches!(
            balancer.acquire_balanced(),
            Err(ResilienceError::PoolExhausted(_))
        ));
        drop(first);
        drop(second);
    }

    #[test]
    fn test_ejection_after_consecutive_failures() {
        let balancer = BalancedPool::with_config(
            pool(10),
            vec![backend("a", 1), backend("b", 1)],
            BalancerConfig {
                failure_threshold: 2,
                ejection_cooldown: Duration::from_secs(60),
            },
        )
        .unwrap();

        balancer.record_failure(BackendId(0));
        balancer.record_success(BackendId(0));
        balancer.record_failure(BackendId(0));
        assert!(!balancer.backend_stats()[0].ejected);

        balancer.record_failure(BackendId(0));
        assert!(balancer.backend_stats()[0].ejected);

        for _ in 0..5 {
            assert_eq!(pick(&balancer), "b");
        }
    }

    #[test]
    fn test_ejection_expires() {
        let balancer = BalancedPool::with_config(
            pool(10),
            vec![backend("a", 1), backend("b", 1)],
            BalancerConfig {
                failure_threshold: 1,
                ejection_cooldown: Duration::from_millis(20),
            },
        )
        .unwrap();

        balancer.record_failure(BackendId(0));
        assert!(balancer.backend_stats()[0].ejected);
        std::thread::sleep(Duration::from_millis(40));
        assert!(!balancer.backend_stats()[0].ejected);

        let picks: Vec<String> = (0..4).map(|_| pick(&balancer)).collect();
        assert!(picks.iter().any(|p| p == "a"));
    }

    #[test]
    fn test_all_ejected_still_serves() {
        let balancer = BalancedPool::with_config(
            pool(10),
            vec![backend("a", 1)],
            BalancerConfig {
                failure_threshold: 1,
                ejection_cooldown: Duration::from_secs(60),
            },
        )
        .unwrap();
        balancer.record_failure(BackendId(0));
        assert_eq!(pick(&balancer), "a");
    }

    #[test]
    fn test_create_failure_moves_on_and_counts() {
        let balancer =
            BalancedPool::new(pool(10), vec![backend("down", 5), backend("b", 1)]).unwrap();

        let (id, handle) = balancer.acquire_balanced().unwrap();
        assert_eq!(id, BackendId(1));
        assert_eq!(handle.as_str(), "b");
        assert_eq!(balancer.backend_stats()[0].failures, 1);
    }

    #[test]
    fn test_full_backend_sits_out_the_round() {
        let weights = || vec![backend("a", 5), backend("b", 1)];
        let balancer = BalancedPool::new(pool(1), weights()).unwrap();
        let a = Destination::new("a", 80);
        let held = balancer.pool().acquire(&a).unwrap();

        for _ in 0..4 {
            assert_eq!(pick(&balancer), "b");
        }
        drop(held);

        // Once "a" frees up the rotation resumes as if it had never filled
        let fresh = BalancedPool::new(pool(1), weights()).unwrap();
        let resumed: Vec<String> = (0..6).map(|_| pick(&balancer)).collect();
        let expected: Vec<String> = (0..6).map(|_| pick(&fresh)).collect();
        assert_eq!(resumed, expected);
        assert_eq!(balancer.backend_stats()[1].selected, 5);
    }

    #[test]
    fn test_failed_round_leaves_scores_unchanged() {
        let balancer =
            BalancedPool::new(pool(10), vec![backend("down", 1), backend("b", 1)]).unwrap();
        let b = Destination::new("b", 80);
        let held: Vec<_> = (0..10).map(|_| balancer.pool().acquire(&b).unwrap()).collect();

        assert!(matches!(
            balancer.acquire_balanced(),
            Err(ResilienceError::ConnectionRefused(_))
        ));
        drop(held);

        let (id, _) = balancer.acquire_balanced().unwrap();
        assert_eq!(id, BackendId(1));
        assert_eq!(balancer.backend_stats()[1].selected, 1);
    }

    #[test]
    fn test_waits_for_full_backend_despite_create_failure() {
        let pool = ResourcePool::new(
            Arc::new(Named),
            PoolConfig {
                max_per_destination: 1,
                acquire_policy: AcquirePolicy::Wait(Duration::from_secs(5)),
                ..Default::default()
            },
        );
        let balancer = BalancedPool::new(pool, vec![backend("down", 5), backend("b", 1)]).unwrap();
        let b = Destination::new("b", 80);
        let held = balancer.pool().acquire(&b).unwrap();

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            drop(held);
        });

        let (id, handle) = balancer.acquire_balanced().unwrap();
        assert_eq!(id, BackendId(1));
        assert_eq!(handle.as_str(), "b");
        assert_eq!(balancer.backend_stats()[0].failures, 1);
        releaser.join().unwrap();
    }

    #[test]
    fn test_fail_fast_reports_create_failure_over_full_backend() {
        let balancer =
            BalancedPool::new(pool(1), vec![backend("down", 5), backend("b", 1)]).unwrap();
        let b = Destination::new("b", 80);
        let _held = balancer.pool().acquire(&b).unwrap();

        assert!(matches!(
            balancer.acquire_balanced(),
            Err(ResilienceError::ConnectionRefused(_))
        ));
    }
}
