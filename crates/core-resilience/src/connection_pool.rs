//! Generic per-destination resource pool
//!
//! Hands out exclusive checkouts of resources that must not be shared
//! between threads while in use (HTTP clients with connection state, framed
//! sockets). A checkout is a [`PooledHandle`]; dropping it returns the
//! resource, so every exit path releases exactly once.
//!
//! Capacity is tracked in slots. A slot is taken by an idle resource, an
//! active checkout, or a reservation (a resource being created or probed by
//! a health sweep). Slots per destination never exceed
//! `max_per_destination`; slots overall never exceed `max_connections`.

use crate::cancel::CancellationToken;
use crate::error::{ResilienceError, Result};
use crate::lock_unpoisoned;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Granularity of pool waits when a cancellation token must be observed
const CANCEL_POLL: Duration = Duration::from_millis(25);

/// Network endpoint a resource is bound to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Behaviour when no slot is free for a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquirePolicy {
    /// Fail immediately with `PoolExhausted`
    FailFast,
    /// Wait up to the given duration, then fail with `AcquireTimeout`
    Wait(Duration),
}

/// Configuration for pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Slots across all destinations
    pub max_connections: usize,
    /// Slots for any single destination
    pub max_per_destination: usize,
    /// Idle resources older than this are discarded on next inspection
    pub idle_timeout: Option<Duration>,
    /// Resources older than this are discarded on release or inspection
    pub max_connection_lifetime: Option<Duration>,
    pub acquire_policy: AcquirePolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_per_destination: 10,
            idle_timeout: Some(Duration::from_secs(90)),
            max_connection_lifetime: Some(Duration::from_secs(30 * 60)),
            acquire_policy: AcquirePolicy::Wait(Duration::from_secs(30)),
        }
    }
}

impl PoolConfig {
    /// Burst profile: wide fan-out of short requests
    ///
    /// High caps, short idle and lifetime limits, and a fail-fast acquire so
    /// callers shed load instead of queueing.
    ///
    /// ```
    /// use salvo_core_resilience::{AcquirePolicy, PoolConfig};
    ///
    /// let config = PoolConfig::burst_profile();
    /// assert_eq!(config.max_connections, 500);
    /// assert_eq!(config.acquire_policy, AcquirePolicy::FailFast);
    /// ```
    pub fn burst_profile() -> Self {
        Self {
            max_connections: 500,
            max_per_destination: 50,
            idle_timeout: Some(Duration::from_secs(10)),
            max_connection_lifetime: Some(Duration::from_secs(60)),
            acquire_policy: AcquirePolicy::FailFast,
        }
    }

    /// Long-lived profile: few resources held for long calls
    ///
    /// Streaming or long-polling upstreams keep a handle busy for minutes,
    /// so lifetimes are extended and a caller is expected to wait its turn.
    pub fn long_lived_profile() -> Self {
        Self {
            max_connections: 8,
            max_per_destination: 4,
            idle_timeout: Some(Duration::from_secs(5 * 60)),
            max_connection_lifetime: Some(Duration::from_secs(24 * 60 * 60)),
            acquire_policy: AcquirePolicy::Wait(Duration::from_secs(10 * 60)),
        }
    }
}

/// Factory for creating, probing, and closing resources
pub trait ResourceFactory<T>: Send + Sync {
    /// Create a new resource bound to `destination`
    fn create(&self, destination: &Destination) -> Result<T>;

    /// Inexpensive liveness probe
    fn is_healthy(&self, resource: &T) -> bool;

    /// Close a resource (optional cleanup)
    fn close(&self, resource: T) {
        drop(resource);
    }
}

#[derive(Debug)]
struct IdleEntry<T> {
    id: u64,
    resource: T,
    created_at: Instant,
    idle_since: Instant,
}

impl<T> IdleEntry<T> {
    fn is_expired(&self, config: &PoolConfig, now: Instant) -> bool {
        let idle_expired = config
            .idle_timeout
            .is_some_and(|limit| now.saturating_duration_since(self.idle_since) > limit);
        let lifetime_expired = config
            .max_connection_lifetime
            .is_some_and(|limit| now.saturating_duration_since(self.created_at) > limit);
        idle_expired || lifetime_expired
    }
}

#[derive(Debug)]
struct DestinationState<T> {
    /// Oldest at the front; reuse pops from the back
    idle: VecDeque<IdleEntry<T>>,
    active: usize,
    reserved: usize,
}

impl<T> DestinationState<T> {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            active: 0,
            reserved: 0,
        }
    }

    fn slots(&self) -> usize {
        self.idle.len() + self.active + self.reserved
    }
}

#[derive(Debug)]
struct PoolState<T> {
    destinations: HashMap<Destination, DestinationState<T>>,
    total: usize,
}

impl<T> PoolState<T> {
    fn destination(&mut self, destination: &Destination) -> &mut DestinationState<T> {
        self.destinations
            .entry(destination.clone())
            .or_insert_with(DestinationState::new)
    }

    /// Remove the longest-idle resource held by a destination other than `keep`
    fn evict_oldest_elsewhere(&mut self, keep: &Destination) -> Option<IdleEntry<T>> {
        let victim = self
            .destinations
            .iter()
            .filter(|(dest, state)| *dest != keep && !state.idle.is_empty())
            .min_by_key(|(_, state)| state.idle.front().map(|entry| entry.idle_since))
            .map(|(dest, _)| dest.clone())?;

        let entry = self.destinations.get_mut(&victim)?.idle.pop_front()?;
        self.total -= 1;
        Some(entry)
    }

    /// Decide how `destination` gets a slot, or `None` when it has to wait
    ///
    /// Expired idle entries of the destination, and any entry evicted to make
    /// room, are moved into `discard` for closing once the lock is released.
    fn plan(
        &mut self,
        config: &PoolConfig,
        destination: &Destination,
        discard: &mut Vec<IdleEntry<T>>,
    ) -> Option<Grant<T>> {
        let now = Instant::now();
        let dest = self.destination(destination);
        let before = dest.idle.len();
        let (stale, fresh): (VecDeque<_>, VecDeque<_>) = dest
            .idle
            .drain(..)
            .partition(|entry| entry.is_expired(config, now));
        dest.idle = fresh;
        discard.extend(stale);
        let pruned = before - dest.idle.len();
        self.total -= pruned;

        let dest = self.destination(destination);
        if let Some(entry) = dest.idle.pop_back() {
            dest.active += 1;
            return Some(Grant::Reuse(entry));
        }
        if dest.slots() >= config.max_per_destination {
            return None;
        }

        if self.total >= config.max_connections {
            let victim = self.evict_oldest_elsewhere(destination)?;
            tracing::debug!(
                destination = %destination,
                id = victim.id,
                "evicting idle resource of another destination"
            );
            discard.push(victim);
        }
        self.destination(destination).reserved += 1;
        self.total += 1;
        Some(Grant::Create)
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    requests_served: AtomicU64,
    created: AtomicU64,
    reused: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
    evicted: AtomicU64,
    next_id: AtomicU64,
}

struct PoolInner<T> {
    config: PoolConfig,
    factory: Arc<dyn ResourceFactory<T>>,
    state: Mutex<PoolState<T>>,
    available: Condvar,
    counters: PoolCounters,
}

/// Slot granted to one acquire round
enum Grant<T> {
    Reuse(IdleEntry<T>),
    /// A slot is reserved; the caller creates the resource outside the lock
    Create,
}

impl<T> PoolInner<T> {
    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        lock_unpoisoned(&self.state)
    }

    fn close_all(&self, resources: Vec<IdleEntry<T>>) {
        if resources.is_empty() {
            return;
        }
        self.counters
            .evicted
            .fetch_add(resources.len() as u64, Ordering::Relaxed);
        for entry in resources {
            self.factory.close(entry.resource);
        }
    }

    /// Return a checked-out resource, or discard it if it may not be reused
    fn check_in(
        &self,
        destination: &Destination,
        id: u64,
        resource: T,
        created_at: Instant,
        reusable: bool,
    ) {
        let now = Instant::now();
        let too_old = self
            .config
            .max_connection_lifetime
            .is_some_and(|limit| now.saturating_duration_since(created_at) > limit);

        let discarded = {
            let mut state = self.lock();
            let dest = state.destination(destination);
            dest.active = dest.active.saturating_sub(1);

            if reusable && !too_old {
                dest.idle.push_back(IdleEntry {
                    id,
                    resource,
                    created_at,
                    idle_since: now,
                });
                None
            } else {
                state.total -= 1;
                Some(resource)
            }
        };
        self.available.notify_all();

        if let Some(resource) = discarded {
            tracing::debug!(destination = %destination, id, "discarding resource on release");
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
            self.factory.close(resource);
        }
    }
}

/// Bounded pool of exclusive, per-destination resources
///
/// Cloning is cheap; clones share the same pool.
///
/// # Example
/// ```
/// use salvo_core_resilience::{Destination, PoolConfig, ResourceFactory, ResourcePool, Result};
/// use std::sync::Arc;
///
/// struct Sockets;
///
/// impl ResourceFactory<String> for Sockets {
///     fn create(&self, destination: &Destination) -> Result<String> {
///         Ok(format!("socket to {}", destination))
///     }
///
///     fn is_healthy(&self, _resource: &String) -> bool {
///         true
///     }
/// }
///
/// let pool: ResourcePool<String> = ResourcePool::new(Arc::new(Sockets), PoolConfig::default());
/// let api = Destination::new("api.example.com", 443);
///
/// let handle = pool.acquire(&api)?;
/// assert_eq!(handle.as_str(), "socket to api.example.com:443");
/// drop(handle);
///
/// assert_eq!(pool.stats().idle, 1);
/// # Ok::<(), salvo_core_resilience::ResilienceError>(())
/// ```
pub struct ResourcePool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for ResourcePool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> ResourcePool<T> {
    /// Create a new pool
    pub fn new(factory: Arc<dyn ResourceFactory<T>>, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                state: Mutex::new(PoolState {
                    destinations: HashMap::new(),
                    total: 0,
                }),
                available: Condvar::new(),
                counters: PoolCounters::default(),
            }),
        }
    }

    /// Create a pool with default configuration
    pub fn new_default(factory: Arc<dyn ResourceFactory<T>>) -> Self {
        Self::new(factory, PoolConfig::default())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Check out a resource for `destination`, following the configured policy
    pub fn acquire(&self, destination: &Destination) -> Result<PooledHandle<T>> {
        self.acquire_inner(destination, self.inner.config.acquire_policy, None)
    }

    /// Like [`acquire`](Self::acquire), but gives up with `Cancelled` once `cancel` fires
    pub fn acquire_cancellable(
        &self,
        destination: &Destination,
        cancel: &CancellationToken,
    ) -> Result<PooledHandle<T>> {
        self.acquire_inner(destination, self.inner.config.acquire_policy, Some(cancel))
    }

    /// Check out a resource without ever waiting
    pub fn try_acquire(&self, destination: &Destination) -> Result<PooledHandle<T>> {
        self.acquire_inner(destination, AcquirePolicy::FailFast, None)
    }

    fn acquire_inner(
        &self,
        destination: &Destination,
        policy: AcquirePolicy,
        cancel: Option<&CancellationToken>,
    ) -> Result<PooledHandle<T>> {
        let inner = &self.inner;
        let deadline = match policy {
            AcquirePolicy::FailFast => None,
            AcquirePolicy::Wait(timeout) => Some((Instant::now() + timeout, timeout)),
        };

        loop {
            let mut expired = Vec::new();
            let grant = {
                let mut state = inner.lock();
                loop {
                    if cancel.is_some_and(CancellationToken::is_cancelled) {
                        break Err(ResilienceError::Cancelled);
                    }
                    if let Some(grant) = state.plan(&inner.config, destination, &mut expired) {
                        break Ok(grant);
                    }

                    let Some((deadline, timeout)) = deadline else {
                        break Err(ResilienceError::PoolExhausted(destination.to_string()));
                    };
                    let now = Instant::now();
                    if now >= deadline {
                        break Err(ResilienceError::AcquireTimeout(timeout));
                    }
                    let mut wait = deadline - now;
                    if cancel.is_some() {
                        wait = wait.min(CANCEL_POLL);
                    }
                    state = match inner.available.wait_timeout(state, wait) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            };
            if !expired.is_empty() {
                inner.available.notify_all();
                inner.close_all(expired);
            }

            let grant = match grant {
                Ok(grant) => grant,
                Err(e) => {
                    if !matches!(e, ResilienceError::Cancelled) {
                        inner.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            destination = %destination,
                            "no pool slot available: {}",
                            e
                        );
                    }
                    return Err(e);
                }
            };

            match grant {
                Grant::Reuse(entry) => {
                    if inner.factory.is_healthy(&entry.resource) {
                        inner.counters.reused.fetch_add(1, Ordering::Relaxed);
                        inner.counters.requests_served.fetch_add(1, Ordering::Relaxed);
                        return Ok(PooledHandle {
                            pool: Arc::clone(inner),
                            destination: destination.clone(),
                            resource_id: entry.id,
                            created_at: entry.created_at,
                            resource: Some(entry.resource),
                            healthy: true,
                        });
                    }

                    tracing::debug!(
                        destination = %destination,
                        id = entry.id,
                        "idle resource failed probe"
                    );
                    {
                        let mut state = inner.lock();
                        let dest_state = state.destination(destination);
                        dest_state.active = dest_state.active.saturating_sub(1);
                        state.total -= 1;
                    }
                    inner.available.notify_all();
                    inner.close_all(vec![entry]);
                }
                Grant::Create => return self.create_reserved(destination),
            }
        }
    }

    /// Turn a reserved slot into a fresh resource
    fn create_reserved(&self, destination: &Destination) -> Result<PooledHandle<T>> {
        let inner = &self.inner;
        let created = inner.factory.create(destination);

        {
            let mut state = inner.lock();
            let dest_state = state.destination(destination);
            dest_state.reserved -= 1;
            if created.is_ok() {
                dest_state.active += 1;
            } else {
                state.total -= 1;
            }
        }

        match created {
            Ok(resource) => {
                let id = inner.counters.next_id.fetch_add(1, Ordering::Relaxed);
                inner.counters.created.fetch_add(1, Ordering::Relaxed);
                inner.counters.requests_served.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(destination = %destination, id, "created pooled resource");
                Ok(PooledHandle {
                    pool: Arc::clone(inner),
                    destination: destination.clone(),
                    resource_id: id,
                    created_at: Instant::now(),
                    resource: Some(resource),
                    healthy: true,
                })
            }
            Err(e) => {
                inner.available.notify_all();
                inner.counters.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(destination = %destination, "failed to create resource: {}", e);
                Err(e)
            }
        }
    }

    /// Probe every idle resource, discarding expired or unhealthy ones
    ///
    /// Returns the number removed. Active checkouts are not touched.
    pub fn perform_health_check(&self) -> usize {
        let inner = &self.inner;

        let candidates: Vec<(Destination, Vec<IdleEntry<T>>)> = {
            let mut state = inner.lock();
            state
                .destinations
                .iter_mut()
                .filter(|(_, dest)| !dest.idle.is_empty())
                .map(|(destination, dest)| {
                    let entries: Vec<_> = dest.idle.drain(..).collect();
                    dest.reserved += entries.len();
                    (destination.clone(), entries)
                })
                .collect()
        };

        let now = Instant::now();
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(candidates.len());
        for (destination, entries) in candidates {
            let swept = entries.len();
            let (alive, dead): (Vec<_>, Vec<_>) = entries.into_iter().partition(|entry| {
                !entry.is_expired(&inner.config, now) && inner.factory.is_healthy(&entry.resource)
            });
            removed.extend(dead);
            kept.push((destination, swept, alive));
        }

        {
            let mut state = inner.lock();
            for (destination, swept, alive) in kept {
                let dest = state.destination(&destination);
                dest.reserved -= swept;
                let dropped = swept - alive.len();
                // Entries were taken oldest first, so order is preserved
                for entry in alive.into_iter().rev() {
                    dest.idle.push_front(entry);
                }
                state.total -= dropped;
            }
        }

        let count = removed.len();
        if count > 0 {
            inner.available.notify_all();
            tracing::info!(removed = count, "health check evicted idle resources");
        }
        inner.close_all(removed);
        count
    }

    /// Close every idle resource
    pub fn clear_idle(&self) -> usize {
        let drained: Vec<IdleEntry<T>> = {
            let mut state = self.inner.lock();
            let drained: Vec<_> = state
                .destinations
                .values_mut()
                .flat_map(|dest| dest.idle.drain(..))
                .collect();
            state.total -= drained.len();
            drained
        };
        let count = drained.len();
        self.inner.available.notify_all();
        self.inner.close_all(drained);
        count
    }

    /// Get current pool statistics
    pub fn stats(&self) -> PoolStats {
        let (total, active, idle) = {
            let state = self.inner.lock();
            let (active, idle) = state
                .destinations
                .values()
                .fold((0, 0), |(active, idle), dest| {
                    (active + dest.active, idle + dest.idle.len())
                });
            (state.total, active, idle)
        };

        let counters = &self.inner.counters;
        PoolStats {
            total,
            active,
            idle,
            max_connections: self.inner.config.max_connections,
            requests_served: counters.requests_served.load(Ordering::Relaxed),
            created: counters.created.load(Ordering::Relaxed),
            reused: counters.reused.load(Ordering::Relaxed),
            timeouts: counters.timeouts.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
            evicted: counters.evicted.load(Ordering::Relaxed),
        }
    }

    /// Slot usage for one destination, if it has ever been acquired
    pub fn destination_stats(&self, destination: &Destination) -> Option<DestinationStats> {
        let state = self.inner.lock();
        state.destinations.get(destination).map(|dest| DestinationStats {
            active: dest.active,
            idle: dest.idle.len(),
            reserved: dest.reserved,
        })
    }

    /// Run [`perform_health_check`](Self::perform_health_check) every `interval`
    /// on a background thread until `cancel` fires
    pub fn spawn_health_checker(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> io::Result<JoinHandle<()>> {
        let pool = self.clone();
        thread::Builder::new()
            .name("salvo-pool-health".to_string())
            .spawn(move || {
                tracing::debug!("pool health checker started ({:?})", interval);
                while cancel.sleep(interval).is_ok() {
                    let removed = pool.perform_health_check();
                    tracing::trace!(removed, "pool health sweep complete");
                }
                tracing::debug!("pool health checker stopped");
            })
    }
}

/// Exclusive checkout of a pooled resource
///
/// Dereferences to the resource. Dropping the handle returns it to the pool.
pub struct PooledHandle<T> {
    pool: Arc<PoolInner<T>>,
    destination: Destination,
    resource_id: u64,
    created_at: Instant,
    resource: Option<T>,
    healthy: bool,
}

impl<T> PooledHandle<T> {
    /// Pool-unique id of the underlying resource
    pub fn id(&self) -> u64 {
        self.resource_id
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Time since the resource was created
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Exclude the resource from reuse; it is closed when the handle goes away
    pub fn mark_unhealthy(&mut self) {
        if self.healthy {
            tracing::debug!(
                destination = %self.destination,
                id = self.resource_id,
                "resource marked unhealthy"
            );
        }
        self.healthy = false;
    }

    pub fn is_marked_unhealthy(&self) -> bool {
        !self.healthy
    }

    /// Return the resource to the pool now
    pub fn release(self) {
        drop(self);
    }
}

impl<T> Deref for PooledHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only emptied in Drop
        self.resource.as_ref().expect("pooled resource present until drop")
    }
}

impl<T> DerefMut for PooledHandle<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.resource.as_mut().expect("pooled resource present until drop")
    }
}

impl<T: fmt::Debug> fmt::Debug for PooledHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledHandle")
            .field("destination", &self.destination)
            .field("id", &self.resource_id)
            .field("healthy", &self.healthy)
            .field("resource", &self.resource)
            .finish()
    }
}

impl<T> Drop for PooledHandle<T> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.check_in(
                &self.destination,
                self.resource_id,
                resource,
                self.created_at,
                self.healthy,
            );
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Slots in use (idle + active + reserved)
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub max_connections: usize,
    /// Successful acquisitions
    pub requests_served: u64,
    pub created: u64,
    pub reused: u64,
    /// Acquisitions that gave up for lack of a slot
    pub timeouts: u64,
    /// Factory create failures
    pub errors: u64,
    /// Resources discarded as expired, unhealthy, or to make room
    pub evicted: u64,
}

impl PoolStats {
    /// Get pool utilization as a percentage
    pub fn utilization(&self) -> f64 {
        if self.max_connections == 0 {
            0.0
        } else {
            (self.total as f64 / self.max_connections as f64) * 100.0
        }
    }
}

/// Slot usage of one destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestinationStats {
    pub active: usize,
    pub idle: usize,
    pub reserved: usize,
}
