/*!
 * Progress events and the terminal progress bar for batch runs
 *
 * Workers publish [`ProgressEvent`]s over a crossbeam channel for library
 * callers. Independently, [`ProgressReporter`] polls the shared
 * [`BatchCounters`] at a fixed interval and redraws an indicatif bar.
 */

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use salvo_core_resilience::{CancellationToken, ErrorCategory};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Progress event types
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Workers are about to start
    BatchStarted {
        total: u64,
        concurrency: usize,
        timestamp: DateTime<Utc>,
    },

    /// A worker picked up an item (`attempt` starts at 1)
    ItemStarted {
        id: u64,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// An attempt failed and the item will run again after `delay`
    ItemRetrying {
        id: u64,
        attempt: u32,
        delay: Duration,
        error: String,
        timestamp: DateTime<Utc>,
    },

    ItemSucceeded {
        id: u64,
        status: u16,
        attempts: u32,
        elapsed: Duration,
        timestamp: DateTime<Utc>,
    },

    ItemFailed {
        id: u64,
        category: ErrorCategory,
        error: String,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// Every item has a result
    BatchComplete {
        succeeded: u64,
        failed: u64,
        elapsed: Duration,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    /// Item id for per-item events
    pub fn item_id(&self) -> Option<u64> {
        match self {
            ProgressEvent::ItemStarted { id, .. }
            | ProgressEvent::ItemRetrying { id, .. }
            | ProgressEvent::ItemSucceeded { id, .. }
            | ProgressEvent::ItemFailed { id, .. } => Some(*id),
            ProgressEvent::BatchStarted { .. } | ProgressEvent::BatchComplete { .. } => None,
        }
    }
}

/// Progress publisher - sends events to subscribers
#[derive(Clone, Debug)]
pub struct ProgressPublisher {
    sender: Option<Sender<ProgressEvent>>,
}

impl ProgressPublisher {
    /// Create a new publisher with bounded channel
    ///
    /// A full buffer blocks the publishing worker until the subscriber drains it.
    pub fn new(buffer_size: usize) -> (Self, ProgressSubscriber) {
        let (tx, rx) = bounded(buffer_size);
        (
            ProgressPublisher { sender: Some(tx) },
            ProgressSubscriber { receiver: rx },
        )
    }

    /// Create a new publisher with unbounded channel
    pub fn unbounded() -> (Self, ProgressSubscriber) {
        let (tx, rx) = unbounded();
        (
            ProgressPublisher { sender: Some(tx) },
            ProgressSubscriber { receiver: rx },
        )
    }

    /// Create a no-op publisher (for when progress tracking is disabled)
    pub fn noop() -> Self {
        ProgressPublisher { sender: None }
    }

    /// Publish an event
    pub fn publish(&self, event: ProgressEvent) {
        if let Some(ref tx) = self.sender {
            // Subscriber may have dropped
            let _ = tx.send(event);
        }
    }

    pub fn is_noop(&self) -> bool {
        self.sender.is_none()
    }
}

impl Default for ProgressPublisher {
    fn default() -> Self {
        Self::noop()
    }
}

/// Progress subscriber - receives events
pub struct ProgressSubscriber {
    receiver: Receiver<ProgressEvent>,
}

impl ProgressSubscriber {
    /// Get the receiver for consuming events
    pub fn receiver(&self) -> &Receiver<ProgressEvent> {
        &self.receiver
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv(&self) -> Option<ProgressEvent> {
        self.receiver.try_recv().ok()
    }

    /// Receive an event (blocking until every publisher is dropped)
    pub fn recv(&self) -> Option<ProgressEvent> {
        self.receiver.recv().ok()
    }

    /// Create an iterator over events
    pub fn iter(&self) -> impl Iterator<Item = ProgressEvent> + '_ {
        self.receiver.iter()
    }

    /// Drain whatever is buffered right now
    pub fn drain(&self) -> Vec<ProgressEvent> {
        self.receiver.try_iter().collect()
    }
}

/// Completion counters shared between workers and the reporter
///
/// Increments use `Release` and reads use `Acquire`, so a reader that sees
/// a count also sees the result row written before it.
#[derive(Debug, Default)]
pub struct BatchCounters {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`BatchCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
}

impl CounterSnapshot {
    pub fn finished(&self) -> u64 {
        self.completed + self.failed
    }

    pub fn is_done(&self) -> bool {
        self.finished() >= self.total
    }
}

impl BatchCounters {
    pub fn new(total: u64) -> Self {
        Self {
            total: AtomicU64::new(total),
            ..Default::default()
        }
    }

    pub(crate) fn reset(&self, total: u64) {
        self.completed.store(0, Ordering::Release);
        self.failed.store(0, Ordering::Release);
        self.total.store(total, Ordering::Release);
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Release);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total: self.total.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
        }
    }
}

const BAR_TEMPLATE: &str = "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}";

/// Polling progress bar thread
pub struct ProgressReporter {
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    /// Start polling `counters` every `interval`
    ///
    /// The thread exits once every item is accounted for or `stop` fires.
    pub fn spawn(
        counters: Arc<BatchCounters>,
        interval: Duration,
        stop: CancellationToken,
    ) -> io::Result<Self> {
        let handle = thread::Builder::new()
            .name("salvo-progress".to_string())
            .spawn(move || run_reporter(&counters, interval, &stop))?;
        Ok(Self { handle })
    }

    /// Wait for the reporter thread to draw its final frame
    pub fn join(self) {
        if self.handle.join().is_err() {
            tracing::warn!("progress reporter thread panicked");
        }
    }
}

fn run_reporter(counters: &BatchCounters, interval: Duration, stop: &CancellationToken) {
    let snapshot = counters.snapshot();
    let bar = ProgressBar::new(snapshot.total);
    match ProgressStyle::default_bar().template(BAR_TEMPLATE) {
        Ok(style) => bar.set_style(style.progress_chars("#>-")),
        Err(e) => tracing::debug!("falling back to default progress style: {}", e),
    }

    loop {
        let snapshot = counters.snapshot();
        bar.set_position(snapshot.finished());
        bar.set_message(format!("{} ok, {} failed", snapshot.completed, snapshot.failed));

        if snapshot.is_done() {
            bar.finish();
            return;
        }
        if stop.sleep(interval).is_err() {
            bar.abandon_with_message(format!(
                "cancelled: {} ok, {} failed",
                snapshot.completed, snapshot.failed
            ));
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_publisher_subscriber() {
        let (publisher, subscriber) = ProgressPublisher::new(10);

        publisher.publish(ProgressEvent::ItemStarted {
            id: 7,
            attempt: 1,
            timestamp: Utc::now(),
        });

        let event = subscriber.try_recv().unwrap();
        match event {
            ProgressEvent::ItemStarted { id, attempt, .. } => {
                assert_eq!(id, 7);
                assert_eq!(attempt, 1);
            }
            _ => panic!("Expected ItemStarted event"),
        }
        assert!(subscriber.try_recv().is_none());
    }

    #[test]
    fn test_noop_publisher() {
        let publisher = ProgressPublisher::noop();
        assert!(publisher.is_noop());
        // Should not panic
        publisher.publish(ProgressEvent::BatchStarted {
            total: 1,
            concurrency: 1,
            timestamp: Utc::now(),
        });
    }

    #[test]
    fn test_publish_after_subscriber_dropped() {
        let (publisher, subscriber) = ProgressPublisher::unbounded();
        drop(subscriber);
        publisher.publish(ProgressEvent::ItemStarted {
            id: 1,
            attempt: 1,
            timestamp: Utc::now(),
        });
    }

    #[test]
    fn test_item_id() {
        let event = ProgressEvent::ItemFailed {
            id: 3,
            category: ErrorCategory::Timeout,
            error: "request timed out".to_string(),
            attempts: 2,
            timestamp: Utc::now(),
        };
        assert_eq!(event.item_id(), Some(3));

        let event = ProgressEvent::BatchComplete {
            succeeded: 1,
            failed: 0,
            elapsed: Duration::ZERO,
            timestamp: Utc::now(),
        };
        assert_eq!(event.item_id(), None);
    }

    #[test]
    fn test_counters() {
        let counters = BatchCounters::new(3);
        counters.record_completed();
        counters.record_failed();
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.finished(), 2);
        assert!(!snapshot.is_done());

        counters.record_completed();
        assert!(counters.snapshot().is_done());

        counters.reset(5);
        assert_eq!(
            counters.snapshot(),
            CounterSnapshot {
                total: 5,
                completed: 0,
                failed: 0
            }
        );
    }

    #[test]
    fn test_reporter_exits_when_done() {
        let counters = Arc::new(BatchCounters::new(2));
        let reporter = ProgressReporter::spawn(
            Arc::clone(&counters),
            Duration::from_millis(5),
            CancellationToken::new(),
        )
        .unwrap();

        counters.record_completed();
        counters.record_failed();
        reporter.join();
    }

    #[test]
    fn test_reporter_stops_on_cancel() {
        let counters = Arc::new(BatchCounters::new(10));
        let stop = CancellationToken::new();
        let reporter =
            ProgressReporter::spawn(Arc::clone(&counters), Duration::from_secs(60), stop.clone())
                .unwrap();

        let start = Instant::now();
        stop.cancel();
        reporter.join();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
