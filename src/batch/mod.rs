/*!
 * Concurrent batch execution
 *
 * A [`BatchOrchestrator`] runs N independent [`BatchRequest`]s on a rayon
 * pool of `min(N, concurrency)` workers. Workers pull from a shared
 * crossbeam queue, retry their own item with exponential backoff and push
 * exactly one [`BatchResult`] per request. Results are sorted by id once
 * every worker has joined.
 */

pub mod progress;

use crate::client::ResilientClient;
use crate::error::{Result, SalvoError};
use crate::transport::{destination_of, HttpRequest, Transport};
use chrono::{DateTime, Utc};
use progress::ProgressReporter;
use salvo_core_resilience::{CancellationToken, ErrorCategory, ResilienceError};
use serde::{Serialize, Serializer};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

pub use progress::{
    BatchCounters, CounterSnapshot, ProgressEvent, ProgressPublisher, ProgressSubscriber,
};

/// Characters of response body kept in a result row
pub const PREVIEW_CHARS: usize = 200;

/// Per-item settings that win over [`BatchConfig`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemOverrides {
    pub retry_count: Option<u32>,
    pub timeout: Option<Duration>,
}

/// One unit of work
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub id: u64,
    pub request: HttpRequest,
    pub overrides: ItemOverrides,
}

impl BatchRequest {
    pub fn new(id: u64, request: HttpRequest) -> Self {
        Self {
            id,
            request,
            overrides: ItemOverrides::default(),
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.overrides.retry_count = Some(retry_count);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.overrides.timeout = Some(timeout);
        self
    }

    /// `host:port` of the target, or the raw URL when it does not parse
    pub fn destination_label(&self) -> String {
        destination_of(&self.request.url)
            .map(|d| d.to_string())
            .unwrap_or_else(|_| self.request.url.clone())
    }
}

/// What an executor hands back for a successful item
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemOutput {
    pub status: u16,
    pub request_bytes: u64,
    pub response_bytes: u64,
    pub body: Vec<u8>,
}

/// Terminal state of one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    Succeeded {
        status: u16,
        request_bytes: u64,
        response_bytes: u64,
        response_preview: String,
    },
    Failed {
        #[serde(serialize_with = "serialize_category")]
        category: ErrorCategory,
        message: String,
    },
}

/// Exactly one per [`BatchRequest`], never modified after it is recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub id: u64,
    pub destination: String,
    pub attempts: u32,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub started_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: BatchOutcome,
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, BatchOutcome::Succeeded { .. })
    }

    pub fn error_category(&self) -> Option<ErrorCategory> {
        match &self.outcome {
            BatchOutcome::Failed { category, .. } => Some(*category),
            BatchOutcome::Succeeded { .. } => None,
        }
    }
}

fn serialize_millis<S: Serializer>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

fn serialize_category<S: Serializer>(
    category: &ErrorCategory,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(category)
}

/// Performs one attempt of one item
///
/// Implemented for [`ResilientClient`] and for plain closures.
pub trait ItemExecutor: Send + Sync {
    fn execute(
        &self,
        item: &BatchRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<ItemOutput, ResilienceError>;
}

impl<F> ItemExecutor for F
where
    F: Fn(&BatchRequest, &CancellationToken) -> std::result::Result<ItemOutput, ResilienceError>
        + Send
        + Sync,
{
    fn execute(
        &self,
        item: &BatchRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<ItemOutput, ResilienceError> {
        self(item, cancel)
    }
}

impl<T: Transport> ItemExecutor for ResilientClient<T> {
    fn execute(
        &self,
        item: &BatchRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<ItemOutput, ResilienceError> {
        let mut options = self.options().clone();
        if let Some(timeout) = item.overrides.timeout {
            options.timeout = timeout;
        }

        let execution =
            self.send_with(&item.request, &options, ResilienceError::is_retryable, Some(cancel));
        let response = execution.result?;
        Ok(ItemOutput {
            status: response.status,
            request_bytes: item.request.body.len() as u64,
            response_bytes: response.body.len() as u64,
            body: response.body,
        })
    }
}

/// Batch-wide settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Upper bound on worker threads
    pub concurrency: usize,
    /// Extra attempts per item after the first
    pub retry_count: u32,
    pub show_progress: bool,
    /// Delay before the second attempt; doubles for each one after
    pub retry_base_delay: Duration,
    pub progress_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry_count: 3,
            show_progress: false,
            retry_base_delay: Duration::from_millis(1000),
            progress_interval: Duration::from_millis(100),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(SalvoError::Config(
                "[batch] concurrency must be at least 1".to_string(),
            ));
        }
        if self.show_progress && self.progress_interval.is_zero() {
            return Err(SalvoError::Config(
                "[batch] progress_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Sleep after failed attempt number `attempt` (1-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.retry_base_delay.saturating_mul(factor)
    }
}

/// Totals for one [`BatchOrchestrator::execute`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Attempts made across all items
    pub attempts: u64,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl BatchSummary {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.total as f64
    }
}

pub struct BatchOrchestrator<E> {
    executor: E,
    progress: ProgressPublisher,
    cancel: CancellationToken,
    counters: Arc<BatchCounters>,
    results: Vec<BatchResult>,
}

impl<E: ItemExecutor> BatchOrchestrator<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            progress: ProgressPublisher::noop(),
            cancel: CancellationToken::new(),
            counters: Arc::new(BatchCounters::default()),
            results: Vec::new(),
        }
    }

    /// Publish [`ProgressEvent`]s to `publisher`
    pub fn with_progress(mut self, publisher: ProgressPublisher) -> Self {
        self.progress = publisher;
        self
    }

    /// Abort the batch when `token` fires
    ///
    /// Items that have not started yet are recorded as `cancelled` failures.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Run every item and block until all of them have a result
    ///
    /// Per-item failures land in [`results`](Self::results); only setup
    /// problems are returned as errors.
    pub fn execute(
        &mut self,
        items: Vec<BatchRequest>,
        config: &BatchConfig,
    ) -> Result<BatchSummary> {
        config.validate()?;

        let start = Instant::now();
        let total = items.len();
        self.results.clear();
        self.counters.reset(total as u64);

        let workers = total.min(config.concurrency);
        self.progress.publish(ProgressEvent::BatchStarted {
            total: total as u64,
            concurrency: workers,
            timestamp: Utc::now(),
        });
        tracing::info!(items = total, workers, "starting batch");

        if total > 0 {
            self.results = self.run_workers(items, workers, config)?;
        }

        let summary = summarize(&self.results, start.elapsed());
        self.progress.publish(ProgressEvent::BatchComplete {
            succeeded: summary.succeeded,
            failed: summary.failed,
            elapsed: summary.elapsed,
            timestamp: Utc::now(),
        });
        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            attempts = summary.attempts,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "batch complete"
        );
        Ok(summary)
    }

    fn run_workers(
        &self,
        items: Vec<BatchRequest>,
        workers: usize,
        config: &BatchConfig,
    ) -> Result<Vec<BatchResult>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("salvo-batch-{}", i))
            .build()
            .map_err(|e| SalvoError::Parallel(e.to_string()))?;

        let total = items.len();
        let (tx, rx) = crossbeam_channel::unbounded();
        for item in items {
            tx.send(item)
                .map_err(|e| SalvoError::Parallel(e.to_string()))?;
        }
        drop(tx);

        let reporter_stop = CancellationToken::new();
        let reporter = if config.show_progress {
            Some(ProgressReporter::spawn(
                Arc::clone(&self.counters),
                config.progress_interval,
                reporter_stop.clone(),
            )?)
        } else {
            None
        };

        let worker = Worker {
            executor: &self.executor,
            progress: &self.progress,
            cancel: &self.cancel,
            counters: &self.counters,
            config,
            results: Mutex::new(Vec::with_capacity(total)),
        };

        pool.scope(|s| {
            for _ in 0..workers {
                let rx = rx.clone();
                let worker = &worker;
                s.spawn(move |_| {
                    for item in rx.iter() {
                        worker.process(&item);
                    }
                });
            }
        });

        if let Some(reporter) = reporter {
            reporter_stop.cancel();
            reporter.join();
        }

        let mut results = worker
            .results
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        results.sort_by_key(|r| r.id);
        Ok(results)
    }

    /// Results of the last run, sorted by id
    pub fn results(&self) -> &[BatchResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<BatchResult> {
        self.results
    }

    /// Live counters, readable from other threads while a batch runs
    pub fn counters(&self) -> Arc<BatchCounters> {
        Arc::clone(&self.counters)
    }
}

struct Worker<'a, E> {
    executor: &'a E,
    progress: &'a ProgressPublisher,
    cancel: &'a CancellationToken,
    counters: &'a BatchCounters,
    config: &'a BatchConfig,
    results: Mutex<Vec<BatchResult>>,
}

impl<E: ItemExecutor> Worker<'_, E> {
    fn process(&self, item: &BatchRequest) {
        let started_at = Utc::now();
        let start = Instant::now();
        let retry_count = item.overrides.retry_count.unwrap_or(self.config.retry_count);
        let max_attempts = retry_count.saturating_add(1);

        let mut attempts = 0;
        let outcome = loop {
            if let Err(e) = self.cancel.check() {
                break Err(e);
            }
            attempts += 1;
            self.progress.publish(ProgressEvent::ItemStarted {
                id: item.id,
                attempt: attempts,
                timestamp: Utc::now(),
            });

            match self.executor.execute(item, self.cancel) {
                Ok(output) => break Ok(output),
                Err(e @ ResilienceError::Cancelled) => break Err(e),
                Err(e) if attempts >= max_attempts => break Err(e),
                Err(e) => {
                    let delay = self.config.retry_delay(attempts);
                    tracing::debug!(
                        id = item.id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "item failed, retrying: {}",
                        e
                    );
                    self.progress.publish(ProgressEvent::ItemRetrying {
                        id: item.id,
                        attempt: attempts,
                        delay,
                        error: e.to_string(),
                        timestamp: Utc::now(),
                    });
                    if let Err(cancelled) = self.cancel.sleep(delay) {
                        break Err(cancelled);
                    }
                }
            }
        };

        let elapsed = start.elapsed();
        let (outcome, event) = match outcome {
            Ok(output) => {
                let event = ProgressEvent::ItemSucceeded {
                    id: item.id,
                    status: output.status,
                    attempts,
                    elapsed,
                    timestamp: Utc::now(),
                };
                let outcome = BatchOutcome::Succeeded {
                    status: output.status,
                    request_bytes: output.request_bytes,
                    response_bytes: output.response_bytes,
                    response_preview: preview(&output.body),
                };
                (outcome, event)
            }
            Err(e) => {
                let category = e.category();
                let message = e.to_string();
                if category != ErrorCategory::Cancelled {
                    tracing::warn!(id = item.id, attempts, "item failed: {}", message);
                }
                let event = ProgressEvent::ItemFailed {
                    id: item.id,
                    category,
                    error: message.clone(),
                    attempts,
                    timestamp: Utc::now(),
                };
                (BatchOutcome::Failed { category, message }, event)
            }
        };

        let succeeded = matches!(outcome, BatchOutcome::Succeeded { .. });
        let result = BatchResult {
            id: item.id,
            destination: item.destination_label(),
            attempts,
            elapsed,
            started_at,
            outcome,
        };

        // Row first, then counter, so a reader that sees the count sees the row
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result);
        if succeeded {
            self.counters.record_completed();
        } else {
            self.counters.record_failed();
        }
        self.progress.publish(event);
    }
}

fn preview(body: &[u8]) -> String {
    String::from_utf8_lossy(body).chars().take(PREVIEW_CHARS).collect()
}

fn summarize(results: &[BatchResult], elapsed: Duration) -> BatchSummary {
    let succeeded = results.iter().filter(|r| r.is_success()).count() as u64;
    BatchSummary {
        total: results.len() as u64,
        succeeded,
        failed: results.len() as u64 - succeeded,
        attempts: results.iter().map(|r| u64::from(r.attempts)).sum(),
        elapsed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn items(n: u64) -> Vec<BatchRequest> {
        (0..n)
            .map(|id| {
                BatchRequest::new(
                    id,
                    HttpRequest::get(format!("https://api.example.com/items/{}", id)),
                )
            })
            .collect()
    }

    fn quick_config(concurrency: usize) -> BatchConfig {
        BatchConfig {
            concurrency,
            retry_count: 2,
            retry_base_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn ok(body: &str) -> std::result::Result<ItemOutput, ResilienceError> {
        Ok(ItemOutput {
            status: 200,
            request_bytes: 0,
            response_bytes: body.len() as u64,
            body: body.as_bytes().to_vec(),
        })
    }

    fn fail(error: ResilienceError) -> std::result::Result<ItemOutput, ResilienceError> {
        Err(error)
    }

    fn unavailable() -> std::result::Result<ItemOutput, ResilienceError> {
        fail(ResilienceError::Http {
            status: 503,
            message: "service unavailable".to_string(),
        })
    }

    #[test]
    fn test_results_sorted_and_complete() {
        let executor = |item: &BatchRequest, _: &CancellationToken| {
            // Later ids finish first
            std::thread::sleep(Duration::from_millis(20 - item.id % 20));
            if item.id % 5 == 0 {
                fail(ResilienceError::Http {
                    status: 400,
                    message: "bad request".to_string(),
                })
            } else {
                ok("done")
            }
        };
        let mut orchestrator = BatchOrchestrator::new(executor);
        let summary = orchestrator.execute(items(40), &quick_config(8)).unwrap();

        let results = orchestrator.results();
        assert_eq!(results.len(), 40);
        assert!(results.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(summary.total, 40);
        assert_eq!(summary.failed, 8);
        assert_eq!(summary.succeeded, 32);

        let counters = orchestrator.counters().snapshot();
        assert_eq!(counters.completed + counters.failed, 40);
    }

    #[test]
    fn test_worker_count_bounded_by_items_and_concurrency() {
        let names = Mutex::new(HashSet::new());
        let executor = |_: &BatchRequest, _: &CancellationToken| {
            let name = std::thread::current().name().unwrap_or_default().to_string();
            names.lock().unwrap().insert(name);
            std::thread::sleep(Duration::from_millis(5));
            ok("")
        };

        let mut orchestrator = BatchOrchestrator::new(&executor);
        orchestrator.execute(items(3), &quick_config(16)).unwrap();
        drop(orchestrator);

        let names = names.into_inner().unwrap();
        assert!(names.len() <= 3);
        assert!(names.iter().all(|n| n.starts_with("salvo-batch-")));
    }

    #[test]
    fn test_item_retried_until_success() {
        let calls = AtomicU32::new(0);
        let executor = |_: &BatchRequest, _: &CancellationToken| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                fail(ResilienceError::ConnectionReset("peer".to_string()))
            } else {
                ok("{\"ok\":true}")
            }
        };

        let mut orchestrator = BatchOrchestrator::new(&executor);
        orchestrator.execute(items(1), &quick_config(1)).unwrap();
        let result = &orchestrator.results()[0];
        assert!(result.is_success());
        assert_eq!(result.attempts, 3);
        assert_eq!(result.destination, "api.example.com:443");
    }

    #[test]
    fn test_retry_count_override() {
        let executor = |_: &BatchRequest, _: &CancellationToken| unavailable();
        let mut batch = items(2);
        batch[1] = batch[1].clone().with_retry_count(0);

        let mut orchestrator = BatchOrchestrator::new(executor);
        orchestrator.execute(batch, &quick_config(2)).unwrap();
        let results = orchestrator.results();
        assert_eq!(results[0].attempts, 3);
        assert_eq!(results[1].attempts, 1);
    }

    #[test]
    fn test_cancelled_error_not_retried() {
        let executor =
            |_: &BatchRequest, _: &CancellationToken| fail(ResilienceError::Cancelled);
        let mut orchestrator = BatchOrchestrator::new(executor);
        orchestrator.execute(items(1), &quick_config(1)).unwrap();
        let result = &orchestrator.results()[0];
        assert_eq!(result.attempts, 1);
        assert_eq!(result.error_category(), Some(ErrorCategory::Cancelled));
    }

    #[test]
    fn test_cancel_before_start_records_every_item() {
        let token = CancellationToken::new();
        token.cancel();
        let executor = |_: &BatchRequest, _: &CancellationToken| ok("unreachable");

        let mut orchestrator = BatchOrchestrator::new(executor).with_cancellation(token);
        let summary = orchestrator.execute(items(5), &quick_config(2)).unwrap();
        assert_eq!(summary.failed, 5);
        assert!(orchestrator
            .results()
            .iter()
            .all(|r| r.attempts == 0 && r.error_category() == Some(ErrorCategory::Cancelled)));
    }

    #[test]
    fn test_empty_batch() {
        let executor = |_: &BatchRequest, _: &CancellationToken| ok("");
        let mut orchestrator = BatchOrchestrator::new(executor);
        let summary = orchestrator.execute(Vec::new(), &quick_config(4)).unwrap();
        assert_eq!(summary, BatchSummary { elapsed: summary.elapsed, ..Default::default() });
        assert!(orchestrator.results().is_empty());
    }

    #[test]
    fn test_invalid_config() {
        let executor = |_: &BatchRequest, _: &CancellationToken| ok("");
        let mut orchestrator = BatchOrchestrator::new(executor);
        let config = BatchConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(matches!(
            orchestrator.execute(items(1), &config),
            Err(SalvoError::Config(_))
        ));
    }

    #[test]
    fn test_progress_events() {
        let (publisher, subscriber) = ProgressPublisher::unbounded();
        let calls = AtomicU32::new(0);
        let executor = |_: &BatchRequest, _: &CancellationToken| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                unavailable()
            } else {
                ok("")
            }
        };

        let mut orchestrator = BatchOrchestrator::new(&executor).with_progress(publisher);
        orchestrator.execute(items(1), &quick_config(1)).unwrap();
        drop(orchestrator);

        let events = subscriber.drain();
        assert!(matches!(events[0], ProgressEvent::BatchStarted { total: 1, .. }));
        assert!(matches!(events[1], ProgressEvent::ItemStarted { attempt: 1, .. }));
        assert!(matches!(events[2], ProgressEvent::ItemRetrying { attempt: 1, .. }));
        assert!(matches!(events[3], ProgressEvent::ItemStarted { attempt: 2, .. }));
        assert!(matches!(events[4], ProgressEvent::ItemSucceeded { attempts: 2, .. }));
        assert!(matches!(
            events[5],
            ProgressEvent::BatchComplete {
                succeeded: 1,
                failed: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_retry_delay_doubles() {
        let config = BatchConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_millis(1000));
        assert_eq!(config.retry_delay(2), Duration::from_millis(2000));
        assert_eq!(config.retry_delay(3), Duration::from_millis(4000));
        // Saturates instead of overflowing
        assert!(config.retry_delay(100) >= Duration::from_secs(1000));
    }

    #[test]
    fn test_preview_truncates() {
        let body = "x".repeat(PREVIEW_CHARS * 2);
        assert_eq!(preview(body.as_bytes()).len(), PREVIEW_CHARS);
        assert_eq!(preview(b"short"), "short");
    }

    #[test]
    fn test_result_serialization() {
        let result = BatchResult {
            id: 4,
            destination: "api.example.com:443".to_string(),
            attempts: 2,
            elapsed: Duration::from_millis(1500),
            started_at: Utc::now(),
            outcome: BatchOutcome::Failed {
                category: ErrorCategory::RateLimited,
                message: "HTTP 429".to_string(),
            },
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["id"], 4);
        assert_eq!(json["elapsed_ms"], 1500);
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["category"], "rate_limited");
        assert_eq!(json["message"], "HTTP 429");
    }
}
