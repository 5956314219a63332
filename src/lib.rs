/*!
 * Salvo - resilient HTTP request execution
 *
 * Runs batches of outbound HTTP requests against flaky or throttled
 * upstreams:
 * - Token-bucket rate limiting and a three-state circuit breaker
 * - Exponential backoff with jitter, driven by a typed error taxonomy
 * - Pooled transports with exclusive checkout and health sweeps
 * - Weighted balancing across backends with failure ejection
 * - Concurrent batches with deterministic, id-sorted results
 *
 * The reusable primitives live in [`resilience`] (`salvo-core-resilience`);
 * this crate adds the HTTP transport, the client, the batch orchestrator,
 * configuration and logging.
 *
 * ```no_run
 * use salvo::{BatchConfig, BatchOrchestrator, BatchRequest, HttpRequest};
 * use salvo::{ItemOutput, ResilienceError};
 * use salvo::resilience::CancellationToken;
 *
 * let executor = |_: &BatchRequest, _: &CancellationToken| -> Result<ItemOutput, ResilienceError> {
 *     Ok(ItemOutput { status: 200, ..Default::default() })
 * };
 * let mut batch = BatchOrchestrator::new(executor);
 * let items = vec![BatchRequest::new(1, HttpRequest::get("https://api.example.com/health"))];
 * let summary = batch.execute(items, &BatchConfig::default()).unwrap();
 * assert_eq!(summary.succeeded, 1);
 * ```
 */

pub mod batch;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod transport;

pub use salvo_core_resilience as resilience;

// Re-export commonly used types
pub use batch::{
    BatchConfig, BatchOrchestrator, BatchOutcome, BatchRequest, BatchResult, BatchSummary,
    ItemExecutor, ItemOutput, ItemOverrides, ProgressEvent, ProgressPublisher,
};
pub use client::ResilientClient;
pub use config::{LogLevel, SalvoConfig};
pub use error::{Result, SalvoError};
pub use logging::init_logging;
pub use resilience::{ErrorCategory, ResilienceError};
pub use transport::{HttpMethod, HttpRequest, HttpResponse, RequestOptions, Transport};

#[cfg(feature = "reqwest-transport")]
pub use transport::{ReqwestFactory, ReqwestTransport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
