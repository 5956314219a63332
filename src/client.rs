/*!
 * Resilient HTTP client
 *
 * Every attempt checks a transport out of the pool, sends once, and returns
 * the transport. Retries, backoff, rate limiting and circuit breaking all
 * come from the shared [`RetryEngine`].
 *
 * A client built from configuration also runs the pool's health sweeper,
 * which stops when the last clone of the client is dropped.
 */

use crate::config::SalvoConfig;
use crate::transport::{
    check_status, destination_of, HttpRequest, HttpResponse, RequestOptions, Transport,
};
use salvo_core_resilience::{
    CancellationToken, Execution, ResilienceError, ResourceFactory, ResourcePool, RetryEngine,
};
use std::io;
use std::sync::Arc;
use std::time::Duration;

pub struct ResilientClient<T> {
    pool: Arc<ResourcePool<T>>,
    engine: Arc<RetryEngine>,
    options: RequestOptions,
    sweeper: Option<Arc<HealthSweeper>>,
}

/// Cancels the background health sweep when dropped
struct HealthSweeper {
    stop: CancellationToken,
}

impl Drop for HealthSweeper {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl<T> Clone for ResilientClient<T> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            engine: Arc::clone(&self.engine),
            options: self.options.clone(),
            sweeper: self.sweeper.clone(),
        }
    }
}

impl<T: Transport> ResilientClient<T> {
    pub fn new(pool: Arc<ResourcePool<T>>, engine: Arc<RetryEngine>) -> Self {
        Self {
            pool,
            engine,
            options: RequestOptions::default(),
            sweeper: None,
        }
    }

    /// Build pool and engine from configuration around `factory`
    ///
    /// Starts the health sweeper unless `pool.health_check_interval_secs` is 0.
    pub fn from_config_with(
        factory: Arc<dyn ResourceFactory<T>>,
        config: &SalvoConfig,
    ) -> crate::error::Result<Self> {
        config.validate()?;
        let engine = RetryEngine::new(config.retry_config())?;
        let pool = ResourcePool::new(factory, config.pool_config());
        let mut client =
            Self::new(Arc::new(pool), Arc::new(engine)).with_options(config.request_options());
        if let Some(interval) = config.pool.health_check_interval() {
            client = client.with_health_check(interval)?;
        }
        Ok(client)
    }

    /// Sweep idle transports every `interval` while any clone of the client lives
    ///
    /// Replaces a sweeper started earlier.
    pub fn with_health_check(mut self, interval: Duration) -> io::Result<Self> {
        let stop = CancellationToken::new();
        // Detached: the thread exits as soon as `stop` fires
        self.pool.spawn_health_checker(interval, stop.clone())?;
        self.sweeper = Some(Arc::new(HealthSweeper { stop }));
        Ok(self)
    }

    /// Whether a background health sweep is running for this client
    pub fn is_health_checking(&self) -> bool {
        self.sweeper.is_some()
    }

    /// Replace the default per-request options
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    pub fn engine(&self) -> &Arc<RetryEngine> {
        &self.engine
    }

    pub fn pool(&self) -> &Arc<ResourcePool<T>> {
        &self.pool
    }

    /// Send with default options and the default retry classifier
    pub fn send(&self, request: &HttpRequest) -> Result<HttpResponse, ResilienceError> {
        self.send_with(request, &self.options, ResilienceError::is_retryable, None)
            .result
    }

    /// Send with explicit options, retry predicate and cancellation
    ///
    /// Non-2xx responses are errors, so the predicate sees the status.
    pub fn send_with<P>(
        &self,
        request: &HttpRequest,
        options: &RequestOptions,
        retryable: P,
        cancel: Option<&CancellationToken>,
    ) -> Execution<HttpResponse>
    where
        P: Fn(&ResilienceError) -> bool,
    {
        let destination = match destination_of(&request.url) {
            Ok(destination) => destination,
            Err(e) => {
                return Execution {
                    result: Err(e),
                    attempts: 0,
                    elapsed: Duration::ZERO,
                }
            }
        };

        let attempt = || {
            let mut transport = match cancel {
                Some(token) => self.pool.acquire_cancellable(&destination, token)?,
                None => self.pool.acquire(&destination)?,
            };

            let outcome = transport.send(request, options).and_then(check_status);
            if let Err(e) = &outcome {
                if e.is_connection_failure() {
                    transport.mark_unhealthy();
                }
                tracing::debug!(
                    method = %request.method,
                    url = %request.url,
                    "attempt failed: {}",
                    e
                );
            }
            outcome
        };

        self.engine.run(cancel, attempt, retryable)
    }
}

#[cfg(feature = "reqwest-transport")]
impl ResilientClient<crate::transport::ReqwestTransport> {
    /// Build a reqwest-backed client from configuration
    pub fn from_config(config: &SalvoConfig) -> crate::error::Result<Self> {
        let mut factory = crate::transport::ReqwestFactory {
            connect_timeout: config.request.connect_timeout(),
            ..Default::default()
        };
        if let Some(agent) = &config.request.user_agent {
            factory.user_agent = agent.clone();
        }
        Self::from_config_with(Arc::new(factory), config)
    }
}
