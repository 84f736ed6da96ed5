//! Resilient client accessor
//!
//! The single call site application code uses to reach the database. It keeps
//! one shared client handle, builds it through an [`InitGuard`] on first use,
//! and runs every operation inside the `payload-database` circuit breaker with
//! classifier-driven retries:
//!
//! - verdicts with `should_retry == false` are raised at once
//! - a local pool acquire timeout waits a fixed cooldown and keeps the client
//! - other connection failures drop the client so the next attempt rebuilds it

use crate::error::{report_dyn, BoxError, DbError};
use crate::manager::DbConnectionManager;
use crate::pool::{DatabasePool, PoolFactory};
use async_trait::async_trait;
use bulwark_core_resilience::{
    CircuitBreaker, CircuitOpenError, ErrorCategory, ErrorClassifier, ErrorReport, ErrorVerdict,
    InitError, InitGuard, PoolMonitor, RetryPolicy,
};
use std::error::Error as StdError;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Builds the shared client handle
#[async_trait]
pub trait ClientFactory<C: Send + 'static>: Send + Sync {
    async fn build(&self) -> Result<C, DbError>;

    /// Release a client the accessor has discarded
    ///
    /// Handles that own background work or connections must stop them here.
    async fn dispose(&self, _client: C) {}
}

/// Builds a [`DbConnectionManager`] as the client handle
pub struct ManagedClientFactory<P: DatabasePool> {
    pools: Arc<dyn PoolFactory<P>>,
    config: crate::manager::ManagerConfig,
    monitor: Option<Arc<PoolMonitor>>,
}

impl<P: DatabasePool> ManagedClientFactory<P> {
    pub fn new(
        pools: Arc<dyn PoolFactory<P>>,
        config: crate::manager::ManagerConfig,
        monitor: Option<Arc<PoolMonitor>>,
    ) -> Self {
        Self {
            pools,
            config,
            monitor,
        }
    }
}

#[async_trait]
impl<P: DatabasePool> ClientFactory<Arc<DbConnectionManager<P>>> for ManagedClientFactory<P> {
    async fn build(&self) -> Result<Arc<DbConnectionManager<P>>, DbError> {
        let manager = DbConnectionManager::connect(
            Arc::clone(&self.pools),
            self.config.clone(),
            self.monitor.clone(),
        )
        .await?;
        Ok(Arc::new(manager))
    }

    async fn dispose(&self, manager: Arc<DbConnectionManager<P>>) {
        manager.shutdown().await;
    }
}

/// Per-call retry behaviour
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccessorConfig {
    pub retry: RetryPolicy,
    /// Wait applied after a local pool acquire timeout, instead of the backoff
    pub capacity_cooldown: Duration,
}

impl Default for AccessorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            capacity_cooldown: Duration::from_secs(5),
        }
    }
}

/// Failure of [`ResilientClient::execute_with_retry`]
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// The pool monitor refused to build a new client
    #[error("Database capacity refused: {reason}")]
    CapacityRefused { reason: String },

    /// The operation or the client build failed and was not retried further
    #[error("{}", .verdict.message)]
    Failed {
        verdict: ErrorVerdict,
        #[source]
        source: BoxError,
    },
}

impl ClientError {
    /// Whether this failure counts against the database breaker
    pub fn trips_breaker(&self) -> bool {
        match self {
            ClientError::CircuitOpen(_) | ClientError::CapacityRefused { .. } => false,
            ClientError::Failed { verdict, .. } => !matches!(
                verdict.category,
                ErrorCategory::ClientAbort | ErrorCategory::Throttled
            ),
        }
    }

    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            ClientError::Failed { verdict, .. } => Some(verdict.category),
            _ => None,
        }
    }
}

/// Shared-client accessor with breaker, classifier and retry
pub struct ResilientClient<C>
where
    C: Clone + Send + Sync + 'static,
{
    factory: Arc<dyn ClientFactory<C>>,
    guard: InitGuard<C>,
    client: RwLock<Option<C>>,
    breaker: CircuitBreaker,
    classifier: Arc<ErrorClassifier>,
    config: AccessorConfig,
}

impl<C> std::fmt::Debug for ResilientClient<C>
where
    C: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("breaker", &self.breaker.name())
            .field("has_client", &self.has_client())
            .field("config", &self.config)
            .finish()
    }
}

impl<C> ResilientClient<C>
where
    C: Clone + Send + Sync + 'static,
{
    pub fn new(
        factory: Arc<dyn ClientFactory<C>>,
        guard: InitGuard<C>,
        breaker: CircuitBreaker,
        classifier: Arc<ErrorClassifier>,
        config: AccessorConfig,
    ) -> Self {
        Self {
            factory,
            guard,
            client: RwLock::new(None),
            breaker,
            classifier,
            config,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn has_client(&self) -> bool {
        self.client
            .read()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// The shared client, if one is currently built
    pub fn current(&self) -> Option<C> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Return the shared client, building it if there is none
    pub async fn client(&self) -> Result<C, InitError> {
        if let Some(client) = self.current() {
            return Ok(client);
        }

        let factory = Arc::clone(&self.factory);
        let client = self
            .guard
            .run(move || async move { factory.build().await })
            .await?;

        let mut slot = self.client.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            info!("Database client initialized");
            *slot = Some(client.clone());
        }
        Ok(client)
    }

    /// Drop the shared client so the next call builds a new one
    ///
    /// The discarded client is handed to [`ClientFactory::dispose`] on a background task.
    pub fn invalidate(&self) {
        let previous = self
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(client) = previous {
            info!("Database client invalidated");
            let factory = Arc::clone(&self.factory);
            tokio::spawn(async move { factory.dispose(client).await });
        }
    }

    /// Run `op` against the shared client inside the database breaker
    ///
    /// `options` overrides the accessor's default retry behaviour for this call.
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        op: F,
        options: Option<AccessorConfig>,
    ) -> Result<T, ClientError>
    where
        F: FnMut(C) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + Send + Sync + 'static,
    {
        let config = options.unwrap_or(self.config);
        self.breaker
            .execute_filtered(|| self.attempt_loop(op, config), ClientError::trips_breaker)
            .await
    }

    async fn attempt_loop<F, Fut, T, E>(&self, mut op: F, config: AccessorConfig) -> Result<T, ClientError>
    where
        F: FnMut(C) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + Send + Sync + 'static,
    {
        let mut attempt = 0u32;

        loop {
            let (report, source): (ErrorReport, BoxError) = match self.client().await {
                Ok(client) => match op(client).await {
                    Ok(value) => return Ok(value),
                    Err(err) => (report_dyn(&err), Box::new(err) as BoxError),
                },
                Err(InitError::Capacity { reason }) => {
                    return Err(ClientError::CapacityRefused { reason });
                }
                Err(InitError::Failed(cause)) => (
                    report_dyn(cause.as_ref()),
                    Box::new(InitError::Failed(cause)) as BoxError,
                ),
            };

            let verdict = self.classifier.handle_error(&report);

            if is_connection_failure(&report, &verdict) {
                self.invalidate();
            }

            if !verdict.should_retry || !config.retry.allows_retry_after(attempt) {
                debug!(
                    category = %verdict.category,
                    attempt = attempt + 1,
                    "Database operation not retried"
                );
                return Err(ClientError::Failed { verdict, source });
            }

            let delay = if report.is_pool_timeout() {
                config.capacity_cooldown
            } else {
                config.retry.delay_for(attempt)
            };
            warn!(
                category = %verdict.category,
                attempt = attempt + 1,
                max_attempts = config.retry.max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Retrying database operation"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Failures that mean the client handle itself is broken
fn is_connection_failure(report: &ErrorReport, verdict: &ErrorVerdict) -> bool {
    if report.is_pool_timeout() {
        return false;
    }
    match verdict.category {
        ErrorCategory::NetworkTransient => true,
        ErrorCategory::Database => report.message.to_lowercase().contains("connection"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_failure_detection() {
        let classifier = ErrorClassifier::default();

        let refused = ErrorReport::new("IoError", "connection refused").with_code("ECONNREFUSED");
        assert!(is_connection_failure(&refused, &classifier.handle_error(&refused)));

        let terminated = ErrorReport::new("Error", "Connection terminated unexpectedly");
        assert!(is_connection_failure(&terminated, &classifier.handle_error(&terminated)));

        let pool_timeout = DbError::PoolTimeout(Duration::from_secs(5)).report();
        assert!(!is_connection_failure(&pool_timeout, &classifier.handle_error(&pool_timeout)));

        let capacity = ErrorReport::new("DatabaseError", "remaining connection slots are reserved");
        assert!(!is_connection_failure(&capacity, &classifier.handle_error(&capacity)));

        let missing = ErrorReport::new("DatabaseError", "relation does not exist").with_code("42P01");
        assert!(!is_connection_failure(&missing, &classifier.handle_error(&missing)));
    }

    #[test]
    fn test_trips_breaker() {
        let abort = ClientError::Failed {
            verdict: ErrorClassifier::default().handle_error(&ErrorReport::new("Error", "aborted")),
            source: "aborted".into(),
        };
        assert!(!abort.trips_breaker());
        assert!(!ClientError::CapacityRefused {
            reason: "full".to_string()
        }
        .trips_breaker());
    }
}
