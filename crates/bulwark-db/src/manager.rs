//! Resilient database connection manager
//!
//! Owns exactly one pool at a time. Operations go through
//! [`DbConnectionManager::execute_with_retry`], which backs off on recoverable
//! failures and, when the failure points at a broken connection, rebuilds the
//! pool in the background with a capped number of attempts.
//!
//! Once the reconnect cap is reached, operations that need a new pool fail with
//! [`DbError::ReconnectExhausted`] until a health check succeeds or
//! [`DbConnectionManager::reconnect`] is called.
//!
//! In [`RuntimeMode::Persistent`] a background task pings the pool
//! periodically. In [`RuntimeMode::Ephemeral`] (serverless invocations) no
//! timer is started, since it would outlive the invocation.

use crate::error::{DbError, RecoveryAction};
use crate::pool::{DatabasePool, PoolFactory};
use async_trait::async_trait;
use bulwark_core_resilience::rate_limiter::unix_millis;
use bulwark_core_resilience::{MonitoredPool, PoolMonitor, PoolStats, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Environment variables whose presence marks a short-lived serverless invocation
const EPHEMERAL_MARKERS: &[&str] = &[
    "AWS_LAMBDA_FUNCTION_NAME",
    "VERCEL",
    "NETLIFY",
    "FUNCTIONS_WORKER_RUNTIME",
];

/// Lifetime of the hosting process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    /// Long-running server: periodic health checks are worthwhile
    Persistent,
    /// Serverless invocation: no background timers
    Ephemeral,
}

impl RuntimeMode {
    /// Guess the mode from well-known serverless environment variables
    pub fn detect() -> Self {
        if EPHEMERAL_MARKERS
            .iter()
            .any(|name| std::env::var_os(name).is_some())
        {
            RuntimeMode::Ephemeral
        } else {
            RuntimeMode::Persistent
        }
    }

    pub fn allows_background_tasks(&self) -> bool {
        matches!(self, RuntimeMode::Persistent)
    }
}

/// Manager behaviour
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Name under which the pool is registered with the [`PoolMonitor`]
    pub pool_name: String,
    pub runtime_mode: RuntimeMode,
    /// Period of the background health check
    pub health_check_interval: Duration,
    /// Reconnect attempts before giving up until the next successful health check
    pub max_reconnect_attempts: u32,
    /// Retry budget and backoff for operations and reconnects
    pub retry: RetryPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            pool_name: "primary".to_string(),
            runtime_mode: RuntimeMode::Persistent,
            health_check_interval: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            retry: RetryPolicy::database(),
        }
    }
}

/// Point-in-time view of the manager's state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealth {
    pub healthy: bool,
    pub reconnecting: bool,
    pub reconnect_attempts: u32,
    /// Unix milliseconds of the last health check, if any ran
    pub last_health_check_ms: Option<u64>,
    pub runtime_mode: RuntimeMode,
    pub pool: PoolStats,
}

impl ConnectionHealth {
    /// Health of a connection that has not been established
    pub fn not_connected(runtime_mode: RuntimeMode) -> Self {
        Self {
            healthy: false,
            reconnecting: false,
            reconnect_attempts: 0,
            last_health_check_ms: None,
            runtime_mode,
            pool: PoolStats::new(0, 0, 0, 0),
        }
    }
}

/// Anything that can report the health of a database connection
#[async_trait]
pub trait HealthReporter: Send + Sync {
    async fn health(&self) -> ConnectionHealth;
}

struct Inner<P: DatabasePool> {
    factory: Arc<dyn PoolFactory<P>>,
    config: ManagerConfig,
    monitor: Option<Arc<PoolMonitor>>,
    /// Registered with the monitor for the manager's whole life; follows pool swaps
    view: Arc<dyn MonitoredPool>,
    pool: RwLock<Arc<P>>,
    healthy: AtomicBool,
    reconnecting: AtomicBool,
    reconnect_attempts: AtomicU32,
    last_health_check_ms: AtomicU64,
    shutdown: CancellationToken,
}

impl<P: DatabasePool> Drop for Inner<P> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Monitor entry that always reports whichever pool the manager currently owns
struct PoolView<P: DatabasePool> {
    inner: Weak<Inner<P>>,
}

impl<P: DatabasePool> MonitoredPool for PoolView<P> {
    fn snapshot(&self) -> PoolStats {
        match self.inner.upgrade() {
            Some(inner) if !inner.shutdown.is_cancelled() => inner.current_pool().snapshot(),
            _ => PoolStats::new(0, 0, 0, 0),
        }
    }

    fn close_idle(&self, count: usize) -> usize {
        self.inner
            .upgrade()
            .map_or(0, |inner| inner.current_pool().close_idle(count))
    }
}

/// Owns one database pool and keeps it usable
pub struct DbConnectionManager<P: DatabasePool> {
    inner: Arc<Inner<P>>,
}

impl<P: DatabasePool> Clone for DbConnectionManager<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: DatabasePool> std::fmt::Debug for DbConnectionManager<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConnectionManager")
            .field("pool_name", &self.inner.config.pool_name)
            .field("healthy", &self.is_healthy())
            .field("reconnecting", &self.inner.reconnecting.load(Ordering::Relaxed))
            .finish()
    }
}

impl<P: DatabasePool> DbConnectionManager<P> {
    /// Build the first pool, verify it answers, and start health checks if allowed
    pub async fn connect(
        factory: Arc<dyn PoolFactory<P>>,
        config: ManagerConfig,
        monitor: Option<Arc<PoolMonitor>>,
    ) -> Result<Self, DbError> {
        let pool = Arc::new(factory.create().await?);
        if let Err(e) = pool.ping().await {
            pool.close().await;
            return Err(e);
        }

        let inner = Arc::new_cyclic(|weak: &Weak<Inner<P>>| Inner {
            factory,
            config,
            monitor,
            view: Arc::new(PoolView {
                inner: weak.clone(),
            }),
            pool: RwLock::new(pool),
            healthy: AtomicBool::new(true),
            reconnecting: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            last_health_check_ms: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        if let Some(monitor) = &inner.monitor {
            monitor.register_pool(inner.config.pool_name.clone(), Arc::clone(&inner.view));
        }

        info!(
            pool = %inner.config.pool_name,
            mode = ?inner.config.runtime_mode,
            "Database connection established"
        );

        if inner.config.runtime_mode.allows_background_tasks() {
            spawn_health_checks(&inner);
        } else {
            debug!("Ephemeral runtime, periodic health checks disabled");
        }

        Ok(Self { inner })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// The pool currently in use
    pub fn pool(&self) -> Arc<P> {
        self.inner.current_pool()
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::SeqCst)
    }

    /// Run `op` against the current pool, retrying recoverable failures with backoff
    pub async fn execute_with_retry<F, Fut, T>(&self, mut op: F) -> Result<T, DbError>
    where
        F: FnMut(Arc<P>) -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        let policy = self.inner.config.retry;
        let mut attempt = 0u32;

        loop {
            if self.inner.shutdown.is_cancelled() {
                return Err(DbError::PoolClosed);
            }

            let err = match op(self.pool()).await {
                Ok(value) => {
                    self.inner.healthy.store(true, Ordering::SeqCst);
                    return Ok(value);
                }
                Err(err) => err,
            };

            let action = err.recovery_action();
            if action == RecoveryAction::Fail || !policy.allows_retry_after(attempt) {
                return Err(err);
            }

            self.inner.healthy.store(false, Ordering::SeqCst);
            if action == RecoveryAction::RetryAndReconnect {
                if let Some(attempts) = self.inner.reconnect_exhausted() {
                    warn!(error = %err, attempts, "Database unreachable, reconnect cap reached");
                    return Err(DbError::ReconnectExhausted(attempts));
                }
                self.inner.schedule_reconnect();
            }

            let delay = policy.delay_for(attempt);
            warn!(
                attempt = attempt + 1,
                max_attempts = policy.max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Database operation failed, retrying"
            );

            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Err(DbError::PoolClosed),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Run a statement with retry
    pub async fn query(&self, sql: &str) -> Result<Vec<P::Row>, DbError> {
        self.execute_with_retry(|pool| async move { pool.query(sql).await })
            .await
    }

    /// Borrow a connection with retry
    pub async fn get_client(&self) -> Result<P::Connection, DbError> {
        self.execute_with_retry(|pool| async move { pool.acquire().await })
            .await
    }

    /// Ping the pool now; a failure marks the manager unhealthy and schedules a reconnect
    pub async fn check_health(&self) -> bool {
        self.inner.check_health().await
    }

    /// Trigger a background pool rebuild unless one is already running
    ///
    /// Also lifts the reconnect cap, so a manager that gave up tries again.
    pub fn reconnect(&self) {
        if !self.inner.reconnecting.load(Ordering::SeqCst) {
            self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        }
        self.inner.schedule_reconnect();
    }

    pub fn health(&self) -> ConnectionHealth {
        let last = self.inner.last_health_check_ms.load(Ordering::SeqCst);
        ConnectionHealth {
            healthy: self.is_healthy(),
            reconnecting: self.inner.reconnecting.load(Ordering::SeqCst),
            reconnect_attempts: self.inner.reconnect_attempts.load(Ordering::SeqCst),
            last_health_check_ms: (last > 0).then_some(last),
            runtime_mode: self.inner.config.runtime_mode,
            pool: self.pool().snapshot(),
        }
    }

    /// Stop background work and close the pool
    ///
    /// A reconnect that is mid-flight either sees the cancellation and discards
    /// its new pool, or has already swapped it in, in which case it is closed here.
    pub async fn shutdown(&self) {
        {
            let _slot = self.inner.pool.write().unwrap_or_else(PoisonError::into_inner);
            self.inner.shutdown.cancel();
        }
        self.inner.healthy.store(false, Ordering::SeqCst);
        if let Some(monitor) = &self.inner.monitor {
            monitor.unregister_pool_if(&self.inner.config.pool_name, &self.inner.view);
        }
        self.pool().close().await;
        info!(pool = %self.inner.config.pool_name, "Database connection closed");
    }
}

#[async_trait]
impl<P: DatabasePool> HealthReporter for DbConnectionManager<P> {
    async fn health(&self) -> ConnectionHealth {
        DbConnectionManager::health(self)
    }
}

impl<P: DatabasePool> Inner<P> {
    fn current_pool(&self) -> Arc<P> {
        Arc::clone(&self.pool.read().unwrap_or_else(PoisonError::into_inner))
    }

    async fn check_health(self: &Arc<Self>) -> bool {
        let result = self.current_pool().ping().await;
        self.last_health_check_ms
            .store(unix_millis(), Ordering::SeqCst);

        match result {
            Ok(()) => {
                self.healthy.store(true, Ordering::SeqCst);
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                true
            }
            Err(e) => {
                warn!(pool = %self.config.pool_name, error = %e, "Database health check failed");
                self.healthy.store(false, Ordering::SeqCst);
                self.schedule_reconnect();
                false
            }
        }
    }

    /// Attempts made, if the reconnect loop has given up
    fn reconnect_exhausted(&self) -> Option<u32> {
        let attempts = self.reconnect_attempts.load(Ordering::SeqCst);
        let exhausted = !self.reconnecting.load(Ordering::SeqCst)
            && attempts >= self.config.max_reconnect_attempts;
        exhausted.then_some(attempts)
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.reconnect_loop().await;
            inner.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn reconnect_loop(&self) {
        let max = self.config.max_reconnect_attempts;

        loop {
            let attempts = self.reconnect_attempts.load(Ordering::SeqCst);
            if attempts >= max {
                error!(
                    pool = %self.config.pool_name,
                    attempts,
                    "Giving up on reconnecting to the database; manual intervention required"
                );
                return;
            }
            self.reconnect_attempts.store(attempts + 1, Ordering::SeqCst);

            let delay = self.config.retry.delay_for(attempts);
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.rebuild_pool().await {
                Ok(()) => {
                    info!(
                        pool = %self.config.pool_name,
                        attempt = attempts + 1,
                        "Reconnected to the database"
                    );
                    self.reconnect_attempts.store(0, Ordering::SeqCst);
                    self.healthy.store(true, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    warn!(
                        pool = %self.config.pool_name,
                        attempt = attempts + 1,
                        max_attempts = max,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                }
            }
        }
    }

    async fn rebuild_pool(&self) -> Result<(), DbError> {
        let fresh = Arc::new(self.factory.create().await?);
        if let Err(e) = fresh.ping().await {
            fresh.close().await;
            return Err(e);
        }

        // Checked under the slot lock so shutdown cannot interleave with the swap
        let old = {
            let mut slot = self.pool.write().unwrap_or_else(PoisonError::into_inner);
            if self.shutdown.is_cancelled() {
                None
            } else {
                Some(std::mem::replace(&mut *slot, Arc::clone(&fresh)))
            }
        };
        match old {
            Some(old) => {
                old.close().await;
                Ok(())
            }
            None => {
                fresh.close().await;
                Err(DbError::PoolClosed)
            }
        }
    }
}

fn spawn_health_checks<P: DatabasePool>(inner: &Arc<Inner<P>>) {
    let weak: Weak<Inner<P>> = Arc::downgrade(inner);
    let token = inner.shutdown.clone();
    let period = inner.config.health_check_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the pool was just verified.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(inner) = weak.upgrade() else { break };
            inner.check_health().await;
        }
        debug!("Health check task stopped");
    });
}
