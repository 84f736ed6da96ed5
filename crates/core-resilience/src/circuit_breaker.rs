//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when a dependency
//! is experiencing issues. It has three states:
//! - Closed: Normal operation, requests pass through
//! - Open: Dependency is unhealthy, requests fail immediately
//! - HalfOpen: Probing whether the dependency has recovered
//!
//! Failures are counted inside a monitoring window. A success while closed forgives
//! one failure instead of wiping the count, and a failure count older than the
//! window is dropped entirely.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::info;

/// Breaker name used around database operations
pub const DATABASE_BREAKER: &str = "payload-database";

/// Breaker name used by the HTTP middleware
pub const API_BREAKER: &str = "api-requests";

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    Open,
    /// Circuit is half-open, testing dependency recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Returned instead of running the operation while the circuit is open
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Circuit breaker '{name}' is open, rejecting requests")]
pub struct CircuitOpenError {
    /// Name of the breaker that rejected the call
    pub name: String,
    /// Remaining cooldown before a trial call is allowed
    pub retry_after: Duration,
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of failures inside the monitoring window before opening the circuit
    pub failure_threshold: u32,
    /// Time to stay open before letting a trial call through
    pub reset_timeout: Duration,
    /// Failures older than this are forgotten
    pub monitoring_window: Duration,
    /// Consecutive half-open successes required to close the circuit
    pub half_open_probe_limit: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            monitoring_window: Duration::from_secs(60),
            half_open_probe_limit: 3,
        }
    }
}

/// Point-in-time view of a breaker, suitable for health endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub ms_since_state_change: u64,
    pub retry_after_ms: Option<u64>,
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    failure_count: u32,
    /// Only meaningful while half-open
    success_count: u32,
    last_failure: Option<Instant>,
    last_state_change: Instant,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            last_state_change: Instant::now(),
        }
    }
}

/// Named circuit breaker for protecting a dependency against cascading failures
///
/// Cloning is cheap and yields a handle onto the same breaker.
///
/// # Example
/// ```no_run
/// use bulwark_core_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitOpenError};
///
/// #[derive(Debug)]
/// enum AppError {
///     Open(CircuitOpenError),
/// }
///
/// impl From<CircuitOpenError> for AppError {
///     fn from(err: CircuitOpenError) -> Self {
///         AppError::Open(err)
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<(), AppError> {
///     let breaker = CircuitBreaker::new("payload-database", CircuitBreakerConfig::default());
///
///     let result = breaker.execute(|| async {
///         Ok::<_, AppError>(42)
///     }).await?;
///
///     println!("Result: {}", result);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<CircuitBreakerState>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: Arc::from(name.into()),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(CircuitBreakerState::new())),
        }
    }

    /// Create a new circuit breaker with default configuration
    pub fn new_default(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state without applying any time-based transition
    pub async fn get_state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Get current failure count
    pub async fn get_failure_count(&self) -> u32 {
        self.state.lock().await.failure_count
    }

    /// Get current half-open success count
    pub async fn get_success_count(&self) -> u32 {
        self.state.lock().await.success_count
    }

    /// Remaining cooldown while open, `None` otherwise
    pub async fn retry_after(&self) -> Option<Duration> {
        let state = self.state.lock().await;
        self.remaining_cooldown(&state)
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.lock().await;
        BreakerSnapshot {
            name: self.name.to_string(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            ms_since_state_change: duration_ms(state.last_state_change.elapsed()),
            retry_after_ms: self.remaining_cooldown(&state).map(duration_ms),
        }
    }

    /// Reset the circuit breaker to closed state
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        if state.state != CircuitState::Closed {
            self.transition(&mut state, CircuitState::Closed);
        }
        state.failure_count = 0;
        state.success_count = 0;
        state.last_failure = None;
    }

    /// Gate a call: fails while open, moves to half-open once the reset timeout elapsed
    pub async fn check(&self) -> Result<(), CircuitOpenError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        self.forgive_stale_failures(&mut state, now);

        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                if now.duration_since(state.last_state_change) >= self.config.reset_timeout {
                    self.transition(&mut state, CircuitState::HalfOpen);
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        name: self.name.to_string(),
                        retry_after: self.remaining_cooldown(&state).unwrap_or_default(),
                    })
                }
            }
        }
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// Every error returned by the operation counts as a failure.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        self.execute_filtered(op, |_| true).await
    }

    /// Execute an operation, counting only errors for which `trips` returns true
    ///
    /// Errors that do not trip the breaker leave its counters untouched.
    pub async fn execute_filtered<F, Fut, T, E, P>(&self, op: F, trips: P) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
        P: FnOnce(&E) -> bool,
    {
        self.check().await?;

        match op().await {
            Ok(result) => {
                self.record_success().await;
                Ok(result)
            }
            Err(e) => {
                if trips(&e) {
                    self.record_failure().await;
                }
                Err(e)
            }
        }
    }

    /// Record a successful outcome observed outside of `execute`
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        self.forgive_stale_failures(&mut state, Instant::now());

        match state.state {
            CircuitState::Closed => {
                state.failure_count = state.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.half_open_probe_limit {
                    self.transition(&mut state, CircuitState::Closed);
                }
            }
            // A call admitted before the circuit opened finished late
            CircuitState::Open => {}
        }
    }

    /// Record a failed outcome observed outside of `execute`
    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        self.forgive_stale_failures(&mut state, now);
        state.last_failure = Some(now);
        state.failure_count = state.failure_count.saturating_add(1);

        match state.state {
            CircuitState::Closed => {
                if state.failure_count >= self.config.failure_threshold {
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut state, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn forgive_stale_failures(&self, state: &mut CircuitBreakerState, now: Instant) {
        if let Some(last_failure) = state.last_failure {
            if now.duration_since(last_failure) > self.config.monitoring_window {
                state.failure_count = 0;
                state.last_failure = None;
            }
        }
    }

    fn remaining_cooldown(&self, state: &CircuitBreakerState) -> Option<Duration> {
        (state.state == CircuitState::Open).then(|| {
            self.config
                .reset_timeout
                .saturating_sub(state.last_state_change.elapsed())
        })
    }

    fn transition(&self, state: &mut CircuitBreakerState, to: CircuitState) {
        let from = state.state;
        state.state = to;
        state.last_state_change = Instant::now();
        state.success_count = 0;
        if to == CircuitState::Closed {
            state.failure_count = 0;
        }

        info!(
            breaker = %self.name,
            from = %from,
            to = %to,
            failure_count = state.failure_count,
            "Circuit breaker state changed"
        );
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Process-wide set of breakers, created lazily by name
#[derive(Debug)]
pub struct BreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Create an empty registry whose breakers use `default_config`
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Get a breaker by name, creating it with the default configuration
    pub fn get_or_create(&self, name: &str) -> CircuitBreaker {
        self.get_or_create_with(name, || self.default_config.clone())
    }

    /// Get a breaker by name, creating it with a specific configuration
    ///
    /// The configuration is only used if the breaker does not exist yet.
    pub fn get_or_create_with<F>(&self, name: &str, config: F) -> CircuitBreaker
    where
        F: FnOnce() -> CircuitBreakerConfig,
    {
        if let Some(existing) = self.get(name) {
            return existing;
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name, config()))
            .clone()
    }

    /// Find a breaker by name
    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        let breakers = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        breakers.get(name).cloned()
    }

    /// Snapshot every registered breaker, ordered by name
    pub async fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<CircuitBreaker> = {
            let guard = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
            guard.values().cloned().collect()
        };

        let mut snapshots = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            snapshots.push(breaker.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Manually reset a breaker; returns false if no breaker has that name
    pub async fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset().await;
                true
            }
            None => false,
        }
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
