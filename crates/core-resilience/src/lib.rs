//! Bulwark Core Resilience: database protection primitives
//!
//! # Overview
//!
//! Building blocks that keep a database-backed service responsive while the
//! database is struggling. None of them perform I/O on their own:
//!
//! - **Circuit Breaker**: fails fast once a dependency keeps failing, tries it again after a cooldown
//! - **Rate Limiter**: keyed fixed-window request counting
//! - **Error Classifier**: decides retry/log behaviour for a failure and throttles repeats
//! - **Pool Monitor**: sums connections across registered pools against a global ceiling
//! - **Init Guard**: single-flight wrapper around expensive client construction
//! - **Retry Policy**: exponential backoff schedule shared by the retrying layers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Inbound request                 │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │   Circuit Breaker ("api-requests")      │  ← 503 while open
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Rate Limiter                      │  ← 429 per client
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │ Circuit Breaker ("payload-database")    │
//! │   ├─ Init Guard ── Pool Monitor         │  ← single-flight, admission
//! │   └─ Error Classifier + Retry Policy    │  ← retry or surface
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!            Database
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use bulwark_core_resilience::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let breaker = CircuitBreaker::new(
//!     "payload-database",
//!     CircuitBreakerConfig {
//!         failure_threshold: 5,
//!         reset_timeout: Duration::from_secs(60),
//!         ..Default::default()
//!     },
//! );
//!
//! let rows = breaker
//!     .execute(|| async { Ok::<_, ResilienceError>(42) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod error;
pub mod error_classifier;
pub mod init_guard;
pub mod pool_monitor;
pub mod rate_limiter;

// Re-export main types for convenience
pub use backoff::RetryPolicy;
pub use circuit_breaker::{
    BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitOpenError,
    CircuitState, API_BREAKER, DATABASE_BREAKER,
};
pub use error::{InitError, ResilienceError};
pub use error_classifier::{
    ErrorCategory, ErrorClassifier, ErrorClassifierConfig, ErrorReport, ErrorVerdict,
};
pub use init_guard::InitGuard;
pub use pool_monitor::{AdmissionDecision, MonitoredPool, PoolMonitor, PoolMonitorConfig, PoolStats};
pub use rate_limiter::{RateLimitDecision, RateLimitOptions, RateLimiter, RateLimiterConfig};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use bulwark_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::backoff::RetryPolicy;
    pub use super::circuit_breaker::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig};
    pub use super::error::{InitError, ResilienceError};
    pub use super::error_classifier::{ErrorClassifier, ErrorReport, ErrorVerdict};
    pub use super::init_guard::InitGuard;
    pub use super::pool_monitor::{MonitoredPool, PoolMonitor, PoolStats};
    pub use super::rate_limiter::{RateLimitOptions, RateLimiter};
}
