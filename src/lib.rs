/*!
 * Bulwark - database resilience for web services
 *
 * Ties the workspace crates together:
 * - `bulwark-core-resilience`: circuit breakers, rate limiter, error classifier,
 *   init guard and pool monitor
 * - `bulwark-db`: self-healing connection manager and the resilient client accessor
 * - `bulwark-server`: axum request gate and health endpoints
 *
 * This crate adds configuration, logging setup and the service wiring used by
 * the `bulwark` binary.
 */

pub mod config;
pub mod error;
pub mod logging;
pub mod service;

// Re-export commonly used types
pub use config::{BulwarkConfig, LogFormat, LogLevel};
pub use error::{BulwarkError, Result};
pub use service::{DatabaseClient, ResilienceService};

pub use bulwark_core_resilience as resilience;
pub use bulwark_db as db;
pub use bulwark_server as server;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
