//! Bulwark DB: resilient database access
//!
//! # Overview
//!
//! - [`DbConnectionManager`]: owns one pool, retries recoverable failures with
//!   exponential backoff, pings the pool periodically and rebuilds it after
//!   connection failures
//! - [`ResilientClient`]: the accessor application code calls; shares one client
//!   handle built through a single-flight guard and runs operations through the
//!   `payload-database` breaker with classifier-driven retries
//! - [`DatabasePool`] / [`PoolFactory`]: the seam between the manager and a
//!   concrete driver, implemented for sqlx Postgres in [`postgres`]
//!
//! # Example
//!
//! ```no_run
//! use bulwark_db::postgres::PgPoolFactory;
//! use bulwark_db::{DbConnectionManager, ManagerConfig, PgDatabasePool, PoolSettings};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), bulwark_db::DbError> {
//! let factory = Arc::new(PgPoolFactory::new(
//!     "postgres://localhost/bulwark",
//!     PoolSettings::default(),
//! ));
//! let manager =
//!     DbConnectionManager::<PgDatabasePool>::connect(factory, ManagerConfig::default(), None)
//!         .await?;
//!
//! let rows = manager.query("SELECT id FROM pages").await?;
//! println!("{} pages", rows.len());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod manager;
pub mod pool;
pub mod postgres;

pub use client::{AccessorConfig, ClientError, ClientFactory, ManagedClientFactory, ResilientClient};
pub use error::{report_dyn, report_sqlx, BoxError, DbError, RecoveryAction};
pub use manager::{ConnectionHealth, DbConnectionManager, HealthReporter, ManagerConfig, RuntimeMode};
pub use pool::{DatabasePool, PoolFactory, PoolSettings};
pub use postgres::{PgDatabasePool, PgPoolFactory};
