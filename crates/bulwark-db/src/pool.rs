//! Pool abstraction used by the connection manager

use crate::error::DbError;
use async_trait::async_trait;
use bulwark_core_resilience::MonitoredPool;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A database connection pool the manager can own, ping and replace
#[async_trait]
pub trait DatabasePool: MonitoredPool + 'static {
    /// Connection borrowed from the pool
    type Connection: Send + 'static;
    /// Row type returned by [`DatabasePool::query`]
    type Row: Send + 'static;

    /// Borrow a connection
    async fn acquire(&self) -> Result<Self::Connection, DbError>;

    /// Run a statement and collect its rows
    async fn query(&self, sql: &str) -> Result<Vec<Self::Row>, DbError>;

    /// Cheap liveness check, the equivalent of `SELECT 1`
    async fn ping(&self) -> Result<(), DbError>;

    /// Close the pool, waiting for borrowed connections to come back
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Builds fresh pools, both at startup and when reconnecting
#[async_trait]
pub trait PoolFactory<P: DatabasePool>: Send + Sync {
    async fn create(&self) -> Result<P, DbError>;
}

/// Sizing and timeouts for a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Maximum number of open connections
    pub max_connections: u32,
    /// Connections kept open while idle
    pub min_connections: u32,
    /// Idle connections are closed after this long
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
    /// Time allowed for acquiring a connection
    #[serde(with = "duration_ms")]
    pub connection_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            idle_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolSettings {
    /// Serverless profile: many short-lived instances share one database
    ///
    /// Each instance holds very few connections and releases them quickly so
    /// that a burst of cold starts does not exhaust the server's slots.
    pub fn serverless() -> Self {
        Self {
            max_connections: 2,
            min_connections: 0,
            idle_timeout: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(10),
        }
    }

    /// Clamp sizing and idle lifetime to `profile`; the acquire timeout is kept
    pub fn within(&self, profile: &PoolSettings) -> Self {
        Self {
            max_connections: self.max_connections.min(profile.max_connections),
            min_connections: self.min_connections.min(profile.min_connections),
            idle_timeout: self.idle_timeout.min(profile.idle_timeout),
            connection_timeout: self.connection_timeout,
        }
    }
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
