//! Postgres pool backed by sqlx

use crate::error::DbError;
use crate::pool::{DatabasePool, PoolFactory, PoolSettings};
use async_trait::async_trait;
use bulwark_core_resilience::{MonitoredPool, PoolStats};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Postgres;
use std::fmt;
use tracing::instrument;

/// A sqlx Postgres pool
#[derive(Debug, Clone)]
pub struct PgDatabasePool {
    pool: PgPool,
}

impl PgDatabasePool {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying sqlx pool, for typed queries
    pub fn inner(&self) -> &PgPool {
        &self.pool
    }
}

impl MonitoredPool for PgDatabasePool {
    fn snapshot(&self) -> PoolStats {
        // sqlx does not expose the number of waiters
        PoolStats::new(
            self.pool.size() as usize,
            self.pool.num_idle(),
            0,
            self.pool.options().get_max_connections() as usize,
        )
    }
}

#[async_trait]
impl DatabasePool for PgDatabasePool {
    type Connection = PoolConnection<Postgres>;
    type Row = PgRow;

    async fn acquire(&self) -> Result<Self::Connection, DbError> {
        Ok(self.pool.acquire().await?)
    }

    async fn query(&self, sql: &str) -> Result<Vec<Self::Row>, DbError> {
        Ok(sqlx::query(sql).fetch_all(&self.pool).await?)
    }

    async fn ping(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

/// Connects new [`PgDatabasePool`]s from a URL and [`PoolSettings`]
#[derive(Clone)]
pub struct PgPoolFactory {
    url: String,
    settings: PoolSettings,
}

impl fmt::Debug for PgPoolFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgPoolFactory")
            .field("url", &"<redacted>")
            .field("settings", &self.settings)
            .finish()
    }
}

impl PgPoolFactory {
    pub fn new(url: impl Into<String>, settings: PoolSettings) -> Self {
        Self {
            url: url.into(),
            settings,
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }
}

#[async_trait]
impl PoolFactory<PgDatabasePool> for PgPoolFactory {
    #[instrument(skip_all, fields(max = self.settings.max_connections), err)]
    async fn create(&self) -> Result<PgDatabasePool, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.settings.max_connections)
            .min_connections(self.settings.min_connections)
            .idle_timeout(Some(self.settings.idle_timeout))
            .acquire_timeout(self.settings.connection_timeout)
            .connect(&self.url)
            .await?;
        Ok(PgDatabasePool::new(pool))
    }
}
