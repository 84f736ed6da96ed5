//! Shared state for the built-in routes

use crate::auth::AdminAuth;
use bulwark_core_resilience::{BreakerRegistry, PoolMonitor};
use bulwark_db::HealthReporter;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// State behind `/health` and the breaker admin routes
#[derive(Clone)]
pub struct AppState {
    pub breakers: Arc<BreakerRegistry>,
    pub pool_monitor: Arc<PoolMonitor>,
    /// Connection manager health, absent until a database is attached
    pub database: Option<Arc<dyn HealthReporter>>,
    /// Guards the breaker admin routes; disabled unless a token is set
    pub admin: AdminAuth,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(breakers: Arc<BreakerRegistry>, pool_monitor: Arc<PoolMonitor>) -> Self {
        Self {
            breakers,
            pool_monitor,
            database: None,
            admin: AdminAuth::default(),
            started_at: Utc::now(),
        }
    }

    pub fn with_database(mut self, database: Arc<dyn HealthReporter>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_admin_token(mut self, token: Option<&str>) -> Self {
        self.admin = AdminAuth::new(token);
        self
    }
}
