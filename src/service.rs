/*!
 * Process-wide wiring of the resilience primitives
 *
 * One `ResilienceService` owns the breaker registry, rate limiter, error
 * classifier and pool monitor, and hands out the pieces the HTTP layer and the
 * database accessor need. Everything shares the same instances, so the database
 * breaker seen by `/health` is the one the accessor trips.
 */

use crate::config::BulwarkConfig;
use crate::error::{BulwarkError, Result};
use async_trait::async_trait;
use axum::Router;
use bulwark_core_resilience::{
    BreakerRegistry, CircuitBreaker, ErrorClassifier, InitGuard, PoolMonitor, RateLimiter,
    RetryPolicy, API_BREAKER, DATABASE_BREAKER,
};
use bulwark_db::{
    AccessorConfig, ConnectionHealth, DatabasePool, DbConnectionManager, HealthReporter,
    ManagedClientFactory, PgDatabasePool, PgPoolFactory, PoolFactory, ResilientClient,
    RuntimeMode,
};
use bulwark_server::{database_routes, router, AppState, GateState};
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Resilient accessor whose client is a connection manager over `P`
pub type DatabaseClient<P> = ResilientClient<Arc<DbConnectionManager<P>>>;

#[derive(Debug)]
pub struct ResilienceService {
    config: BulwarkConfig,
    breakers: Arc<BreakerRegistry>,
    limiter: Arc<RateLimiter>,
    classifier: Arc<ErrorClassifier>,
    pool_monitor: Arc<PoolMonitor>,
}

impl ResilienceService {
    pub fn new(config: BulwarkConfig) -> Self {
        let breakers = Arc::new(BreakerRegistry::new(
            config.circuit_breaker.breaker_config(),
        ));
        // Registered up front so health output lists them before first use
        breakers.get_or_create(DATABASE_BREAKER);
        breakers.get_or_create(API_BREAKER);

        let pool_monitor = Arc::new(PoolMonitor::new(config.pool_monitor.monitor_config()));

        Self {
            config,
            breakers,
            limiter: Arc::new(RateLimiter::default()),
            classifier: Arc::new(ErrorClassifier::default()),
            pool_monitor,
        }
    }

    pub fn config(&self) -> &BulwarkConfig {
        &self.config
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    pub fn pool_monitor(&self) -> &Arc<PoolMonitor> {
        &self.pool_monitor
    }

    pub fn database_breaker(&self) -> CircuitBreaker {
        self.breakers.get_or_create(DATABASE_BREAKER)
    }

    pub fn api_breaker(&self) -> CircuitBreaker {
        self.breakers.get_or_create(API_BREAKER)
    }

    /// State for the `/api` request gate
    pub fn gate(&self) -> GateState {
        GateState::new(
            self.api_breaker(),
            Arc::clone(&self.limiter),
            self.config.rate_limit.options(),
            Arc::clone(&self.classifier),
        )
        .with_forwarded_headers(self.config.rate_limit.trust_forwarded_headers)
    }

    /// Database accessor over pools built by `pools`
    ///
    /// Managers are registered with the shared pool monitor, and client builds
    /// are refused while the monitor reports critical utilization.
    pub fn database_client<P: DatabasePool>(
        &self,
        pools: Arc<dyn PoolFactory<P>>,
    ) -> Arc<DatabaseClient<P>> {
        let factory = ManagedClientFactory::new(
            pools,
            self.config.database.manager_config(),
            Some(Arc::clone(&self.pool_monitor)),
        );
        Arc::new(ResilientClient::new(
            Arc::new(factory),
            InitGuard::with_monitor(Arc::clone(&self.pool_monitor)),
            self.database_breaker(),
            Arc::clone(&self.classifier),
            AccessorConfig {
                retry: RetryPolicy::default(),
                ..Default::default()
            },
        ))
    }

    /// Postgres accessor from `database.url`
    pub fn postgres_client(&self) -> Result<Arc<DatabaseClient<PgDatabasePool>>> {
        let url = self.config.database.url.clone().ok_or_else(|| {
            BulwarkError::Config(
                "database.url is required (or set BULWARK_DATABASE_URL)".to_string(),
            )
        })?;
        let pools = PgPoolFactory::new(url, self.config.database.pool_settings());
        Ok(self.database_client(Arc::new(pools)))
    }

    /// Full application router: built-in routes, database routes, and `api`
    pub fn router<P: DatabasePool>(
        &self,
        client: Option<Arc<DatabaseClient<P>>>,
        api: Router,
    ) -> Router {
        let mut state = AppState::new(Arc::clone(&self.breakers), Arc::clone(&self.pool_monitor))
            .with_admin_token(self.config.server.admin_token.as_deref());
        let mut routes = api;

        if let Some(client) = client {
            state = state.with_database(Arc::new(DatabaseHealth {
                client: Arc::clone(&client),
                runtime_mode: self.config.database.runtime_mode(),
            }));
            routes = routes.merge(database_routes(client));
        }

        router(state, self.gate(), routes)
    }

    /// Serve `app` on the configured address until `shutdown` resolves
    pub async fn serve<F>(&self, app: Router, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.server.socket_addr()?;
        info!(
            %addr,
            rate_limit = self.config.rate_limit.max_requests,
            window_ms = self.config.rate_limit.window_ms,
            "Starting Bulwark server"
        );
        bulwark_server::serve(addr, app, shutdown).await?;
        Ok(())
    }
}

/// Reports the accessor's current manager without building one
struct DatabaseHealth<P: DatabasePool> {
    client: Arc<DatabaseClient<P>>,
    runtime_mode: RuntimeMode,
}

#[async_trait]
impl<P: DatabasePool> HealthReporter for DatabaseHealth<P> {
    async fn health(&self) -> ConnectionHealth {
        match self.client.current() {
            Some(manager) => manager.health(),
            None => ConnectionHealth::not_connected(self.runtime_mode),
        }
    }
}
