//! End-to-end wiring: accessor, breakers, pool monitor and HTTP routes sharing state

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use bulwark::config::BulwarkConfig;
use bulwark::db::{DatabasePool, DbError, PoolFactory, RuntimeMode};
use bulwark::resilience::{CircuitState, MonitoredPool, PoolStats, DATABASE_BREAKER};
use bulwark::ResilienceService;
use serde_json::Value;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

#[derive(Default)]
struct Database {
    down: AtomicBool,
    pools: AtomicUsize,
}

struct TestPool {
    db: Arc<Database>,
    closed: AtomicBool,
}

fn refused() -> DbError {
    DbError::Connection(io::Error::new(
        io::ErrorKind::ConnectionRefused,
        "connection refused",
    ))
}

impl MonitoredPool for TestPool {
    fn snapshot(&self) -> PoolStats {
        PoolStats::new(3, 2, 0, 10)
    }
}

#[async_trait]
impl DatabasePool for TestPool {
    type Connection = ();
    type Row = String;

    async fn acquire(&self) -> Result<(), DbError> {
        Ok(())
    }

    async fn query(&self, sql: &str) -> Result<Vec<String>, DbError> {
        if self.db.down.load(Ordering::SeqCst) {
            return Err(refused());
        }
        Ok(vec![sql.to_string()])
    }

    async fn ping(&self) -> Result<(), DbError> {
        if self.db.down.load(Ordering::SeqCst) {
            return Err(refused());
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct TestPools {
    db: Arc<Database>,
}

#[async_trait]
impl PoolFactory<TestPool> for TestPools {
    async fn create(&self) -> Result<TestPool, DbError> {
        if self.db.down.load(Ordering::SeqCst) {
            return Err(refused());
        }
        self.db.pools.fetch_add(1, Ordering::SeqCst);
        Ok(TestPool {
            db: Arc::clone(&self.db),
            closed: AtomicBool::new(false),
        })
    }
}

fn service() -> ResilienceService {
    let mut config = BulwarkConfig::default();
    config.database.runtime_mode = Some(RuntimeMode::Ephemeral);
    config.circuit_breaker.failure_threshold = 2;
    ResilienceService::new(config)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-real-ip", "198.51.100.20")
        .body(Body::empty())
        .unwrap()
}

async fn json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_ping_registers_pool_with_monitor() {
    let service = service();
    let db = Arc::new(Database::default());
    let client = service.database_client(Arc::new(TestPools { db: Arc::clone(&db) }));
    let app = service.router(Some(Arc::clone(&client)), Router::new());

    let response = app.clone().oneshot(get("/api/db/ping")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(db.pools.load(Ordering::SeqCst), 1);
    assert!(service.pool_monitor().is_registered("primary"));

    let response = app.oneshot(get("/health")).await.unwrap();
    let body = json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"]["healthy"], true);
    assert_eq!(body["database"]["runtimeMode"], "ephemeral");
    assert_eq!(body["connections"]["totalConnections"], 3);
}

#[tokio::test(start_paused = true)]
async fn test_health_before_first_use_reports_not_connected() {
    let service = service();
    let db = Arc::new(Database::default());
    let client = service.database_client(Arc::new(TestPools { db: Arc::clone(&db) }));
    let app = service.router(Some(client), Router::new());

    let body = json(app.oneshot(get("/health")).await.unwrap()).await;
    assert_eq!(body["database"]["healthy"], false);
    assert_eq!(db.pools.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_outage_opens_database_breaker() {
    let service = service();
    let db = Arc::new(Database::default());
    db.down.store(true, Ordering::SeqCst);
    let client = service.database_client(Arc::new(TestPools { db: Arc::clone(&db) }));
    let app = service.router(Some(client), Router::new());

    for _ in 0..2 {
        let response = app.clone().oneshot(get("/api/db/ping")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    let breaker = service.breakers().get(DATABASE_BREAKER).unwrap();
    assert_eq!(breaker.get_state().await, CircuitState::Open);

    // Short-circuited without touching the database
    let response = app.clone().oneshot(get("/api/db/ping")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key("retry-after"));

    let body = json(app.oneshot(get("/health")).await.unwrap()).await;
    assert_eq!(body["status"], "degraded");
}
