//! Router assembly and the HTTP server loop

use crate::auth::require_admin;
use crate::error::{ApiError, ServerError};
use crate::middleware::{resilience_gate, GateState};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    middleware,
    routing::{get, post},
    Json, Router,
};
use bulwark_core_resilience::{AdmissionDecision, BreakerSnapshot, CircuitState};
use bulwark_db::{ConnectionHealth, DatabasePool, DbConnectionManager, ResilientClient};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Body of `GET /health`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// `ok`, or `degraded` when a breaker is not closed, the database is unhealthy
    /// or the connection ceiling is reached
    pub status: &'static str,
    pub timestamp: String,
    pub uptime_secs: i64,
    pub breakers: Vec<BreakerSnapshot>,
    pub connections: AdmissionDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<ConnectionHealth>,
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    let breakers = state.breakers.snapshots().await;
    let connections = state.pool_monitor.check_connection_limit();
    let database = match &state.database {
        Some(reporter) => Some(reporter.health().await),
        None => None,
    };

    let degraded = breakers.iter().any(|b| b.state != CircuitState::Closed)
        || !connections.allowed
        || database.as_ref().is_some_and(|db| !db.healthy);

    let now = Utc::now();
    Json(HealthReport {
        status: if degraded { "degraded" } else { "ok" },
        timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        uptime_secs: (now - state.started_at).num_seconds(),
        breakers,
        connections,
        database,
    })
}

async fn reset_breaker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.breakers.reset(&name).await {
        info!(breaker = %name, "Circuit breaker reset by operator");
        Ok(Json(json!({ "name": name, "state": CircuitState::Closed })))
    } else {
        Err(ApiError::NotFound(format!("Circuit breaker '{name}'")))
    }
}

/// Build the application router
///
/// `api` carries the application's own routes; every `/api` request, built-in or
/// not, passes through the resilience gate. Admin routes also require the admin
/// bearer token.
pub fn router(state: AppState, gate: GateState, api: Router) -> Router {
    let admin = Router::new()
        .route("/api/admin/breakers/:name/reset", post(reset_breaker))
        .route_layer(middleware::from_fn_with_state(
            state.admin.clone(),
            require_admin,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(admin)
        .with_state(state)
        .merge(api)
        .layer(middleware::from_fn_with_state(gate, resilience_gate))
        .layer(TraceLayer::new_for_http())
}

type ManagedClient<P> = ResilientClient<Arc<DbConnectionManager<P>>>;

async fn db_ping<P: DatabasePool>(
    State(client): State<Arc<ManagedClient<P>>>,
) -> Result<Json<Value>, ApiError> {
    let started = Instant::now();
    let rows = client
        .execute_with_retry(
            |manager| async move { manager.query("SELECT 1").await.map(|rows| rows.len()) },
            None,
        )
        .await?;

    Ok(Json(json!({
        "ok": true,
        "rows": rows,
        "latencyMs": u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    })))
}

/// Routes that exercise the database through the resilient client
pub fn database_routes<P: DatabasePool>(client: Arc<ManagedClient<P>>) -> Router {
    Router::new()
        .route("/api/db/ping", get(db_ping::<P>))
        .with_state(client)
}

/// Bind `addr` and serve `app` until `shutdown` resolves
pub async fn serve<F>(addr: SocketAddr, app: Router, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(%addr, "Bulwark listening");
    info!("   Health: http://{}/health", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(ServerError::Serve)
}
