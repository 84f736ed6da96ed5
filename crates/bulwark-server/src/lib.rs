//! Bulwark Server
//!
//! Axum integration for the Bulwark resilience layer: a request gate that applies
//! the API circuit breaker and per-client rate limits to `/api` routes, plus the
//! `/health` and breaker admin endpoints.

pub mod auth;
pub mod error;
pub mod middleware;
pub mod server;
pub mod state;

pub use auth::{require_admin, AdminAuth};
pub use error::{ApiError, ServerError};
pub use middleware::{client_ip, resilience_gate, GateState};
pub use server::{database_routes, router, serve, HealthReport};
pub use state::AppState;
