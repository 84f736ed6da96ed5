//! Request gate for API routes
//!
//! For every request under the API prefix:
//! 1. an open `api-requests` breaker answers 503 without touching the limiter or handler
//! 2. the rate limiter is consulted per client IP; a breach answers 429
//! 3. the handler runs; 5xx responses count as breaker failures, anything else as success
//!
//! Admin routes skip steps 1 and 3 so operators can reach a tripped service, but
//! are still rate limited.
//!
//! A failing rate limiter never blocks traffic: the error is classified and the
//! request is let through.

use crate::error::{insert_rate_limit_headers, ApiError};
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bulwark_core_resilience::rate_limiter::unix_millis;
use bulwark_core_resilience::{
    CircuitBreaker, ErrorClassifier, RateLimitDecision, RateLimitOptions, RateLimiter,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

const API_PREFIX: &str = "/api";
/// Operator endpoints: exempt from the API breaker, not from the limiter
const ADMIN_PREFIX: &str = "/api/admin";

/// Shared state of [`resilience_gate`]
#[derive(Debug, Clone)]
pub struct GateState {
    pub breaker: CircuitBreaker,
    pub limiter: Arc<RateLimiter>,
    pub limits: RateLimitOptions,
    pub classifier: Arc<ErrorClassifier>,
    /// Key clients by `X-Forwarded-For` / `X-Real-IP`; only safe behind a proxy that sets them
    pub trust_forwarded_headers: bool,
}

impl GateState {
    pub fn new(
        breaker: CircuitBreaker,
        limiter: Arc<RateLimiter>,
        limits: RateLimitOptions,
        classifier: Arc<ErrorClassifier>,
    ) -> Self {
        Self {
            breaker,
            limiter,
            limits,
            classifier,
            trust_forwarded_headers: false,
        }
    }

    pub fn with_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }
}

fn has_prefix(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Identify the caller
///
/// With `trust_forwarded` the first `X-Forwarded-For` hop wins, then `X-Real-IP`.
/// Otherwise, and as the fallback, the socket address is used.
pub fn client_ip(request: &Request, trust_forwarded: bool) -> String {
    if trust_forwarded {
        if let Some(ip) = forwarded_ip(request) {
            return ip;
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn forwarded_ip(request: &Request) -> Option<String> {
    let headers = request.headers();

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = forwarded {
        return Some(ip.to_string());
    }

    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

/// Breaker and rate-limit gate, installed with `axum::middleware::from_fn_with_state`
pub async fn resilience_gate(
    State(gate): State<GateState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_owned();
    if !has_prefix(&path, API_PREFIX) {
        return next.run(request).await;
    }
    let admin = has_prefix(&path, ADMIN_PREFIX);

    if admin {
        debug!(path = %path, "Admin route, API breaker not consulted");
    } else if let Err(open) = gate.breaker.check().await {
        debug!(breaker = %open.name, path = %path, "Rejecting request, circuit open");
        return ApiError::CircuitOpen {
            retry_after: open.retry_after,
        }
        .into_response();
    }

    let ip = client_ip(&request, gate.trust_forwarded_headers);
    let decision = match gate.limiter.check_limit(&ip, &gate.limits) {
        Ok(decision) => Some(decision),
        Err(err) => {
            let verdict = gate.classifier.handle(&err);
            warn!(
                error = %err,
                category = %verdict.category,
                "Rate limiter failed, allowing request"
            );
            None
        }
    };

    if let Some(decision) = decision.filter(|d| !d.allowed) {
        debug!(client = %ip, limit = decision.limit, "Rate limit exceeded");
        return rate_limited(decision).into_response();
    }

    let mut response = next.run(request).await;

    if !admin {
        if response.status().is_server_error() {
            gate.breaker.record_failure().await;
        } else {
            gate.breaker.record_success().await;
        }
    }

    if let Some(decision) = decision {
        insert_rate_limit_headers(
            response.headers_mut(),
            decision.limit,
            decision.remaining,
            decision.reset_time_ms,
        );
    }
    response
}

fn rate_limited(decision: RateLimitDecision) -> ApiError {
    ApiError::RateLimited {
        limit: decision.limit,
        remaining: decision.remaining,
        reset_time_ms: decision.reset_time_ms,
        retry_after: decision.retry_after(unix_millis()),
    }
}
