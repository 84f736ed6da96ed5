//! HTTP error responses

use axum::{
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bulwark_core_resilience::ErrorCategory;
use bulwark_db::ClientError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Errors returned to HTTP clients
///
/// Messages are always safe for end users; database error text never reaches a response.
#[derive(Debug, Error)]
pub enum ApiError {
    /// A circuit breaker is open
    #[error("Service temporarily unavailable")]
    CircuitOpen { retry_after: Duration },

    /// The caller exceeded its request budget
    #[error("Too many requests")]
    RateLimited {
        limit: u32,
        remaining: u32,
        /// Unix milliseconds at which the budget resets
        reset_time_ms: u64,
        retry_after: Duration,
    },

    /// The database cannot take more work right now
    #[error("{0}")]
    Unavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing or wrong admin credentials
    #[error("Authentication required")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("{0}")]
    Internal(String),
}

impl From<ClientError> for ApiError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::CircuitOpen(open) => ApiError::CircuitOpen {
                retry_after: open.retry_after,
            },
            ClientError::CapacityRefused { .. } => ApiError::Unavailable(
                "Database is at connection capacity, please retry later".to_string(),
            ),
            ClientError::Failed { verdict, .. } => match verdict.category {
                ErrorCategory::CapacityExhausted
                | ErrorCategory::NetworkTransient
                | ErrorCategory::Throttled => ApiError::Unavailable(verdict.message),
                ErrorCategory::ClientAbort | ErrorCategory::Database | ErrorCategory::Fatal => {
                    ApiError::Internal(verdict.message)
                }
            },
        }
    }
}

/// Whole seconds for a `Retry-After` header, never below one
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let millis = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
    millis.div_ceil(1000).max(1)
}

/// Unix seconds at which a rate-limit bucket resets
pub fn reset_epoch_secs(reset_time_ms: u64) -> u64 {
    reset_time_ms.div_ceil(1000)
}

fn iso_timestamp(unix_ms: u64) -> String {
    i64::try_from(unix_ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Insert the `X-RateLimit-*` headers
pub fn insert_rate_limit_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset_time_ms: u64) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_epoch_secs(reset_time_ms)));
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::CircuitOpen { retry_after } => {
                let secs = retry_after_secs(retry_after);
                let body = json!({
                    "error": "Service Unavailable",
                    "message": "Service is temporarily unavailable, please retry later",
                    "retryAfter": secs,
                });
                let mut response = (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(secs));
                response
            }
            ApiError::RateLimited {
                limit,
                remaining,
                reset_time_ms,
                retry_after,
            } => {
                let body = json!({
                    "error": "Too Many Requests",
                    "message": "Rate limit exceeded, please slow down",
                    "resetTime": iso_timestamp(reset_time_ms),
                });
                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                let headers = response.headers_mut();
                insert_rate_limit_headers(headers, limit, remaining, reset_time_ms);
                headers.insert(
                    header::RETRY_AFTER,
                    HeaderValue::from(retry_after_secs(retry_after)),
                );
                response
            }
            ApiError::Unavailable(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "Service Unavailable", "message": message })),
            )
                .into_response(),
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "Not Found", "message": format!("{what} not found") })),
            )
                .into_response(),
            ApiError::Unauthorized => {
                let body = json!({
                    "error": "Unauthorized",
                    "message": "A valid admin bearer token is required",
                });
                let mut response = (StatusCode::UNAUTHORIZED, Json(body)).into_response();
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                response
            }
            ApiError::Forbidden(message) => (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": "Forbidden", "message": message })),
            )
                .into_response(),
            ApiError::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal Server Error", "message": message })),
            )
                .into_response(),
        }
    }
}

/// Failure to run the HTTP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[source] io::Error),
}
