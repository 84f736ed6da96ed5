//! Bearer-token guard for the operator endpoints

use crate::error::ApiError;
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Shared secret accepted on `/api/admin` routes
///
/// Without a token the admin routes answer 403 to everyone.
#[derive(Clone, Default)]
pub struct AdminAuth {
    token: Option<Arc<str>>,
}

impl fmt::Debug for AdminAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminAuth")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl AdminAuth {
    pub fn new(token: Option<&str>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()).map(Arc::from),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    fn accepts(&self, presented: &str) -> bool {
        self.token
            .as_deref()
            .is_some_and(|expected| constant_time_eq(expected.as_bytes(), presented.as_bytes()))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Axum middleware to require the admin token
pub async fn require_admin(
    State(auth): State<AdminAuth>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !auth.is_enabled() {
        return Err(ApiError::Forbidden(
            "Admin API is disabled, configure server.admin_token".to_string(),
        ));
    }

    let authorized = bearer_token(&request).is_some_and(|token| auth.accepts(token));
    if !authorized {
        warn!(path = %request.uri().path(), "Rejected unauthenticated admin request");
        return Err(ApiError::Unauthorized);
    }
    Ok(next.run(request).await)
}
