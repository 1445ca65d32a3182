//! Authentication middleware.
//!
//! The teacher supports a full BasicAuth/OIDC stack with JWKS fetch and
//! JWT validation; this pipeline's HTTP surface is an operational control
//! plane, not a multi-tenant API, so it carries only what that surface
//! actually needs: no auth at all, or a single shared bearer token.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthMode {
    #[default]
    None,
    Bearer,
}

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub bearer_token: Option<String>,
}

impl AuthConfig {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self { mode: AuthMode::Bearer, bearer_token: Some(token.into()) }
    }
}

/// Paths that bypass auth even when bearer auth is enabled, so orchestrators
/// can probe liveness/readiness without a token.
pub fn is_public_path(path: &str) -> bool {
    matches!(path, "/health" | "/health/live" | "/health/ready")
}

pub async fn auth_middleware(State(config): State<Arc<AuthConfig>>, request: Request, next: Next) -> Response {
    if config.mode == AuthMode::None || is_public_path(request.uri().path()) {
        return next.run(request).await;
    }

    let expected = match &config.bearer_token {
        Some(token) => token,
        None => return (StatusCode::INTERNAL_SERVER_ERROR, "bearer auth enabled with no token configured").into_response(),
    };

    let provided = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if token == expected => next.run(request).await,
        _ => (StatusCode::UNAUTHORIZED, "missing or invalid bearer token").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_paths_bypass_auth() {
        assert!(is_public_path("/health"));
        assert!(!is_public_path("/status"));
    }
}
