// =============================================================================
// Admin token authentication
// =============================================================================
//
// Every endpoint except /health requires `Authorization: Bearer <token>`,
// where the token is the value of the SURGE_ADMIN_TOKEN environment variable.
// The WebSocket upgrade cannot carry headers from a browser, so it passes the
// same token as a `?token=` query parameter and goes through
// `validate_token` instead of the extractor.
//
// Token comparison is constant-time. An unset SURGE_ADMIN_TOKEN locks every
// authenticated endpoint rather than opening them.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

/// Extractor that admits a request only with a valid admin bearer token.
///
/// Handlers take it as an argument and ignore the value; rejection happens
/// before the handler body runs.
pub struct RequireAuth;

/// Why a request was rejected. All variants map to 403 so a probing client
/// cannot distinguish a wrong token from a missing one.
#[derive(Debug, Clone, Copy)]
pub enum AuthError {
    NotConfigured,
    MissingHeader,
    BadToken,
}

impl AuthError {
    fn message(self) -> &'static str {
        match self {
            Self::NotConfigured => "Server authentication not configured",
            Self::MissingHeader => "Missing or invalid authorization token",
            Self::BadToken => "Invalid authorization token",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message() });
        (StatusCode::FORBIDDEN, axum::Json(body)).into_response()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for RequireAuth
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(expected) = expected_token() else {
            warn!("SURGE_ADMIN_TOKEN is not set — rejecting authenticated request");
            return Err(AuthError::NotConfigured);
        };

        let presented = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        let Some(presented) = presented else {
            warn!("missing or malformed Authorization header");
            return Err(AuthError::MissingHeader);
        };

        if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            warn!("invalid admin token presented");
            return Err(AuthError::BadToken);
        }

        Ok(RequireAuth)
    }
}

/// Check a token from a query parameter (WebSocket upgrade path).
pub fn validate_token(token: &str) -> bool {
    expected_token()
        .map(|expected| constant_time_eq(token.as_bytes(), expected.as_bytes()))
        .unwrap_or(false)
}

/// The configured admin token, or None when unset/empty. Read from the
/// environment on every call so rotation does not need a restart.
fn expected_token() -> Option<String> {
    match std::env::var("SURGE_ADMIN_TOKEN") {
        Ok(token) if !token.is_empty() => Some(token),
        _ => None,
    }
}

/// Equality over every byte of both inputs, so comparison time does not leak
/// the position of the first mismatch. Length differences return early; the
/// expected token's length is not attacker-controlled.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_inputs_match() {
        assert!(constant_time_eq(b"surge-admin", b"surge-admin"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn unequal_inputs_do_not_match() {
        for (a, b) in [
            (&b"token"[..], &b"tokem"[..]),
            (b"token", b"token2"),
            (b"", b"x"),
            (b"\x00", b"\x01"),
        ] {
            assert!(!constant_time_eq(a, b), "{a:?} vs {b:?}");
        }
    }

    #[test]
    fn auth_errors_all_read_as_forbidden() {
        for err in [
            AuthError::NotConfigured,
            AuthError::MissingHeader,
            AuthError::BadToken,
        ] {
            assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);
        }
    }
}
