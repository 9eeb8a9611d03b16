//! Request authentication helpers
//!
//! Chat ingress authenticates with `X-API-Key` (resolved by the
//! pipeline); the admin plane takes either the configured admin token
//! or a `/auth/login` session, both as `Authorization: Bearer`.

use std::sync::atomic::{AtomicBool, Ordering};

use axum::http::{header, HeaderMap, StatusCode};

use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const SESSION_HEADER: &str = "x-session-id";

/// Track if we've warned about the open admin plane (warn once only)
static ADMIN_OPEN_WARNED: AtomicBool = AtomicBool::new(false);

/// `X-API-Key` from the request, if present. The OpenAI-compatible
/// surface also accepts `Authorization: Bearer <key>`.
pub fn api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    bearer(headers).filter(|token| token.starts_with("orbit_"))
}

/// Client-supplied session id, if present.
pub fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(String::from)
}

/// Gate for `/admin/*`. Accepts the configured admin token or a live
/// login session. With neither an admin token configured nor any login
/// session active, the plane is open (development mode) and a warning
/// is logged once per process.
pub async fn authorize_admin(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let provided = bearer(headers);

    if let Some(expected) = &state.settings.server.admin_token {
        match &provided {
            Some(token) if constant_time_compare(token.as_bytes(), expected.as_bytes()) => {
                return Ok(())
            }
            _ => {}
        }
    }

    if let Some(token) = &provided {
        if state.admin_sessions.validate(token).is_some() {
            return Ok(());
        }
    }

    // Dev mode: nothing configured to check against
    let has_admin_token = state.settings.server.admin_token.is_some();
    if !has_admin_token && state.admin_sessions.is_empty() {
        if !ADMIN_OPEN_WARNED.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "admin plane is OPEN: no admin_token configured and no user logged in. \
                 Set ORBIT__SERVER__ADMIN_TOKEN or register an admin user for production."
            );
        }
        return Ok(());
    }

    Err(StatusCode::UNAUTHORIZED)
}

/// Constant-time comparison to prevent timing attacks.
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(b"secret", b"secret"));
        assert!(!constant_time_compare(b"secret", b"secre"));
        assert!(!constant_time_compare(b"secret", b"secreT"));
    }

    #[test]
    fn test_api_key_extraction() {
        let mut headers = HeaderMap::new();
        assert!(api_key(&headers).is_none());

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("orbit_abc"));
        assert_eq!(api_key(&headers).as_deref(), Some("orbit_abc"));
    }

    #[test]
    fn test_bearer_fallback_requires_key_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer orbit_xyz"),
        );
        assert_eq!(api_key(&headers).as_deref(), Some("orbit_xyz"));

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer some-admin-token"),
        );
        assert!(api_key(&headers).is_none());
    }

    #[test]
    fn test_session_header() {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, HeaderValue::from_static("s-123"));
        assert_eq!(session_id(&headers).as_deref(), Some("s-123"));
    }
}
