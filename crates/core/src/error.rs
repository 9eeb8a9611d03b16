//! Gateway error taxonomy
//!
//! Every collaborator maps its native errors into this taxonomy before
//! the pipeline sees them. The pipeline either recovers or converts the
//! error into a terminal stream event.

use thiserror::Error;

/// How an authentication attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// No `X-API-Key` header was supplied
    Missing,
    /// Token is not known to the key store
    Invalid,
    /// Token exists but has been deactivated
    Inactive,
}

impl AuthFailure {
    pub fn message(&self) -> &'static str {
        match self {
            AuthFailure::Missing => "Missing API key",
            AuthFailure::Invalid => "Invalid API key",
            AuthFailure::Inactive => "API key has been deactivated",
        }
    }
}

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request, missing fields. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing/invalid/inactive key. Never retried.
    #[error("Authentication failed: {}", .0.message())]
    Auth(AuthFailure),

    /// Referenced adapter/prompt/provider not found. Never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network, timeout, 5xx from a datasource or inference backend.
    /// Retried by the supervisor; contributes to circuit state.
    #[error("Transient upstream error from {target}: {message}")]
    UpstreamTransient { target: String, message: String },

    /// 4xx from a backend (bad request, content policy, quota). Not retried.
    #[error("Permanent upstream error from {target}: {message}")]
    UpstreamPermanent { target: String, message: String },

    /// Circuit for the target is open; no outbound call was made.
    #[error("upstream_unavailable: {target}")]
    UpstreamUnavailable { target: String },

    /// Moderation refusal on input or output.
    #[error("Blocked by moderator {moderator}: {reason}")]
    Blocked { moderator: String, reason: String },

    /// Client disconnect or deadline exceeded.
    #[error("Request cancelled")]
    Cancelled,

    /// Persistence failure outside the upstream call path.
    #[error("Store error: {0}")]
    Store(String),

    /// Invariant violation inside the gateway itself.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Gateway result alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status for errors that abort the request before any stream
    /// is established. In-stream failures are always 200 + `error` event.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::Auth(AuthFailure::Inactive) => 403,
            Error::Auth(_) => 401,
            Error::Config(_) => 500,
            Error::UpstreamTransient { .. } => 502,
            Error::UpstreamPermanent { .. } => 502,
            Error::UpstreamUnavailable { .. } => 503,
            Error::Blocked { .. } => 200,
            Error::Cancelled => 499,
            Error::Store(_) => 500,
            Error::Internal(_) => 500,
        }
    }

    /// Whether the supervisor may retry the failed call
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::UpstreamTransient { .. })
    }

    /// Short machine-readable class for health reporting
    pub fn class(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Auth(_) => "auth",
            Error::Config(_) => "config",
            Error::UpstreamTransient { .. } => "upstream_transient",
            Error::UpstreamPermanent { .. } => "upstream_permanent",
            Error::UpstreamUnavailable { .. } => "upstream_unavailable",
            Error::Blocked { .. } => "blocked",
            Error::Cancelled => "cancelled",
            Error::Store(_) => "store",
            Error::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::Validation("bad".into()).status_code(), 400);
        assert_eq!(Error::Auth(AuthFailure::Missing).status_code(), 401);
        assert_eq!(Error::Auth(AuthFailure::Invalid).status_code(), 401);
        assert_eq!(Error::Auth(AuthFailure::Inactive).status_code(), 403);
        assert_eq!(
            Error::UpstreamUnavailable { target: "inference:ollama".into() }.status_code(),
            503
        );
    }

    #[test]
    fn test_transient_classification() {
        let transient = Error::UpstreamTransient {
            target: "retriever:qa-sql".into(),
            message: "timeout".into(),
        };
        assert!(transient.is_transient());

        let permanent = Error::UpstreamPermanent {
            target: "inference:openai".into(),
            message: "quota exceeded".into(),
        };
        assert!(!permanent.is_transient());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn test_error_class() {
        assert_eq!(
            Error::Blocked { moderator: "rules".into(), reason: "injection".into() }.class(),
            "blocked"
        );
        assert_eq!(Error::Cancelled.class(), "cancelled");
    }
}
