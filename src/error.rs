//! Error types for Tessera
//!
//! Every fallible operation in the crate returns [`Result<T>`]. The variants
//! map one-to-one onto the HTTP status codes the service exposes, so the
//! HTTP layer can render any error with a single match (see `http::respond`).
//!
//! Backend adapters (tuple store, KV store, JWKS fetch, identity provider)
//! catch their transport errors at the boundary and map them to
//! [`Error::BackendUnavailable`] or [`Error::BackendRejected`]; higher layers
//! never reinterpret. In particular, a `check` that fails because a backend
//! is down surfaces as 503 — never as a silent `allowed = false`.

use thiserror::Error;

/// Result type alias for Tessera
pub type Result<T> = std::result::Result<T, Error>;

/// Tessera errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (startup only)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing or malformed request parameters
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Bad credentials, or an expired/invalid token
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Authenticated, but the caller lacks the required relation
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Referenced tenant, version, blob, key, or session is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Uniqueness violation (tenant id, duplicate share, ...)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// State-machine violation (KEK status, recovery session)
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Tuple store, KV store, or JWKS provider unreachable; retryable
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Backend permanently rejected the request (e.g. schema violation)
    #[error("Backend rejected request: {0}")]
    BackendRejected(String),

    /// Too many requests from this client
    #[error("Rate limited")]
    RateLimited,

    /// Unexpected internal error; details are logged, never leaked
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status code for this error.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Authentication(_) => 401,
            Self::AccessDenied(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) | Self::InvalidTransition(_) => 409,
            Self::RateLimited => 429,
            Self::BackendUnavailable(_) => 503,
            Self::Config(_) | Self::BackendRejected(_) | Self::Internal(_) => 500,
        }
    }

    /// `true` if a client may retry the identical request and expect it to
    /// eventually succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::RateLimited)
    }

    /// Message safe to return to clients. Internal variants are collapsed to
    /// a generic string so no backend detail leaks.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) | Self::Config(_) | Self::BackendRejected(_) => {
                "internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::BackendUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_error_kinds() {
        assert_eq!(Error::Validation("x".into()).status(), 400);
        assert_eq!(Error::Authentication("x".into()).status(), 401);
        assert_eq!(Error::AccessDenied("x".into()).status(), 403);
        assert_eq!(Error::NotFound("x".into()).status(), 404);
        assert_eq!(Error::Conflict("x".into()).status(), 409);
        assert_eq!(Error::InvalidTransition("x".into()).status(), 409);
        assert_eq!(Error::RateLimited.status(), 429);
        assert_eq!(Error::BackendUnavailable("x".into()).status(), 503);
        assert_eq!(Error::Internal("x".into()).status(), 500);
    }

    #[test]
    fn internal_detail_never_leaks() {
        let err = Error::Internal("kv pool exhausted at 10.0.0.3".into());
        assert_eq!(err.public_message(), "internal server error");

        let err = Error::NotFound("kek version v9".into());
        assert!(err.public_message().contains("v9"));
    }

    #[test]
    fn only_backend_and_rate_errors_are_retryable() {
        assert!(Error::BackendUnavailable("down".into()).is_retryable());
        assert!(Error::RateLimited.is_retryable());
        assert!(!Error::Conflict("dup".into()).is_retryable());
        assert!(!Error::Authentication("bad".into()).is_retryable());
    }
}
