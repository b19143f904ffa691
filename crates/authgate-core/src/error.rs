//! Error types for authentication and API calls.
//!
//! `AuthError` carries one kind from the closed `AuthErrorKind` taxonomy.
//! The identity provider adapter is the only place that produces these from
//! provider-specific failures; everything downstream matches on the kind.
//!
//! `ApiError` is what the request gateway hands back to its callers.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Closed set of authentication failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum AuthErrorKind {
    InvalidCredentials,
    UserNotConfirmed,
    UserNotFound,
    TooManyRequests,
    ChallengeRequired,
    SessionExpired,
    RefreshFailed,
    NetworkError,
    ProviderUnavailable,
    Unknown,
}

impl AuthErrorKind {
    /// Stable machine-readable code, matching the backend's `error_code` values.
    pub fn code(&self) -> &'static str {
        match self {
            AuthErrorKind::InvalidCredentials => "INVALID_CREDENTIALS",
            AuthErrorKind::UserNotConfirmed => "USER_NOT_CONFIRMED",
            AuthErrorKind::UserNotFound => "USER_NOT_FOUND",
            AuthErrorKind::TooManyRequests => "TOO_MANY_REQUESTS",
            AuthErrorKind::ChallengeRequired => "CHALLENGE_REQUIRED",
            AuthErrorKind::SessionExpired => "SESSION_EXPIRED",
            AuthErrorKind::RefreshFailed => "INVALID_REFRESH_TOKEN",
            AuthErrorKind::NetworkError => "NETWORK_ERROR",
            AuthErrorKind::ProviderUnavailable => "SERVICE_ERROR",
            AuthErrorKind::Unknown => "UNKNOWN",
        }
    }

    /// Parse a backend `error_code`. Unrecognized codes return `None` so the
    /// caller can fall back to status-based classification.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "INVALID_CREDENTIALS" => Some(AuthErrorKind::InvalidCredentials),
            "USER_NOT_CONFIRMED" => Some(AuthErrorKind::UserNotConfirmed),
            "USER_NOT_FOUND" => Some(AuthErrorKind::UserNotFound),
            "TOO_MANY_REQUESTS" => Some(AuthErrorKind::TooManyRequests),
            "CHALLENGE_REQUIRED" => Some(AuthErrorKind::ChallengeRequired),
            "SESSION_EXPIRED" | "TOKEN_EXPIRED" | "INVALID_TOKEN" | "MISSING_TOKEN" => Some(AuthErrorKind::SessionExpired),
            "INVALID_REFRESH_TOKEN" => Some(AuthErrorKind::RefreshFailed),
            "SERVICE_ERROR" => Some(AuthErrorKind::ProviderUnavailable),
            _ => None,
        }
    }

    /// Human-readable message suitable for an inline form error or notification.
    pub fn user_message(&self) -> &'static str {
        match self {
            AuthErrorKind::InvalidCredentials => "Invalid email or password",
            AuthErrorKind::UserNotConfirmed => {
                "User account is not confirmed. Please check your email for confirmation instructions."
            }
            AuthErrorKind::UserNotFound => "User not found",
            AuthErrorKind::TooManyRequests => "Too many login attempts. Please try again later.",
            AuthErrorKind::ChallengeRequired => "Additional verification is required to sign in",
            AuthErrorKind::SessionExpired => "Your session has expired. Please sign in again.",
            AuthErrorKind::RefreshFailed => "Your session could not be renewed. Please sign in again.",
            AuthErrorKind::NetworkError => {
                "Unable to connect to server. Check your internet connection."
            }
            AuthErrorKind::ProviderUnavailable => {
                "Authentication service temporarily unavailable"
            }
            AuthErrorKind::Unknown => "Authentication failed due to an unexpected error",
        }
    }

    /// Failures that say nothing about the validity of the session itself.
    /// A refresh failing with one of these leaves the stored session alone.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AuthErrorKind::NetworkError
                | AuthErrorKind::ProviderUnavailable
                | AuthErrorKind::TooManyRequests
        )
    }
}

impl fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// An authentication failure with its classified kind and detail text.
///
/// Clone is required so a single refresh result can be delivered to every
/// request queued behind it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct AuthError {
    pub kind: AuthErrorKind,
    pub message: String,
}

impl AuthError {
    pub fn new(kind: AuthErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Build an error carrying the kind's default user-facing message.
    pub fn from_kind(kind: AuthErrorKind) -> Self {
        Self::new(kind, kind.user_message())
    }

    pub fn session_expired() -> Self {
        Self::from_kind(AuthErrorKind::SessionExpired)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::NetworkError, message)
    }

    pub fn kind(&self) -> AuthErrorKind {
        self.kind
    }
}

/// Errors surfaced by the request gateway.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!(
                "{}... (truncated, {} total bytes)",
                &body[..end],
                body.len()
            )
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// The authentication kind, if this error came from session recovery.
    pub fn auth_kind(&self) -> Option<AuthErrorKind> {
        match self {
            ApiError::Auth(e) => Some(e.kind),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip_for_backend_codes() {
        for kind in [
            AuthErrorKind::InvalidCredentials,
            AuthErrorKind::UserNotConfirmed,
            AuthErrorKind::UserNotFound,
            AuthErrorKind::TooManyRequests,
            AuthErrorKind::RefreshFailed,
            AuthErrorKind::ProviderUnavailable,
        ] {
            assert_eq!(AuthErrorKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(AuthErrorKind::from_code("LOGIN_ERROR"), None);
    }

    #[test]
    fn test_is_transient() {
        assert!(!AuthErrorKind::RefreshFailed.is_transient());
        assert!(!AuthErrorKind::SessionExpired.is_transient());
        assert!(!AuthErrorKind::Unknown.is_transient());
        assert!(AuthErrorKind::NetworkError.is_transient());
        assert!(AuthErrorKind::ProviderUnavailable.is_transient());
    }

    #[test]
    fn test_from_status() {
        assert!(matches!(ApiError::from_status(401, ""), ApiError::Unauthorized));
        assert!(matches!(ApiError::from_status(403, "no"), ApiError::AccessDenied(_)));
        assert!(matches!(ApiError::from_status(404, ""), ApiError::NotFound(_)));
        assert!(matches!(ApiError::from_status(429, ""), ApiError::RateLimited));
        assert!(matches!(ApiError::from_status(503, ""), ApiError::ServerError(_)));
        assert!(matches!(ApiError::from_status(418, ""), ApiError::InvalidResponse(_)));
    }

    #[test]
    fn test_truncate_body() {
        let long = "x".repeat(MAX_ERROR_BODY_LENGTH + 20);
        let truncated = ApiError::truncate_body(&long);
        assert!(truncated.contains("truncated"));
        assert!(truncated.starts_with(&"x".repeat(MAX_ERROR_BODY_LENGTH)));

        // Multi-byte characters straddling the limit must not panic
        let wide = "é".repeat(MAX_ERROR_BODY_LENGTH);
        assert!(ApiError::truncate_body(&wide).contains("truncated"));
    }

    #[test]
    fn test_auth_error_display() {
        let err = AuthError::from_kind(AuthErrorKind::TooManyRequests);
        assert!(err.to_string().starts_with("TOO_MANY_REQUESTS"));
        assert_eq!(err.kind(), AuthErrorKind::TooManyRequests);
    }
}
