//! Wire shapes of the backend auth API and the translation of its failures
//! into `AuthErrorKind`.
//!
//! Every response is wrapped in an envelope:
//! `{"status": "success"|"error", "data": ..., "message": ..., "error_code": ...}`.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::claims::TokenClaims;
use crate::error::{AuthError, AuthErrorKind};
use crate::session::{Challenge, Session};

/// Token lifetime assumed when neither the response nor the token says.
const FALLBACK_TOKEN_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub status: Option<String>,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
}

/// Error-only view of an envelope, used when the body shape is unknown.
#[derive(Debug, Default, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct LoginData {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub user: Option<LoginUser>,
}

#[derive(Debug, Deserialize)]
pub struct LoginUser {
    #[serde(default)]
    pub cognito_user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChallengeData {
    pub challenge: String,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub challenge_parameters: HashMap<String, String>,
}

impl From<ChallengeData> for Challenge {
    fn from(data: ChallengeData) -> Self {
        Challenge {
            name: data.challenge,
            session: data.session,
            parameters: data.challenge_parameters,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RefreshData {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// `POST /verify` payload. Only `valid` matters; the claims are already in the token.
#[derive(Debug, Deserialize)]
pub struct VerifyData {
    #[serde(default)]
    pub valid: bool,
}

/// Which provider call failed. The same status means different things
/// depending on the call (a 401 on sign-in is bad credentials, on refresh it
/// is a dead refresh token).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOperation {
    SignIn,
    Refresh,
    SignOut,
    Verify,
    Profile,
}

/// Map a non-success HTTP response onto exactly one `AuthErrorKind`.
pub fn classify_failure(
    operation: AuthOperation,
    status: u16,
    error_code: Option<&str>,
    message: Option<&str>,
) -> AuthError {
    let kind = error_code
        .and_then(AuthErrorKind::from_code)
        .unwrap_or_else(|| classify_status(operation, status));
    let message = message
        .map(str::to_string)
        .unwrap_or_else(|| kind.user_message().to_string());
    AuthError::new(kind, message)
}

fn classify_status(operation: AuthOperation, status: u16) -> AuthErrorKind {
    match (operation, status) {
        (AuthOperation::SignIn, 401) => AuthErrorKind::InvalidCredentials,
        (AuthOperation::Refresh, 400 | 401) => AuthErrorKind::RefreshFailed,
        (_, 401) => AuthErrorKind::SessionExpired,
        (AuthOperation::Profile, 404) => AuthErrorKind::UserNotFound,
        (_, 429) => AuthErrorKind::TooManyRequests,
        (_, 502..=504) => AuthErrorKind::ProviderUnavailable,
        _ => AuthErrorKind::Unknown,
    }
}

/// Map a transport-level failure (no HTTP response) onto an `AuthError`.
pub fn classify_transport(err: &reqwest::Error) -> AuthError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        AuthError::network(err.to_string())
    } else if err.is_decode() {
        AuthError::new(AuthErrorKind::Unknown, format!("Malformed provider response: {}", err))
    } else {
        AuthError::new(AuthErrorKind::Unknown, err.to_string())
    }
}

/// Assemble a `Session` from issued tokens.
///
/// `subject_hint` wins when the provider states the subject; otherwise the
/// access token's `sub` claim is used, then `fallback_subject`.
pub fn session_from_tokens(
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    subject_hint: Option<String>,
    fallback_subject: &str,
    now: DateTime<Utc>,
) -> Session {
    let claims = TokenClaims::decode(&access_token).unwrap_or_default();
    let expires_at = expires_in
        .filter(|secs| *secs > 0)
        .and_then(Duration::try_seconds)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .or_else(|| claims.expires_at())
        .unwrap_or_else(|| now + Duration::seconds(FALLBACK_TOKEN_LIFETIME_SECS));
    let subject = subject_hint
        .filter(|s| !s.is_empty())
        .or(claims.sub)
        .unwrap_or_else(|| fallback_subject.to_string());
    Session::new(access_token, refresh_token, expires_at, subject)
}
