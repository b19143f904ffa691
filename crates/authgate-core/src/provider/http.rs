//! `IdentityProvider` backed by the backend's REST auth endpoints.
//!
//! Endpoints, relative to the auth base URL:
//! - `POST /login`   `{email, password}` → tokens, or HTTP 202 with a challenge
//! - `POST /refresh` `{refresh_token}`   → new access token
//! - `POST /logout`  bearer              → global sign-out
//! - `POST /verify`  bearer              → token still accepted?

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::wire::{
    classify_failure, classify_transport, session_from_tokens, AuthOperation, ChallengeData,
    Envelope, ErrorEnvelope, LoginData, LoginRequest, RefreshData, RefreshRequest, VerifyData,
};
use super::{IdentityProvider, SignInOutcome};
use crate::error::{AuthError, AuthErrorKind};
use crate::session::{Credentials, Session};

/// Default HTTP timeout for auth calls, in seconds.
pub const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 15;

pub struct HttpIdentityProvider {
    client: Client,
    base_url: String,
    /// Last session this provider issued, served by `current_session`.
    last_issued: Mutex<Option<Session>>,
}

impl HttpIdentityProvider {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_AUTH_TIMEOUT_SECS))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Create a provider sharing an existing connection pool.
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            last_issued: Mutex::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn remember(&self, session: Option<Session>) {
        if let Ok(mut last) = self.last_issued.lock() {
            *last = session;
        }
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, AuthError> {
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| classify_transport(&e))?;
        envelope.data.ok_or_else(|| {
            AuthError::new(
                AuthErrorKind::Unknown,
                envelope
                    .message
                    .unwrap_or_else(|| "Provider response carried no data".to_string()),
            )
        })
    }

    async fn failure(operation: AuthOperation, response: Response) -> AuthError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let envelope: ErrorEnvelope = serde_json::from_str(&body).unwrap_or_default();
        classify_failure(
            operation,
            status,
            envelope.error_code.as_deref(),
            envelope.message.as_deref(),
        )
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn sign_in(&self, credentials: &Credentials) -> Result<SignInOutcome, AuthError> {
        let response = self
            .client
            .post(self.url("login"))
            .json(&LoginRequest {
                email: &credentials.username,
                password: &credentials.password,
            })
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        match response.status() {
            StatusCode::ACCEPTED => {
                let challenge: ChallengeData = Self::parse(response).await?;
                info!(challenge = %challenge.challenge, "Sign-in requires a challenge");
                Ok(SignInOutcome::ChallengeRequired(challenge.into()))
            }
            status if status.is_success() => {
                let data: LoginData = Self::parse(response).await?;
                let subject_hint = data.user.and_then(|u| u.cognito_user_id);
                let session = session_from_tokens(
                    data.access_token,
                    data.refresh_token,
                    data.expires_in,
                    subject_hint,
                    &credentials.username,
                    Utc::now(),
                );
                debug!(subject = %session.identity_subject, "Provider issued session");
                self.remember(Some(session.clone()));
                Ok(SignInOutcome::SignedIn(session))
            }
            _ => Err(Self::failure(AuthOperation::SignIn, response).await),
        }
    }

    async fn refresh(&self, session: &Session) -> Result<Session, AuthError> {
        let refresh_token = match session.refresh_token.as_deref() {
            Some(token) if !token.is_empty() => token,
            _ => {
                return Err(AuthError::new(
                    AuthErrorKind::RefreshFailed,
                    "Session has no refresh token",
                ))
            }
        };

        let response = self
            .client
            .post(self.url("refresh"))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        if !response.status().is_success() {
            return Err(Self::failure(AuthOperation::Refresh, response).await);
        }

        let data: RefreshData = Self::parse(response).await?;
        // The backend does not rotate refresh tokens; keep the one we have
        let refreshed = session_from_tokens(
            data.access_token,
            data.refresh_token.or_else(|| session.refresh_token.clone()),
            data.expires_in,
            Some(session.identity_subject.clone()),
            &session.identity_subject,
            Utc::now(),
        );
        self.remember(Some(refreshed.clone()));
        Ok(refreshed)
    }

    async fn sign_out(&self, session: &Session) -> Result<(), AuthError> {
        self.remember(None);

        let response = self
            .client
            .post(self.url("logout"))
            .bearer_auth(&session.access_token)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::UNAUTHORIZED {
            // Token already invalid on the provider side: the outcome is the same
            warn!("Sign-out with an already invalid token");
            return Ok(());
        }
        Err(Self::failure(AuthOperation::SignOut, response).await)
    }

    async fn verify(&self, session: &Session) -> Result<(), AuthError> {
        let response = self
            .client
            .post(self.url("verify"))
            .bearer_auth(&session.access_token)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        if !response.status().is_success() {
            return Err(Self::failure(AuthOperation::Verify, response).await);
        }
        let data: VerifyData = Self::parse(response).await?;
        if data.valid {
            Ok(())
        } else {
            Err(AuthError::session_expired())
        }
    }

    /// The last session this provider issued, if the backend still accepts it.
    async fn current_session(&self) -> Result<Option<Session>, AuthError> {
        let last = self
            .last_issued
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        let Some(session) = last.filter(|s| !s.is_expired()) else {
            return Ok(None);
        };

        match self.verify(&session).await {
            Ok(()) => Ok(Some(session)),
            Err(e) if e.kind == AuthErrorKind::SessionExpired => {
                debug!("Last issued session was revoked");
                self.remember(None);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
