//! Backend profile lookup and the application-facing user projection.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::claims::TokenClaims;
use crate::error::{AuthError, AuthErrorKind};
use crate::provider::wire::{classify_failure, classify_transport, AuthOperation, Envelope, ErrorEnvelope};
use crate::session::Session;

/// Default profile path; `{subject}` is replaced by the identity subject.
pub const DEFAULT_PROFILE_PATH: &str = "users/{subject}";

/// User record as returned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    #[serde(default)]
    pub cognito_user_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// The signed-in user as the application sees it.
///
/// Derived from a session plus, when available, the backend profile. It is
/// never stored on its own: clearing the session clears the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub id: Option<i64>,
    pub subject: String,
    pub email: Option<String>,
    pub username: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// False when the profile lookup failed and only token claims are known.
    pub profile_loaded: bool,
}

impl AuthUser {
    pub fn from_session(session: &Session, profile: Option<&Profile>) -> Self {
        let claims = TokenClaims::decode(&session.access_token).unwrap_or_default();
        let claim_username = claims.username().map(str::to_string);

        match profile {
            Some(p) => Self {
                id: Some(p.id),
                subject: session.identity_subject.clone(),
                email: p.email.clone().or(claims.email),
                username: p
                    .username
                    .clone()
                    .or(claim_username)
                    .unwrap_or_else(|| session.identity_subject.clone()),
                created_at: p.created_at,
                updated_at: p.updated_at,
                profile_loaded: true,
            },
            None => Self {
                id: None,
                subject: session.identity_subject.clone(),
                email: claims.email,
                username: claim_username.unwrap_or_else(|| session.identity_subject.clone()),
                created_at: None,
                updated_at: None,
                profile_loaded: false,
            },
        }
    }

    /// Name to show in greetings and status lines.
    pub fn display_name(&self) -> &str {
        self.email.as_deref().unwrap_or(&self.username)
    }
}

#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn fetch_profile(&self, session: &Session) -> Result<Profile, AuthError>;
}

/// Looks up the profile with a bearer-authenticated `GET`.
pub struct HttpProfileSource {
    client: Client,
    base_url: String,
    path_template: String,
}

impl HttpProfileSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            path_template: DEFAULT_PROFILE_PATH.to_string(),
        }
    }

    pub fn with_path_template(mut self, template: impl Into<String>) -> Self {
        self.path_template = template.into();
        self
    }

    fn url_for(&self, subject: &str) -> String {
        let path = self.path_template.replace("{subject}", subject);
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl ProfileSource for HttpProfileSource {
    async fn fetch_profile(&self, session: &Session) -> Result<Profile, AuthError> {
        let url = self.url_for(&session.identity_subject);
        debug!(url = %url, "Fetching profile");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&session.access_token)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let envelope: ErrorEnvelope = serde_json::from_str(&body).unwrap_or_default();
            return Err(classify_failure(
                AuthOperation::Profile,
                status,
                envelope.error_code.as_deref(),
                envelope.message.as_deref(),
            ));
        }

        let envelope: Envelope<Profile> = response.json().await.map_err(|e| classify_transport(&e))?;
        envelope.data.ok_or_else(|| {
            AuthError::new(AuthErrorKind::Unknown, "Profile response carried no data")
        })
    }
}
