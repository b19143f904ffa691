//! Identity provider adapter.
//!
//! `IdentityProvider` is the boundary between the session manager and the
//! external identity service. Implementations talk to the network, translate
//! every provider failure into an `AuthErrorKind`, and never touch the token
//! store.

pub mod http;
pub mod wire;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::AuthError;
use crate::session::{Challenge, Credentials, Session};

pub use http::HttpIdentityProvider;

/// Result of a sign-in attempt that didn't fail outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInOutcome {
    SignedIn(Session),
    ChallengeRequired(Challenge),
}

/// Push notifications a provider may emit on its own (another tab signed
/// out, a background token rotation, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    SignedIn(Session),
    TokenRefreshed(Session),
    SignedOut,
    SessionExpired,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in(&self, credentials: &Credentials) -> Result<SignInOutcome, AuthError>;

    async fn refresh(&self, session: &Session) -> Result<Session, AuthError>;

    async fn sign_out(&self, session: &Session) -> Result<(), AuthError>;

    /// Ask the provider whether it still accepts the session's access token.
    /// A revoked or expired token is `SessionExpired`; any other error means
    /// the answer is unknown.
    async fn verify(&self, session: &Session) -> Result<(), AuthError>;

    async fn current_session(&self) -> Result<Option<Session>, AuthError>;

    /// Subscribe to provider-initiated events. Providers without a push
    /// channel return `None`.
    fn events(&self) -> Option<broadcast::Receiver<ProviderEvent>> {
        None
    }
}
