//! Client-side authentication session management.
//!
//! The pieces, from the bottom up:
//! - [`store::TokenStore`] persists the current [`Session`]
//! - [`provider::IdentityProvider`] talks to the identity service
//! - [`SessionManager`] owns every state transition and publishes [`AuthState`]
//! - [`RequestGateway`] attaches bearer tokens and recovers from 401s
//! - [`guard::Guard`] decides whether a view may render
//! - [`notify::Notifier`] receives user-facing notifications

pub mod cache;
pub mod claims;
pub mod config;
pub mod error;
pub mod gateway;
pub mod guard;
pub mod manager;
pub mod notify;
pub mod profile;
pub mod provider;
pub mod session;
pub mod state;
pub mod store;

pub use config::Config;
pub use error::{ApiError, AuthError, AuthErrorKind};
pub use gateway::{ApiRequest, ApiResponse, HttpTransport, ReqwestTransport, RequestGateway};
pub use guard::{Guard, GuardDecision, ViewAccess};
pub use manager::{SessionManager, SessionManagerConfig, SignInResult};
pub use notify::{Notification, NotificationLevel, Notifier};
pub use profile::{AuthUser, HttpProfileSource, Profile, ProfileSource};
pub use provider::{HttpIdentityProvider, IdentityProvider, ProviderEvent, SignInOutcome};
pub use session::{Challenge, Credentials, Session};
pub use state::{AuthPhase, AuthState};
pub use store::TokenStore;
