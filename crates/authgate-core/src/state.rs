//! Observable authentication state.
//!
//! `AuthState` values are only built through the constructors here, which
//! keep `is_authenticated == user.is_some()` and tie `is_loading` to the
//! in-flight phases.

use serde::{Deserialize, Serialize};

use crate::error::AuthErrorKind;
use crate::profile::AuthUser;

/// Session manager state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum AuthPhase {
    SignedOut,
    SigningIn,
    /// Sign-in stopped at a provider challenge. Still signed out.
    ChallengePending,
    SignedIn,
    Refreshing,
    SigningOut,
}

impl AuthPhase {
    /// Phases with an operation in flight.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            AuthPhase::SigningIn | AuthPhase::Refreshing | AuthPhase::SigningOut
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            AuthPhase::SignedOut => "signed out",
            AuthPhase::SigningIn => "signing in",
            AuthPhase::ChallengePending => "challenge pending",
            AuthPhase::SignedIn => "signed in",
            AuthPhase::Refreshing => "refreshing",
            AuthPhase::SigningOut => "signing out",
        }
    }
}

/// Serialize-only: deserializing could bypass the invariants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct AuthState {
    phase: AuthPhase,
    user: Option<AuthUser>,
    is_authenticated: bool,
    is_loading: bool,
    error: Option<AuthErrorKind>,
    /// False until the persisted session has been checked at startup.
    ready: bool,
}

impl AuthState {
    fn build(phase: AuthPhase, user: Option<AuthUser>, error: Option<AuthErrorKind>, ready: bool) -> Self {
        Self {
            phase,
            is_authenticated: user.is_some(),
            is_loading: phase.is_transitional(),
            user,
            error,
            ready,
        }
    }

    /// State before startup restoration has finished.
    pub fn initializing() -> Self {
        Self::build(AuthPhase::SignedOut, None, None, false)
    }

    pub fn signed_out(error: Option<AuthErrorKind>) -> Self {
        Self::build(AuthPhase::SignedOut, None, error, true)
    }

    pub fn signing_in() -> Self {
        Self::build(AuthPhase::SigningIn, None, None, true)
    }

    pub fn challenge_pending() -> Self {
        Self::build(
            AuthPhase::ChallengePending,
            None,
            Some(AuthErrorKind::ChallengeRequired),
            true,
        )
    }

    pub fn signed_in(user: AuthUser) -> Self {
        Self::build(AuthPhase::SignedIn, Some(user), None, true)
    }

    /// Signed in, carrying a non-fatal error (e.g. a transient refresh failure).
    pub fn signed_in_with_error(user: AuthUser, error: AuthErrorKind) -> Self {
        Self::build(AuthPhase::SignedIn, Some(user), Some(error), true)
    }

    pub fn refreshing(user: AuthUser) -> Self {
        Self::build(AuthPhase::Refreshing, Some(user), None, true)
    }

    /// Local state is cleared before the provider call, so no user here.
    pub fn signing_out() -> Self {
        Self::build(AuthPhase::SigningOut, None, None, true)
    }

    pub fn phase(&self) -> AuthPhase {
        self.phase
    }

    pub fn user(&self) -> Option<&AuthUser> {
        self.user.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.is_authenticated
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn error(&self) -> Option<AuthErrorKind> {
        self.error
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Invariant check used by tests and debug assertions.
    pub fn is_consistent(&self) -> bool {
        self.is_authenticated == self.user.is_some()
            && self.is_loading == self.phase.is_transitional()
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::initializing()
    }
}
