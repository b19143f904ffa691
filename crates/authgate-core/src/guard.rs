//! View guards derived from `AuthState`.
//!
//! A guard holds nothing but a receiver on the manager's state channel.
//! Until the first ready state arrives (startup restoration finished) it
//! refuses to decide, so a restored session never flashes the sign-in view.

use tokio::sync::watch;

use crate::state::AuthState;

/// Default redirect for unauthenticated visitors.
pub const DEFAULT_SIGN_IN_PATH: &str = "/login";

/// Default redirect for signed-in users visiting guest-only views.
pub const DEFAULT_HOME_PATH: &str = "/dashboard";

/// Who may see a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewAccess {
    RequireAuth,
    /// Sign-in and registration views.
    GuestOnly,
    Public,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Allowed,
    Redirect(String),
    /// Startup restoration has not finished yet.
    Pending,
}

#[derive(Debug, Clone)]
pub struct Guard {
    state: watch::Receiver<AuthState>,
    sign_in_path: String,
    home_path: String,
}

impl Guard {
    pub fn new(state: watch::Receiver<AuthState>) -> Self {
        Self {
            state,
            sign_in_path: DEFAULT_SIGN_IN_PATH.to_string(),
            home_path: DEFAULT_HOME_PATH.to_string(),
        }
    }

    pub fn with_paths(mut self, sign_in_path: impl Into<String>, home_path: impl Into<String>) -> Self {
        self.sign_in_path = sign_in_path.into();
        self.home_path = home_path.into();
        self
    }

    /// Decide from the latest state without waiting.
    pub fn check(&self, access: ViewAccess) -> GuardDecision {
        let state = self.state.borrow();
        if !state.is_ready() {
            return GuardDecision::Pending;
        }
        self.decide(&state, access, None)
    }

    /// Wait for the first ready state, then decide.
    pub async fn can_render(&mut self, require_auth: bool) -> GuardDecision {
        let access = if require_auth {
            ViewAccess::RequireAuth
        } else {
            ViewAccess::Public
        };
        self.resolve(access, None).await
    }

    /// Like `can_render` for a concrete path; sign-in redirects carry
    /// `?next=<path>` so the user lands back where they started.
    pub async fn can_render_path(&mut self, access: ViewAccess, path: &str) -> GuardDecision {
        self.resolve(access, Some(path)).await
    }

    async fn resolve(&mut self, access: ViewAccess, next: Option<&str>) -> GuardDecision {
        let state = match self.state.wait_for(AuthState::is_ready).await {
            Ok(state) => state.clone(),
            // Manager dropped: nobody can be signed in
            Err(_) => AuthState::signed_out(None),
        };
        self.decide(&state, access, next)
    }

    fn decide(&self, state: &AuthState, access: ViewAccess, next: Option<&str>) -> GuardDecision {
        match access {
            ViewAccess::Public => GuardDecision::Allowed,
            ViewAccess::RequireAuth if state.is_authenticated() => GuardDecision::Allowed,
            ViewAccess::RequireAuth => GuardDecision::Redirect(self.sign_in_target(next)),
            ViewAccess::GuestOnly if state.is_authenticated() => {
                GuardDecision::Redirect(self.home_path.clone())
            }
            ViewAccess::GuestOnly => GuardDecision::Allowed,
        }
    }

    fn sign_in_target(&self, next: Option<&str>) -> String {
        match next {
            Some(path) if !path.is_empty() && path != self.sign_in_path => {
                format!("{}?next={}", self.sign_in_path, encode_next(path))
            }
            _ => self.sign_in_path.clone(),
        }
    }
}

/// Percent-encode each segment, leaving `/` readable.
fn encode_next(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
