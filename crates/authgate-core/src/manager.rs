//! Session manager: the single authority over authentication state.
//!
//! Every transition (sign-in, sign-out, refresh, provider push events) goes
//! through the functions here and is published on a `watch` channel, so all
//! observers see states in emission order and never an older one after a
//! newer one.
//!
//! Concurrency rules:
//! - At most one refresh is in flight. Late callers await the same shared
//!   future.
//! - Sign-out always wins. It bumps a generation counter; an in-flight
//!   refresh or sign-in from an older generation resolves immediately and its
//!   provider result is discarded.
//! - State mutations (token store writes plus state emission) happen under
//!   one lock, never held across an `.await`.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::{AuthError, AuthErrorKind};
use crate::notify::Notifier;
use crate::profile::{AuthUser, Profile, ProfileSource};
use crate::provider::http::DEFAULT_AUTH_TIMEOUT_SECS;
use crate::provider::{IdentityProvider, ProviderEvent, SignInOutcome};
use crate::session::{Challenge, Credentials, Session, DEFAULT_REFRESH_BUFFER_SECS};
use crate::state::{AuthPhase, AuthState};
use crate::store::TokenStore;

type RefreshFuture = Shared<BoxFuture<'static, Result<Session, AuthError>>>;

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Applied to every provider and profile call; expiry surfaces as `NetworkError`.
    pub auth_timeout: Duration,
    /// Sessions this close to expiry are refreshed before use.
    pub refresh_buffer: chrono::Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(DEFAULT_AUTH_TIMEOUT_SECS),
            refresh_buffer: chrono::Duration::seconds(DEFAULT_REFRESH_BUFFER_SECS),
        }
    }
}

/// What a successful `sign_in` call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInResult {
    SignedIn(AuthUser),
    ChallengeRequired(Challenge),
}

struct InFlightRefresh {
    id: u64,
    future: RefreshFuture,
}

struct Inner {
    provider: Arc<dyn IdentityProvider>,
    profiles: Arc<dyn ProfileSource>,
    store: TokenStore,
    notifier: Arc<dyn Notifier>,
    config: SessionManagerConfig,
    state: watch::Sender<AuthState>,
    generation: watch::Sender<u64>,
    /// Held while mutating the store and emitting state.
    transition: Mutex<()>,
    refresh: Mutex<Option<InFlightRefresh>>,
    next_refresh_id: AtomicU64,
    events_started: Mutex<bool>,
}

/// Cheap to clone; all clones share one state machine.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> Result<T, AuthError>
where
    F: Future<Output = Result<T, AuthError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(AuthError::network(format!(
            "{} timed out after {}s",
            what,
            limit.as_secs()
        ))),
    }
}

impl SessionManager {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        profiles: Arc<dyn ProfileSource>,
        store: TokenStore,
        notifier: Arc<dyn Notifier>,
        config: SessionManagerConfig,
    ) -> Self {
        let (state, _) = watch::channel(AuthState::initializing());
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                provider,
                profiles,
                store,
                notifier,
                config,
                state,
                generation,
                transition: Mutex::new(()),
                refresh: Mutex::new(None),
                next_refresh_id: AtomicU64::new(0),
                events_started: Mutex::new(false),
            }),
        }
    }

    // =========================================================================
    // Observation
    // =========================================================================

    pub fn state(&self) -> AuthState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.inner.state.subscribe()
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.inner.store
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        Arc::clone(&self.inner.notifier)
    }

    pub fn config(&self) -> &SessionManagerConfig {
        &self.inner.config
    }

    pub fn is_refreshing(&self) -> bool {
        lock(&self.inner.refresh).is_some()
    }

    /// True when the stored session is inside the refresh buffer and can be refreshed.
    pub fn needs_refresh(&self) -> bool {
        self.inner
            .store
            .peek()
            .map(|s| s.can_refresh() && s.needs_refresh(self.inner.config.refresh_buffer))
            .unwrap_or(false)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Restore the session on startup and emit the first ready state.
    ///
    /// Order: a valid persisted session the provider still accepts, then a
    /// persisted session that can still be refreshed, then whatever the
    /// provider reports as current.
    /// Also starts listening for provider push events. Calling it again after
    /// the first ready state is a no-op.
    pub async fn init(&self) -> AuthState {
        self.start_event_listener();

        if self.state().is_ready() {
            return self.state();
        }

        if let Some(session) = self.inner.store.get() {
            if self.verify_restored(&session).await {
                info!(subject = %session.identity_subject, "Restored persisted session");
                let user = self.load_user(&session).await;
                self.inner.adopt(session, user, None);
                return self.state();
            }
            if !session.can_refresh() {
                self.inner.expire_session();
                return self.state();
            }
        }

        if self.inner.store.peek().map(|s| s.can_refresh()).unwrap_or(false) {
            debug!("Persisted session expired, attempting silent refresh");
            if let Ok(session) = self.refresh_session().await {
                let user = self.load_user(&session).await;
                self.inner.adopt(session, user, None);
            }
            return self.state();
        }

        match with_timeout(
            self.inner.config.auth_timeout,
            "Session lookup",
            self.inner.provider.current_session(),
        )
        .await
        {
            Ok(Some(session)) if !session.is_expired() => {
                info!(subject = %session.identity_subject, "Adopted provider session");
                let user = self.load_user(&session).await;
                self.inner.adopt(session, user, None);
            }
            Ok(_) => {
                let _t = lock(&self.inner.transition);
                self.inner.emit(AuthState::signed_out(None));
            }
            Err(e) => {
                warn!(error = %e, "Provider session lookup failed, starting signed out");
                let _t = lock(&self.inner.transition);
                self.inner.emit(AuthState::signed_out(None));
            }
        }
        self.state()
    }

    /// False only when the provider positively rejects the token. An
    /// unreachable provider keeps the session.
    async fn verify_restored(&self, session: &Session) -> bool {
        match with_timeout(
            self.inner.config.auth_timeout,
            "Session check",
            self.inner.provider.verify(session),
        )
        .await
        {
            Ok(()) => true,
            Err(e) if e.kind == AuthErrorKind::SessionExpired => {
                info!(error = %e.message, "Persisted session rejected by provider");
                false
            }
            Err(e) => {
                warn!(kind = %e.kind, error = %e.message, "Could not verify persisted session, keeping it");
                true
            }
        }
    }

    fn start_event_listener(&self) {
        {
            let mut started = lock(&self.inner.events_started);
            if *started {
                return;
            }
            *started = true;
        }

        let Some(mut events) = self.inner.provider.events() else {
            return;
        };
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(inner) = weak.upgrade() else { break };
                        SessionManager { inner }.apply_event(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed provider events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Provider event stream closed");
        });
    }

    /// Feed a provider push event through the regular transition functions.
    pub async fn apply_event(&self, event: ProviderEvent) {
        debug!(?event, "Provider event");
        match event {
            ProviderEvent::SignedIn(session) | ProviderEvent::TokenRefreshed(session) => {
                let generation = {
                    let _t = lock(&self.inner.transition);
                    if self.inner.state.borrow().phase() == AuthPhase::SigningOut {
                        debug!("Ignoring pushed session while signing out");
                        return;
                    }
                    self.inner.current_generation()
                };
                let user = match self.state().user() {
                    Some(user) if user.subject == session.identity_subject => user.clone(),
                    _ => self.load_user(&session).await,
                };
                self.inner.adopt(session, user, Some(generation));
            }
            ProviderEvent::SignedOut => {
                if self.inner.clear_session(None) {
                    self.inner.notifier.info("Signed out", "You have been signed out.");
                }
            }
            ProviderEvent::SessionExpired => {
                self.inner.expire_session();
            }
        }
    }

    // =========================================================================
    // Sign-in / sign-out
    // =========================================================================

    pub async fn sign_in(&self, credentials: Credentials) -> Result<SignInResult, AuthError> {
        if !credentials.is_complete() {
            let err = AuthError::new(
                AuthErrorKind::InvalidCredentials,
                "Username and password required",
            );
            {
                let _t = lock(&self.inner.transition);
                self.inner.emit(AuthState::signed_out(Some(err.kind)));
            }
            self.inner.notifier.error("Sign in failed", &err.message);
            return Err(err);
        }

        if self.inner.store.peek().is_some() {
            debug!("Signing out the existing session before a new sign-in");
            self.sign_out().await;
        }

        let generation = {
            let _t = lock(&self.inner.transition);
            let generation = self.inner.bump_generation();
            self.inner.emit(AuthState::signing_in());
            generation
        };
        info!(username = %credentials.username, "Signing in");

        let outcome = with_timeout(
            self.inner.config.auth_timeout,
            "Sign-in",
            self.inner.provider.sign_in(&credentials),
        )
        .await;

        match outcome {
            Ok(SignInOutcome::SignedIn(session)) => {
                let user = self.load_user(&session).await;
                if !self.inner.adopt(session, user.clone(), Some(generation)) {
                    return Err(AuthError::new(
                        AuthErrorKind::SessionExpired,
                        "Sign-in was cancelled by sign-out",
                    ));
                }
                info!(subject = %user.subject, "Sign-in successful");
                self.inner
                    .notifier
                    .success("Signed in", &format!("Welcome, {}", user.display_name()));
                Ok(SignInResult::SignedIn(user))
            }
            Ok(SignInOutcome::ChallengeRequired(challenge)) => {
                {
                    let _t = lock(&self.inner.transition);
                    if self.inner.current_generation() == generation {
                        self.inner.emit(AuthState::challenge_pending());
                    }
                }
                info!(challenge = %challenge.name, "Sign-in needs a challenge response");
                self.inner.notifier.info(
                    "Verification required",
                    AuthErrorKind::ChallengeRequired.user_message(),
                );
                Ok(SignInResult::ChallengeRequired(challenge))
            }
            Err(err) => {
                {
                    let _t = lock(&self.inner.transition);
                    if self.inner.current_generation() == generation {
                        self.inner.emit(AuthState::signed_out(Some(err.kind)));
                    }
                }
                warn!(kind = %err.kind, error = %err.message, "Sign-in failed");
                self.inner
                    .notifier
                    .error("Sign in failed", err.kind.user_message());
                Err(err)
            }
        }
    }

    /// Sign out. Local state always clears, whatever the provider says.
    ///
    /// With no active session this is a no-op: no state change and no
    /// provider call.
    pub async fn sign_out(&self) {
        let session = {
            let _t = lock(&self.inner.transition);
            let session = self.inner.store.peek();
            let phase = self.inner.state.borrow().phase();
            if session.is_none() && phase == AuthPhase::SignedOut {
                debug!("Sign-out with no active session");
                return;
            }

            self.inner.bump_generation();
            self.inner.store.clear();
            self.inner.emit(if session.is_some() {
                AuthState::signing_out()
            } else {
                AuthState::signed_out(None)
            });
            session
        };

        let Some(session) = session else {
            return;
        };

        info!(subject = %session.identity_subject, "Signing out");
        let result = with_timeout(
            self.inner.config.auth_timeout,
            "Sign-out",
            self.inner.provider.sign_out(&session),
        )
        .await;

        {
            let _t = lock(&self.inner.transition);
            // A sign-in may have started meanwhile; only settle our own transition
            if self.inner.state.borrow().phase() == AuthPhase::SigningOut {
                self.inner.emit(AuthState::signed_out(None));
            }
        }

        match result {
            Ok(()) => self.inner.notifier.info("Signed out", "You have been signed out."),
            Err(e) => {
                warn!(kind = %e.kind, error = %e.message, "Provider sign-out failed, cleared locally");
                self.inner.notifier.warning(
                    "Signed out on this device",
                    "The identity provider could not be reached, but your local session was cleared.",
                );
            }
        }
    }

    // =========================================================================
    // Refresh
    // =========================================================================

    /// Refresh the session, or sign out if it cannot be refreshed.
    ///
    /// Single-flight: while a refresh is running every caller awaits the same
    /// result. Outcomes:
    /// - `Ok(session)`: the new session is stored
    /// - `Err(NetworkError | ProviderUnavailable | TooManyRequests)`: the
    ///   stored session is untouched and a later call may try again
    /// - `Err(SessionExpired)`: the session is gone and state is signed out
    pub async fn refresh_session(&self) -> Result<Session, AuthError> {
        let future = {
            let _t = lock(&self.inner.transition);
            let joined = lock(&self.inner.refresh).as_ref().map(|in_flight| {
                debug!(refresh_id = in_flight.id, "Joining in-flight refresh");
                in_flight.future.clone()
            });
            match joined {
                Some(future) => future,
                None => self.start_refresh()?,
            }
        };
        future.await
    }

    /// Begin a refresh of the stored session. Caller holds `transition`.
    fn start_refresh(&self) -> Result<RefreshFuture, AuthError> {
        let session = match self.inner.store.peek() {
            Some(session) if session.can_refresh() => session,
            other => {
                debug!(has_session = other.is_some(), "No refreshable session");
                if self.inner.expire_session_locked(other.is_some()) {
                    self.inner.notify_expired();
                }
                return Err(AuthError::session_expired());
            }
        };

        let id = self.inner.next_refresh_id.fetch_add(1, Ordering::Relaxed);
        let generation = self.inner.current_generation();
        let user = self
            .inner
            .state
            .borrow()
            .user()
            .cloned()
            .unwrap_or_else(|| AuthUser::from_session(&session, None));
        self.inner.emit(AuthState::refreshing(user));
        debug!(refresh_id = id, "Starting refresh");

        let future = Inner::run_refresh(Arc::clone(&self.inner), id, generation, session)
            .boxed()
            .shared();
        *lock(&self.inner.refresh) = Some(InFlightRefresh {
            id,
            future: future.clone(),
        });

        // Drive to completion even if every caller goes away
        tokio::spawn(future.clone());
        Ok(future)
    }

    /// Refresh if the session is inside the refresh buffer; otherwise return
    /// the current valid session.
    pub async fn ensure_fresh(&self) -> Result<Option<Session>, AuthError> {
        if self.needs_refresh() {
            return self.refresh_session().await.map(Some);
        }
        Ok(self.inner.store.get())
    }

    // =========================================================================
    // Profile
    // =========================================================================

    /// Retry the backend profile lookup for the current session.
    pub async fn reload_profile(&self) -> Result<AuthUser, AuthError> {
        let session = self.inner.store.get().ok_or_else(AuthError::session_expired)?;
        let profile = with_timeout(
            self.inner.config.auth_timeout,
            "Profile lookup",
            self.inner.profiles.fetch_profile(&session),
        )
        .await?;
        let user = AuthUser::from_session(&session, Some(&profile));

        let _t = lock(&self.inner.transition);
        let still_current = self
            .inner
            .store
            .peek()
            .map(|s| s.identity_subject == session.identity_subject)
            .unwrap_or(false);
        if !still_current {
            return Err(AuthError::session_expired());
        }
        let phase = self.inner.state.borrow().phase();
        let state = match phase {
            AuthPhase::Refreshing => AuthState::refreshing(user.clone()),
            _ => AuthState::signed_in(user.clone()),
        };
        self.inner.emit(state);
        Ok(user)
    }

    /// Session-derived user, with the backend profile when it can be fetched.
    async fn load_user(&self, session: &Session) -> AuthUser {
        let profile: Option<Profile> = match with_timeout(
            self.inner.config.auth_timeout,
            "Profile lookup",
            self.inner.profiles.fetch_profile(session),
        )
        .await
        {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!(kind = %e.kind, error = %e.message, "Profile lookup failed");
                self.inner.notifier.warning(
                    "Profile unavailable",
                    "Signed in, but your profile could not be loaded. It will be retried.",
                );
                None
            }
        };
        AuthUser::from_session(session, profile.as_ref())
    }
}

impl Inner {
    fn emit(&self, state: AuthState) {
        debug_assert!(state.is_consistent(), "inconsistent auth state: {:?}", state);
        debug!(
            phase = state.phase().label(),
            authenticated = state.is_authenticated(),
            error = ?state.error(),
            "Auth state"
        );
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn current_generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Invalidate in-flight sign-ins and refreshes. Caller holds `transition`.
    fn bump_generation(&self) -> u64 {
        self.generation.send_modify(|g| *g += 1);
        if let Some(in_flight) = lock(&self.refresh).take() {
            debug!(refresh_id = in_flight.id, "Cancelling in-flight refresh");
        }
        self.current_generation()
    }

    /// Store `session` and emit signed-in. Returns false (and changes nothing)
    /// if `expected_generation` is stale.
    fn adopt(&self, session: Session, user: AuthUser, expected_generation: Option<u64>) -> bool {
        let _t = lock(&self.transition);
        if let Some(expected) = expected_generation {
            if self.current_generation() != expected {
                debug!("Discarding session from a cancelled operation");
                return false;
            }
        }
        self.store.set(session);
        self.emit(AuthState::signed_in(user));
        true
    }

    /// Clear the session locally. Returns true if anything changed.
    fn clear_session(&self, error: Option<AuthErrorKind>) -> bool {
        let _t = lock(&self.transition);
        let had_session = self.store.peek().is_some();
        let phase = self.state.borrow().phase();
        if !had_session && phase == AuthPhase::SignedOut {
            return false;
        }
        self.bump_generation();
        self.store.clear();
        self.emit(AuthState::signed_out(error));
        true
    }

    fn expire_session(&self) {
        let expired = {
            let _t = lock(&self.transition);
            let had_session = self.store.peek().is_some();
            self.expire_session_locked(had_session)
        };
        if expired {
            self.notify_expired();
        }
    }

    /// Force signed-out with `SessionExpired`. Caller holds `transition`.
    fn expire_session_locked(&self, had_session: bool) -> bool {
        let was_signed_in = self.state.borrow().is_authenticated();
        if !had_session && !was_signed_in {
            return false;
        }
        self.bump_generation();
        self.store.clear();
        self.emit(AuthState::signed_out(Some(AuthErrorKind::SessionExpired)));
        true
    }

    fn notify_expired(&self) {
        info!("Session expired");
        self.notifier
            .warning("Session expired", AuthErrorKind::SessionExpired.user_message());
    }

    async fn run_refresh(
        inner: Arc<Inner>,
        id: u64,
        generation: u64,
        session: Session,
    ) -> Result<Session, AuthError> {
        let mut generation_rx = inner.generation.subscribe();
        let outcome = tokio::select! {
            biased;
            _ = async {
                let _ = generation_rx.wait_for(|g| *g != generation).await;
            } => None,
            result = with_timeout(
                inner.config.auth_timeout,
                "Token refresh",
                inner.provider.refresh(&session),
            ) => Some(result),
        };
        inner.finish_refresh(id, generation, outcome)
    }

    fn finish_refresh(
        &self,
        id: u64,
        generation: u64,
        outcome: Option<Result<Session, AuthError>>,
    ) -> Result<Session, AuthError> {
        let expired = {
            let _t = lock(&self.transition);
            {
                let mut slot = lock(&self.refresh);
                if slot.as_ref().map(|r| r.id) == Some(id) {
                    *slot = None;
                }
            }

            let outcome = match outcome {
                Some(outcome) if self.current_generation() == generation => outcome,
                _ => {
                    debug!(refresh_id = id, "Refresh superseded by sign-out, result discarded");
                    return Err(AuthError::session_expired());
                }
            };

            match outcome {
                Ok(session) => {
                    let user = match self.state.borrow().user() {
                        Some(user) if user.subject == session.identity_subject => user.clone(),
                        _ => AuthUser::from_session(&session, None),
                    };
                    self.store.set(session.clone());
                    self.emit(AuthState::signed_in(user));
                    debug!(refresh_id = id, "Refresh succeeded");
                    return Ok(session);
                }
                Err(e) if e.kind.is_transient() => {
                    warn!(refresh_id = id, kind = %e.kind, "Refresh failed transiently, keeping session");
                    let user = self
                        .state
                        .borrow()
                        .user()
                        .cloned()
                        .or_else(|| self.store.peek().map(|s| AuthUser::from_session(&s, None)));
                    match user {
                        Some(user) => self.emit(AuthState::signed_in_with_error(user, e.kind)),
                        None => self.emit(AuthState::signed_out(Some(e.kind))),
                    }
                    return Err(e);
                }
                Err(e) => {
                    info!(refresh_id = id, kind = %e.kind, "Refresh rejected, signing out");
                    self.expire_session_locked(true)
                }
            }
        };
        if expired {
            self.notify_expired();
        }
        Err(AuthError::session_expired())
    }
}
