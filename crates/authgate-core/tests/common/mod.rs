//! In-process fakes shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Notify};

use authgate_core::gateway::{ApiRequest, ApiResponse, HttpTransport};
use authgate_core::notify::{ChannelNotifier, Notification, NotificationLevel};
use authgate_core::store::{KeyValueStore, MemoryStore};
use authgate_core::{
    ApiError, AuthError, AuthErrorKind, Credentials, IdentityProvider, Profile, ProfileSource,
    ProviderEvent, RequestGateway, Session, SessionManager, SessionManagerConfig, SignInOutcome,
    TokenStore,
};

pub const SUBJECT: &str = "subject-1";

pub fn session(token: &str, minutes: i64) -> Session {
    Session::new(
        token,
        Some("refresh-token".to_string()),
        Utc::now() + chrono::Duration::minutes(minutes),
        SUBJECT,
    )
}

/// Holds an operation until the test releases it.
#[derive(Default)]
pub struct Gate {
    pub started: Notify,
    pub release: Notify,
    pub enabled: AtomicBool,
}

impl Gate {
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    async fn pass(&self) {
        self.started.notify_one();
        if self.enabled.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
    }
}

// ============================================================================
// Identity provider
// ============================================================================

pub struct FakeProvider {
    pub sign_in_result: Mutex<Result<SignInOutcome, AuthError>>,
    pub refresh_result: Mutex<Result<Session, AuthError>>,
    pub sign_out_result: Mutex<Result<(), AuthError>>,
    pub verify_result: Mutex<Result<(), AuthError>>,
    pub current: Mutex<Option<Session>>,
    pub sign_in_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub sign_out_calls: AtomicUsize,
    pub verify_calls: AtomicUsize,
    pub sign_in_gate: Gate,
    pub refresh_gate: Gate,
    pub sign_out_gate: Gate,
    pub events: Option<broadcast::Sender<ProviderEvent>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            sign_in_result: Mutex::new(Ok(SignInOutcome::SignedIn(session("signed-in", 60)))),
            refresh_result: Mutex::new(Ok(session("refreshed", 60))),
            sign_out_result: Mutex::new(Ok(())),
            verify_result: Mutex::new(Ok(())),
            current: Mutex::new(None),
            sign_in_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            sign_out_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
            sign_in_gate: Gate::default(),
            refresh_gate: Gate::default(),
            sign_out_gate: Gate::default(),
            events: None,
        }
    }

    pub fn with_events(mut self) -> Self {
        let (tx, _) = broadcast::channel(16);
        self.events = Some(tx);
        self
    }

    pub fn set_refresh(&self, result: Result<Session, AuthError>) {
        *self.refresh_result.lock().unwrap() = result;
    }

    pub fn set_sign_in(&self, result: Result<SignInOutcome, AuthError>) {
        *self.sign_in_result.lock().unwrap() = result;
    }

    pub fn set_sign_out(&self, result: Result<(), AuthError>) {
        *self.sign_out_result.lock().unwrap() = result;
    }

    pub fn set_verify(&self, result: Result<(), AuthError>) {
        *self.verify_result.lock().unwrap() = result;
    }

    pub fn emit(&self, event: ProviderEvent) {
        if let Some(tx) = &self.events {
            tx.send(event).expect("event receiver");
        }
    }

    pub fn refreshes(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    async fn sign_in(&self, _credentials: &Credentials) -> Result<SignInOutcome, AuthError> {
        self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
        self.sign_in_gate.pass().await;
        self.sign_in_result.lock().unwrap().clone()
    }

    async fn refresh(&self, _session: &Session) -> Result<Session, AuthError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.refresh_gate.pass().await;
        self.refresh_result.lock().unwrap().clone()
    }

    async fn sign_out(&self, _session: &Session) -> Result<(), AuthError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        self.sign_out_gate.pass().await;
        self.sign_out_result.lock().unwrap().clone()
    }

    async fn verify(&self, _session: &Session) -> Result<(), AuthError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        self.verify_result.lock().unwrap().clone()
    }

    async fn current_session(&self) -> Result<Option<Session>, AuthError> {
        Ok(self.current.lock().unwrap().clone())
    }

    fn events(&self) -> Option<broadcast::Receiver<ProviderEvent>> {
        self.events.as_ref().map(|tx| tx.subscribe())
    }
}

// ============================================================================
// Profile source
// ============================================================================

#[derive(Default)]
pub struct FakeProfiles {
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl ProfileSource for FakeProfiles {
    async fn fetch_profile(&self, session: &Session) -> Result<Profile, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(AuthError::new(AuthErrorKind::ProviderUnavailable, "profile service down"));
        }
        Ok(Profile {
            id: 7,
            cognito_user_id: Some(session.identity_subject.clone()),
            email: Some("alice@example.com".to_string()),
            username: Some("alice".to_string()),
            created_at: None,
            updated_at: None,
        })
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Answers 200 for the currently valid token, 401 otherwise.
/// `/boom` always answers 500 and `/public` ignores the token.
pub struct FakeTransport {
    pub valid_token: Mutex<String>,
    pub bearers: Mutex<Vec<Option<String>>>,
    /// Installed into the store right before the first 401, to simulate a
    /// refresh finishing while the request was in flight.
    pub renew_on_401: Mutex<Option<(TokenStore, Session)>>,
}

impl FakeTransport {
    pub fn new(valid_token: &str) -> Self {
        Self {
            valid_token: Mutex::new(valid_token.to_string()),
            bearers: Mutex::new(Vec::new()),
            renew_on_401: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.bearers.lock().unwrap().len()
    }

    pub fn bearers(&self) -> Vec<Option<String>> {
        self.bearers.lock().unwrap().clone()
    }
}

fn response(status: u16, body: serde_json::Value) -> ApiResponse {
    ApiResponse {
        status,
        headers: Vec::new(),
        body: body.to_string(),
    }
}

#[async_trait]
impl HttpTransport for FakeTransport {
    async fn execute(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        self.bearers.lock().unwrap().push(bearer.map(str::to_string));
        // Let other tasks interleave like a real network call would
        tokio::task::yield_now().await;

        if request.path == "/boom" {
            return Ok(response(500, serde_json::json!({"error": "boom"})));
        }
        if request.path == "/public" {
            return Ok(response(200, serde_json::json!({"public": true})));
        }

        let valid = self.valid_token.lock().unwrap().clone();
        if bearer == Some(valid.as_str()) {
            return Ok(response(200, serde_json::json!({"ok": true, "token": valid})));
        }

        if let Some((store, renewed)) = self.renew_on_401.lock().unwrap().take() {
            store.set(renewed);
        }
        Ok(response(401, serde_json::json!({"detail": "unauthorized"})))
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub manager: SessionManager,
    pub provider: Arc<FakeProvider>,
    pub profiles: Arc<FakeProfiles>,
    pub backend: Arc<MemoryStore>,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
}

impl Harness {
    pub fn new(provider: FakeProvider) -> Self {
        Self::with_backend(provider, Arc::new(MemoryStore::new()))
    }

    pub fn with_backend(provider: FakeProvider, backend: Arc<MemoryStore>) -> Self {
        let provider = Arc::new(provider);
        let profiles = Arc::new(FakeProfiles::default());
        let (notifier, notifications) = ChannelNotifier::new();
        let store_backend: Arc<dyn KeyValueStore> = backend.clone();
        let manager = SessionManager::new(
            provider.clone(),
            profiles.clone(),
            TokenStore::new(store_backend),
            Arc::new(notifier),
            SessionManagerConfig {
                auth_timeout: Duration::from_secs(5),
                ..SessionManagerConfig::default()
            },
        );
        Self {
            manager,
            provider,
            profiles,
            backend,
            notifications,
        }
    }

    /// Harness already signed in with `token`, past `init`.
    pub async fn signed_in(provider: FakeProvider, token: &str) -> Self {
        let mut harness = Self::new(provider);
        harness.provider.set_sign_in(Ok(SignInOutcome::SignedIn(session(token, 60))));
        harness.manager.init().await;
        harness
            .manager
            .sign_in(Credentials::new("alice@example.com", "hunter2"))
            .await
            .expect("sign in");
        harness.drain_notifications();
        harness
    }

    pub fn gateway(&self, transport: Arc<FakeTransport>) -> RequestGateway {
        RequestGateway::new(self.manager.clone(), transport)
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = self.notifications.try_recv() {
            out.push(n);
        }
        out
    }

    pub fn count(&mut self, level: NotificationLevel) -> usize {
        self.drain_notifications()
            .iter()
            .filter(|n| n.level == level)
            .count()
    }
}

/// Yield until `condition` holds, failing after a second.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached");
}
