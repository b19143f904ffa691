use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use super::KeyValueStore;
use crate::session::Session;

/// Name of the single key holding the persisted session record
pub const SESSION_KEY: &str = "session";

type Listener = Arc<dyn Fn(Option<&Session>) + Send + Sync>;

struct Inner {
    backend: Arc<dyn KeyValueStore>,
    key: String,
    /// `None` until the backend has been read once.
    current: Mutex<Option<Option<Session>>>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
}

/// Holder of the current session.
///
/// Clone is cheap and every clone shares the same state. The session manager
/// is the only writer; the request gateway and guards only read.
#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<Inner>,
}

impl TokenStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self::with_key(backend, SESSION_KEY)
    }

    pub fn with_key(backend: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                key: key.into(),
                current: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
            }),
        }
    }

    /// The current session, or `None` if absent, unreadable or expired.
    ///
    /// An expired session that cannot be refreshed is removed. One that still
    /// carries a refresh token is kept for [`TokenStore::peek`].
    pub fn get(&self) -> Option<Session> {
        match self.peek() {
            Some(s) if s.is_expired() => {
                debug!(subject = %s.identity_subject, "Stored session expired");
                if !s.can_refresh() {
                    self.clear();
                }
                None
            }
            other => other,
        }
    }

    /// The stored session regardless of expiry. Used to drive a refresh;
    /// never attach the result to a request without checking expiry.
    pub fn peek(&self) -> Option<Session> {
        let mut current = match self.inner.current.lock() {
            Ok(guard) => guard,
            Err(_) => return None,
        };
        if current.is_none() {
            *current = Some(self.load_from_backend());
        }
        current.clone().flatten()
    }

    /// Replace the current session and persist it.
    pub fn set(&self, session: Session) {
        match serde_json::to_string(&session) {
            Ok(json) => {
                if let Err(e) = self.inner.backend.write(&self.inner.key, &json) {
                    warn!(error = %e, "Failed to persist session");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize session"),
        }
        self.replace(Some(session));
    }

    /// Remove the current session from memory and the backend.
    pub fn clear(&self) {
        if let Err(e) = self.inner.backend.remove(&self.inner.key) {
            warn!(error = %e, "Failed to remove persisted session");
        }
        self.replace(None);
    }

    /// Drop the in-memory copy so the next `get` reads the backend again.
    pub fn reload(&self) -> Option<Session> {
        if let Ok(mut current) = self.inner.current.lock() {
            *current = None;
        }
        self.get()
    }

    /// Register a listener called with the new value after each change.
    ///
    /// The listener stays registered until the returned `Subscription` is
    /// dropped or unsubscribed.
    pub fn on_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Option<&Session>) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.push((id, Arc::new(listener)));
        }
        Subscription {
            store: Arc::downgrade(&self.inner),
            id,
        }
    }

    fn load_from_backend(&self) -> Option<Session> {
        let raw = match self.inner.backend.read(&self.inner.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Session storage unavailable, treating as signed out");
                return None;
            }
        };
        match serde_json::from_str::<Session>(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(error = %e, "Discarding malformed session record");
                if let Err(e) = self.inner.backend.remove(&self.inner.key) {
                    debug!(error = %e, "Failed to remove malformed session record");
                }
                None
            }
        }
    }

    fn replace(&self, session: Option<Session>) {
        let changed = match self.inner.current.lock() {
            Ok(mut current) => {
                let previous = current.replace(session.clone()).flatten();
                previous != session
            }
            Err(_) => false,
        };
        if !changed {
            return;
        }

        // Snapshot so listeners can subscribe/unsubscribe from inside a callback
        let listeners: Vec<Listener> = match self.inner.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(session.as_ref());
        }
    }
}

/// Handle returned by [`TokenStore::on_change`].
pub struct Subscription {
    store: Weak<Inner>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work
    }

    /// Keep the listener registered for the lifetime of the store.
    pub fn detach(self) {
        std::mem::forget(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.store.upgrade() {
            if let Ok(mut listeners) = inner.listeners.lock() {
                listeners.retain(|(id, _)| *id != self.id);
            }
        }
    }
}
