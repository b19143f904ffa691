use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::state::{AuthPhase, AuthState};

/// Consider cache stale after 1 hour.
/// Balances freshness with reducing unnecessary API calls for slowly-changing data.
const CACHE_STALE_MINUTES: i64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> CachedData<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
        }
    }

    pub fn age_minutes(&self) -> i64 {
        let now = Utc::now();
        (now - self.cached_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }

    pub fn is_stale(&self) -> bool {
        self.age_minutes() > CACHE_STALE_MINUTES
    }
}

/// File cache under `<root>/<subject>/<name>.json`.
///
/// With no subject set (signed out) loads return `None` and saves are
/// skipped.
pub struct CacheManager {
    root: PathBuf,
    subject: Mutex<Option<String>>,
}

impl CacheManager {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create cache dir: {}", root.display()))?;
        Ok(Self {
            root,
            subject: Mutex::new(None),
        })
    }

    pub fn subject(&self) -> Option<String> {
        self.subject
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_subject(&self, subject: Option<String>) {
        *self.subject.lock().unwrap_or_else(PoisonError::into_inner) = subject;
    }

    fn cache_path(&self, name: &str) -> Option<PathBuf> {
        let subject = self.subject()?;
        Some(
            self.root
                .join(sanitize(&subject))
                .join(format!("{}.json", sanitize(name))),
        )
    }

    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<CachedData<T>>> {
        let Some(path) = self.cache_path(name) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read cache file: {}", name))?;

        let cached: CachedData<T> = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse cache file: {}", name))?;

        Ok(Some(cached))
    }

    pub fn save<T: Serialize>(&self, name: &str, data: &T) -> Result<()> {
        let Some(path) = self.cache_path(name) else {
            debug!(cache = name, "No signed-in user, not caching");
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let cached = CachedData::new(data);
        let contents = serde_json::to_string_pretty(&cached)?;
        std::fs::write(&path, contents)
            .with_context(|| format!("Failed to write cache file: {}", name))?;
        Ok(())
    }

    /// Age of a cached entry for display, logging read errors instead of failing.
    pub fn age(&self, name: &str) -> Option<String> {
        match self.load::<serde_json::Value>(name) {
            Ok(Some(cached)) => Some(cached.age_display()),
            Ok(None) => None,
            Err(e) => {
                debug!(cache = name, error = %e, "Failed to load cache for age display");
                None
            }
        }
    }

    /// Remove every user's cached files. Only the per-subject directories
    /// are touched; anything else under the root is left alone.
    pub fn clear(&self) -> Result<()> {
        if !self.root.exists() {
            return Ok(());
        }
        let entries = std::fs::read_dir(&self.root)
            .with_context(|| format!("Failed to read cache dir: {}", self.root.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)
                    .with_context(|| format!("Failed to clear cache dir: {}", path.display()))?;
            }
        }
        Ok(())
    }

    /// Keep the cache in step with the auth state: wipe it when the session
    /// ends or the subject changes, and scope it to the new subject.
    pub fn spawn_invalidation(self: Arc<Self>, mut state: watch::Receiver<AuthState>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let (phase, ready, subject) = {
                    let current = state.borrow_and_update();
                    (
                        current.phase(),
                        current.is_ready(),
                        current.user().map(|u| u.subject.clone()),
                    )
                };
                if ready {
                    self.apply(phase, subject);
                }
                if state.changed().await.is_err() {
                    break;
                }
            }
            debug!("Cache invalidation stopped");
        })
    }

    fn apply(&self, phase: AuthPhase, subject: Option<String>) {
        let current = self.subject();
        match subject {
            Some(subject) if current.as_deref() == Some(subject.as_str()) => {}
            Some(subject) => {
                if current.is_some() {
                    info!("Signed-in user changed, clearing cache");
                    self.clear_logged();
                }
                self.set_subject(Some(subject));
            }
            None if phase == AuthPhase::SignedOut => {
                if current.is_some() {
                    info!("Signed out, clearing cache");
                }
                self.clear_logged();
                self.set_subject(None);
            }
            None => {}
        }
    }

    fn clear_logged(&self) {
        if let Err(e) = self.clear() {
            warn!(error = %e, "Failed to clear cache");
        }
    }
}

/// Restrict a path component to safe characters.
fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
