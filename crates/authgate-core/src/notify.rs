//! User-facing outcome notifications.
//!
//! Notifiers are sinks only. Nothing in the crate reads a notification back
//! or branches on whether delivery worked.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Success,
    Error,
    Warning,
    Info,
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NotificationLevel::Success => "success",
            NotificationLevel::Error => "error",
            NotificationLevel::Warning => "warning",
            NotificationLevel::Info => "info",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Notification {
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
}

impl Notification {
    pub fn new(level: NotificationLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            message: message.into(),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);

    fn success(&self, title: &str, message: &str) {
        self.notify(Notification::new(NotificationLevel::Success, title, message));
    }

    fn error(&self, title: &str, message: &str) {
        self.notify(Notification::new(NotificationLevel::Error, title, message));
    }

    fn warning(&self, title: &str, message: &str) {
        self.notify(Notification::new(NotificationLevel::Warning, title, message));
    }

    fn info(&self, title: &str, message: &str) {
        self.notify(Notification::new(NotificationLevel::Info, title, message));
    }
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, n: Notification) {
        match n.level {
            NotificationLevel::Error => error!(title = %n.title, "{}", n.message),
            NotificationLevel::Warning => warn!(title = %n.title, "{}", n.message),
            NotificationLevel::Success | NotificationLevel::Info => {
                info!(level = %n.level, title = %n.title, "{}", n.message)
            }
        }
    }
}

/// Forwards notifications to a UI consumer over a channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        // Fire-and-forget: a closed UI is not an auth failure
        let _ = self.tx.send(notification);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _notification: Notification) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_notifier_delivers_in_order() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier.success("Signed in", "Welcome back");
        notifier.warning("Signed out", "Provider unreachable");

        let first = rx.try_recv().expect("first");
        assert_eq!(first.level, NotificationLevel::Success);
        assert_eq!(first.title, "Signed in");
        let second = rx.try_recv().expect("second");
        assert_eq!(second.level, NotificationLevel::Warning);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_notifier_ignores_closed_receiver() {
        let (notifier, rx) = ChannelNotifier::new();
        drop(rx);
        notifier.error("Sign in failed", "nobody is listening");
    }
}
