//! Notification collaborator.
//!
//! Quota-threshold crossings, credential deactivation, failure streaks and
//! recoveries are reported through a [`Notifier`]. Delivery is
//! fire-and-forget: `notify` is synchronous and must not block, so the
//! orchestrator never waits on an alerting backend.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl NotificationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationLevel::Info => "info",
            NotificationLevel::Warning => "warning",
            NotificationLevel::Error => "error",
            NotificationLevel::Critical => "critical",
        }
    }
}

/// A single operational event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub level: NotificationLevel,
    /// Component that raised it (e.g. `"quota"`, `"orchestrator"`).
    pub source: String,
    /// Short subject line, usually naming the provider.
    pub subject: String,
    pub message: String,
}

impl Notification {
    pub fn new(
        level: NotificationLevel,
        source: impl Into<String>,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            level,
            source: source.into(),
            subject: subject.into(),
            message: message.into(),
        }
    }
}

/// Receiver of operational notifications.
pub trait Notifier: Send + Sync {
    /// Deliver a notification. Must return promptly.
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the `tracing` log. The default notifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, n: Notification) {
        match n.level {
            NotificationLevel::Info => {
                info!(source = %n.source, subject = %n.subject, "{}", n.message)
            }
            NotificationLevel::Warning => {
                warn!(source = %n.source, subject = %n.subject, "{}", n.message)
            }
            NotificationLevel::Error | NotificationLevel::Critical => error!(
                level = n.level.as_str(),
                source = %n.source,
                subject = %n.subject,
                "{}",
                n.message
            ),
        }
    }
}

/// Forwards notifications into a bounded tokio channel.
///
/// When the channel is full or closed the notification is dropped with a
/// warning rather than blocking the caller.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiving end of its channel.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        if let Err(e) = self.tx.try_send(notification) {
            warn!(error = %e, "dropping notification");
        }
    }
}
