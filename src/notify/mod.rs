//! Notification channel
//!
//! The engine and the lifecycle controller publish outcome notifications
//! here; whoever renders them subscribes to the broadcast channel.

use dashmap::DashMap;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::debug;

/// Display lifetime of an outcome notification
pub const OUTCOME_REMOVE_AFTER_MS: u64 = 10_000;

/// Display lifetime of a cycle restart notification
pub const RESTART_REMOVE_AFTER_MS: u64 = 31_536_000;

const CHANNEL_CAPACITY: usize = 256;

/// Visual class of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Success,
    Rejected,
    Reimbursement,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    /// `"{round}-{order}"` of the cycle it describes
    pub key: String,
    pub title: String,
    pub status: NotificationStatus,
    /// Structured payload for the renderer
    pub data: serde_json::Value,
    pub remove_after_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    Emitted(Notification),
    Removed { key: String },
}

/// A showing notification and the instant it lapses
struct Showing {
    notification: Notification,
    /// `None` when the lifetime overflows the clock
    expires_at: Option<Instant>,
}

impl Showing {
    fn lapsed(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// Broadcast publisher that also remembers which keys are showing
pub struct Notifier {
    sender: broadcast::Sender<NotificationEvent>,
    active: DashMap<String, Showing>,
}

impl Notifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            active: DashMap::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.sender.subscribe()
    }

    /// Publish a notification, replacing any active one with the same key
    pub fn emit(&self, notification: Notification) {
        debug!("Notification {}: {}", notification.key, notification.title);
        self.prune();
        let expires_at =
            Instant::now().checked_add(Duration::from_millis(notification.remove_after_ms));
        self.active.insert(
            notification.key.clone(),
            Showing {
                notification: notification.clone(),
                expires_at,
            },
        );
        // No subscribers is fine
        let _ = self.sender.send(NotificationEvent::Emitted(notification));
    }

    /// Withdraw the notification under `key`
    pub fn remove(&self, key: &str) {
        self.active.remove(key);
        let _ = self.sender.send(NotificationEvent::Removed {
            key: key.to_string(),
        });
    }

    /// Notifications currently showing
    pub fn active(&self) -> Vec<Notification> {
        self.prune();
        self.active
            .iter()
            .map(|entry| entry.value().notification.clone())
            .collect()
    }

    /// Drop notifications whose display lifetime has run out.
    ///
    /// Each dropped key is announced as `Removed`. Returns how many lapsed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let lapsed: Vec<String> = self
            .active
            .iter()
            .filter(|entry| entry.value().lapsed(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in lapsed {
            // Re-check: the key may have been re-emitted meanwhile
            if self
                .active
                .remove_if(&key, |_, showing| showing.lapsed(now))
                .is_some()
            {
                removed += 1;
                let _ = self.sender.send(NotificationEvent::Removed { key });
            }
        }
        removed
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
