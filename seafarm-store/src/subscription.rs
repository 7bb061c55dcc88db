use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::change::ChangeEvent;

/// Lifecycle callbacks a store reports for one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Subscribed,
    TimedOut,
    ChannelError(String),
    Closed,
}

/// Item delivered on a table subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreNotice {
    Change(ChangeEvent),
    Status(SubscriptionStatus),
}

/// Peer key to last tracked payload.
pub type PresenceState = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Sync(PresenceState),
    Join { key: String, payload: Value },
    Leave { key: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub event: String,
    pub payload: Value,
}

impl BroadcastMessage {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

/// Releases the remote resource behind a subscription at most once.
pub struct Release {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Release {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn noop() -> Self {
        Self { release: None }
    }

    /// Runs the release callback; returns false when already released.
    pub fn release(&mut self) -> bool {
        match self.release.take() {
            Some(release) => {
                release();
                true
            }
            None => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Release {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Release")
            .field("released", &self.is_released())
            .finish()
    }
}

/// A live stream of items from the store plus the handle that releases it.
#[derive(Debug)]
pub struct Subscription<T> {
    topic: String,
    receiver: mpsc::UnboundedReceiver<T>,
    release: Release,
}

impl<T> Subscription<T> {
    pub fn new(topic: impl Into<String>, receiver: mpsc::UnboundedReceiver<T>, release: Release) -> Self {
        Self {
            topic: topic.into(),
            receiver,
            release,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn into_parts(self) -> (String, mpsc::UnboundedReceiver<T>, Release) {
        (self.topic, self.receiver, self.release)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn release_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let mut release = Release::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(release.release());
        assert!(!release.release());
        drop(release);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_unreleased_handle_releases() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let (_tx, rx) = mpsc::unbounded_channel::<StoreNotice>();
        let sub = Subscription::new(
            "realtime:sites",
            rx,
            Release::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(sub.topic(), "realtime:sites");
        drop(sub);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
