// ABOUTME: Presence and broadcast channels layered on the remote store
// ABOUTME: Keeps a live peer map and an in-order log of received broadcast messages

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use seafarm_store::{
    BroadcastMessage, PresenceEvent, PresenceState, Release, RemoteStore, StoreError, StoreResult,
};
use serde_json::Value;
use tokio::sync::{broadcast, watch};

/// Field added to every tracked presence payload.
pub const ONLINE_AT_FIELD: &str = "online_at";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stamps `payload` with the current time under [`ONLINE_AT_FIELD`].
pub fn stamp_presence(payload: Value) -> StoreResult<Value> {
    let mut fields = match payload {
        Value::Object(fields) => fields,
        Value::Null => serde_json::Map::new(),
        other => {
            return Err(StoreError::Malformed(format!(
                "presence payload must be an object, got {}",
                other
            )))
        }
    };
    fields.insert(
        ONLINE_AT_FIELD.to_string(),
        Value::String(chrono::Utc::now().to_rfc3339()),
    );
    Ok(Value::Object(fields))
}

struct PresenceShared {
    members: Mutex<PresenceState>,
    events: broadcast::Sender<PresenceEvent>,
    revision: watch::Sender<u64>,
}

impl PresenceShared {
    fn apply(&self, event: PresenceEvent) {
        {
            let mut members = lock(&self.members);
            match &event {
                PresenceEvent::Sync(state) => *members = state.clone(),
                PresenceEvent::Join { key, payload } => {
                    tracing::info!("Peer {} joined", key);
                    members.insert(key.clone(), payload.clone());
                }
                PresenceEvent::Leave { key } => {
                    tracing::info!("Peer {} left", key);
                    members.remove(key);
                }
            }
        }
        self.revision.send_modify(|revision| *revision += 1);
        let _ = self.events.send(event);
    }
}

/// Membership in one presence channel under a peer key.
pub struct PresenceChannel {
    store: Arc<dyn RemoteStore>,
    name: String,
    key: String,
    shared: Arc<PresenceShared>,
    release: Mutex<Release>,
    left: AtomicBool,
}

impl PresenceChannel {
    /// Joins `channel` as `key`; the live map fills in from the first sync.
    pub async fn join(
        store: Arc<dyn RemoteStore>,
        channel: &str,
        key: &str,
    ) -> StoreResult<Self> {
        let subscription = store.join_presence(channel, key).await?;
        let (_, mut receiver, release) = subscription.into_parts();

        let (events, _) = broadcast::channel(64);
        let (revision, _) = watch::channel(0);
        let shared = Arc::new(PresenceShared {
            members: Mutex::new(PresenceState::new()),
            events,
            revision,
        });

        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                task_shared.apply(event);
            }
        });

        tracing::info!("Joined presence channel {} as {}", channel, key);
        Ok(Self {
            store,
            name: channel.to_string(),
            key: key.to_string(),
            shared,
            release: Mutex::new(release),
            left: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publishes this peer's payload with an `online_at` timestamp.
    pub async fn track(&self, payload: Value) -> StoreResult<()> {
        if self.left.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let payload = stamp_presence(payload)?;
        self.store
            .track_presence(&self.name, &self.key, payload)
            .await
    }

    /// Current peer key -> payload map.
    pub fn peers(&self) -> PresenceState {
        lock(&self.shared.members).clone()
    }

    /// Sync, join and leave events as they arrive.
    pub fn events(&self) -> broadcast::Receiver<PresenceEvent> {
        self.shared.events.subscribe()
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    /// Leaves the channel; other peers see this peer leave. Idempotent.
    pub fn leave(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.release).release();
        tracing::info!("Left presence channel {}", self.name);
    }
}

impl Drop for PresenceChannel {
    fn drop(&mut self) {
        self.leave();
    }
}

type BroadcastHandler = Arc<dyn Fn(&BroadcastMessage) + Send + Sync>;

struct BroadcastShared {
    messages: Mutex<Vec<BroadcastMessage>>,
    handlers: Mutex<Vec<BroadcastHandler>>,
    revision: watch::Sender<u64>,
}

/// Fire-and-forget pub/sub on a named channel.
///
/// Received messages are kept in arrival order until cleared.
pub struct BroadcastChannel {
    store: Arc<dyn RemoteStore>,
    name: String,
    shared: Arc<BroadcastShared>,
    release: Mutex<Release>,
    left: AtomicBool,
}

impl BroadcastChannel {
    pub async fn join(store: Arc<dyn RemoteStore>, channel: &str) -> StoreResult<Self> {
        let subscription = store.subscribe_broadcast(channel).await?;
        let (_, mut receiver, release) = subscription.into_parts();

        let (revision, _) = watch::channel(0);
        let shared = Arc::new(BroadcastShared {
            messages: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
            revision,
        });

        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                let handlers = lock(&task_shared.handlers).clone();
                for handler in handlers {
                    handler(&message);
                }
                lock(&task_shared.messages).push(message);
                task_shared
                    .revision
                    .send_modify(|revision| *revision += 1);
            }
        });

        Ok(Self {
            store,
            name: channel.to_string(),
            shared,
            release: Mutex::new(release),
            left: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends `payload` as `event` to everyone currently listening.
    pub async fn broadcast(&self, event: &str, payload: Value) -> StoreResult<()> {
        if self.left.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        self.store
            .send_broadcast(&self.name, BroadcastMessage::new(event, payload))
            .await
    }

    /// Runs `handler` for every message received from now on.
    pub fn on_broadcast(&self, handler: impl Fn(&BroadcastMessage) + Send + Sync + 'static) {
        lock(&self.shared.handlers).push(Arc::new(handler));
    }

    pub fn messages(&self) -> Vec<BroadcastMessage> {
        lock(&self.shared.messages).clone()
    }

    pub fn clear_messages(&self) {
        lock(&self.shared.messages).clear();
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    pub fn leave(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.release).release();
    }
}

impl Drop for BroadcastChannel {
    fn drop(&mut self) {
        self.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seafarm_store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn settle(mut changes: watch::Receiver<u64>, until: impl Fn() -> bool) {
        for _ in 0..20 {
            if until() {
                return;
            }
            let _ = tokio::time::timeout(Duration::from_millis(100), changes.changed()).await;
        }
    }

    #[test]
    fn stamping_adds_online_at() {
        let stamped = stamp_presence(json!({"user": "amina"})).unwrap();
        assert_eq!(stamped["user"], json!("amina"));
        let online_at = stamped[ONLINE_AT_FIELD].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(online_at).is_ok());

        assert!(stamp_presence(Value::Null).unwrap()[ONLINE_AT_FIELD].is_string());
        assert!(matches!(
            stamp_presence(json!(42)),
            Err(StoreError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn peers_follow_track_and_leave() {
        let store: Arc<dyn RemoteStore> = Arc::new(MemoryStore::new());
        let observer = PresenceChannel::join(Arc::clone(&store), "site-s1", "observer")
            .await
            .unwrap();
        let peer = PresenceChannel::join(Arc::clone(&store), "site-s1", "amina")
            .await
            .unwrap();

        peer.track(json!({"role": "technician"})).await.unwrap();
        settle(observer.changes(), || observer.peers().contains_key("amina")).await;
        let peers = observer.peers();
        assert_eq!(peers["amina"]["role"], json!("technician"));
        assert!(peers["amina"][ONLINE_AT_FIELD].is_string());

        peer.leave();
        peer.leave();
        settle(observer.changes(), || observer.peers().is_empty()).await;
        assert!(observer.peers().is_empty());
        assert!(matches!(
            peer.track(json!({})).await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn broadcast_logs_and_dispatches_messages() {
        let store: Arc<dyn RemoteStore> = Arc::new(MemoryStore::new());
        let listener = BroadcastChannel::join(Arc::clone(&store), "alerts").await.unwrap();
        let sender = BroadcastChannel::join(Arc::clone(&store), "alerts").await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        listener.on_broadcast(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sender.broadcast("storm", json!({"level": 2})).await.unwrap();
        sender.broadcast("clear", json!({})).await.unwrap();
        settle(listener.changes(), || listener.messages().len() == 2).await;

        let events: Vec<_> = listener.messages().into_iter().map(|m| m.event).collect();
        assert_eq!(events, vec!["storm", "clear"]);
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        listener.clear_messages();
        assert!(listener.messages().is_empty());
    }
}
