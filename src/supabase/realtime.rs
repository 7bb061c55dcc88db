// ABOUTME: Realtime socket client - one websocket multiplexing change, presence and broadcast topics
// ABOUTME: Joins topics, keeps the heartbeat alive, and routes incoming frames to subscribers

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use seafarm_store::{
    BroadcastMessage, PresenceEvent, PresenceState, Release, StoreError, StoreNotice, StoreResult,
    SubscribeRequest, Subscription, SubscriptionStatus,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::protocol::{
    decode_broadcast, decode_change, decode_presence_diff, decode_presence_state, topic_for,
    JoinConfig, PhoenixMessage, Reply, EVENT_BROADCAST, EVENT_CLOSE, EVENT_ERROR,
    EVENT_POSTGRES_CHANGES, EVENT_PRESENCE_DIFF, EVENT_PRESENCE_STATE, EVENT_REPLY, EVENT_SYSTEM,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub socket_url: Url,
    pub access_token: String,
    pub schema: String,
    pub heartbeat_interval: Duration,
    pub join_timeout: Duration,
}

enum Route {
    Changes(mpsc::UnboundedSender<StoreNotice>),
    Presence {
        key: String,
        state: PresenceState,
        watchers: HashMap<u64, mpsc::UnboundedSender<PresenceEvent>>,
    },
    Broadcast(HashMap<u64, mpsc::UnboundedSender<BroadcastMessage>>),
}

impl Route {
    /// Drops one watcher; true if nobody is left listening on the topic.
    fn remove_watcher(&mut self, watcher: Option<u64>) -> bool {
        match (self, watcher) {
            (Route::Presence { watchers, .. }, Some(id)) => {
                watchers.remove(&id);
                watchers.is_empty()
            }
            (Route::Broadcast(listeners), Some(id)) => {
                listeners.remove(&id);
                listeners.is_empty()
            }
            _ => true,
        }
    }
}

struct Socket {
    outgoing: mpsc::UnboundedSender<Message>,
    topics: Mutex<HashMap<String, Route>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    alive: AtomicBool,
    refs: AtomicU64,
}

impl Socket {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn next_ref(&self) -> String {
        (self.refs.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn send(&self, frame: PhoenixMessage) -> StoreResult<()> {
        let text = frame.to_json()?;
        self.outgoing
            .send(Message::Text(text))
            .map_err(|_| StoreError::Closed)
    }

    fn request(&self, frame: PhoenixMessage) -> StoreResult<oneshot::Receiver<Reply>> {
        let reference = frame
            .reference
            .clone()
            .ok_or_else(|| StoreError::Malformed("request frame without a ref".into()))?;
        let (sender, receiver) = oneshot::channel();
        lock(&self.pending).insert(reference.clone(), sender);
        if let Err(err) = self.send(frame) {
            lock(&self.pending).remove(&reference);
            return Err(err);
        }
        Ok(receiver)
    }

    fn leave(&self, topic: &str) {
        let reference = self.next_ref();
        if self.send(PhoenixMessage::leave(topic, &reference)).is_ok() {
            tracing::debug!("Left realtime topic {}", topic);
        }
    }

    fn handle(&self, frame: PhoenixMessage) {
        match frame.event.as_str() {
            EVENT_REPLY => {
                let Some(reference) = frame.reference.as_ref() else {
                    return;
                };
                let Some(waiter) = lock(&self.pending).remove(reference) else {
                    return;
                };
                match serde_json::from_value::<Reply>(frame.payload) {
                    Ok(reply) => {
                        let _ = waiter.send(reply);
                    }
                    Err(e) => tracing::warn!("Unreadable reply on {}: {}", frame.topic, e),
                }
            }
            EVENT_POSTGRES_CHANGES => {
                let topics = lock(&self.topics);
                if let Some(Route::Changes(sender)) = topics.get(&frame.topic) {
                    match decode_change(&frame.payload) {
                        Ok(event) => {
                            let _ = sender.send(StoreNotice::Change(event));
                        }
                        Err(e) => {
                            tracing::warn!("Dropping undecodable change on {}: {}", frame.topic, e)
                        }
                    }
                }
            }
            EVENT_PRESENCE_STATE => {
                let mut topics = lock(&self.topics);
                if let Some(Route::Presence {
                    state, watchers, ..
                }) = topics.get_mut(&frame.topic)
                {
                    *state = decode_presence_state(&frame.payload);
                    let event = PresenceEvent::Sync(state.clone());
                    watchers.retain(|_, watcher| watcher.send(event.clone()).is_ok());
                }
            }
            EVENT_PRESENCE_DIFF => {
                let mut topics = lock(&self.topics);
                if let Some(Route::Presence {
                    state, watchers, ..
                }) = topics.get_mut(&frame.topic)
                {
                    for event in decode_presence_diff(&frame.payload) {
                        match &event {
                            PresenceEvent::Join { key, payload } => {
                                state.insert(key.clone(), payload.clone());
                            }
                            PresenceEvent::Leave { key } => {
                                state.remove(key);
                            }
                            PresenceEvent::Sync(_) => {}
                        }
                        watchers.retain(|_, watcher| watcher.send(event.clone()).is_ok());
                    }
                }
            }
            EVENT_BROADCAST => {
                let mut topics = lock(&self.topics);
                if let Some(Route::Broadcast(listeners)) = topics.get_mut(&frame.topic) {
                    match decode_broadcast(&frame.payload) {
                        Ok(message) => {
                            listeners.retain(|_, listener| listener.send(message.clone()).is_ok())
                        }
                        Err(e) => tracing::warn!("Dropping broadcast on {}: {}", frame.topic, e),
                    }
                }
            }
            EVENT_SYSTEM => {
                let status = frame.payload.get("status").and_then(Value::as_str);
                if status != Some("error") {
                    return;
                }
                let message = frame
                    .payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("realtime system error")
                    .to_string();
                tracing::warn!("Realtime reported an error on {}: {}", frame.topic, message);
                if let Some(Route::Changes(sender)) = lock(&self.topics).get(&frame.topic) {
                    let _ = sender.send(StoreNotice::Status(SubscriptionStatus::ChannelError(
                        message,
                    )));
                }
            }
            EVENT_ERROR | EVENT_CLOSE => {
                let route = lock(&self.topics).remove(&frame.topic);
                if let Some(Route::Changes(sender)) = route {
                    let status = if frame.event == EVENT_ERROR {
                        SubscriptionStatus::ChannelError("channel crashed on the server".into())
                    } else {
                        SubscriptionStatus::Closed
                    };
                    let _ = sender.send(StoreNotice::Status(status));
                }
            }
            other => tracing::trace!("Ignoring realtime event {} on {}", other, frame.topic),
        }
    }

    /// Marks the socket dead and closes every topic.
    fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let routes: Vec<Route> = lock(&self.topics).drain().map(|(_, route)| route).collect();
        for route in routes {
            if let Route::Changes(sender) = route {
                let _ = sender.send(StoreNotice::Status(SubscriptionStatus::Closed));
            }
        }
        lock(&self.pending).clear();
    }
}

/// Releases one subscriber; leaves the topic when it was the last one.
fn release_topic(socket: &Arc<Socket>, topic: String, watcher: Option<u64>) -> Release {
    let weak = Arc::downgrade(socket);
    Release::new(move || {
        let Some(socket) = weak.upgrade() else {
            return;
        };
        let leave = {
            let mut topics = lock(&socket.topics);
            let empty = topics
                .get_mut(&topic)
                .map(|route| route.remove_watcher(watcher));
            if empty == Some(true) {
                topics.remove(&topic);
            }
            empty == Some(true)
        };
        if leave {
            socket.leave(&topic);
        }
    })
}

/// Websocket connection to the project's realtime service.
///
/// Connects lazily on first use. A dropped connection closes every open
/// topic; the next subscription opens a fresh connection.
pub struct RealtimeClient {
    config: RealtimeConfig,
    socket: tokio::sync::Mutex<Option<Arc<Socket>>>,
    watchers: AtomicU64,
}

impl RealtimeClient {
    pub fn new(config: RealtimeConfig) -> Self {
        Self {
            config,
            socket: tokio::sync::Mutex::new(None),
            watchers: AtomicU64::new(0),
        }
    }

    fn next_watcher(&self) -> u64 {
        self.watchers.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn socket(&self) -> StoreResult<Arc<Socket>> {
        let mut slot = self.socket.lock().await;
        if let Some(socket) = slot.as_ref() {
            if socket.is_alive() {
                return Ok(Arc::clone(socket));
            }
        }
        let socket = self.connect().await?;
        *slot = Some(Arc::clone(&socket));
        Ok(socket)
    }

    async fn current_socket(&self) -> Option<Arc<Socket>> {
        self.socket
            .lock()
            .await
            .as_ref()
            .filter(|socket| socket.is_alive())
            .cloned()
    }

    async fn connect(&self) -> StoreResult<Arc<Socket>> {
        let host = self.config.socket_url.host_str().unwrap_or_default().to_string();
        tracing::info!("Connecting to realtime service at {}", host);

        let connecting = connect_async(self.config.socket_url.as_str());
        let (stream, _) = tokio::time::timeout(self.config.join_timeout, connecting)
            .await
            .map_err(|_| StoreError::Timeout(format!("connecting to realtime at {}", host)))?
            .map_err(|e| StoreError::Connectivity(e.to_string()))?;
        let (mut write, mut read) = stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let socket = Arc::new(Socket {
            outgoing,
            topics: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
            refs: AtomicU64::new(0),
        });

        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if write.send(message).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let heartbeat = Arc::downgrade(&socket);
        let period = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(socket) = heartbeat.upgrade() else {
                    break;
                };
                if !socket.is_alive() {
                    break;
                }
                let reference = socket.next_ref();
                if socket.send(PhoenixMessage::heartbeat(reference)).is_err() {
                    break;
                }
            }
        });

        let reader = Arc::clone(&socket);
        tokio::spawn(async move {
            while let Some(item) = read.next().await {
                match item {
                    Ok(Message::Text(text)) => match PhoenixMessage::from_json(&text) {
                        Ok(frame) => reader.handle(frame),
                        Err(e) => tracing::warn!("Ignoring unparseable realtime frame: {}", e),
                    },
                    Ok(Message::Ping(data)) => {
                        let _ = reader.outgoing.send(Message::Pong(data));
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("Realtime connection closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("Realtime socket error: {}", e);
                        break;
                    }
                }
            }
            reader.shutdown();
        });

        tracing::info!("Connected to realtime service at {}", host);
        Ok(socket)
    }

    /// Sends a join and waits for the server's reply.
    async fn await_join(
        &self,
        socket: &Socket,
        topic: &str,
        config: &JoinConfig,
        join_ref: &str,
    ) -> StoreResult<()> {
        let outcome = match socket.request(PhoenixMessage::join(
            topic,
            config,
            &self.config.access_token,
            join_ref,
        )) {
            Err(err) => Err(err),
            Ok(reply) => match tokio::time::timeout(self.config.join_timeout, reply).await {
                Ok(Ok(reply)) if reply.is_ok() => Ok(()),
                Ok(Ok(reply)) => Err(StoreError::Malformed(format!(
                    "join of {} refused: {}",
                    topic,
                    reply.reason()
                ))),
                Ok(Err(_)) => Err(StoreError::Closed),
                Err(_) => Err(StoreError::Timeout(format!("no reply to join of {}", topic))),
            },
        };
        if outcome.is_err() {
            lock(&socket.topics).remove(topic);
            lock(&socket.pending).remove(join_ref);
        }
        outcome
    }

    pub async fn subscribe(
        &self,
        request: SubscribeRequest,
    ) -> StoreResult<Subscription<StoreNotice>> {
        let socket = self.socket().await?;
        let topic = topic_for(&request.topic);
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut topics = lock(&socket.topics);
            if topics.contains_key(&topic) {
                return Err(StoreError::Malformed(format!(
                    "topic {} is already joined",
                    topic
                )));
            }
            topics.insert(topic.clone(), Route::Changes(sender.clone()));
        }

        let config = JoinConfig::postgres_changes(
            &self.config.schema,
            &request.table,
            request.filter.as_ref(),
            request.kinds.wire_event(),
        );
        let join_ref = socket.next_ref();
        let reply = match socket.request(PhoenixMessage::join(
            &topic,
            &config,
            &self.config.access_token,
            &join_ref,
        )) {
            Ok(reply) => reply,
            Err(err) => {
                lock(&socket.topics).remove(&topic);
                return Err(err);
            }
        };

        // The join outcome arrives as the first status notice.
        let timeout = self.config.join_timeout;
        let pending = Arc::downgrade(&socket);
        let status_topic = topic.clone();
        tokio::spawn(async move {
            let status = match tokio::time::timeout(timeout, reply).await {
                Ok(Ok(reply)) if reply.is_ok() => SubscriptionStatus::Subscribed,
                Ok(Ok(reply)) => SubscriptionStatus::ChannelError(reply.reason()),
                Ok(Err(_)) => SubscriptionStatus::Closed,
                Err(_) => {
                    if let Some(socket) = pending.upgrade() {
                        lock(&socket.pending).remove(&join_ref);
                    }
                    SubscriptionStatus::TimedOut
                }
            };
            tracing::debug!("Join of {} finished: {:?}", status_topic, status);
            let _ = sender.send(StoreNotice::Status(status));
        });

        Ok(Subscription::new(
            request.topic,
            receiver,
            release_topic(&socket, topic, None),
        ))
    }

    pub async fn join_presence(
        &self,
        channel: &str,
        key: &str,
    ) -> StoreResult<Subscription<PresenceEvent>> {
        let socket = self.socket().await?;
        let topic = topic_for(channel);
        let watcher = self.next_watcher();
        let (sender, receiver) = mpsc::unbounded_channel();

        let join_ref = {
            let mut topics = lock(&socket.topics);
            match topics.get_mut(&topic) {
                Some(Route::Presence {
                    key: joined,
                    state,
                    watchers,
                }) => {
                    if joined.as_str() != key {
                        return Err(StoreError::Malformed(format!(
                            "presence channel {} is already joined as {}",
                            channel, joined
                        )));
                    }
                    let _ = sender.send(PresenceEvent::Sync(state.clone()));
                    watchers.insert(watcher, sender);
                    None
                }
                Some(_) => {
                    return Err(StoreError::Malformed(format!(
                        "channel {} is already joined for another purpose",
                        channel
                    )))
                }
                None => {
                    let mut watchers = HashMap::new();
                    watchers.insert(watcher, sender);
                    topics.insert(
                        topic.clone(),
                        Route::Presence {
                            key: key.to_string(),
                            state: PresenceState::new(),
                            watchers,
                        },
                    );
                    Some(socket.next_ref())
                }
            }
        };

        if let Some(join_ref) = join_ref {
            self.await_join(&socket, &topic, &JoinConfig::presence(key), &join_ref)
                .await?;
            tracing::info!("Joined presence channel {} as {}", channel, key);
        }

        Ok(Subscription::new(
            format!("presence:{}", channel),
            receiver,
            release_topic(&socket, topic, Some(watcher)),
        ))
    }

    pub async fn track_presence(&self, channel: &str, key: &str, payload: Value) -> StoreResult<()> {
        let topic = topic_for(channel);
        let socket = self.current_socket().await.ok_or_else(|| {
            StoreError::Malformed(format!("join presence channel {} before tracking", channel))
        })?;
        let joined_as = match lock(&socket.topics).get(&topic) {
            Some(Route::Presence { key, .. }) => Some(key.clone()),
            _ => None,
        };
        if joined_as.as_deref() != Some(key) {
            return Err(StoreError::Malformed(format!(
                "peer {} must join presence channel {} before tracking",
                key, channel
            )));
        }
        let reference = socket.next_ref();
        socket.send(PhoenixMessage::track(&topic, payload, &reference))
    }

    pub async fn send_broadcast(&self, channel: &str, message: BroadcastMessage) -> StoreResult<()> {
        let topic = topic_for(channel);
        let socket = self.current_socket().await.ok_or_else(|| {
            StoreError::Malformed(format!("join broadcast channel {} before sending", channel))
        })?;
        if !lock(&socket.topics).contains_key(&topic) {
            return Err(StoreError::Malformed(format!(
                "join broadcast channel {} before sending",
                channel
            )));
        }
        let reference = socket.next_ref();
        socket.send(PhoenixMessage::broadcast(&topic, &message, &reference))
    }

    pub async fn subscribe_broadcast(
        &self,
        channel: &str,
    ) -> StoreResult<Subscription<BroadcastMessage>> {
        let socket = self.socket().await?;
        let topic = topic_for(channel);
        let watcher = self.next_watcher();
        let (sender, receiver) = mpsc::unbounded_channel();

        let join_ref = {
            let mut topics = lock(&socket.topics);
            match topics.get_mut(&topic) {
                Some(Route::Broadcast(listeners)) => {
                    listeners.insert(watcher, sender);
                    None
                }
                Some(_) => {
                    return Err(StoreError::Malformed(format!(
                        "channel {} is already joined for another purpose",
                        channel
                    )))
                }
                None => {
                    let mut listeners = HashMap::new();
                    listeners.insert(watcher, sender);
                    topics.insert(topic.clone(), Route::Broadcast(listeners));
                    Some(socket.next_ref())
                }
            }
        };

        if let Some(join_ref) = join_ref {
            self.await_join(&socket, &topic, &JoinConfig::broadcast(), &join_ref)
                .await?;
            tracing::info!("Joined broadcast channel {}", channel);
        }

        Ok(Subscription::new(
            format!("broadcast:{}", channel),
            receiver,
            release_topic(&socket, topic, Some(watcher)),
        ))
    }

    /// Closes the websocket. Open topics report `Closed`.
    pub async fn disconnect(&self) {
        if let Some(socket) = self.socket.lock().await.take() {
            let _ = socket.outgoing.send(Message::Close(None));
            socket.shutdown();
        }
    }
}
