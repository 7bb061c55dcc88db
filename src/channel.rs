// ABOUTME: Change channel manager - one store subscription per table channel
// ABOUTME: Stamps arriving events with a sequence, tracks status, releases exactly once

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use seafarm_store::{
    ChangeEvent, ChangeKind, EventKinds, Release, RemoteStore, RowFilter, StoreError, StoreNotice,
    SubscribeRequest, SubscriptionStatus,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Why a channel ended up in the `error` state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel subscription timed out")]
    Timeout,
    #[error("channel subscription rejected: {0}")]
    Rejected(String),
    #[error("could not subscribe: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Connected,
    Disconnected,
    Error(ChannelError),
}

impl ChannelStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ChannelStatus::Connecting => "connecting",
            ChannelStatus::Connected => "connected",
            ChannelStatus::Disconnected => "disconnected",
            ChannelStatus::Error(_) => "error",
        }
    }

    pub fn error(&self) -> Option<&ChannelError> {
        match self {
            ChannelStatus::Error(err) => Some(err),
            _ => None,
        }
    }

    /// Next status after a store lifecycle callback, if it causes a transition.
    ///
    /// Only connecting->connected, connecting->error and
    /// connected->disconnected are produced; terminal states stay put.
    pub fn after(&self, notice: &SubscriptionStatus) -> Option<ChannelStatus> {
        match (self, notice) {
            (ChannelStatus::Connecting, SubscriptionStatus::Subscribed) => {
                Some(ChannelStatus::Connected)
            }
            (ChannelStatus::Connecting, SubscriptionStatus::TimedOut) => {
                Some(ChannelStatus::Error(ChannelError::Timeout))
            }
            (ChannelStatus::Connecting, SubscriptionStatus::ChannelError(reason)) => Some(
                ChannelStatus::Error(ChannelError::Rejected(reason.clone())),
            ),
            (ChannelStatus::Connecting, SubscriptionStatus::Closed) => Some(ChannelStatus::Error(
                ChannelError::Rejected("channel closed before subscribing".to_string()),
            )),
            (ChannelStatus::Connected, SubscriptionStatus::Subscribed) => None,
            (ChannelStatus::Connected, _) => Some(ChannelStatus::Disconnected),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelStatus::Error(err) => write!(f, "error ({})", err),
            other => f.write_str(other.label()),
        }
    }
}

/// A change event stamped with its arrival sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedChange {
    pub sequence: u64,
    pub table: String,
    pub event: ChangeEvent,
}

/// Item yielded by a [`ChannelStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Change(SequencedChange),
    Status(ChannelStatus),
}

/// What to subscribe to: a table, an optional equality filter, event kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub table: String,
    pub filter: Option<RowFilter>,
    pub kinds: EventKinds,
}

impl ChannelSpec {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
            kinds: EventKinds::all(),
        }
    }

    pub fn filter(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn kinds(mut self, kinds: EventKinds) -> Self {
        self.kinds = kinds;
        self
    }

    fn channel_name(&self, token: u64) -> String {
        let filter = self
            .filter
            .as_ref()
            .map(|f| f.to_string())
            .unwrap_or_else(|| "all".to_string());
        format!(
            "{}-{}-{}-{}",
            self.table,
            filter,
            chrono::Utc::now().timestamp_millis(),
            token
        )
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ManagerShared {
    sequence: AtomicU64,
    tokens: AtomicU64,
    open: Mutex<BTreeSet<String>>,
}

struct ChannelInner {
    name: String,
    table: String,
    closed: AtomicBool,
    release: Mutex<Release>,
    status: watch::Sender<ChannelStatus>,
    manager: Arc<ManagerShared>,
}

impl ChannelInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Applies a store lifecycle callback; returns the new status if it changed.
    fn apply_status(&self, notice: &SubscriptionStatus) -> Option<ChannelStatus> {
        let next = self.status.borrow().after(notice)?;
        match &next {
            ChannelStatus::Error(err) => {
                tracing::warn!("Channel {} failed: {}", self.name, err)
            }
            status => tracing::info!("Channel {} is {}", self.name, status),
        }
        self.status.send_replace(next.clone());
        Some(next)
    }
}

/// Control side of an open channel. Clones refer to the same channel.
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Arc<ChannelInner>,
}

impl ChannelHandle {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn table(&self) -> &str {
        &self.inner.table
    }

    pub fn status(&self) -> ChannelStatus {
        self.inner.status.borrow().clone()
    }

    /// Current subscription error, if the channel is in the `error` state.
    pub fn error(&self) -> Option<ChannelError> {
        self.status().error().cloned()
    }

    pub fn status_changes(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.status.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Stops delivery and releases the remote subscription.
    ///
    /// Returns false if the channel was already closed.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        lock(&self.inner.release).release();
        lock(&self.inner.manager.open).remove(&self.inner.name);
        if self.status() == ChannelStatus::Connected {
            self.inner.status.send_replace(ChannelStatus::Disconnected);
        }
        tracing::info!("Closed channel {}", self.inner.name);
        true
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Consumer side of an open channel, in arrival order.
pub struct ChannelStream {
    inner: Arc<ChannelInner>,
    receiver: mpsc::UnboundedReceiver<ChannelMessage>,
}

impl ChannelStream {
    /// Next message, or `None` once the channel is closed or the store ends it.
    pub async fn next(&mut self) -> Option<ChannelMessage> {
        if self.inner.is_closed() {
            return None;
        }
        let message = self.receiver.recv().await?;
        if self.inner.is_closed() {
            return None;
        }
        Some(message)
    }

    /// Next change event, skipping status messages.
    pub async fn next_change(&mut self) -> Option<SequencedChange> {
        loop {
            match self.next().await? {
                ChannelMessage::Change(change) => return Some(change),
                ChannelMessage::Status(_) => continue,
            }
        }
    }
}

type ChangeHandler = Box<dyn FnMut(&SequencedChange) + Send>;
type StatusHandler = Box<dyn FnMut(&ChannelStatus) + Send>;

/// Callbacks run for each delivered message.
///
/// A change runs its kind-specific handler first, then `on_change`.
#[derive(Default)]
pub struct ChannelHandlers {
    on_insert: Option<ChangeHandler>,
    on_update: Option<ChangeHandler>,
    on_delete: Option<ChangeHandler>,
    on_change: Option<ChangeHandler>,
    on_status: Option<StatusHandler>,
}

impl ChannelHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_insert(mut self, handler: impl FnMut(&SequencedChange) + Send + 'static) -> Self {
        self.on_insert = Some(Box::new(handler));
        self
    }

    pub fn on_update(mut self, handler: impl FnMut(&SequencedChange) + Send + 'static) -> Self {
        self.on_update = Some(Box::new(handler));
        self
    }

    pub fn on_delete(mut self, handler: impl FnMut(&SequencedChange) + Send + 'static) -> Self {
        self.on_delete = Some(Box::new(handler));
        self
    }

    pub fn on_change(mut self, handler: impl FnMut(&SequencedChange) + Send + 'static) -> Self {
        self.on_change = Some(Box::new(handler));
        self
    }

    pub fn on_status(mut self, handler: impl FnMut(&ChannelStatus) + Send + 'static) -> Self {
        self.on_status = Some(Box::new(handler));
        self
    }

    pub fn dispatch(&mut self, message: &ChannelMessage) {
        match message {
            ChannelMessage::Change(change) => {
                let specific = match change.event.kind() {
                    ChangeKind::Insert => self.on_insert.as_mut(),
                    ChangeKind::Update => self.on_update.as_mut(),
                    ChangeKind::Delete => self.on_delete.as_mut(),
                };
                if let Some(handler) = specific {
                    handler(change);
                }
                if let Some(handler) = self.on_change.as_mut() {
                    handler(change);
                }
            }
            ChannelMessage::Status(status) => {
                if let Some(handler) = self.on_status.as_mut() {
                    handler(status);
                }
            }
        }
    }
}

/// Opens table channels against one shared store.
///
/// Every channel opened here must be closed by its owner; the manager only
/// tracks names so leaks can be observed through [`ChannelManager::open_channels`].
#[derive(Clone)]
pub struct ChannelManager {
    store: Arc<dyn RemoteStore>,
    shared: Arc<ManagerShared>,
}

impl ChannelManager {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            shared: Arc::new(ManagerShared::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    /// Sequence of the most recently delivered event.
    ///
    /// Anything stamped later arrived after this call.
    pub fn ticket(&self) -> u64 {
        self.shared.sequence.load(Ordering::SeqCst)
    }

    pub fn open_channels(&self) -> Vec<String> {
        lock(&self.shared.open).iter().cloned().collect()
    }

    pub async fn open(
        &self,
        spec: ChannelSpec,
    ) -> Result<(ChannelHandle, ChannelStream), ChannelError> {
        let token = self.shared.tokens.fetch_add(1, Ordering::SeqCst) + 1;
        let name = spec.channel_name(token);
        lock(&self.shared.open).insert(name.clone());

        let request = SubscribeRequest {
            topic: name.clone(),
            table: spec.table.clone(),
            filter: spec.filter.clone(),
            kinds: spec.kinds,
        };
        let subscription = match self.store.subscribe(request).await {
            Ok(subscription) => subscription,
            Err(err) => {
                lock(&self.shared.open).remove(&name);
                tracing::warn!("Failed to open channel {}: {}", name, err);
                return Err(ChannelError::Store(err));
            }
        };
        let (_, notices, release) = subscription.into_parts();

        let (status, _) = watch::channel(ChannelStatus::Connecting);
        let inner = Arc::new(ChannelInner {
            name: name.clone(),
            table: spec.table.clone(),
            closed: AtomicBool::new(false),
            release: Mutex::new(release),
            status,
            manager: Arc::clone(&self.shared),
        });
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(pump(Arc::clone(&inner), notices, sender, spec.kinds));

        tracing::info!("Opened channel {} on table {}", name, spec.table);
        Ok((
            ChannelHandle {
                inner: Arc::clone(&inner),
            },
            ChannelStream { inner, receiver },
        ))
    }

    /// Opens a channel and runs `handlers` for every message until it closes.
    pub async fn open_with_handlers(
        &self,
        spec: ChannelSpec,
        mut handlers: ChannelHandlers,
    ) -> Result<ChannelHandle, ChannelError> {
        let (handle, mut stream) = self.open(spec).await?;
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                handlers.dispatch(&message);
            }
        });
        Ok(handle)
    }

    pub fn close(&self, handle: &ChannelHandle) -> bool {
        handle.close()
    }
}

async fn pump(
    inner: Arc<ChannelInner>,
    mut notices: mpsc::UnboundedReceiver<StoreNotice>,
    sender: mpsc::UnboundedSender<ChannelMessage>,
    kinds: EventKinds,
) {
    while let Some(notice) = notices.recv().await {
        if inner.is_closed() {
            tracing::debug!("Discarding notice for closed channel {}", inner.name);
            break;
        }
        let message = match notice {
            StoreNotice::Change(event) => {
                if !kinds.contains(event.kind()) {
                    continue;
                }
                let sequence = inner.manager.sequence.fetch_add(1, Ordering::SeqCst) + 1;
                ChannelMessage::Change(SequencedChange {
                    sequence,
                    table: inner.table.clone(),
                    event,
                })
            }
            StoreNotice::Status(notice) => match inner.apply_status(&notice) {
                Some(status) => ChannelMessage::Status(status),
                None => continue,
            },
        };
        let _ = sender.send(message);
    }

    if !inner.is_closed() {
        if let Some(status) = inner.apply_status(&SubscriptionStatus::Closed) {
            let _ = sender.send(ChannelMessage::Status(status));
        }
    }
}
