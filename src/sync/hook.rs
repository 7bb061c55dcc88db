// ABOUTME: Sync hook - keeps a local collection reconciled with one remote table
// ABOUTME: Opens a change channel, loads a snapshot, applies events until stopped

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use seafarm_store::{Query, Row};
use tokio::sync::watch;

use super::collection::Collection;
use super::SyncError;
use crate::channel::{ChannelHandle, ChannelManager, ChannelMessage, ChannelSpec, ChannelStatus};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct HookState {
    collection: Collection,
    loading: bool,
    loaded: bool,
    error: Option<SyncError>,
    status: ChannelStatus,
}

struct HookShared {
    table: String,
    state: Mutex<HookState>,
    stopped: AtomicBool,
    channel: Mutex<Option<ChannelHandle>>,
    revision: watch::Sender<u64>,
}

impl HookShared {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn publish(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    fn apply(&self, message: ChannelMessage) {
        if self.is_stopped() {
            return;
        }
        match message {
            ChannelMessage::Change(change) => {
                let applied = lock(&self.state).collection.apply(&change);
                tracing::debug!(
                    "{} {} on {} (seq {}): {:?}",
                    change.event.kind(),
                    change.event.id(),
                    self.table,
                    change.sequence,
                    applied
                );
                if applied.changed() {
                    self.publish();
                }
            }
            ChannelMessage::Status(status) => {
                lock(&self.state).status = status;
                self.publish();
            }
        }
    }
}

/// Local mirror of one remote table.
///
/// Reads (`data`, `loading`, `error`, `status`) are cheap snapshots; `changes`
/// yields a revision counter that bumps whenever any of them change.
pub struct SyncHook {
    channels: ChannelManager,
    enabled: bool,
    shared: Arc<HookShared>,
    open_gate: tokio::sync::Mutex<()>,
}

impl SyncHook {
    pub fn new(channels: ChannelManager, table: impl Into<String>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            channels,
            enabled: true,
            shared: Arc::new(HookShared {
                table: table.into(),
                state: Mutex::new(HookState {
                    collection: Collection::new(),
                    loading: true,
                    loaded: false,
                    error: None,
                    status: ChannelStatus::Disconnected,
                }),
                stopped: AtomicBool::new(false),
                channel: Mutex::new(None),
                revision,
            }),
            open_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Starts from `rows` instead of an empty collection.
    pub fn with_rows(self, rows: Vec<Row>) -> Self {
        lock(&self.shared.state).collection = Collection::from_rows(rows);
        self
    }

    /// A disabled hook never opens a channel or loads; `start` is a no-op.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        if !enabled {
            lock(&self.shared.state).loading = false;
        }
        self
    }

    pub fn table(&self) -> &str {
        &self.shared.table
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn data(&self) -> Vec<Row> {
        lock(&self.shared.state).collection.to_vec()
    }

    pub fn get(&self, id: &str) -> Option<Row> {
        lock(&self.shared.state).collection.get(id).cloned()
    }

    pub fn loading(&self) -> bool {
        lock(&self.shared.state).loading
    }

    pub fn is_loaded(&self) -> bool {
        lock(&self.shared.state).loaded
    }

    pub fn error(&self) -> Option<SyncError> {
        lock(&self.shared.state).error.clone()
    }

    pub fn status(&self) -> ChannelStatus {
        lock(&self.shared.state).status.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    /// Applies a change directly, as if it arrived on the channel.
    pub fn apply(&self, message: ChannelMessage) {
        self.shared.apply(message);
    }

    /// Opens the change channel (once) and performs the initial load.
    ///
    /// The channel is opened before the fetch is issued so no change committed
    /// after the fetch can be missed. Calling again after a failed load retries
    /// only the load.
    pub async fn start(&self) -> Result<(), SyncError> {
        if !self.enabled {
            return Ok(());
        }
        if self.is_stopped() {
            return Err(SyncError::Stopped(self.shared.table.clone()));
        }
        self.ensure_channel().await?;
        if self.is_loaded() {
            return Ok(());
        }
        self.load().await
    }

    /// Re-fetches the whole table and merges it like the initial load.
    pub async fn refetch(&self) -> Result<(), SyncError> {
        if !self.enabled {
            return Ok(());
        }
        if self.is_stopped() {
            return Err(SyncError::Stopped(self.shared.table.clone()));
        }
        self.load().await
    }

    /// Closes the channel and stops applying events. Idempotent.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = lock(&self.shared.channel).take();
        if let Some(handle) = handle {
            handle.close();
            lock(&self.shared.state).status = handle.status();
        }
        lock(&self.shared.state).loading = false;
        tracing::info!("Stopped sync for {}", self.shared.table);
        self.shared.publish();
    }

    async fn ensure_channel(&self) -> Result<(), SyncError> {
        let _gate = self.open_gate.lock().await;
        if lock(&self.shared.channel).is_some() {
            return Ok(());
        }

        lock(&self.shared.state).status = ChannelStatus::Connecting;
        let spec = ChannelSpec::new(self.shared.table.clone());
        let (handle, mut stream) = match self.channels.open(spec).await {
            Ok(opened) => opened,
            Err(err) => {
                let error = SyncError::Channel {
                    table: self.shared.table.clone(),
                    source: err.clone(),
                };
                {
                    let mut state = lock(&self.shared.state);
                    state.status = ChannelStatus::Error(err);
                    state.error = Some(error.clone());
                    state.loading = false;
                }
                self.shared.publish();
                return Err(error);
            }
        };

        *lock(&self.shared.channel) = Some(handle);
        if self.is_stopped() {
            if let Some(handle) = lock(&self.shared.channel).take() {
                handle.close();
            }
            return Err(SyncError::Stopped(self.shared.table.clone()));
        }

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                shared.apply(message);
            }
        });
        Ok(())
    }

    async fn load(&self) -> Result<(), SyncError> {
        let table = self.shared.table.clone();
        let ticket = {
            let mut state = lock(&self.shared.state);
            state.loading = true;
            state.collection.begin_snapshot();
            self.channels.ticket()
        };
        self.shared.publish();

        let result = self.channels.store().select(&table, &Query::all()).await;
        if self.is_stopped() {
            tracing::debug!("Discarding fetch for stopped sync on {}", table);
            lock(&self.shared.state).collection.abandon_snapshot();
            return Err(SyncError::Stopped(table));
        }

        let outcome = {
            let mut state = lock(&self.shared.state);
            state.loading = false;
            match result {
                Ok(rows) => {
                    let count = rows.len();
                    if state.collection.merge_snapshot(rows, ticket) {
                        tracing::info!("Loaded {} rows from {}", count, table);
                    } else {
                        tracing::info!("No rows in {}, keeping local data", table);
                    }
                    state.loaded = true;
                    state.error = None;
                    Ok(())
                }
                Err(err) => {
                    tracing::error!("Failed to load {}: {}", table, err);
                    state.collection.abandon_snapshot();
                    let error = SyncError::Load {
                        table: table.clone(),
                        source: err,
                    };
                    state.error = Some(error.clone());
                    Err(error)
                }
            }
        };
        self.shared.publish();
        outcome
    }
}

impl Drop for SyncHook {
    fn drop(&mut self) {
        self.stop();
    }
}
