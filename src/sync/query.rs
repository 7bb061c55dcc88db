// ABOUTME: Realtime query - a filtered, ordered, limited view of a table
// ABOUTME: Re-runs the query whenever the table reports any change

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use seafarm_store::{Query, RemoteStore, Row};
use tokio::sync::watch;

use super::SyncError;
use crate::channel::{ChannelHandle, ChannelManager, ChannelMessage, ChannelSpec};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub table: String,
    pub query: Query,
    /// Re-run the query on table changes. Off means fetch on demand only.
    pub realtime: bool,
}

impl QueryOptions {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            query: Query::all(),
            realtime: true,
        }
    }

    pub fn query(mut self, query: Query) -> Self {
        self.query = query;
        self
    }

    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }
}

#[derive(Default)]
struct QueryState {
    data: Vec<Row>,
    loading: bool,
    error: Option<SyncError>,
    applied: u64,
}

struct QueryShared {
    store: Arc<dyn RemoteStore>,
    options: QueryOptions,
    state: Mutex<QueryState>,
    generation: AtomicU64,
    stopped: AtomicBool,
    revision: watch::Sender<u64>,
}

impl QueryShared {
    fn publish(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    /// Runs the query. Results from a fetch issued before one already applied
    /// are dropped, so the newest issued fetch always wins.
    async fn fetch(&self) -> Result<(), SyncError> {
        let table = &self.options.table;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.state).loading = true;
        self.publish();

        let result = self.store.select(table, &self.options.query).await;
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Stopped(table.clone()));
        }

        let outcome = {
            let mut state = lock(&self.state);
            if generation < state.applied {
                tracing::debug!("Dropping superseded fetch of {}", table);
                return Ok(());
            }
            state.applied = generation;
            state.loading = false;
            match result {
                Ok(rows) => {
                    tracing::debug!("Query on {} returned {} rows", table, rows.len());
                    state.data = rows;
                    state.error = None;
                    Ok(())
                }
                Err(err) => {
                    tracing::error!("Query on {} failed: {}", table, err);
                    let error = SyncError::Load {
                        table: table.clone(),
                        source: err,
                    };
                    state.error = Some(error.clone());
                    Err(error)
                }
            }
        };
        self.publish();
        outcome
    }
}

/// Query results kept fresh by re-fetching on every change to the table.
///
/// Unlike [`super::SyncHook`], an empty result replaces the data.
pub struct RealtimeQuery {
    channels: ChannelManager,
    shared: Arc<QueryShared>,
    channel: Mutex<Option<ChannelHandle>>,
    open_gate: tokio::sync::Mutex<()>,
}

impl RealtimeQuery {
    pub fn new(channels: ChannelManager, options: QueryOptions) -> Self {
        let (revision, _) = watch::channel(0);
        let shared = Arc::new(QueryShared {
            store: Arc::clone(channels.store()),
            options,
            state: Mutex::new(QueryState {
                loading: true,
                ..QueryState::default()
            }),
            generation: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            revision,
        });
        Self {
            channels,
            shared,
            channel: Mutex::new(None),
            open_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn data(&self) -> Vec<Row> {
        lock(&self.shared.state).data.clone()
    }

    pub fn loading(&self) -> bool {
        lock(&self.shared.state).loading
    }

    pub fn error(&self) -> Option<SyncError> {
        lock(&self.shared.state).error.clone()
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    /// Runs the initial fetch and, when realtime, subscribes to the table.
    pub async fn start(&self) -> Result<(), SyncError> {
        if self.is_stopped() {
            return Err(SyncError::Stopped(self.shared.options.table.clone()));
        }
        if self.shared.options.realtime {
            self.subscribe().await?;
        }
        self.refetch().await
    }

    async fn subscribe(&self) -> Result<(), SyncError> {
        let _gate = self.open_gate.lock().await;
        if lock(&self.channel).is_some() {
            return Ok(());
        }

        let table = self.shared.options.table.clone();
        let (handle, mut stream) = self
            .channels
            .open(ChannelSpec::new(table.clone()))
            .await
            .map_err(|source| SyncError::Channel {
                table: table.clone(),
                source,
            })?;
        *lock(&self.channel) = Some(handle);
        // stop() may have run while the channel was opening.
        if self.is_stopped() {
            if let Some(handle) = lock(&self.channel).take() {
                handle.close();
            }
            return Err(SyncError::Stopped(table));
        }

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                if let ChannelMessage::Change(_) = message {
                    // Errors are kept in the query state.
                    let _ = shared.fetch().await;
                }
            }
        });
        Ok(())
    }

    fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    pub async fn refetch(&self) -> Result<(), SyncError> {
        if self.is_stopped() {
            return Err(SyncError::Stopped(self.shared.options.table.clone()));
        }
        self.shared.fetch().await
    }

    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = lock(&self.channel).take() {
            handle.close();
        }
        lock(&self.shared.state).loading = false;
        self.shared.publish();
    }
}

impl Drop for RealtimeQuery {
    fn drop(&mut self) {
        self.stop();
    }
}
