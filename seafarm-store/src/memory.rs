use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::change::{ChangeEvent, EventKinds};
use crate::error::{StoreError, StoreResult};
use crate::row::{row_id, Row, ID_FIELD};
use crate::store::{Query, RemoteStore, RowFilter, SubscribeRequest};
use crate::subscription::{
    BroadcastMessage, PresenceEvent, PresenceState, Release, StoreNotice, Subscription,
    SubscriptionStatus,
};

/// Store operations that can be counted and fault-injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
    Subscribe,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStoreOptions {
    /// Report deletes of missing rows as `NotFound` instead of succeeding.
    pub strict_deletes: bool,
}

/// One committed change, numbered in commit order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub change_id: i64,
    pub table_name: String,
    pub event: ChangeEvent,
}

struct Fault {
    error: StoreError,
    after_commit: bool,
}

struct TableSubscriber {
    table: String,
    filter: Option<RowFilter>,
    kinds: EventKinds,
    sender: mpsc::UnboundedSender<StoreNotice>,
}

#[derive(Default)]
struct PresenceRoom {
    members: PresenceState,
    watchers: HashMap<u64, (String, mpsc::UnboundedSender<PresenceEvent>)>,
}

impl PresenceRoom {
    fn notify(&mut self, event: PresenceEvent) {
        let sync = PresenceEvent::Sync(self.members.clone());
        self.watchers.retain(|_, (_, sender)| {
            sender.send(event.clone()).is_ok() && sender.send(sync.clone()).is_ok()
        });
    }
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, Vec<Row>>,
    changes: Vec<ChangeRecord>,
    next_change_id: i64,
    next_generated_id: u64,
    next_subscriber_id: u64,
    subscribers: HashMap<u64, TableSubscriber>,
    rooms: HashMap<String, PresenceRoom>,
    broadcast: HashMap<String, HashMap<u64, mpsc::UnboundedSender<BroadcastMessage>>>,
    faults: HashMap<Operation, VecDeque<Fault>>,
    attempts: HashMap<Operation, usize>,
    subscribe_outcome: Option<SubscriptionStatus>,
}

impl Inner {
    fn begin(&mut self, op: Operation) -> Option<Fault> {
        *self.attempts.entry(op).or_default() += 1;
        self.faults.get_mut(&op).and_then(|queue| queue.pop_front())
    }

    fn next_subscriber(&mut self) -> u64 {
        self.next_subscriber_id += 1;
        self.next_subscriber_id
    }

    fn publish(&mut self, table: &str, event: ChangeEvent, old_row: Option<&Row>) {
        self.next_change_id += 1;
        self.changes.push(ChangeRecord {
            change_id: self.next_change_id,
            table_name: table.to_string(),
            event: event.clone(),
        });

        let kind = event.kind();
        let subject = event.row().or(old_row);
        self.subscribers.retain(|_, sub| {
            if sub.table != table || !sub.kinds.contains(kind) {
                return true;
            }
            let matches = match (&sub.filter, subject) {
                (None, _) => true,
                (Some(filter), Some(row)) => filter.matches(row),
                (Some(_), None) => false,
            };
            !matches || sub.sender.send(StoreNotice::Change(event.clone())).is_ok()
        });
    }
}

/// Fails pre-commit faults now; after-commit faults are returned for later.
fn split_fault(fault: Option<Fault>) -> StoreResult<Option<StoreError>> {
    match fault {
        Some(Fault {
            error,
            after_commit: false,
        }) => Err(error),
        Some(Fault { error, .. }) => Ok(Some(error)),
        None => Ok(None),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

/// Keeps selects from returning until released; dropping it also releases.
pub struct SelectHold {
    sender: watch::Sender<bool>,
}

impl SelectHold {
    pub fn release(&self) {
        let _ = self.sender.send(false);
    }
}

impl Drop for SelectHold {
    fn drop(&mut self) {
        self.release();
    }
}

/// In-process [`RemoteStore`] with a numbered change log.
///
/// Used by tests and by the CLI's `--memory` mode. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    options: MemoryStoreOptions,
    select_hold: Arc<Mutex<Option<watch::Receiver<bool>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: MemoryStoreOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    /// Loads rows without publishing change events.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Row>) {
        let mut inner = lock(&self.inner);
        inner
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        lock(&self.inner)
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Delivers an event to subscribers without changing table contents.
    pub fn emit(&self, table: &str, event: ChangeEvent) {
        lock(&self.inner).publish(table, event, None);
    }

    pub fn change_log(&self) -> Vec<ChangeRecord> {
        lock(&self.inner).changes.clone()
    }

    /// Number of live table subscriptions.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }

    pub fn attempts(&self, op: Operation) -> usize {
        lock(&self.inner).attempts.get(&op).copied().unwrap_or(0)
    }

    /// Fails the next call of `op` before it touches any data.
    pub fn fail_next(&self, op: Operation, error: StoreError) {
        self.push_fault(op, error, false);
    }

    /// Applies the next call of `op`, then reports `error` to the caller.
    pub fn fail_next_after_commit(&self, op: Operation, error: StoreError) {
        self.push_fault(op, error, true);
    }

    fn push_fault(&self, op: Operation, error: StoreError, after_commit: bool) {
        lock(&self.inner)
            .faults
            .entry(op)
            .or_default()
            .push_back(Fault {
                error,
                after_commit,
            });
    }

    /// Status every new subscription reports first; `None` means subscribed.
    pub fn set_subscribe_outcome(&self, outcome: Option<SubscriptionStatus>) {
        lock(&self.inner).subscribe_outcome = outcome;
    }

    /// Makes selects compute their result immediately but wait to return.
    pub fn hold_selects(&self) -> SelectHold {
        let (sender, receiver) = watch::channel(true);
        *lock(&self.select_hold) = Some(receiver);
        SelectHold { sender }
    }

    /// Closes every table subscription from the store side.
    pub fn disconnect_all(&self) {
        let mut inner = lock(&self.inner);
        for (_, sub) in inner.subscribers.drain() {
            let _ = sub
                .sender
                .send(StoreNotice::Status(SubscriptionStatus::Closed));
        }
    }

    pub fn presence_members(&self, channel: &str) -> PresenceState {
        lock(&self.inner)
            .rooms
            .get(channel)
            .map(|room| room.members.clone())
            .unwrap_or_default()
    }

    async fn wait_for_select_release(&self) {
        let hold = lock(&self.select_hold).clone();
        if let Some(mut receiver) = hold {
            while *receiver.borrow() {
                if receiver.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn select(&self, table: &str, query: &Query) -> StoreResult<Vec<Row>> {
        let rows = {
            let mut inner = lock(&self.inner);
            if let Some(fault) = inner.begin(Operation::Select) {
                return Err(fault.error);
            }
            let mut rows: Vec<Row> = inner
                .tables
                .get(table)
                .map(|rows| rows.iter().filter(|row| query.matches(row)).cloned().collect())
                .unwrap_or_default();
            if let Some(order) = &query.order {
                rows.sort_by(|a, b| {
                    let ordering = compare_values(a.get(&order.column), b.get(&order.column));
                    if order.ascending {
                        ordering
                    } else {
                        ordering.reverse()
                    }
                });
            }
            if let Some(limit) = query.limit {
                rows.truncate(limit);
            }
            rows
        };
        self.wait_for_select_release().await;
        debug!(table, rows = rows.len(), "memory select");
        Ok(rows)
    }

    async fn insert(&self, table: &str, mut row: Row) -> StoreResult<Row> {
        let mut inner = lock(&self.inner);
        let deferred = split_fault(inner.begin(Operation::Insert))?;

        let id = match row_id(&row) {
            Some(id) => id,
            None => {
                inner.next_generated_id += 1;
                let id = format!("{}-{}", table, inner.next_generated_id);
                row.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                id
            }
        };

        let rows = inner.tables.entry(table.to_string()).or_default();
        if rows.iter().any(|r| row_id(r).as_deref() == Some(id.as_str())) {
            return Err(StoreError::Conflict {
                table: table.to_string(),
                id,
            });
        }
        rows.push(row.clone());
        inner.publish(
            table,
            ChangeEvent::Insert {
                id,
                row: row.clone(),
            },
            None,
        );

        match deferred {
            Some(error) => Err(error),
            None => Ok(row),
        }
    }

    async fn update(&self, table: &str, id: &str, patch: Row) -> StoreResult<Row> {
        let mut inner = lock(&self.inner);
        let deferred = split_fault(inner.begin(Operation::Update))?;

        if let Some(patch_id) = row_id(&patch) {
            if patch_id != id {
                return Err(StoreError::Malformed(format!(
                    "update of {table}/{id} may not change id to {patch_id}"
                )));
            }
        }

        let not_found = || StoreError::NotFound {
            table: table.to_string(),
            id: id.to_string(),
        };
        let row = inner
            .tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|r| row_id(r).as_deref() == Some(id)))
            .ok_or_else(not_found)?;
        for (field, value) in patch {
            row.insert(field, value);
        }
        let updated = row.clone();
        inner.publish(
            table,
            ChangeEvent::Update {
                id: id.to_string(),
                row: updated.clone(),
            },
            None,
        );

        match deferred {
            Some(error) => Err(error),
            None => Ok(updated),
        }
    }

    async fn delete(&self, table: &str, id: &str) -> StoreResult<()> {
        let mut inner = lock(&self.inner);
        let deferred = split_fault(inner.begin(Operation::Delete))?;

        let position = inner
            .tables
            .get(table)
            .and_then(|rows| rows.iter().position(|r| row_id(r).as_deref() == Some(id)));
        match position {
            Some(index) => {
                let removed = inner
                    .tables
                    .get_mut(table)
                    .map(|rows| rows.remove(index));
                inner.publish(table, ChangeEvent::delete(id), removed.as_ref());
            }
            None if self.options.strict_deletes => {
                return Err(StoreError::NotFound {
                    table: table.to_string(),
                    id: id.to_string(),
                });
            }
            None => debug!(table, id, "delete of missing row treated as success"),
        }

        match deferred {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn subscribe(&self, request: SubscribeRequest) -> StoreResult<Subscription<StoreNotice>> {
        let mut inner = lock(&self.inner);
        if let Some(fault) = inner.begin(Operation::Subscribe) {
            return Err(fault.error);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let outcome = inner
            .subscribe_outcome
            .clone()
            .unwrap_or(SubscriptionStatus::Subscribed);
        let _ = sender.send(StoreNotice::Status(outcome.clone()));
        if outcome != SubscriptionStatus::Subscribed {
            debug!(topic = %request.topic, ?outcome, "subscription refused");
            return Ok(Subscription::new(request.topic, receiver, Release::noop()));
        }

        let id = inner.next_subscriber();
        debug!(topic = %request.topic, table = %request.table, "subscription opened");
        inner.subscribers.insert(
            id,
            TableSubscriber {
                table: request.table,
                filter: request.filter,
                kinds: request.kinds,
                sender,
            },
        );

        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        let release = Release::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner).subscribers.remove(&id);
            }
        });
        Ok(Subscription::new(request.topic, receiver, release))
    }

    async fn join_presence(
        &self,
        channel: &str,
        key: &str,
    ) -> StoreResult<Subscription<PresenceEvent>> {
        let mut inner = lock(&self.inner);
        let id = inner.next_subscriber();
        let (sender, receiver) = mpsc::unbounded_channel();
        let room = inner.rooms.entry(channel.to_string()).or_default();
        let _ = sender.send(PresenceEvent::Sync(room.members.clone()));
        room.watchers.insert(id, (key.to_string(), sender));

        let weak = Arc::downgrade(&self.inner);
        let channel_name = channel.to_string();
        let release = Release::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut inner = lock(&inner);
            let Some(room) = inner.rooms.get_mut(&channel_name) else {
                return;
            };
            let Some((key, _)) = room.watchers.remove(&id) else {
                return;
            };
            let still_present = room.watchers.values().any(|(k, _)| *k == key);
            if !still_present && room.members.remove(&key).is_some() {
                room.notify(PresenceEvent::Leave { key });
            }
        });
        Ok(Subscription::new(
            format!("presence:{channel}"),
            receiver,
            release,
        ))
    }

    async fn track_presence(&self, channel: &str, key: &str, payload: Value) -> StoreResult<()> {
        let mut inner = lock(&self.inner);
        let room = inner
            .rooms
            .get_mut(channel)
            .filter(|room| room.watchers.values().any(|(k, _)| k == key))
            .ok_or_else(|| {
                StoreError::Malformed(format!(
                    "peer {key} must join presence channel {channel} before tracking"
                ))
            })?;
        room.members.insert(key.to_string(), payload.clone());
        room.notify(PresenceEvent::Join {
            key: key.to_string(),
            payload,
        });
        Ok(())
    }

    async fn send_broadcast(&self, channel: &str, message: BroadcastMessage) -> StoreResult<()> {
        let mut inner = lock(&self.inner);
        if let Some(listeners) = inner.broadcast.get_mut(channel) {
            listeners.retain(|_, sender| sender.send(message.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe_broadcast(
        &self,
        channel: &str,
    ) -> StoreResult<Subscription<BroadcastMessage>> {
        let mut inner = lock(&self.inner);
        let id = inner.next_subscriber();
        let (sender, receiver) = mpsc::unbounded_channel();
        inner
            .broadcast
            .entry(channel.to_string())
            .or_default()
            .insert(id, sender);

        let weak = Arc::downgrade(&self.inner);
        let channel_name = channel.to_string();
        let release = Release::new(move || {
            if let Some(inner) = weak.upgrade() {
                if let Some(listeners) = lock(&inner).broadcast.get_mut(&channel_name) {
                    listeners.remove(&id);
                }
            }
        });
        Ok(Subscription::new(
            format!("broadcast:{channel}"),
            receiver,
            release,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::row_from_value;
    use serde_json::json;

    fn row(value: Value) -> Row {
        row_from_value(value).unwrap()
    }

    #[tokio::test]
    async fn select_filters_orders_and_limits() {
        let store = MemoryStore::new();
        store.seed(
            "modules",
            vec![
                row(json!({"id": "m1", "site_id": "s1", "code": "B"})),
                row(json!({"id": "m2", "site_id": "s2", "code": "A"})),
                row(json!({"id": "m3", "site_id": "s1", "code": "A"})),
            ],
        );

        let query = Query::all().eq("site_id", "s1").order_by("code", true);
        let rows = store.select("modules", &query).await.unwrap();
        let ids: Vec<_> = rows.iter().filter_map(row_id).collect();
        assert_eq!(ids, vec!["m3", "m1"]);

        let rows = store
            .select("modules", &Query::all().order_by("code", false).limit(1))
            .await
            .unwrap();
        assert_eq!(row_id(&rows[0]).as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn writes_are_logged_in_commit_order() {
        let store = MemoryStore::new();
        store
            .insert("sites", row(json!({"id": "s1", "name": "North"})))
            .await
            .unwrap();
        store
            .update("sites", "s1", row(json!({"name": "North Bay"})))
            .await
            .unwrap();
        store.delete("sites", "s1").await.unwrap();

        let log = store.change_log();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].change_id, 1);
        assert!(matches!(log[1].event, ChangeEvent::Update { .. }));
        assert_eq!(log[2].event, ChangeEvent::delete("s1"));
        assert!(store.rows("sites").is_empty());
    }

    #[tokio::test]
    async fn generates_ids_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let stored = store
            .insert("sites", row(json!({"name": "X"})))
            .await
            .unwrap();
        assert_eq!(row_id(&stored).as_deref(), Some("sites-1"));

        let err = store
            .insert("sites", row(json!({"id": "sites-1"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn missing_rows_follow_delete_policy() {
        let lenient = MemoryStore::new();
        assert!(lenient.delete("sites", "nope").await.is_ok());

        let strict = MemoryStore::with_options(MemoryStoreOptions {
            strict_deletes: true,
        });
        let err = strict.delete("sites", "nope").await.unwrap_err();
        assert!(err.is_not_found());

        let err = lenient
            .update("sites", "nope", row(json!({"name": "Y"})))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn injected_faults_fire_once() {
        let store = MemoryStore::new();
        store.fail_next(Operation::Insert, StoreError::Connectivity("down".into()));
        assert!(store.insert("sites", row(json!({"id": "a"}))).await.is_err());
        assert!(store.rows("sites").is_empty());
        assert!(store.insert("sites", row(json!({"id": "a"}))).await.is_ok());
        assert_eq!(store.attempts(Operation::Insert), 2);

        store.fail_next_after_commit(Operation::Insert, StoreError::Timeout("lost".into()));
        assert!(store.insert("sites", row(json!({"id": "b"}))).await.is_err());
        assert_eq!(store.rows("sites").len(), 2);
    }

    #[tokio::test]
    async fn subscriptions_receive_filtered_changes_until_released() {
        let store = MemoryStore::new();
        let mut sub = store
            .subscribe(SubscribeRequest {
                topic: "modules-site_id=eq.s1-1".into(),
                table: "modules".into(),
                filter: Some(RowFilter::eq("site_id", "s1")),
                kinds: EventKinds::all(),
            })
            .await
            .unwrap();
        assert_eq!(
            sub.recv().await,
            Some(StoreNotice::Status(SubscriptionStatus::Subscribed))
        );

        store
            .insert("modules", row(json!({"id": "m1", "site_id": "s2"})))
            .await
            .unwrap();
        store
            .insert("modules", row(json!({"id": "m2", "site_id": "s1"})))
            .await
            .unwrap();
        store.delete("modules", "m2").await.unwrap();

        match sub.recv().await {
            Some(StoreNotice::Change(event)) => assert_eq!(event.id(), "m2"),
            other => panic!("unexpected notice {other:?}"),
        }
        assert_eq!(
            sub.recv().await,
            Some(StoreNotice::Change(ChangeEvent::delete("m2")))
        );

        assert_eq!(store.subscriber_count(), 1);
        drop(sub);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn presence_tracks_and_removes_peers() {
        let store = MemoryStore::new();
        let mut alice = store.join_presence("online-users", "alice").await.unwrap();
        assert_eq!(alice.recv().await, Some(PresenceEvent::Sync(PresenceState::new())));

        let bob = store.join_presence("online-users", "bob").await.unwrap();
        store
            .track_presence("online-users", "bob", json!({"page": "dashboard"}))
            .await
            .unwrap();
        assert!(matches!(alice.recv().await, Some(PresenceEvent::Join { key, .. }) if key == "bob"));
        assert!(matches!(alice.recv().await, Some(PresenceEvent::Sync(state)) if state.len() == 1));

        drop(bob);
        assert_eq!(
            alice.recv().await,
            Some(PresenceEvent::Leave { key: "bob".into() })
        );
        assert!(store.presence_members("online-users").is_empty());

        let err = store
            .track_presence("online-users", "carol", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Malformed(_)));
    }

    #[tokio::test]
    async fn health_check_reports_failed_read() {
        let store = MemoryStore::new();
        assert!(store.health_check("sites").await);
        store.fail_next(Operation::Select, StoreError::Timeout("stalled".into()));
        assert!(!store.health_check("sites").await);
        assert_eq!(store.attempts(Operation::Select), 2);
    }
}
