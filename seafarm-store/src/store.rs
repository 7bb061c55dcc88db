use async_trait::async_trait;
use serde_json::Value;

use crate::change::EventKinds;
use crate::error::{StoreError, StoreResult};
use crate::row::Row;
use crate::subscription::{BroadcastMessage, PresenceEvent, StoreNotice, Subscription};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// Read options for [`RemoteStore::select`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<(String, Value)>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((column.into(), value.into()));
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.filters
            .iter()
            .all(|(column, value)| row.get(column) == Some(value))
    }
}

/// Equality predicate for change subscriptions, written `column=eq.value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    pub column: String,
    pub value: String,
}

impl RowFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn parse(filter: &str) -> StoreResult<Self> {
        let (column, predicate) = filter
            .split_once('=')
            .ok_or_else(|| StoreError::Malformed(format!("invalid filter '{filter}'")))?;
        let value = predicate.strip_prefix("eq.").ok_or_else(|| {
            StoreError::Malformed(format!(
                "unsupported filter operator in '{filter}' (only eq is supported)"
            ))
        })?;
        if column.trim().is_empty() {
            return Err(StoreError::Malformed(format!(
                "filter '{filter}' has no column"
            )));
        }
        Ok(Self::eq(column.trim(), value))
    }

    pub fn matches(&self, row: &Row) -> bool {
        match row.get(&self.column) {
            Some(Value::String(s)) => *s == self.value,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == self.value,
        }
    }
}

impl std::fmt::Display for RowFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeRequest {
    /// Unique channel name chosen by the caller.
    pub topic: String,
    pub table: String,
    pub filter: Option<RowFilter>,
    pub kinds: EventKinds,
}

/// Hosted row store with change notifications, presence and broadcast.
///
/// Every method is a network round-trip in production implementations;
/// subscriptions stay open until their [`crate::Release`] runs.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select(&self, table: &str, query: &Query) -> StoreResult<Vec<Row>>;

    /// Writes one row and returns the stored representation.
    async fn insert(&self, table: &str, row: Row) -> StoreResult<Row>;

    async fn update(&self, table: &str, id: &str, patch: Row) -> StoreResult<Row>;

    async fn delete(&self, table: &str, id: &str) -> StoreResult<()>;

    async fn subscribe(&self, request: SubscribeRequest) -> StoreResult<Subscription<StoreNotice>>;

    /// Joins a presence channel as `key`; the first item is a full sync.
    async fn join_presence(
        &self,
        channel: &str,
        key: &str,
    ) -> StoreResult<Subscription<PresenceEvent>>;

    async fn track_presence(&self, channel: &str, key: &str, payload: Value) -> StoreResult<()>;

    async fn send_broadcast(&self, channel: &str, message: BroadcastMessage) -> StoreResult<()>;

    async fn subscribe_broadcast(
        &self,
        channel: &str,
    ) -> StoreResult<Subscription<BroadcastMessage>>;

    /// True if a one-row read of `probe_table` succeeds. Never errors.
    async fn health_check(&self, probe_table: &str) -> bool {
        match self.select(probe_table, &Query::all().limit(1)).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(table = %probe_table, error = %err, "health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::row_from_value;
    use serde_json::json;

    #[test]
    fn parses_and_matches_filters() {
        let filter = RowFilter::parse("site_id=eq.42").unwrap();
        assert_eq!(filter, RowFilter::eq("site_id", "42"));
        assert_eq!(filter.to_string(), "site_id=eq.42");

        let numeric = row_from_value(json!({"id": "m1", "site_id": 42})).unwrap();
        let text = row_from_value(json!({"id": "m2", "site_id": "42"})).unwrap();
        let other = row_from_value(json!({"id": "m3", "site_id": "7"})).unwrap();
        assert!(filter.matches(&numeric));
        assert!(filter.matches(&text));
        assert!(!filter.matches(&other));

        assert!(RowFilter::parse("site_id").is_err());
        assert!(RowFilter::parse("site_id=gt.4").is_err());
    }

    #[test]
    fn query_builder_matches_equality() {
        let query = Query::all().eq("zone", "north").order_by("name", true).limit(5);
        let row = row_from_value(json!({"id": "a", "zone": "north"})).unwrap();
        assert!(query.matches(&row));
        assert_eq!(query.limit, Some(5));
        assert!(!Query::all().eq("zone", "south").matches(&row));
    }
}
