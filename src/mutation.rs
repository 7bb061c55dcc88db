// ABOUTME: Mutation gateway - insert, update and delete with retry on transient failures
// ABOUTME: Makes inserts retry-safe with client ids and tracks last-outcome state

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use seafarm_store::{row_id, Query, RemoteStore, Row, StoreError, ID_FIELD};
use serde_json::Value;
use thiserror::Error;

use crate::utils::{retry_with_backoff, validate_table_name, RetryFailure};

/// How many times a write is attempted and how long to wait between attempts.
///
/// The wait before retry `k` is `base_delay * 2^k`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(retry)
    }

    /// Total time spent waiting if every attempt fails.
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts.max(1))
            .map(|retry| self.delay_before_retry(retry))
            .sum()
    }
}

/// Who picks the `id` of an inserted row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdStrategy {
    /// The gateway fills in a UUID when the record has no id, so a retried
    /// insert can be recognised by its key.
    #[default]
    Client,
    /// The store assigns ids. Inserts are only retried when the failed
    /// attempt certainly did not reach the store.
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for WriteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            WriteKind::Insert => "insert",
            WriteKind::Update => "update",
            WriteKind::Delete => "delete",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    #[error("row {id} not found in {table}")]
    NotFound { table: String, id: String },
    #[error("{operation} on {table} failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: WriteKind,
        table: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("{operation} on {table} rejected: {source}")]
    Rejected {
        operation: WriteKind,
        table: String,
        #[source]
        source: StoreError,
    },
    #[error("{operation} on {table} may or may not have been applied: {source}")]
    Ambiguous {
        operation: WriteKind,
        table: String,
        #[source]
        source: StoreError,
    },
    #[error("invalid {operation} request: {reason}")]
    Invalid { operation: WriteKind, reason: String },
}

impl MutationError {
    /// The store error behind this failure, if any.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            MutationError::Exhausted { source, .. }
            | MutationError::Rejected { source, .. }
            | MutationError::Ambiguous { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MutationError::NotFound { .. })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Outcome {
    in_flight: AtomicUsize,
    error: Mutex<Option<MutationError>>,
}

struct InFlight<'a>(&'a Outcome);

impl<'a> InFlight<'a> {
    fn begin(outcome: &'a Outcome) -> Self {
        outcome.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(outcome)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Remembers whether any attempt failed without knowing if the store applied it.
#[derive(Default)]
struct AmbiguousAttempts(AtomicBool);

impl AmbiguousAttempts {
    fn observe<T>(&self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if let Err(err) = &result {
            if err.is_ambiguous() {
                self.0.store(true, Ordering::SeqCst);
            }
        }
        result
    }

    fn seen(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Writes rows through a [`RemoteStore`], retrying transient failures.
///
/// Calls are independent and may run concurrently; the only shared state is
/// `loading` (any call in flight) and `error` (outcome of the last call).
#[derive(Clone)]
pub struct MutationGateway {
    store: Arc<dyn RemoteStore>,
    policy: RetryPolicy,
    ids: IdStrategy,
    outcome: Arc<Outcome>,
}

impl MutationGateway {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            policy: RetryPolicy::default(),
            ids: IdStrategy::default(),
            outcome: Arc::new(Outcome::default()),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_id_strategy(mut self, ids: IdStrategy) -> Self {
        self.ids = ids;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn loading(&self) -> bool {
        self.outcome.in_flight.load(Ordering::SeqCst) > 0
    }

    pub fn error(&self) -> Option<MutationError> {
        lock(&self.outcome.error).clone()
    }

    fn record<T>(&self, result: Result<T, MutationError>) -> Result<T, MutationError> {
        match &result {
            Ok(_) => *lock(&self.outcome.error) = None,
            Err(err) => {
                tracing::error!("{}", err);
                *lock(&self.outcome.error) = Some(err.clone());
            }
        }
        result
    }

    fn check_table(table: &str, operation: WriteKind) -> Result<(), MutationError> {
        validate_table_name(table).map_err(|e| MutationError::Invalid {
            operation,
            reason: e.to_string(),
        })
    }

    /// Inserts one record and returns the stored row.
    pub async fn insert(&self, table: &str, record: Row) -> Result<Row, MutationError> {
        let _in_flight = InFlight::begin(&self.outcome);
        let result = self.insert_inner(table, record).await;
        self.record(result)
    }

    async fn insert_inner(&self, table: &str, mut record: Row) -> Result<Row, MutationError> {
        Self::check_table(table, WriteKind::Insert)?;
        if self.ids == IdStrategy::Client && row_id(&record).is_none() {
            let id = uuid::Uuid::new_v4().to_string();
            record.insert(ID_FIELD.to_string(), Value::String(id));
        }
        let key = row_id(&record);

        let ambiguous = AmbiguousAttempts::default();
        let seen = &ambiguous;
        let result = retry_with_backoff(
            |_| {
                let attempt = self.store.insert(table, record.clone());
                async move { seen.observe(attempt.await) }
            },
            self.policy.max_attempts,
            self.policy.base_delay,
            |err: &StoreError| match key {
                Some(_) => err.is_transient(),
                None => err.is_transient() && !err.is_ambiguous(),
            },
        )
        .await;

        match result {
            Ok(row) => {
                tracing::info!(
                    "Inserted row {} into {}",
                    row_id(&row).unwrap_or_default(),
                    table
                );
                Ok(row)
            }
            // Only a retry after an unknown outcome can conflict with itself.
            Err(RetryFailure {
                error: StoreError::Conflict { .. },
                ..
            }) if key.is_some() && ambiguous.seen() => {
                let id = key.unwrap_or_default();
                tracing::info!(
                    "Insert of {} into {} conflicted on retry, reading back the committed row",
                    id,
                    table
                );
                self.read_back(table, &id).await
            }
            Err(failure) => Err(self.classify(WriteKind::Insert, table, key.is_some(), failure)),
        }
    }

    async fn read_back(&self, table: &str, id: &str) -> Result<Row, MutationError> {
        let query = Query::all().eq(ID_FIELD, id).limit(1);
        match self.store.select(table, &query).await {
            Ok(rows) => rows.into_iter().next().ok_or_else(|| MutationError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            }),
            Err(source) => Err(MutationError::Rejected {
                operation: WriteKind::Insert,
                table: table.to_string(),
                source,
            }),
        }
    }

    /// Applies `patch` to the row `id` and returns the updated row.
    pub async fn update(&self, table: &str, id: &str, patch: Row) -> Result<Row, MutationError> {
        let _in_flight = InFlight::begin(&self.outcome);
        let result = self.update_inner(table, id, patch).await;
        self.record(result)
    }

    async fn update_inner(&self, table: &str, id: &str, patch: Row) -> Result<Row, MutationError> {
        Self::check_table(table, WriteKind::Update)?;
        let result = retry_with_backoff(
            |_| self.store.update(table, id, patch.clone()),
            self.policy.max_attempts,
            self.policy.base_delay,
            StoreError::is_transient,
        )
        .await;

        match result {
            Ok(row) => {
                tracing::info!("Updated row {} in {}", id, table);
                Ok(row)
            }
            Err(failure) => Err(self.classify(WriteKind::Update, table, true, failure)),
        }
    }

    /// Deletes the row `id`. Succeeds if the store does not report the row
    /// missing.
    pub async fn remove(&self, table: &str, id: &str) -> Result<(), MutationError> {
        let _in_flight = InFlight::begin(&self.outcome);
        let result = self.remove_inner(table, id).await;
        self.record(result)
    }

    async fn remove_inner(&self, table: &str, id: &str) -> Result<(), MutationError> {
        Self::check_table(table, WriteKind::Delete)?;
        let ambiguous = AmbiguousAttempts::default();
        let seen = &ambiguous;
        let result = retry_with_backoff(
            |_| {
                let attempt = self.store.delete(table, id);
                async move { seen.observe(attempt.await) }
            },
            self.policy.max_attempts,
            self.policy.base_delay,
            StoreError::is_transient,
        )
        .await;

        match result {
            Ok(()) => {
                tracing::info!("Deleted row {} from {}", id, table);
                Ok(())
            }
            // An earlier attempt that timed out already removed the row.
            Err(RetryFailure {
                error: StoreError::NotFound { .. },
                ..
            }) if ambiguous.seen() => {
                tracing::info!("Deleted row {} from {} on an earlier attempt", id, table);
                Ok(())
            }
            Err(failure) => Err(self.classify(WriteKind::Delete, table, true, failure)),
        }
    }

    /// Deletes each id in order, stopping at the first failure.
    pub async fn remove_many<I, S>(&self, table: &str, ids: I) -> Result<usize, MutationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut removed = 0;
        for id in ids {
            self.remove(table, id.as_ref()).await?;
            removed += 1;
        }
        Ok(removed)
    }

    fn classify(
        &self,
        operation: WriteKind,
        table: &str,
        keyed: bool,
        failure: RetryFailure<StoreError>,
    ) -> MutationError {
        let RetryFailure {
            attempts,
            error,
            exhausted,
        } = failure;
        let table = table.to_string();
        match error {
            StoreError::NotFound { id, .. } => MutationError::NotFound { table, id },
            source if exhausted => MutationError::Exhausted {
                operation,
                table,
                attempts,
                source,
            },
            source if !keyed && source.is_ambiguous() => MutationError::Ambiguous {
                operation,
                table,
                source,
            },
            source => MutationError::Rejected {
                operation,
                table,
                source,
            },
        }
    }
}
