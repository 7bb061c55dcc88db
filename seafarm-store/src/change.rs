use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::row::{row_id, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }

    pub fn parse(value: &str) -> StoreResult<Self> {
        match value.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(ChangeKind::Insert),
            "UPDATE" => Ok(ChangeKind::Update),
            "DELETE" => Ok(ChangeKind::Delete),
            other => Err(StoreError::Malformed(format!("unknown change kind: {other}"))),
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of change kinds a subscription listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventKinds {
    insert: bool,
    update: bool,
    delete: bool,
}

impl Default for EventKinds {
    fn default() -> Self {
        Self::all()
    }
}

impl EventKinds {
    pub fn all() -> Self {
        Self {
            insert: true,
            update: true,
            delete: true,
        }
    }

    pub fn only(kind: ChangeKind) -> Self {
        Self::from_kinds(&[kind])
    }

    pub fn from_kinds(kinds: &[ChangeKind]) -> Self {
        if kinds.is_empty() {
            return Self::all();
        }
        Self {
            insert: kinds.contains(&ChangeKind::Insert),
            update: kinds.contains(&ChangeKind::Update),
            delete: kinds.contains(&ChangeKind::Delete),
        }
    }

    pub fn contains(&self, kind: ChangeKind) -> bool {
        match kind {
            ChangeKind::Insert => self.insert,
            ChangeKind::Update => self.update,
            ChangeKind::Delete => self.delete,
        }
    }

    pub fn is_all(&self) -> bool {
        self.insert && self.update && self.delete
    }

    /// Wire form used by realtime joins: `*` or a single kind.
    ///
    /// A two-kind subset has no single wire value, so it widens to `*` and
    /// relies on [`EventKinds::contains`] being applied on receipt.
    pub fn wire_event(&self) -> &'static str {
        match (self.insert, self.update, self.delete) {
            (true, false, false) => "INSERT",
            (false, true, false) => "UPDATE",
            (false, false, true) => "DELETE",
            _ => "*",
        }
    }
}

/// A row-level change delivered over a table channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Insert { id: String, row: Row },
    Update { id: String, row: Row },
    Delete { id: String },
}

impl ChangeEvent {
    /// Build an INSERT or UPDATE event; the row must carry an `id`.
    pub fn from_row(kind: ChangeKind, row: Row) -> StoreResult<Self> {
        let id = row_id(&row)
            .ok_or_else(|| StoreError::Malformed(format!("{kind} event row has no id")))?;
        match kind {
            ChangeKind::Insert => Ok(ChangeEvent::Insert { id, row }),
            ChangeKind::Update => Ok(ChangeEvent::Update { id, row }),
            ChangeKind::Delete => Ok(ChangeEvent::Delete { id }),
        }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        ChangeEvent::Delete { id: id.into() }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Insert { .. } => ChangeKind::Insert,
            ChangeEvent::Update { .. } => ChangeKind::Update,
            ChangeEvent::Delete { .. } => ChangeKind::Delete,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ChangeEvent::Insert { id, .. }
            | ChangeEvent::Update { id, .. }
            | ChangeEvent::Delete { id } => id,
        }
    }

    pub fn row(&self) -> Option<&Row> {
        match self {
            ChangeEvent::Insert { row, .. } | ChangeEvent::Update { row, .. } => Some(row),
            ChangeEvent::Delete { .. } => None,
        }
    }
}
