// ABOUTME: Id-keyed local copy of a remote table with per-row arrival sequences
// ABOUTME: Applies change events and merges fetched snapshots without losing newer events

use std::collections::{HashMap, HashSet};

use seafarm_store::{row_id, ChangeEvent, Row};

use crate::channel::SequencedChange;

/// Outcome of applying one change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Updated,
    Deleted,
    /// Insert for an id already present; the existing row is kept.
    Duplicate,
    /// Update or delete for an id not present.
    Missing,
    /// Event older than what is already applied for this id.
    Stale,
}

impl Applied {
    pub fn changed(self) -> bool {
        matches!(self, Applied::Inserted | Applied::Updated | Applied::Deleted)
    }
}

/// Ordered rows plus the sequence at which each id was last touched.
///
/// Rows seeded or taken from a snapshot carry the snapshot's ticket; rows
/// touched by events carry the event's sequence. While a snapshot is in
/// flight, deletes leave a tombstone so the snapshot cannot resurrect the row,
/// and updates for rows not yet present are parked until the snapshot brings
/// the row in. Both are discarded once no snapshot is pending.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    rows: Vec<Row>,
    versions: HashMap<String, u64>,
    tombstones: HashMap<String, u64>,
    parked: HashMap<String, (u64, Row)>,
    pending_snapshots: usize,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a collection from initial rows. Rows without an id are dropped,
    /// and of rows sharing an id only the first is kept.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let mut collection = Self::new();
        for row in rows {
            let Some(id) = row_id(&row) else {
                tracing::warn!("Dropping seeded row without an id");
                continue;
            };
            if collection.versions.contains_key(&id) {
                continue;
            }
            collection.versions.insert(id, 0);
            collection.rows.push(row);
        }
        collection
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn to_vec(&self) -> Vec<Row> {
        self.rows.clone()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Row> {
        self.position(id).map(|index| &self.rows[index])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.rows
            .iter()
            .position(|row| row_id(row).as_deref() == Some(id))
    }

    /// Marks a fetch as started. Must be paired with [`Self::merge_snapshot`]
    /// or [`Self::abandon_snapshot`].
    pub fn begin_snapshot(&mut self) {
        self.pending_snapshots += 1;
    }

    /// Ends a fetch that produced no rows to merge.
    pub fn abandon_snapshot(&mut self) {
        self.end_snapshot();
    }

    fn end_snapshot(&mut self) {
        self.pending_snapshots = self.pending_snapshots.saturating_sub(1);
        if self.pending_snapshots == 0 {
            self.tombstones.clear();
            self.parked.clear();
        }
    }

    fn snapshot_pending(&self) -> bool {
        self.pending_snapshots > 0
    }

    /// Tombstones and parked updates held for in-flight snapshots.
    pub fn held_for_snapshot(&self) -> usize {
        self.tombstones.len() + self.parked.len()
    }

    fn last_touched(&self, id: &str) -> Option<u64> {
        let version = self.versions.get(id).copied();
        let tombstone = self.tombstones.get(id).copied();
        version.max(tombstone)
    }

    pub fn apply(&mut self, change: &SequencedChange) -> Applied {
        let id = change.event.id().to_string();
        if let Some(last) = self.last_touched(&id) {
            if last > 0 && change.sequence <= last {
                return Applied::Stale;
            }
        }

        match &change.event {
            ChangeEvent::Insert { row, .. } => {
                if self.contains(&id) {
                    return Applied::Duplicate;
                }
                self.rows.push(row.clone());
                self.tombstones.remove(&id);
                self.parked.remove(&id);
                self.versions.insert(id, change.sequence);
                Applied::Inserted
            }
            ChangeEvent::Update { row, .. } => match self.position(&id) {
                Some(index) => {
                    self.rows[index] = row.clone();
                    self.versions.insert(id, change.sequence);
                    Applied::Updated
                }
                None => {
                    if self.snapshot_pending() {
                        self.parked.insert(id, (change.sequence, row.clone()));
                    }
                    Applied::Missing
                }
            },
            ChangeEvent::Delete { .. } => {
                if self.snapshot_pending() {
                    self.tombstones.insert(id.clone(), change.sequence);
                }
                self.versions.remove(&id);
                self.parked.remove(&id);
                match self.position(&id) {
                    Some(index) => {
                        self.rows.remove(index);
                        Applied::Deleted
                    }
                    None => Applied::Missing,
                }
            }
        }
    }

    /// Replaces the contents with `snapshot`, a fetch issued at `ticket`,
    /// and ends that fetch.
    ///
    /// Rows touched by events stamped after `ticket` keep their local state,
    /// and rows deleted after `ticket` stay deleted. An empty snapshot leaves
    /// the rows untouched and returns false.
    pub fn merge_snapshot(&mut self, snapshot: Vec<Row>, ticket: u64) -> bool {
        if snapshot.is_empty() {
            self.end_snapshot();
            return false;
        }

        let mut merged = Vec::with_capacity(snapshot.len());
        let mut versions = HashMap::with_capacity(snapshot.len());
        let mut seen = HashSet::new();

        for row in snapshot {
            let Some(id) = row_id(&row) else {
                tracing::warn!("Ignoring fetched row without an id");
                continue;
            };
            if !seen.insert(id.clone()) {
                continue;
            }
            if self.tombstones.get(&id).is_some_and(|&seq| seq > ticket) {
                continue;
            }
            if let Some((seq, parked)) = self.parked.get(&id).filter(|(seq, _)| *seq > ticket) {
                merged.push(parked.clone());
                versions.insert(id, *seq);
                continue;
            }
            match self.versions.get(&id) {
                Some(&seq) if seq > ticket => {
                    if let Some(local) = self.get(&id) {
                        merged.push(local.clone());
                    }
                    versions.insert(id, seq);
                }
                _ => {
                    merged.push(row);
                    versions.insert(id, ticket);
                }
            }
        }

        for row in &self.rows {
            let Some(id) = row_id(row) else { continue };
            if seen.contains(&id) {
                continue;
            }
            if let Some(&seq) = self.versions.get(&id) {
                if seq > ticket {
                    merged.push(row.clone());
                    versions.insert(id, seq);
                }
            }
        }

        self.tombstones.retain(|_, seq| *seq > ticket);
        self.parked.retain(|_, (seq, _)| *seq > ticket);
        self.rows = merged;
        self.versions = versions;
        self.end_snapshot();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seafarm_store::row::row_from_value;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        row_from_value(value).unwrap()
    }

    fn change(sequence: u64, event: ChangeEvent) -> SequencedChange {
        SequencedChange {
            sequence,
            table: "sites".to_string(),
            event,
        }
    }

    fn insert(sequence: u64, value: serde_json::Value) -> SequencedChange {
        let row = row(value);
        change(sequence, ChangeEvent::Insert { id: row_id(&row).unwrap(), row })
    }

    fn update(sequence: u64, value: serde_json::Value) -> SequencedChange {
        let row = row(value);
        change(sequence, ChangeEvent::Update { id: row_id(&row).unwrap(), row })
    }

    fn ids(collection: &Collection) -> Vec<String> {
        collection.rows().iter().filter_map(row_id).collect()
    }

    #[test]
    fn duplicate_insert_keeps_first_row() {
        let mut collection = Collection::new();
        assert_eq!(collection.apply(&insert(1, json!({"id": "x", "v": 1}))), Applied::Inserted);
        assert_eq!(collection.apply(&insert(2, json!({"id": "x", "v": 2}))), Applied::Duplicate);
        assert_eq!(collection.len(), 1);
        assert_eq!(collection.get("x").unwrap()["v"], json!(1));
    }

    #[test]
    fn update_and_delete_of_missing_rows_are_noops() {
        let mut collection = Collection::new();
        assert_eq!(collection.apply(&update(1, json!({"id": "x"}))), Applied::Missing);
        assert_eq!(
            collection.apply(&change(2, ChangeEvent::delete("x"))),
            Applied::Missing
        );
        assert!(collection.is_empty());
    }

    #[test]
    fn update_replaces_in_place() {
        let mut collection =
            Collection::from_rows(vec![row(json!({"id": "a"})), row(json!({"id": "b"}))]);
        collection.apply(&update(1, json!({"id": "a", "name": "renamed"})));
        assert_eq!(ids(&collection), vec!["a", "b"]);
        assert_eq!(collection.get("a").unwrap()["name"], json!("renamed"));
    }

    #[test]
    fn seeded_rows_are_deduplicated() {
        let collection = Collection::from_rows(vec![
            row(json!({"id": "a", "v": 1})),
            row(json!({"id": "a", "v": 2})),
            row(json!({"name": "no id"})),
        ]);
        assert_eq!(collection.len(), 1);
        assert_eq!(collection.get("a").unwrap()["v"], json!(1));
    }

    #[test]
    fn empty_snapshot_keeps_local_rows() {
        let mut collection = Collection::from_rows(vec![row(json!({"id": "p"}))]);
        assert!(!collection.merge_snapshot(Vec::new(), 0));
        assert_eq!(ids(&collection), vec!["p"]);
    }

    #[test]
    fn snapshot_replaces_rows_older_than_ticket() {
        let mut collection = Collection::from_rows(vec![row(json!({"id": "old"}))]);
        collection.apply(&insert(1, json!({"id": "a", "v": 0})));
        assert!(collection.merge_snapshot(
            vec![row(json!({"id": "a", "v": 1})), row(json!({"id": "b"}))],
            1
        ));
        assert_eq!(ids(&collection), vec!["a", "b"]);
        assert_eq!(collection.get("a").unwrap()["v"], json!(1));
    }

    #[test]
    fn events_after_ticket_survive_snapshot() {
        let mut collection = Collection::new();
        collection.begin_snapshot();
        collection.apply(&insert(5, json!({"id": "x"})));
        collection.apply(&update(6, json!({"id": "a", "v": 9})));
        collection.apply(&change(7, ChangeEvent::delete("b")));

        collection.merge_snapshot(
            vec![
                row(json!({"id": "a", "v": 1})),
                row(json!({"id": "b"})),
            ],
            4,
        );
        assert_eq!(ids(&collection), vec!["a", "x"]);
        assert_eq!(collection.get("a").unwrap()["v"], json!(9));
        assert_eq!(collection.held_for_snapshot(), 0);
    }

    #[test]
    fn parked_update_older_than_ticket_is_dropped() {
        let mut collection = Collection::new();
        collection.begin_snapshot();
        collection.apply(&update(2, json!({"id": "a", "v": 9})));
        collection.merge_snapshot(vec![row(json!({"id": "a", "v": 1}))], 3);
        assert_eq!(collection.get("a").unwrap()["v"], json!(1));
    }

    #[test]
    fn update_after_ticket_wins_over_snapshot_row() {
        let mut collection = Collection::from_rows(vec![row(json!({"id": "a", "v": 0}))]);
        collection.apply(&update(3, json!({"id": "a", "v": 2})));
        collection.merge_snapshot(vec![row(json!({"id": "a", "v": 1}))], 2);
        assert_eq!(collection.get("a").unwrap()["v"], json!(2));
    }

    #[test]
    fn nothing_is_held_once_loaded() {
        let mut collection = Collection::new();
        collection.begin_snapshot();
        collection.merge_snapshot(vec![row(json!({"id": "keep"}))], 1);

        for n in 0..1000u64 {
            let id = format!("r{}", n);
            collection.apply(&insert(10 + 3 * n, json!({"id": id})));
            collection.apply(&change(11 + 3 * n, ChangeEvent::delete(id.as_str())));
            collection.apply(&update(12 + 3 * n, json!({"id": format!("absent{}", n)})));
        }

        assert_eq!(ids(&collection), vec!["keep"]);
        assert_eq!(collection.held_for_snapshot(), 0);
    }

    #[test]
    fn overlapping_snapshots_keep_later_events() {
        let mut collection = Collection::new();
        collection.begin_snapshot();
        collection.begin_snapshot();
        collection.apply(&change(5, ChangeEvent::delete("a")));
        collection.apply(&update(6, json!({"id": "b", "v": 2})));

        collection.merge_snapshot(vec![row(json!({"id": "c"}))], 2);
        assert_eq!(collection.held_for_snapshot(), 2);

        collection.merge_snapshot(
            vec![row(json!({"id": "a"})), row(json!({"id": "b", "v": 1}))],
            4,
        );
        assert_eq!(ids(&collection), vec!["b"]);
        assert_eq!(collection.get("b").unwrap()["v"], json!(2));
        assert_eq!(collection.held_for_snapshot(), 0);
    }

    #[test]
    fn abandoned_snapshot_releases_tombstones() {
        let mut collection = Collection::new();
        collection.begin_snapshot();
        collection.apply(&change(3, ChangeEvent::delete("a")));
        assert_eq!(collection.held_for_snapshot(), 1);

        collection.abandon_snapshot();
        assert_eq!(collection.held_for_snapshot(), 0);
    }

    #[test]
    fn stale_events_are_ignored() {
        let mut collection = Collection::new();
        collection.apply(&insert(4, json!({"id": "a", "v": 1})));
        assert_eq!(collection.apply(&update(3, json!({"id": "a", "v": 0}))), Applied::Stale);
        assert_eq!(collection.get("a").unwrap()["v"], json!(1));
    }
}
