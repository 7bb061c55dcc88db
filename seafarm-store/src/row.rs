use serde_json::{Map, Value};

use crate::error::{StoreError, StoreResult};

/// Name of the identifier column every synced table carries.
pub const ID_FIELD: &str = "id";

/// One record of a remote table, keyed by field name.
pub type Row = Map<String, Value>;

/// Returns the row identifier as a string.
///
/// Numeric identifiers are rendered with their JSON representation so that
/// tables keyed by integers still reconcile by `id`.
pub fn row_id(row: &Row) -> Option<String> {
    match row.get(ID_FIELD)? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn row_from_value(value: Value) -> StoreResult<Row> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Malformed(format!(
            "expected a JSON object row, got {other}"
        ))),
    }
}
