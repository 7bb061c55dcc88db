// ABOUTME: Command implementations for the seafarm-sync CLI
// ABOUTME: Exports watch, write, health, presence and project commands

pub mod health;
pub mod mutate;
pub mod presence;
pub mod project;
pub mod watch;

pub use health::health;
pub use mutate::{delete, insert, update};
pub use presence::presence;
pub use project::command as project;
pub use watch::watch;

use anyhow::{Context, Result};
use seafarm_store::{row::row_from_value, Row};

/// Parses a `--json` argument into a row object.
pub(crate) fn parse_row(json: &str) -> Result<Row> {
    let value: serde_json::Value =
        serde_json::from_str(json).context("--json must be valid JSON")?;
    Ok(row_from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_row() {
        let row = parse_row(r#"{"name": "Site A", "capacity": 40}"#).unwrap();
        assert_eq!(row["name"], serde_json::json!("Site A"));
        assert!(parse_row("[1, 2]").is_err());
        assert!(parse_row("{not json").is_err());
    }
}
