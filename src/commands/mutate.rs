// ABOUTME: Write commands - insert, update and delete rows through the mutation gateway
// ABOUTME: Prints the stored representation returned by the store

use anyhow::{Context, Result};
use seafarm_store::Row;

use super::parse_row;
use crate::mutation::MutationGateway;

fn print_row(row: &Row) -> Result<()> {
    let text = serde_json::to_string_pretty(row).context("Failed to render row")?;
    println!("{}", text);
    Ok(())
}

pub async fn insert(gateway: &MutationGateway, table: &str, json: &str) -> Result<()> {
    let record = parse_row(json)?;
    let row = gateway
        .insert(table, record)
        .await
        .with_context(|| format!("Failed to insert into {}", table))?;
    print_row(&row)
}

pub async fn update(gateway: &MutationGateway, table: &str, id: &str, json: &str) -> Result<()> {
    let patch = parse_row(json)?;
    let row = gateway
        .update(table, id, patch)
        .await
        .with_context(|| format!("Failed to update {} in {}", id, table))?;
    print_row(&row)
}

pub async fn delete(gateway: &MutationGateway, table: &str, ids: &[String]) -> Result<()> {
    let removed = gateway
        .remove_many(table, ids)
        .await
        .with_context(|| format!("Failed to delete from {}", table))?;
    println!("Deleted {} row(s) from {}", removed, table);
    Ok(())
}
