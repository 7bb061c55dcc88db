// ABOUTME: Watch command - mirrors tables locally and reports every reconciled change
// ABOUTME: Runs until Ctrl-C, then stops each sync hook and closes its channel

use anyhow::{bail, Result};
use std::future::Future;
use std::sync::Arc;

use crate::channel::ChannelManager;
use crate::sync::SyncHook;
use crate::utils::{is_known_table, validate_table_name};

pub async fn watch(channels: ChannelManager, tables: Vec<String>) -> Result<()> {
    watch_until(channels, tables, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
        }
    })
    .await?;
    Ok(())
}

/// Follows `tables` until `shutdown` completes and returns the final row counts.
pub async fn watch_until<F>(
    channels: ChannelManager,
    tables: Vec<String>,
    shutdown: F,
) -> Result<Vec<(String, usize)>>
where
    F: Future<Output = ()>,
{
    if tables.is_empty() {
        bail!("No tables to watch. Pass --table or list tables in the config file");
    }
    for table in &tables {
        validate_table_name(table)?;
        if !is_known_table(table) {
            tracing::warn!("{} is not a known farm table", table);
        }
    }

    let mut hooks = Vec::with_capacity(tables.len());
    let mut reporters = Vec::with_capacity(tables.len());
    for table in tables {
        let hook = Arc::new(SyncHook::new(channels.clone(), table.clone()));
        if let Err(e) = hook.start().await {
            tracing::warn!("{} (will keep following changes)", e);
        }

        let mut changes = hook.changes();
        let reporter = Arc::clone(&hook);
        reporters.push(tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                if reporter.is_stopped() {
                    break;
                }
                tracing::info!(
                    "{}: {} rows, channel {}",
                    reporter.table(),
                    reporter.data().len(),
                    reporter.status()
                );
            }
        }));
        hooks.push(hook);
    }

    tracing::info!("Watching {} table(s), press Ctrl-C to stop", hooks.len());
    shutdown.await;

    let mut counts = Vec::with_capacity(hooks.len());
    for hook in &hooks {
        hook.stop();
        counts.push((hook.table().to_string(), hook.data().len()));
    }
    for reporter in reporters {
        reporter.abort();
    }
    for (table, count) in &counts {
        println!("{}: {} rows", table, count);
    }
    Ok(counts)
}
