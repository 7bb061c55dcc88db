// ABOUTME: Presence command - joins a presence channel and prints the peer map as it changes
// ABOUTME: Optionally tracks a payload for this peer before listening

use anyhow::{Context, Result};
use seafarm_store::RemoteStore;
use std::sync::Arc;

use crate::presence::PresenceChannel;

pub async fn presence(
    store: Arc<dyn RemoteStore>,
    channel: &str,
    key: &str,
    json: Option<&str>,
) -> Result<()> {
    let room = PresenceChannel::join(store, channel, key)
        .await
        .with_context(|| format!("Failed to join presence channel {}", channel))?;

    if let Some(json) = json {
        let payload: serde_json::Value =
            serde_json::from_str(json).context("--json must be valid JSON")?;
        room.track(payload)
            .await
            .with_context(|| format!("Failed to track presence on {}", channel))?;
    }

    let mut changes = room.changes();
    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let peers = room.peers();
                let rendered = serde_json::to_string(&peers).context("Failed to render peers")?;
                println!("{} peer(s): {}", peers.len(), rendered);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    room.leave();
    Ok(())
}
