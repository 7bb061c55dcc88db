// ABOUTME: Health command - probes the remote store with a one-row read
// ABOUTME: Prints ok or unreachable and fails the process when unreachable

use anyhow::{bail, Result};
use seafarm_store::RemoteStore;
use std::sync::Arc;

use crate::utils::HEALTH_PROBE_TABLE;

pub async fn health(store: Arc<dyn RemoteStore>) -> Result<()> {
    tracing::info!("Checking connection by reading from {}", HEALTH_PROBE_TABLE);
    if store.health_check(HEALTH_PROBE_TABLE).await {
        println!("ok");
        Ok(())
    } else {
        println!("unreachable");
        bail!("Remote store is unreachable");
    }
}
