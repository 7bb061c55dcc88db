// ABOUTME: Table synchronization - sync hooks and realtime queries over change channels
// ABOUTME: Shared error type for load and subscription failures

pub mod collection;
pub mod hook;
pub mod query;

pub use collection::{Applied, Collection};
pub use hook::SyncHook;
pub use query::{QueryOptions, RealtimeQuery};

use seafarm_store::StoreError;
use thiserror::Error;

use crate::channel::ChannelError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("failed to load {table}: {source}")]
    Load {
        table: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to open channel for {table}: {source}")]
    Channel {
        table: String,
        #[source]
        source: ChannelError,
    },
    #[error("sync for {0} has been stopped")]
    Stopped(String),
}

impl SyncError {
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            SyncError::Load { source, .. } => Some(source),
            SyncError::Channel {
                source: ChannelError::Store(source),
                ..
            } => Some(source),
            _ => None,
        }
    }
}
