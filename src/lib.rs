// ABOUTME: Library root for seafarm-sync - realtime table sync over a hosted store
// ABOUTME: Exposes channels, sync hooks, the mutation gateway, presence and the store backend

pub mod channel;
pub mod commands;
pub mod config;
pub mod mutation;
pub mod presence;
pub mod state;
pub mod supabase;
pub mod sync;
pub mod utils;

pub use channel::{
    ChannelError, ChannelHandle, ChannelHandlers, ChannelManager, ChannelMessage, ChannelSpec,
    ChannelStatus, ChannelStream, SequencedChange,
};
pub use config::SyncConfig;
pub use mutation::{IdStrategy, MutationError, MutationGateway, RetryPolicy, WriteKind};
pub use presence::{BroadcastChannel, PresenceChannel};
pub use supabase::{SupabaseSettings, SupabaseStore};
pub use sync::{QueryOptions, RealtimeQuery, SyncError, SyncHook};

pub use seafarm_store::{
    ChangeEvent, ChangeKind, EventKinds, MemoryStore, Query, RemoteStore, Row, RowFilter,
    StoreError, StoreResult,
};
