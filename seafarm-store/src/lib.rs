pub mod change;
pub mod error;
pub mod memory;
pub mod row;
pub mod store;
pub mod subscription;

pub use change::{ChangeEvent, ChangeKind, EventKinds};
pub use error::{StoreError, StoreResult};
pub use memory::{ChangeRecord, MemoryStore, MemoryStoreOptions, Operation, SelectHold};
pub use row::{row_id, Row, ID_FIELD};
pub use store::{Order, Query, RemoteStore, RowFilter, SubscribeRequest};
pub use subscription::{
    BroadcastMessage, PresenceEvent, PresenceState, Release, StoreNotice, Subscription,
    SubscriptionStatus,
};
