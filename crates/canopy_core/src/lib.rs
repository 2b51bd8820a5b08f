//! # Canopy Core
//!
//! Synchronous heart of the canopy realtime tree database.
//!
//! This crate provides:
//! - Paths and validated keys
//! - Immutable, structurally shared tree nodes with priorities
//! - Query ordering, range bounds and limits
//! - The sync tree: server cache plus pending-write overlay
//! - The event router: per-query views diffed into child and value events
//! - An optional persistence collaborator
//!
//! Nothing here performs I/O or blocks. The client engine serializes all
//! calls behind its own lock and fires the returned dispatches afterwards.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod events;
mod index;
mod key;
mod node;
mod path;
mod persistence;
mod push_id;
mod query;
mod server_values;
mod snapshot;
mod sync_tree;
mod value;
mod write;

pub use error::{CoreError, CoreResult};
pub use events::{
    CancelCallback, DataCallback, Dispatch, Event, EventRouter, EventType, ListenOptions,
    ListenerHandle, Registered,
};
pub use index::{compare_values, Bound, OrderBy};
pub use key::{key_compare, parse_int_key, ChildKey};
pub use node::{Node, MAX_DEPTH, PRIORITY_KEY, VALUE_KEY};
pub use path::{validate_key, Path, MAX_KEY_BYTES, SEPARATOR};
pub use persistence::{MemoryPersistence, PersistedState, PersistenceStore};
pub use push_id::{PushIdGenerator, PUSH_ID_LEN};
pub use query::{Limit, QueryKey, QueryParams, QuerySpec};
pub use server_values::{ServerValue, ServerValues, SERVER_VALUE_KEY};
pub use snapshot::DataSnapshot;
pub use sync_tree::{AckOutcome, SyncTree};
pub use value::{Leaf, Priority};
pub use write::{
    payload_with_priority, PendingWrite, WriteId, WriteKind, WriteOp, WriteRecord, WriteStatus,
};
