//! Logical translation session layered over the connection
//!
//! A session outlives individual sockets: it can stay paused across a
//! reconnect and is restorable from its persisted snapshot.
//!
//! # Lifecycle
//!
//! ```text
//! idle ─▶ creating ─▶ active ◀──▶ paused
//!                       │    (resuming)
//!                       ▼
//!                  terminating ─▶ terminated
//!
//! any live state ──fail──▶ error ──terminate──▶ terminated
//! ```

mod manager;
mod state;
mod store;

pub use manager::{SessionEvent, SessionManager, SubscriptionId};
pub use state::{reduce, SessionError, SessionInfo, SessionOp, SessionState, SessionStats};
pub use store::{
    FileSnapshotStore, MemorySnapshotStore, Snapshot, SnapshotStore, StoreError, SNAPSHOT_VERSION,
};
pub(crate) use store::write_atomic;
