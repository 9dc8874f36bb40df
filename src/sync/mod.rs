//! Offline-first synchronization.
//!
//! Local mutations are applied to [`LocalStore`](crate::store::LocalStore)
//! immediately and recorded in a durable [`PendingQueue`]. A
//! [`SyncCoordinator`] pushes them to a [`RemoteStore`] when connectivity
//! allows, settles conflicts through a [`ConflictResolver`] and pulls remote
//! updates back by remote revision. Conflicts that need a person's decision
//! wait in a durable [`ReviewQueue`]. Progress is published as [`SyncState`]
//! on a `watch` channel.

pub mod coordinator;
pub mod queue;
pub mod remote;
pub mod resolver;
pub mod types;

pub use coordinator::SyncCoordinator;
pub use queue::{DurableList, PendingQueue, ReviewQueue};
pub use remote::{MemoryRemote, PushResult, RemoteRecord, RemoteStore};
pub use resolver::{ConflictResolver, Decision, LastWriterWins, Resolution};
pub use types::{
    Conflict, Operation, PendingChange, SkipReason, SyncOutcome, SyncPhase, SyncReport, SyncState,
};
