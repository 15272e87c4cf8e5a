//! fitsync sync engine
//!
//! Keeps the on-device store and the remote record store consistent under
//! intermittent connectivity:
//! - Durable FIFO queue of local mutations, replayed per entity type in order
//! - Batch executor that chunks saves and retries transient remote failures
//! - Full and incremental (change-token based) sync passes
//! - Last-write-wins reconciliation of fetched records
//! - Periodic, foreground and manual triggers

pub mod batch;
pub mod engine;
pub mod queue;
pub mod reconcile;
pub mod retry;
pub mod state;
pub mod triggers;

// Re-export main types
pub use batch::{BatchConfig, BatchError, BatchExecutor, FetchResult};
pub use engine::{SyncConfig, SyncCoordinator, SyncMode, SyncOutcome, SyncReport};
pub use queue::{DrainReport, Eviction, OperationQueue, Outcome};
pub use reconcile::{plan_delta, plan_full, remote_wins, MergePlan};
pub use retry::{RetryConfig, RetryExecutor};
pub use state::{AccountCause, SyncFailure, SyncProgress, SyncState, SyncStatus};
pub use triggers::{SyncTriggers, Trigger, TriggerLoop};
