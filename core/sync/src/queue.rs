//! Durable operation queue.
//!
//! Local mutations are appended here and replayed against the remote store
//! when a sync pass drains the queue. Every append and removal is written
//! through to a [`QueueStore`] before the call returns, so a crash can at
//! worst replay an entry that was already confirmed remotely.

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use fitsync_common::{EntityType, PendingOperation, RecordId, Result};
use fitsync_storage::QueueStore;

/// Result of applying one queued operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The remote store confirmed the operation.
    Success,
    /// The operation may succeed later; it stays queued.
    Retryable(String),
    /// The operation can never succeed; it is dropped.
    Terminal(String),
}

/// An entry dropped during a drain because of a terminal failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub operation_id: String,
    pub label: String,
    pub reason: String,
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries confirmed and removed.
    pub applied: usize,
    /// Entries removed after a terminal failure.
    pub evicted: Vec<Eviction>,
    /// Entries kept after a retryable failure.
    pub retained: usize,
    /// Entries not attempted because an earlier entry of the same type was retained.
    pub skipped: usize,
}

impl DrainReport {
    /// Entries still queued because of this pass.
    pub fn left_queued(&self) -> usize {
        self.retained + self.skipped
    }
}

/// Ordered, persisted list of pending mutations.
///
/// Only the owning [`SyncCoordinator`](crate::SyncCoordinator) appends to or
/// drains the queue; other crates see it read-only.
///
/// ```compile_fail
/// use fitsync_common::PendingOperation;
/// use fitsync_sync::SyncCoordinator;
///
/// async fn bypass(coordinator: &SyncCoordinator, op: PendingOperation) {
///     coordinator.queue().enqueue(op).await.unwrap();
/// }
/// ```
///
/// ```compile_fail
/// use fitsync_sync::{Outcome, SyncCoordinator};
///
/// async fn bypass(coordinator: &SyncCoordinator) {
///     coordinator.queue().drain(|_| async { Outcome::Success }).await.unwrap();
/// }
/// ```
pub struct OperationQueue {
    store: Arc<dyn QueueStore>,
    entries: Mutex<Vec<PendingOperation>>,
    /// Held for the duration of a drain.
    draining: Mutex<()>,
}

impl OperationQueue {
    /// Load the persisted queue.
    ///
    /// # Errors
    /// - The store cannot be read or holds malformed entries
    pub(crate) async fn open(store: Arc<dyn QueueStore>) -> Result<Self> {
        let entries = store.load().await?;
        if !entries.is_empty() {
            info!("Restored {} pending operations", entries.len());
        }
        Ok(Self {
            store,
            entries: Mutex::new(entries),
            draining: Mutex::new(()),
        })
    }

    /// Append an operation and persist the queue.
    ///
    /// # Errors
    /// - `InvalidInput` if the operation is malformed
    /// - `Persistence` if the queue could not be written; the queue is left unchanged
    pub(crate) async fn enqueue(&self, op: PendingOperation) -> Result<()> {
        op.validate()?;
        let mut entries = self.entries.lock().await;
        let label = op.label();
        entries.push(op);

        if let Err(err) = self.store.store(&entries).await {
            entries.pop();
            warn!("Failed to persist {}: {}", label, err);
            return Err(err);
        }

        debug!("Enqueued {} ({} pending)", label, entries.len());
        Ok(())
    }

    /// Number of pending operations.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Snapshot of the pending operations in FIFO order.
    pub async fn operations(&self) -> Vec<PendingOperation> {
        self.entries.lock().await.clone()
    }

    /// Ids of records of `entity_type` with a pending operation.
    pub async fn pending_record_ids(&self, entity_type: &EntityType) -> BTreeSet<RecordId> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|op| &op.entity_type == entity_type)
            .map(|op| op.record_id.clone())
            .collect()
    }

    /// Run the store's maintenance hook.
    pub async fn compact(&self) -> Result<()> {
        let _entries = self.entries.lock().await;
        self.store.compact().await
    }

    /// Apply every pending operation in FIFO order.
    ///
    /// `Success` and `Terminal` remove the entry and persist the removal
    /// before the next entry is attempted. `Retryable` keeps the entry, and
    /// later entries of the same entity type are left untouched for the rest
    /// of the pass. Operations enqueued while a drain is running wait for the
    /// next pass.
    ///
    /// # Errors
    /// - `Persistence` if a removal could not be written; the entry stays queued
    pub(crate) async fn drain<F, Fut>(&self, mut apply: F) -> Result<DrainReport>
    where
        F: FnMut(PendingOperation) -> Fut,
        Fut: Future<Output = Outcome>,
    {
        let _draining = self.draining.lock().await;
        let snapshot = self.operations().await;
        let mut report = DrainReport::default();
        let mut blocked: HashSet<EntityType> = HashSet::new();

        for op in snapshot {
            if blocked.contains(&op.entity_type) {
                report.skipped += 1;
                continue;
            }

            let id = op.id.clone();
            let label = op.label();
            match apply(op.clone()).await {
                Outcome::Success => {
                    self.remove(&id).await?;
                    report.applied += 1;
                }
                Outcome::Terminal(reason) => {
                    warn!("Dropping {}: {}", label, reason);
                    self.remove(&id).await?;
                    report.evicted.push(Eviction {
                        operation_id: id,
                        label,
                        reason,
                    });
                }
                Outcome::Retryable(reason) => {
                    debug!("Keeping {} for a later pass: {}", label, reason);
                    blocked.insert(op.entity_type);
                    report.retained += 1;
                }
            }
        }

        if report.left_queued() > 0 || !report.evicted.is_empty() {
            info!(
                "Drain finished: {} applied, {} evicted, {} still queued",
                report.applied,
                report.evicted.len(),
                report.left_queued()
            );
        }
        Ok(report)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let Some(position) = entries.iter().position(|op| op.id == id) else {
            return Ok(());
        };

        let removed = entries.remove(position);
        if let Err(err) = self.store.store(&entries).await {
            entries.insert(position, removed);
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitsync_common::{Error, OperationKind, Record};
    use fitsync_storage::MemoryQueueStore;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn save(entity: &str, id: &str) -> PendingOperation {
        PendingOperation::save(Record::new(
            EntityType::new(entity).unwrap(),
            RecordId::new(id).unwrap(),
        ))
    }

    async fn queue_with(store: Arc<MemoryQueueStore>, ops: &[PendingOperation]) -> OperationQueue {
        let queue = OperationQueue::open(store).await.unwrap();
        for op in ops {
            queue.enqueue(op.clone()).await.unwrap();
        }
        queue
    }

    #[tokio::test]
    async fn test_enqueue_persists_before_returning() {
        let store = Arc::new(MemoryQueueStore::new());
        let queue = queue_with(store.clone(), &[save("goal", "a"), save("meal", "b")]).await;

        assert_eq!(queue.len().await, 2);
        assert_eq!(store.persisted(), queue.operations().await);
    }

    #[tokio::test]
    async fn test_enqueue_rolls_back_on_persistence_failure() {
        let store = Arc::new(MemoryQueueStore::new());
        let queue = queue_with(store.clone(), &[save("goal", "a")]).await;

        store.fail_writes(1);
        let result = queue.enqueue(save("goal", "b")).await;

        assert!(matches!(result, Err(Error::Persistence(_))));
        assert_eq!(queue.len().await, 1);
        assert_eq!(store.persisted().len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_malformed_operation() {
        let queue = OperationQueue::open(Arc::new(MemoryQueueStore::new()))
            .await
            .unwrap();
        let mut op = save("goal", "a");
        op.kind = OperationKind::Delete;

        assert!(queue.enqueue(op).await.is_err());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_drain_removes_success_and_terminal() {
        let store = Arc::new(MemoryQueueStore::new());
        let ops = [save("goal", "a"), save("goal", "b"), save("goal", "c")];
        let queue = queue_with(store.clone(), &ops).await;

        let report = queue
            .drain(|op| async move {
                match op.record_id.as_str() {
                    "b" => Outcome::Terminal("schema mismatch".to_string()),
                    _ => Outcome::Success,
                }
            })
            .await
            .unwrap();

        assert_eq!(report.applied, 2);
        assert_eq!(report.evicted.len(), 1);
        assert_eq!(report.evicted[0].reason, "schema mismatch");
        assert!(queue.is_empty().await);
        assert!(store.persisted().is_empty());
    }

    #[tokio::test]
    async fn test_retryable_blocks_same_type_only() {
        let ops = [
            save("goal", "g1"),
            save("meal", "m1"),
            save("goal", "g2"),
            save("meal", "m2"),
        ];
        let queue = queue_with(Arc::new(MemoryQueueStore::new()), &ops).await;

        let mut attempted = Vec::new();
        let report = queue
            .drain(|op| {
                attempted.push(op.record_id.to_string());
                async move {
                    if op.record_id.as_str() == "g1" {
                        Outcome::Retryable("throttled".to_string())
                    } else {
                        Outcome::Success
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(attempted, vec!["g1", "m1", "m2"]);
        assert_eq!(report.retained, 1);
        assert_eq!(report.skipped, 1);
        let remaining: Vec<_> = queue
            .operations()
            .await
            .into_iter()
            .map(|op| op.record_id.to_string())
            .collect();
        assert_eq!(remaining, vec!["g1", "g2"]);
    }

    #[tokio::test]
    async fn test_failed_removal_keeps_entry() {
        let store = Arc::new(MemoryQueueStore::new());
        let queue = queue_with(store.clone(), &[save("goal", "a"), save("goal", "b")]).await;

        store.fail_writes(1);
        let result = queue.drain(|_| async { Outcome::Success }).await;

        assert!(matches!(result, Err(Error::Persistence(_))));
        assert_eq!(queue.len().await, 2);
        assert_eq!(store.persisted().len(), 2);
    }

    #[tokio::test]
    async fn test_reopen_restores_entries() {
        let store = Arc::new(MemoryQueueStore::new());
        let ops = [save("goal", "a"), save("meal", "b")];
        {
            let _queue = queue_with(store.clone(), &ops).await;
        }

        let reopened = OperationQueue::open(store).await.unwrap();
        assert_eq!(reopened.operations().await, ops.to_vec());
    }

    fn arb_plan() -> impl Strategy<Value = Vec<(u8, u8)>> {
        // (entity type index, outcome index)
        prop::collection::vec((0u8..3, 0u8..3), 0..24)
    }

    proptest! {
        #[test]
        fn prop_drain_preserves_per_type_order(plan in arb_plan()) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let types = ["goal", "meal", "workout"];
                let ops: Vec<PendingOperation> = plan
                    .iter()
                    .enumerate()
                    .map(|(i, (t, _))| save(types[*t as usize], &format!("r{}", i)))
                    .collect();
                let outcomes: HashMap<String, u8> = ops
                    .iter()
                    .zip(&plan)
                    .map(|(op, (_, o))| (op.id.clone(), *o))
                    .collect();

                let queue = queue_with(Arc::new(MemoryQueueStore::new()), &ops).await;
                let mut attempted: Vec<PendingOperation> = Vec::new();
                queue
                    .drain(|op| {
                        attempted.push(op.clone());
                        let outcome = match outcomes[&op.id] {
                            0 => Outcome::Success,
                            1 => Outcome::Terminal("bad".to_string()),
                            _ => Outcome::Retryable("later".to_string()),
                        };
                        async move { outcome }
                    })
                    .await
                    .unwrap();

                // Attempts follow enqueue order.
                let positions: Vec<usize> = attempted
                    .iter()
                    .map(|a| ops.iter().position(|o| o.id == a.id).unwrap())
                    .collect();
                assert!(positions.windows(2).all(|w| w[0] < w[1]));

                // Nothing of a type is attempted after that type was retained.
                let mut blocked = HashSet::new();
                for op in &attempted {
                    assert!(!blocked.contains(&op.entity_type));
                    if outcomes[&op.id] == 2 {
                        blocked.insert(op.entity_type.clone());
                    }
                }

                // Remaining entries keep their relative order.
                let remaining = queue.operations().await;
                let expected: Vec<PendingOperation> = ops
                    .iter()
                    .filter(|op| remaining.iter().any(|r| r.id == op.id))
                    .cloned()
                    .collect();
                assert_eq!(remaining, expected);

                // Every entry left behind was retained or blocked.
                for op in &remaining {
                    let was_attempted = attempted.iter().any(|a| a.id == op.id);
                    assert!(!was_attempted || outcomes[&op.id] == 2);
                }
            });
        }
    }
}
