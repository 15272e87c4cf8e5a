//! Sync coordinator that orchestrates sync passes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fitsync_common::duration::millis;
use fitsync_common::{EntityType, Error, PendingOperation};
use fitsync_storage::{LocalStore, QueueStore, RecordQuery, RemoteStore, TokenStore};

use crate::batch::{BatchConfig, BatchExecutor, FetchResult};
use crate::queue::{DrainReport, OperationQueue, Outcome};
use crate::reconcile::{plan_delta, plan_full, MergePlan};
use crate::retry::RetryConfig;
use crate::state::{AccountCause, SyncFailure, SyncProgress, SyncStatus};

/// Default time between periodic incremental syncs while active.
pub const DEFAULT_PERIODIC_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Configuration for the sync coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Entity types fetched on every pass, in this order.
    pub entity_types: Vec<EntityType>,
    /// Period of the foreground timer trigger.
    #[serde(with = "millis")]
    pub periodic_interval: Duration,
    pub batch: BatchConfig,
    pub retry: RetryConfig,
}

impl SyncConfig {
    pub fn with_entity_types(mut self, entity_types: impl IntoIterator<Item = EntityType>) -> Self {
        self.entity_types = entity_types.into_iter().collect();
        self
    }

    pub fn with_periodic_interval(mut self, interval: Duration) -> Self {
        self.periodic_interval = interval;
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            entity_types: Vec::new(),
            periodic_interval: DEFAULT_PERIODIC_INTERVAL,
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Kind of sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Drain the queue, then fetch everything and reconcile.
    Full,
    /// Fetch changes since the stored tokens, then drain the queue.
    Incremental,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Full => f.write_str("full"),
            SyncMode::Incremental => f.write_str("incremental"),
        }
    }
}

/// What a completed pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub mode: SyncMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub drain: DrainReport,
    /// Remote records received.
    pub fetched: usize,
    /// Local records written from remote versions.
    pub upserted: usize,
    /// Local records deleted.
    pub deleted: usize,
    /// Local records kept despite a remote deletion because they are queued.
    pub preserved: usize,
}

impl SyncReport {
    fn new(mode: SyncMode) -> Self {
        let now = Utc::now();
        Self {
            mode,
            started_at: now,
            finished_at: now,
            drain: DrainReport::default(),
            fetched: 0,
            upserted: 0,
            deleted: 0,
            preserved: 0,
        }
    }

    fn add_merge(&mut self, fetched: &FetchResult, plan: &MergePlan) {
        self.fetched += fetched.records.len();
        self.upserted += plan.upserts.len();
        self.deleted += plan.deletes.len();
        self.preserved += plan.preserved.len();
    }
}

/// Result of requesting a sync pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    Failed(SyncFailure),
    /// A pass was already running; nothing was done.
    AlreadyRunning,
}

impl SyncOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SyncOutcome::Completed(_))
    }
}

/// Ends a pass however its future ends.
///
/// A pass dropped before it settled (its task was aborted when the execution
/// window closed) is published as `Failed(Expired)`. The running flag is
/// cleared after the state is published.
struct PassGuard<'a> {
    running: &'a AtomicBool,
    status: &'a watch::Sender<SyncStatus>,
    settled: bool,
}

impl PassGuard<'_> {
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("Sync pass dropped before finishing");
            self.status.send_modify(|s| s.fail(SyncFailure::Expired));
        }
        self.running.store(false, Ordering::Release);
    }
}

fn step_failure(step: &str, err: Error) -> SyncFailure {
    warn!("Sync step '{}' failed: {}", step, err);
    SyncFailure::from_error(&err)
}

/// Owns the operation queue and runs sync passes against the stores.
///
/// At most one pass runs at a time; the current [`SyncStatus`] is published
/// through a watch channel.
pub struct SyncCoordinator {
    config: SyncConfig,
    remote: Arc<dyn RemoteStore>,
    local: Arc<dyn LocalStore>,
    tokens: Arc<dyn TokenStore>,
    queue: OperationQueue,
    executor: BatchExecutor,
    status: watch::Sender<SyncStatus>,
    running: AtomicBool,
}

impl SyncCoordinator {
    /// Create a coordinator, restoring the persisted queue.
    ///
    /// # Errors
    /// - The persisted queue cannot be loaded
    pub async fn open(
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        local: Arc<dyn LocalStore>,
        queue_store: Arc<dyn QueueStore>,
        tokens: Arc<dyn TokenStore>,
    ) -> fitsync_common::Result<Self> {
        let queue = OperationQueue::open(queue_store).await?;
        let executor = BatchExecutor::new(remote.clone(), config.batch.clone(), config.retry.clone());
        let (status, _) = watch::channel(SyncStatus::default());

        Ok(Self {
            config,
            remote,
            local,
            tokens,
            queue,
            executor,
            status,
            running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The pending operation queue.
    ///
    /// Outside this crate the queue is read-only; operations are added with
    /// [`SyncCoordinator::enqueue`] and removed by sync passes.
    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    /// Queue a local mutation for upload.
    ///
    /// # Errors
    /// - `Persistence` if the queue could not be written
    pub async fn enqueue(&self, op: PendingOperation) -> fitsync_common::Result<()> {
        self.queue.enqueue(op).await
    }

    /// Current status snapshot.
    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn sync_full(&self) -> SyncOutcome {
        self.sync_with(SyncMode::Full, &CancellationToken::new()).await
    }

    pub async fn sync_incremental(&self) -> SyncOutcome {
        self.sync_with(SyncMode::Incremental, &CancellationToken::new()).await
    }

    pub async fn sync_full_with(&self, cancel: &CancellationToken) -> SyncOutcome {
        self.sync_with(SyncMode::Full, cancel).await
    }

    pub async fn sync_incremental_with(&self, cancel: &CancellationToken) -> SyncOutcome {
        self.sync_with(SyncMode::Incremental, cancel).await
    }

    /// Run one pass unless another is already running.
    ///
    /// Cancelling `cancel` abandons the pass at its next suspension point and
    /// fails it with [`SyncFailure::Expired`]. Queue entries not yet confirmed
    /// stay queued.
    pub async fn sync_with(&self, mode: SyncMode, cancel: &CancellationToken) -> SyncOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sync already running, ignoring {} request", mode);
            return SyncOutcome::AlreadyRunning;
        }
        let mut guard = PassGuard {
            running: &self.running,
            status: &self.status,
            settled: false,
        };

        info!("Starting {} sync", mode);
        self.status.send_modify(SyncStatus::begin);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncFailure::Expired),
            result = self.run_pass(mode) => result,
        };

        guard.settle();
        match result {
            Ok(mut report) => {
                report.finished_at = Utc::now();
                info!(
                    "{} sync completed: {} fetched, {} written, {} deleted, {} uploaded, {} still queued",
                    mode,
                    report.fetched,
                    report.upserted,
                    report.deleted,
                    report.drain.applied,
                    report.drain.left_queued()
                );
                self.status.send_modify(|s| s.complete(report.finished_at));
                SyncOutcome::Completed(report)
            }
            Err(failure) => {
                warn!("{} sync failed: {}", mode, failure);
                self.status.send_modify(|s| s.fail(failure.clone()));
                SyncOutcome::Failed(failure)
            }
        }
    }

    async fn run_pass(&self, mode: SyncMode) -> Result<SyncReport, SyncFailure> {
        let mut report = SyncReport::new(mode);
        self.preflight().await?;

        match mode {
            SyncMode::Full => {
                report.drain = self.drain().await?;
                for entity_type in &self.config.entity_types {
                    self.merge_all(entity_type, &mut report).await?;
                }
            }
            SyncMode::Incremental => {
                for entity_type in &self.config.entity_types {
                    self.merge_changes(entity_type, &mut report).await?;
                }
                report.drain = self.drain().await?;
            }
        }

        Ok(report)
    }

    async fn preflight(&self) -> Result<(), SyncFailure> {
        match self.remote.account_status().await {
            Ok(status) => match AccountCause::from_status(status) {
                None => Ok(()),
                Some(cause) => {
                    info!("Remote account not usable: {}", status);
                    Err(SyncFailure::Account(cause))
                }
            },
            Err(err) => {
                warn!("Account status check failed: {}", err);
                Err(SyncFailure::Account(AccountCause::Unknown))
            }
        }
    }

    async fn drain(&self) -> Result<DrainReport, SyncFailure> {
        let total = self.queue.len().await;
        self.update_progress(|p| {
            p.total_operations = total;
            p.completed_operations = 0;
        });
        if total == 0 {
            return Ok(DrainReport::default());
        }

        self.queue
            .drain(move |op| async move { self.apply_queued(op).await })
            .await
            .map_err(|e| step_failure("drain", e))
    }

    async fn apply_queued(&self, op: PendingOperation) -> Outcome {
        self.update_progress(|p| p.current_operation_label = Some(op.label()));
        let outcome = self.executor.apply(&op).await;
        self.update_progress(|p| {
            p.completed_operations += 1;
            p.current_operation_label = None;
        });
        outcome
    }

    /// Fetch every remote record of one type and reconcile.
    async fn merge_all(
        &self,
        entity_type: &EntityType,
        report: &mut SyncReport,
    ) -> Result<(), SyncFailure> {
        self.update_progress(|p| p.current_operation_label = Some(format!("fetch {}", entity_type)));
        let query = RecordQuery::all(entity_type.clone());

        let fetched = self
            .executor
            .fetch(&query, None)
            .await
            .map_err(|e| step_failure("fetch", e))?;
        let local = self
            .local
            .query(&query)
            .await
            .map_err(|e| step_failure("local query", e))?;
        let pending = self.queue.pending_record_ids(entity_type).await;

        let plan = plan_full(&local, &fetched.records, &pending);
        self.apply_plan(entity_type, &plan).await?;
        if let Some(token) = &fetched.change_token {
            self.tokens
                .store_token(entity_type, token)
                .await
                .map_err(|e| step_failure("store token", e))?;
        }

        debug!(
            "Reconciled {}: {} fetched, {} written, {} deleted",
            entity_type,
            fetched.records.len(),
            plan.upserts.len(),
            plan.deletes.len()
        );
        report.add_merge(&fetched, &plan);
        Ok(())
    }

    /// Fetch changes of one type since its stored token and merge them.
    async fn merge_changes(
        &self,
        entity_type: &EntityType,
        report: &mut SyncReport,
    ) -> Result<(), SyncFailure> {
        let token = self
            .tokens
            .load_token(entity_type)
            .await
            .map_err(|e| step_failure("load token", e))?;
        let Some(token) = token else {
            debug!("No change token for {}, fetching everything", entity_type);
            return self.merge_all(entity_type, report).await;
        };

        self.update_progress(|p| p.current_operation_label = Some(format!("fetch {}", entity_type)));
        let query = RecordQuery::all(entity_type.clone());
        let fetched = match self.executor.fetch(&query, Some(&token)).await {
            Ok(fetched) => fetched,
            Err(Error::InvalidInput(reason)) => {
                warn!(
                    "Change token for {} rejected ({}), fetching everything",
                    entity_type, reason
                );
                return self.merge_all(entity_type, report).await;
            }
            Err(e) => return Err(step_failure("fetch changes", e)),
        };

        let local = self
            .local
            .query(&query)
            .await
            .map_err(|e| step_failure("local query", e))?;
        let pending = self.queue.pending_record_ids(entity_type).await;

        let plan = plan_delta(&local, &fetched.records, &fetched.deleted, &pending);
        self.apply_plan(entity_type, &plan).await?;
        if let Some(next) = &fetched.change_token {
            self.tokens
                .store_token(entity_type, next)
                .await
                .map_err(|e| step_failure("store token", e))?;
        }

        report.add_merge(&fetched, &plan);
        Ok(())
    }

    async fn apply_plan(&self, entity_type: &EntityType, plan: &MergePlan) -> Result<(), SyncFailure> {
        if !plan.upserts.is_empty() {
            self.local
                .upsert(plan.upserts.clone())
                .await
                .map_err(|e| step_failure("local upsert", e))?;
        }
        if !plan.deletes.is_empty() {
            self.local
                .delete(entity_type, &plan.deletes)
                .await
                .map_err(|e| step_failure("local delete", e))?;
        }
        for id in &plan.preserved {
            debug!("Keeping {}/{}: deletion pending upload", entity_type, id);
        }
        Ok(())
    }

    fn update_progress(&self, update: impl FnOnce(&mut SyncProgress)) {
        self.status.send_if_modified(|status| match status.progress.as_mut() {
            Some(progress) => {
                update(progress);
                true
            }
            None => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SyncState;
    use fitsync_common::{AccountStatus, Record, RecordId};
    use fitsync_storage::{MemoryLocalStore, MemoryQueueStore, MemoryRemoteStore, MemoryTokenStore, RemoteOp};
    use serde_json::json;

    fn workout_type() -> EntityType {
        EntityType::new("workout").unwrap()
    }

    fn workout(id: &str, minutes: i64) -> Record {
        Record::new(workout_type(), RecordId::new(id).unwrap()).with_field("minutes", json!(minutes))
    }

    struct Fixture {
        remote: Arc<MemoryRemoteStore>,
        local: Arc<MemoryLocalStore>,
        tokens: Arc<MemoryTokenStore>,
        coordinator: SyncCoordinator,
    }

    async fn fixture() -> Fixture {
        let remote = Arc::new(MemoryRemoteStore::new());
        let local = Arc::new(MemoryLocalStore::new());
        let tokens = Arc::new(MemoryTokenStore::new());
        let config = SyncConfig::default()
            .with_entity_types([workout_type()])
            .with_retry(RetryConfig::none());
        let coordinator = SyncCoordinator::open(
            config,
            remote.clone(),
            local.clone(),
            Arc::new(MemoryQueueStore::new()),
            tokens.clone(),
        )
        .await
        .unwrap();
        Fixture {
            remote,
            local,
            tokens,
            coordinator,
        }
    }

    #[tokio::test]
    async fn test_full_sync_pulls_remote_records() {
        let f = fixture().await;
        f.remote.insert_remote(workout("w1", 30));
        f.remote.insert_remote(workout("w2", 45));

        let SyncOutcome::Completed(report) = f.coordinator.sync_full().await else {
            panic!("full sync failed");
        };
        assert_eq!(report.fetched, 2);
        assert_eq!(f.local.len(), 2);
        assert!(f.tokens.load_token(&workout_type()).await.unwrap().is_some());

        let status = f.coordinator.status();
        assert!(matches!(status.state, SyncState::Completed { .. }));
        assert!(status.last_sync_at.is_some());
        assert!(status.progress.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_account_fails_pass() {
        let f = fixture().await;
        f.remote.set_account_status(AccountStatus::NoAccount);

        let outcome = f.coordinator.sync_incremental().await;

        assert_eq!(
            outcome,
            SyncOutcome::Failed(SyncFailure::Account(AccountCause::NoAccount))
        );
        assert!(!f.coordinator.is_syncing());
    }

    #[tokio::test]
    async fn test_status_check_error_is_unknown_cause() {
        let f = fixture().await;
        f.remote
            .fail_next(RemoteOp::AccountStatus, || Error::Network("offline".to_string()));

        let outcome = f.coordinator.sync_full().await;
        assert_eq!(
            outcome,
            SyncOutcome::Failed(SyncFailure::Account(AccountCause::Unknown))
        );
    }

    #[tokio::test]
    async fn test_incremental_uses_token_and_tombstones() {
        let f = fixture().await;
        f.remote.insert_remote(workout("w1", 30));
        f.remote.insert_remote(workout("w2", 45));
        assert!(f.coordinator.sync_full().await.is_completed());

        f.remote.remove_remote(&workout_type(), &RecordId::new("w1").unwrap());
        f.remote.insert_remote(workout("w3", 60));

        let SyncOutcome::Completed(report) = f.coordinator.sync_incremental().await else {
            panic!("incremental sync failed");
        };
        assert_eq!(report.fetched, 1);
        assert_eq!(report.deleted, 1);
        assert!(f.local.get(&workout_type(), &RecordId::new("w1").unwrap()).is_none());
        assert!(f.local.get(&workout_type(), &RecordId::new("w3").unwrap()).is_some());
    }

    #[tokio::test]
    async fn test_rejected_token_falls_back_to_full_fetch() {
        let f = fixture().await;
        f.remote.insert_remote(workout("w1", 30));
        f.tokens
            .store_token(&workout_type(), &fitsync_common::ChangeToken::new("garbage"))
            .await
            .unwrap();

        let SyncOutcome::Completed(report) = f.coordinator.sync_incremental().await else {
            panic!("incremental sync failed");
        };
        assert_eq!(report.fetched, 1);
        assert_eq!(
            f.tokens.load_token(&workout_type()).await.unwrap(),
            Some(fitsync_common::ChangeToken::new("1"))
        );
    }

    #[tokio::test]
    async fn test_cancelled_pass_fails_as_expired() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = f.coordinator.sync_full_with(&cancel).await;

        assert_eq!(outcome, SyncOutcome::Failed(SyncFailure::Expired));
        assert!(!f.coordinator.is_syncing());
    }
}
