//! Background scheduler behaviour against a recording OS double and the
//! tokio-backed facility.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use fitsync_background::{
    BackgroundScheduler, BackgroundTask, FnJob, JobClass, JobHandler, OsScheduler, SchedulingError,
    ScheduledJob, SyncJob, TokioOsScheduler,
};
use fitsync_common::{AccountStatus, ChangeToken, EntityType, Error, PendingOperation, Record, RecordId};
use fitsync_storage::{
    FetchPage, MemoryLocalStore, MemoryQueueStore, MemoryRemoteStore, MemoryTokenStore,
    PageCursor, RecordQuery, RemoteStore, SavePolicy,
};
use fitsync_sync::{RetryConfig, SyncConfig, SyncCoordinator, SyncFailure, SyncState};

/// OS facility that records requests and launches handlers on demand.
#[derive(Default)]
struct RecordingOs {
    handlers: Mutex<HashMap<String, JobHandler>>,
    submits: Mutex<Vec<ScheduledJob>>,
    refuse: Mutex<Vec<String>>,
    cancels: AtomicUsize,
}

impl RecordingOs {
    fn refuse_submits_for(&self, job_id: &str) {
        self.refuse.lock().unwrap().push(job_id.to_string());
    }

    fn submits_for(&self, job_id: &str) -> usize {
        self.submits
            .lock()
            .unwrap()
            .iter()
            .filter(|job| job.job_id == job_id)
            .count()
    }

    /// Start a run of `job_id` and return the completion receiver.
    fn launch(&self, job_id: &str, expiration: CancellationToken) -> oneshot::Receiver<bool> {
        let handler = self.handlers.lock().unwrap().get(job_id).cloned().unwrap();
        let (task, completion) = BackgroundTask::new(job_id, expiration);
        tokio::spawn(handler(task));
        completion
    }
}

impl OsScheduler for RecordingOs {
    fn register(&self, job_id: &str, handler: JobHandler) -> Result<(), SchedulingError> {
        self.handlers
            .lock()
            .unwrap()
            .insert(job_id.to_string(), handler);
        Ok(())
    }

    fn submit(&self, job: ScheduledJob) -> Result<(), SchedulingError> {
        if self.refuse.lock().unwrap().contains(&job.job_id) {
            return Err(SchedulingError::TooManyPendingRequests(10));
        }
        self.submits.lock().unwrap().push(job);
        Ok(())
    }

    fn cancel_all(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

/// Remote whose account check never answers in time.
struct StalledRemote(Arc<MemoryRemoteStore>);

#[async_trait]
impl RemoteStore for StalledRemote {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn account_status(&self) -> fitsync_common::Result<AccountStatus> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        self.0.account_status().await
    }

    async fn save(
        &self,
        records: Vec<Record>,
        policy: SavePolicy,
    ) -> fitsync_common::Result<Vec<Record>> {
        self.0.save(records, policy).await
    }

    async fn delete(
        &self,
        entity_type: &EntityType,
        ids: Vec<RecordId>,
    ) -> fitsync_common::Result<Vec<RecordId>> {
        self.0.delete(entity_type, ids).await
    }

    async fn fetch(
        &self,
        query: &RecordQuery,
        changed_since: Option<&ChangeToken>,
        cursor: Option<&PageCursor>,
    ) -> fitsync_common::Result<FetchPage> {
        self.0.fetch(query, changed_since, cursor).await
    }
}

async fn coordinator(remote: Arc<dyn RemoteStore>) -> Arc<SyncCoordinator> {
    let goal = EntityType::new("goal").unwrap();
    Arc::new(
        SyncCoordinator::open(
            SyncConfig::default()
                .with_entity_types([goal])
                .with_retry(RetryConfig::none()),
            remote,
            Arc::new(MemoryLocalStore::new()),
            Arc::new(MemoryQueueStore::new()),
            Arc::new(MemoryTokenStore::new()),
        )
        .await
        .unwrap(),
    )
}

fn goal(id: &str) -> Record {
    Record::new(EntityType::new("goal").unwrap(), RecordId::new(id).unwrap())
        .with_field("title", json!("Run 5k"))
}

fn scheduler() -> (Arc<RecordingOs>, BackgroundScheduler) {
    let os = Arc::new(RecordingOs::default());
    let scheduler = BackgroundScheduler::new(os.clone());
    (os, scheduler)
}

#[tokio::test]
async fn failed_work_still_reschedules() {
    let (os, mut scheduler) = scheduler();
    let work = FnJob::new(|_cancel| async { Err(Error::Network("offline".to_string())) });
    scheduler
        .register_default(JobClass::Sync, Arc::new(work))
        .unwrap();
    scheduler.schedule_all();
    assert_eq!(os.submits_for("sync"), 1);

    let completion = os.launch("sync", CancellationToken::new());
    assert!(!completion.await.unwrap());
    assert_eq!(os.submits_for("sync"), 2);
    assert_eq!(scheduler.job_status().get("sync"), Some(&true));
}

#[tokio::test]
async fn expiration_reports_failure_and_reschedules() {
    let (os, mut scheduler) = scheduler();
    let work = FnJob::new(|_cancel| async {
        futures::future::pending::<()>().await;
        Ok(())
    });
    scheduler
        .register_default(JobClass::DataSync, Arc::new(work))
        .unwrap();

    let expiration = CancellationToken::new();
    let completion = os.launch("data-sync", expiration.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;
    expiration.cancel();

    assert!(!completion.await.unwrap());
    assert_eq!(os.submits_for("data-sync"), 1);
}

#[tokio::test]
async fn work_failing_after_expiration_reports_once() {
    let (os, mut scheduler) = scheduler();
    let work = FnJob::new(|cancel: CancellationToken| async move {
        cancel.cancelled().await;
        Err(Error::Cancelled("window closed".to_string()))
    });
    scheduler
        .register_default(JobClass::DataSync, Arc::new(work))
        .unwrap();

    let expiration = CancellationToken::new();
    let completion = os.launch("data-sync", expiration.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;
    expiration.cancel();

    assert!(!completion.await.unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(os.submits_for("data-sync"), 1);
    assert_eq!(scheduler.job_status().get("data-sync"), Some(&true));
}

#[tokio::test]
async fn work_panicking_after_expiration_reports_once() {
    let (os, mut scheduler) = scheduler();
    let work = FnJob::new(|cancel: CancellationToken| async move {
        cancel.cancelled().await;
        if !cancel.is_cancelled() {
            return Ok(());
        }
        panic!("expired");
    });
    scheduler
        .register_default(JobClass::Maintenance, Arc::new(work))
        .unwrap();

    let expiration = CancellationToken::new();
    let completion = os.launch("maintenance", expiration.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;
    expiration.cancel();

    assert!(!completion.await.unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(os.submits_for("maintenance"), 1);
}

#[tokio::test]
async fn expired_sync_job_leaves_coordinator_failed() {
    let remote = Arc::new(StalledRemote(Arc::new(MemoryRemoteStore::new())));
    let coordinator = coordinator(remote).await;
    coordinator.enqueue(PendingOperation::save(goal("g1"))).await.unwrap();

    let (os, mut scheduler) = scheduler();
    scheduler
        .register_default(JobClass::Sync, Arc::new(SyncJob::incremental(coordinator.clone())))
        .unwrap();

    let expiration = CancellationToken::new();
    let completion = os.launch("sync", expiration.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(coordinator.is_syncing());
    expiration.cancel();

    assert!(!completion.await.unwrap());
    assert_eq!(os.submits_for("sync"), 1);

    // The aborted pass settles once its task is dropped.
    let mut status = coordinator.subscribe();
    let settled = tokio::time::timeout(
        Duration::from_secs(1),
        status.wait_for(|s| !s.state.is_syncing()),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert_eq!(
        settled.state,
        SyncState::Failed {
            failure: SyncFailure::Expired
        }
    );
    assert!(settled.progress.is_none());
    assert!(!coordinator.is_syncing());
    assert_eq!(coordinator.queue().len().await, 1);
}

#[tokio::test]
async fn overlapping_run_is_refused_without_blocking_the_first() {
    let (os, mut scheduler) = scheduler();
    let release = Arc::new(Notify::new());
    let gate = release.clone();
    let work = FnJob::new(move |_cancel| {
        let gate = gate.clone();
        async move {
            gate.notified().await;
            Ok(())
        }
    });
    scheduler
        .register_default(JobClass::Maintenance, Arc::new(work))
        .unwrap();

    let first = os.launch("maintenance", CancellationToken::new());
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = os.launch("maintenance", CancellationToken::new());

    assert!(!second.await.unwrap());
    release.notify_one();
    assert!(first.await.unwrap());
    assert_eq!(os.submits_for("maintenance"), 2);
}

#[tokio::test]
async fn panicking_work_counts_as_failure() {
    let (os, mut scheduler) = scheduler();
    let work = FnJob::new(|_cancel| async {
        let ids: Vec<u32> = Vec::new();
        if ids.is_empty() {
            panic!("boom");
        }
        Ok(())
    });
    scheduler
        .register_default(JobClass::NotificationRefresh, Arc::new(work))
        .unwrap();

    let completion = os.launch("notification-refresh", CancellationToken::new());
    assert!(!completion.await.unwrap());
    assert_eq!(os.submits_for("notification-refresh"), 1);
}

#[tokio::test]
async fn refused_submission_does_not_block_other_classes() {
    let (os, mut scheduler) = scheduler();
    let ok = || Arc::new(FnJob::new(|_cancel| async { Ok(()) }));
    scheduler.register_default(JobClass::Sync, ok()).unwrap();
    scheduler.register_default(JobClass::Maintenance, ok()).unwrap();
    os.refuse_submits_for("sync");

    scheduler.schedule_all();

    let status = scheduler.job_status();
    assert_eq!(status.get("sync"), Some(&false));
    assert_eq!(status.get("maintenance"), Some(&true));

    // The refused class still runs if the OS launches it anyway.
    let completion = os.launch("sync", CancellationToken::new());
    assert!(completion.await.unwrap());
}

#[tokio::test]
async fn registering_twice_is_rejected() {
    let (os, mut scheduler) = scheduler();
    let ok = || Arc::new(FnJob::new(|_cancel| async { Ok(()) }));
    scheduler.register_default(JobClass::Sync, ok()).unwrap();

    assert_eq!(
        scheduler.register_default(JobClass::Sync, ok()).unwrap_err(),
        SchedulingError::AlreadyRegistered("sync".to_string())
    );
    assert_eq!(scheduler.classes(), vec![JobClass::Sync]);

    scheduler.schedule_all();
    scheduler.cancel_all();
    assert_eq!(os.cancels.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.job_status().get("sync"), Some(&false));
}

#[tokio::test]
async fn sync_job_uploads_queued_operation() {
    let goal_type = EntityType::new("goal").unwrap();
    let remote = Arc::new(MemoryRemoteStore::new());
    let coordinator = coordinator(remote.clone()).await;
    coordinator
        .enqueue(PendingOperation::save(goal("g1")))
        .await
        .unwrap();

    let os = Arc::new(TokioOsScheduler::new());
    let mut scheduler = BackgroundScheduler::new(os.clone());
    scheduler
        .register_default(JobClass::Sync, Arc::new(SyncJob::incremental(coordinator.clone())))
        .unwrap();
    scheduler.schedule_all();
    os.trigger("sync").unwrap();

    let runs = os.wait_for_runs(1).await;
    assert_eq!(runs[0].success, Some(true));
    assert!(remote.record(&goal_type, &RecordId::new("g1").unwrap()).is_some());
    assert!(coordinator.queue().is_empty().await);
    assert!(matches!(coordinator.status().state, SyncState::Completed { .. }));

    // The next run is already pending.
    let pending = os.pending_jobs();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].job_id, "sync");
}
