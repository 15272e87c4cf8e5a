//! In-process [`OsScheduler`] backed by tokio timers.
//!
//! Used by the daemon on hosts without a native background task facility,
//! and by tests. It keeps the OS contract: one pending request per job id,
//! a bounded number of pending requests, runs gated on network and power
//! conditions, and an expiration signal once the execution budget is spent.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::job::ScheduledJob;
use crate::os::{JobHandler, OsScheduler, SchedulingError};
use crate::task::BackgroundTask;

/// Pending requests allowed at once.
pub const DEFAULT_MAX_PENDING: usize = 10;

/// Time a handler gets to report completion after its window expires.
const EXPIRATION_GRACE: Duration = Duration::from_secs(5);

/// Device conditions a scheduled job may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Conditions {
    pub network_available: bool,
    pub on_power: bool,
}

impl Conditions {
    /// Network reachable and external power connected.
    pub fn unrestricted() -> Self {
        Self {
            network_available: true,
            on_power: true,
        }
    }

    pub fn satisfies(&self, job: &ScheduledJob) -> bool {
        (!job.requires_network || self.network_available) && (!job.requires_power || self.on_power)
    }
}

/// Record of one execution window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRun {
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// `None` if the handler never reported completion.
    pub success: Option<bool>,
    /// Whether the expiration signal fired during the run.
    pub expired: bool,
}

struct Pending {
    generation: u64,
    job: ScheduledJob,
    timer: JoinHandle<()>,
}

struct Shared {
    handlers: Mutex<HashMap<String, JobHandler>>,
    pending: Mutex<HashMap<String, Pending>>,
    generation: AtomicU64,
    conditions: watch::Sender<Conditions>,
    history: watch::Sender<Vec<TaskRun>>,
    max_pending: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    async fn wait_and_run(self: Arc<Self>, job: ScheduledJob, generation: u64) {
        let delay = (job.earliest_next_run - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        tokio::time::sleep(delay).await;

        let mut conditions = self.conditions.subscribe();
        if !conditions.borrow().satisfies(&job) {
            debug!("Job {} waiting for required conditions", job.job_id);
        }
        if conditions.wait_for(|c| c.satisfies(&job)).await.is_err() {
            return;
        }

        {
            let mut pending = lock(&self.pending);
            match pending.get(&job.job_id) {
                Some(entry) if entry.generation == generation => {
                    pending.remove(&job.job_id);
                }
                _ => return,
            }
        }

        self.run(job).await;
    }

    async fn run(&self, job: ScheduledJob) {
        let handler = lock(&self.handlers).get(&job.job_id).cloned();
        let Some(handler) = handler else {
            warn!("No handler for job {}", job.job_id);
            return;
        };

        let expiration = CancellationToken::new();
        let (task, mut completion) = BackgroundTask::new(job.job_id.clone(), expiration.clone());
        let started_at = Utc::now();
        debug!("Launching job {} (budget {:?})", job.job_id, job.max_execution_budget);

        let watchdog = {
            let expiration = expiration.clone();
            let budget = job.max_execution_budget;
            tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                expiration.cancel();
            })
        };
        let handle = tokio::spawn(handler(task));

        let success = tokio::select! {
            reported = &mut completion => reported.ok(),
            _ = async {
                expiration.cancelled().await;
                tokio::time::sleep(EXPIRATION_GRACE).await;
            } => {
                warn!("Job {} did not report completion after expiring", job.job_id);
                handle.abort();
                None
            }
        };
        watchdog.abort();

        let run = TaskRun {
            job_id: job.job_id,
            started_at,
            finished_at: Utc::now(),
            success,
            expired: expiration.is_cancelled(),
        };
        debug!("Job {} ended: {:?}", run.job_id, run.success);
        self.history.send_modify(|history| history.push(run));
    }
}

/// Tokio-driven background task facility.
pub struct TokioOsScheduler {
    shared: Arc<Shared>,
}

impl TokioOsScheduler {
    pub fn new() -> Self {
        Self::with_max_pending(DEFAULT_MAX_PENDING)
    }

    pub fn with_max_pending(max_pending: usize) -> Self {
        let (conditions, _) = watch::channel(Conditions::unrestricted());
        let (history, _) = watch::channel(Vec::new());
        Self {
            shared: Arc::new(Shared {
                handlers: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                conditions,
                history,
                max_pending,
            }),
        }
    }

    /// Update device conditions; runs waiting on them resume.
    pub fn set_conditions(&self, conditions: Conditions) {
        info!(
            "Conditions changed: network={}, power={}",
            conditions.network_available, conditions.on_power
        );
        self.shared.conditions.send_replace(conditions);
    }

    pub fn conditions(&self) -> Conditions {
        *self.shared.conditions.borrow()
    }

    /// Pending requests ordered by job id.
    pub fn pending_jobs(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> = lock(&self.shared.pending)
            .values()
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        jobs
    }

    /// Finished runs in completion order.
    pub fn history(&self) -> Vec<TaskRun> {
        self.shared.history.borrow().clone()
    }

    /// Wait until at least `count` runs have finished.
    pub async fn wait_for_runs(&self, count: usize) -> Vec<TaskRun> {
        let mut history = self.shared.history.subscribe();
        let runs = match history.wait_for(|runs| runs.len() >= count).await {
            Ok(runs) => runs.clone(),
            Err(_) => self.history(),
        };
        runs
    }

    /// Move the pending request for `job_id` to now. Conditions still apply.
    ///
    /// # Errors
    /// - `NotRegistered` if nothing is pending for the id
    pub fn trigger(&self, job_id: &str) -> Result<(), SchedulingError> {
        let job = lock(&self.shared.pending)
            .get(job_id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| SchedulingError::NotRegistered(job_id.to_string()))?;
        self.submit(ScheduledJob {
            earliest_next_run: Utc::now(),
            ..job
        })
    }
}

impl Default for TokioOsScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TokioOsScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

impl OsScheduler for TokioOsScheduler {
    fn register(&self, job_id: &str, handler: JobHandler) -> Result<(), SchedulingError> {
        let mut handlers = lock(&self.shared.handlers);
        if handlers.contains_key(job_id) {
            return Err(SchedulingError::AlreadyRegistered(job_id.to_string()));
        }
        handlers.insert(job_id.to_string(), handler);
        Ok(())
    }

    fn submit(&self, job: ScheduledJob) -> Result<(), SchedulingError> {
        if !lock(&self.shared.handlers).contains_key(&job.job_id) {
            return Err(SchedulingError::NotRegistered(job.job_id));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SchedulingError::Unavailable("no async runtime".to_string()))?;

        let mut pending = lock(&self.shared.pending);
        if !pending.contains_key(&job.job_id) && pending.len() >= self.shared.max_pending {
            return Err(SchedulingError::TooManyPendingRequests(self.shared.max_pending));
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed);
        let timer = runtime.spawn(Arc::clone(&self.shared).wait_and_run(job.clone(), generation));
        let replaced = pending.insert(
            job.job_id.clone(),
            Pending {
                generation,
                job,
                timer,
            },
        );
        if let Some(old) = replaced {
            old.timer.abort();
        }
        Ok(())
    }

    fn cancel_all(&self) {
        let drained: Vec<Pending> = lock(&self.shared.pending).drain().map(|(_, p)| p).collect();
        for entry in drained {
            entry.timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn job(id: &str, after: chrono::Duration) -> ScheduledJob {
        ScheduledJob {
            job_id: id.to_string(),
            earliest_next_run: Utc::now() + after,
            requires_network: false,
            requires_power: false,
            max_execution_budget: Duration::from_secs(30),
        }
    }

    fn reporting(success: bool) -> JobHandler {
        Arc::new(move |task: BackgroundTask| {
            async move {
                task.completion.complete(success);
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_submit_requires_registration() {
        let os = TokioOsScheduler::new();
        let err = os.submit(job("sync", chrono::Duration::zero())).unwrap_err();
        assert_eq!(err, SchedulingError::NotRegistered("sync".to_string()));

        os.register("sync", reporting(true)).unwrap();
        assert!(matches!(
            os.register("sync", reporting(true)),
            Err(SchedulingError::AlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_runs_when_due() {
        let os = TokioOsScheduler::new();
        os.register("sync", reporting(true)).unwrap();
        os.submit(job("sync", chrono::Duration::zero())).unwrap();

        let runs = os.wait_for_runs(1).await;
        assert_eq!(runs[0].job_id, "sync");
        assert_eq!(runs[0].success, Some(true));
        assert!(!runs[0].expired);
        assert!(os.pending_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_runs_returns_settled_history() {
        let os = TokioOsScheduler::new();
        os.register("sync", reporting(true)).unwrap();
        os.register("maintenance", reporting(false)).unwrap();
        os.submit(job("sync", chrono::Duration::zero())).unwrap();
        os.submit(job("maintenance", chrono::Duration::milliseconds(20))).unwrap();

        let runs = os.wait_for_runs(2).await;
        assert_eq!(runs.len(), 2);
        assert_eq!(runs, os.history());

        // Already satisfied: returns without waiting.
        assert_eq!(os.wait_for_runs(1).await.len(), 2);
    }

    #[tokio::test]
    async fn test_resubmit_replaces_pending_request() {
        let os = TokioOsScheduler::new();
        os.register("sync", reporting(true)).unwrap();
        os.submit(job("sync", chrono::Duration::hours(1))).unwrap();
        os.submit(job("sync", chrono::Duration::hours(2))).unwrap();

        let pending = os.pending_jobs();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].earliest_next_run > Utc::now() + chrono::Duration::minutes(90));
    }

    #[tokio::test]
    async fn test_quota_limits_distinct_requests() {
        let os = TokioOsScheduler::with_max_pending(2);
        for id in ["a", "b", "c"] {
            os.register(id, reporting(true)).unwrap();
        }
        os.submit(job("a", chrono::Duration::hours(1))).unwrap();
        os.submit(job("b", chrono::Duration::hours(1))).unwrap();

        assert_eq!(
            os.submit(job("c", chrono::Duration::hours(1))),
            Err(SchedulingError::TooManyPendingRequests(2))
        );
        // Replacing an existing request does not count against the quota.
        os.submit(job("a", chrono::Duration::hours(2))).unwrap();
    }

    #[tokio::test]
    async fn test_waits_for_network() {
        let os = TokioOsScheduler::new();
        os.register("sync", reporting(true)).unwrap();
        os.set_conditions(Conditions {
            network_available: false,
            on_power: true,
        });

        let mut request = job("sync", chrono::Duration::zero());
        request.requires_network = true;
        os.submit(request).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(os.history().is_empty());

        os.set_conditions(Conditions::unrestricted());
        let runs = os.wait_for_runs(1).await;
        assert_eq!(runs[0].success, Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_expires_run() {
        let os = TokioOsScheduler::new();
        let handler: JobHandler = Arc::new(|task: BackgroundTask| {
            async move {
                task.expiration.cancelled().await;
                task.completion.complete(false);
            }
            .boxed()
        });
        os.register("maintenance", handler).unwrap();

        let mut request = job("maintenance", chrono::Duration::zero());
        request.max_execution_budget = Duration::from_secs(1);
        os.submit(request).unwrap();

        let runs = os.wait_for_runs(1).await;
        assert_eq!(runs[0].success, Some(false));
        assert!(runs[0].expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_handler_is_recorded_without_result() {
        let os = TokioOsScheduler::new();
        let handler: JobHandler = Arc::new(|_task: BackgroundTask| {
            async move {
                futures::future::pending::<()>().await;
            }
            .boxed()
        });
        os.register("sync", handler).unwrap();

        let mut request = job("sync", chrono::Duration::zero());
        request.max_execution_budget = Duration::from_secs(1);
        os.submit(request).unwrap();

        let runs = os.wait_for_runs(1).await;
        assert_eq!(runs[0].success, None);
        assert!(runs[0].expired);
    }

    #[tokio::test]
    async fn test_trigger_and_cancel_all() {
        let os = TokioOsScheduler::new();
        os.register("sync", reporting(true)).unwrap();
        os.register("maintenance", reporting(true)).unwrap();

        assert!(os.trigger("sync").is_err());

        os.submit(job("sync", chrono::Duration::hours(1))).unwrap();
        os.trigger("sync").unwrap();
        os.wait_for_runs(1).await;

        os.submit(job("maintenance", chrono::Duration::hours(1))).unwrap();
        os.cancel_all();
        assert!(os.pending_jobs().is_empty());
    }
}
