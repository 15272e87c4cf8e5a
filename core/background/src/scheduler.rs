//! Background task scheduler: registers job classes with the OS and runs them.

use chrono::Utc;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::job::{JobClass, JobPolicy, ScheduledJob};
use crate::jobs::JobWork;
use crate::os::{JobHandler, OsScheduler, SchedulingError};
use crate::task::BackgroundTask;

/// Whether each registered job currently has a run scheduled, by job id.
pub type JobStatusMap = BTreeMap<String, bool>;

/// Everything the handler of one job class needs.
struct JobRunner {
    class: JobClass,
    policy: JobPolicy,
    work: Arc<dyn JobWork>,
    /// Weak because the OS facility owns the handler that owns this runner.
    os: Weak<dyn OsScheduler>,
    status: Arc<watch::Sender<JobStatusMap>>,
    running: AtomicBool,
}

impl JobRunner {
    /// Handle one OS-granted window: run, reschedule, report once.
    async fn run(self: Arc<Self>, task: BackgroundTask) {
        let job_id = self.class.job_id();

        if self.running.swap(true, Ordering::AcqRel) {
            warn!("Job {} invoked while already running", job_id);
            self.schedule_next();
            task.completion.complete(false);
            return;
        }

        debug!("Job {} started", job_id);
        let work = Arc::clone(&self.work);
        let cancel = task.expiration.clone();
        let mut handle = tokio::spawn(async move { work.run(cancel).await });

        let success = tokio::select! {
            biased;
            _ = task.expiration.cancelled() => {
                handle.abort();
                warn!("Job {} expired before finishing", job_id);
                false
            }
            joined = &mut handle => match joined {
                Ok(Ok(())) => {
                    debug!("Job {} finished", job_id);
                    true
                }
                Ok(Err(e)) => {
                    warn!("Job {} failed: {}", job_id, e);
                    false
                }
                Err(e) if e.is_panic() => {
                    error!("Job {} panicked", job_id);
                    false
                }
                Err(e) => {
                    error!("Job {} aborted: {}", job_id, e);
                    false
                }
            },
        };

        self.running.store(false, Ordering::Release);
        // The OS may suspend the process once completion is reported.
        self.schedule_next();
        task.completion.complete(success);
    }

    fn schedule_next(&self) {
        let job = ScheduledJob::next_run(self.class, &self.policy, Utc::now());
        let job_id = job.job_id.clone();
        let earliest = job.earliest_next_run;

        let Some(os) = self.os.upgrade() else {
            debug!("OS scheduler gone, not rescheduling {}", job_id);
            return;
        };
        let scheduled = match os.submit(job) {
            Ok(()) => {
                debug!("Job {} scheduled for {}", job_id, earliest.to_rfc3339());
                true
            }
            Err(e) => {
                warn!("Failed to schedule job {}: {}", job_id, e);
                false
            }
        };
        self.status.send_modify(|map| {
            map.insert(job_id, scheduled);
        });
    }
}

/// Registers job classes with an [`OsScheduler`] and keeps them scheduled.
///
/// Each class is registered once. Its handler reports completion exactly
/// once per run, whether the work finished, failed, panicked or ran out of
/// time, and then always submits the next run.
pub struct BackgroundScheduler {
    os: Arc<dyn OsScheduler>,
    runners: BTreeMap<JobClass, Arc<JobRunner>>,
    status: Arc<watch::Sender<JobStatusMap>>,
}

impl BackgroundScheduler {
    pub fn new(os: Arc<dyn OsScheduler>) -> Self {
        let (status, _) = watch::channel(JobStatusMap::new());
        Self {
            os,
            runners: BTreeMap::new(),
            status: Arc::new(status),
        }
    }

    /// Register `class` with the OS.
    ///
    /// # Errors
    /// - `AlreadyRegistered` if the class was registered before
    /// - Any refusal from the OS facility
    pub fn register(
        &mut self,
        class: JobClass,
        policy: JobPolicy,
        work: Arc<dyn JobWork>,
    ) -> Result<(), SchedulingError> {
        if self.runners.contains_key(&class) {
            return Err(SchedulingError::AlreadyRegistered(class.job_id().to_string()));
        }

        let runner = Arc::new(JobRunner {
            class,
            policy,
            work,
            os: Arc::downgrade(&self.os),
            status: Arc::clone(&self.status),
            running: AtomicBool::new(false),
        });

        let handler_runner = Arc::clone(&runner);
        let handler: JobHandler = Arc::new(move |task: BackgroundTask| {
            Arc::clone(&handler_runner).run(task).boxed()
        });
        self.os.register(class.job_id(), handler)?;

        self.status.send_modify(|map| {
            map.insert(class.job_id().to_string(), false);
        });
        self.runners.insert(class, runner);
        info!("Registered background job {}", class);
        Ok(())
    }

    /// Register `class` with its default policy.
    pub fn register_default(
        &mut self,
        class: JobClass,
        work: Arc<dyn JobWork>,
    ) -> Result<(), SchedulingError> {
        self.register(class, class.default_policy(), work)
    }

    /// Submit the first run of every registered class.
    ///
    /// Failures are logged and reflected in [`job_status`](Self::job_status);
    /// they do not stop other classes from being scheduled.
    pub fn schedule_all(&self) {
        for runner in self.runners.values() {
            runner.schedule_next();
        }
    }

    /// Drop every pending run.
    pub fn cancel_all(&self) {
        self.os.cancel_all();
        self.status.send_modify(|map| {
            for scheduled in map.values_mut() {
                *scheduled = false;
            }
        });
        info!("Cancelled all background jobs");
    }

    pub fn job_status(&self) -> JobStatusMap {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobStatusMap> {
        self.status.subscribe()
    }

    /// Registered classes in order.
    pub fn classes(&self) -> Vec<JobClass> {
        self.runners.keys().copied().collect()
    }
}
