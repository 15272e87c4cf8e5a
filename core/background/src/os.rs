//! Interface to the OS background execution facility.

use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;

use fitsync_common::Error;

use crate::job::ScheduledJob;
use crate::task::BackgroundTask;

/// Called by the OS with each granted execution window.
pub type JobHandler = Arc<dyn Fn(BackgroundTask) -> BoxFuture<'static, ()> + Send + Sync>;

/// Reasons the OS refuses a scheduling request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingError {
    #[error("Job {0} is not registered")]
    NotRegistered(String),

    #[error("Job {0} is already registered")]
    AlreadyRegistered(String),

    #[error("Too many pending requests (limit {0})")]
    TooManyPendingRequests(usize),

    #[error("Background execution unavailable: {0}")]
    Unavailable(String),
}

impl From<SchedulingError> for Error {
    fn from(err: SchedulingError) -> Self {
        Error::Scheduling(err.to_string())
    }
}

/// OS background task facility.
///
/// Each job id is registered once with a handler; `submit` asks for one
/// future run, replacing any pending request for the same id.
pub trait OsScheduler: Send + Sync {
    fn register(&self, job_id: &str, handler: JobHandler) -> Result<(), SchedulingError>;

    fn submit(&self, job: ScheduledJob) -> Result<(), SchedulingError>;

    /// Drop every pending request.
    fn cancel_all(&self);
}
