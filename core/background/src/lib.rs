//! FitSync background execution.
//!
//! Registers recurring job classes with the OS background task facility,
//! runs them within their execution windows and keeps each one scheduled.

pub mod job;
pub mod jobs;
pub mod os;
pub mod runtime;
pub mod scheduler;
pub mod task;

pub use job::{JobClass, JobPolicy, ScheduledJob};
pub use jobs::{FnJob, JobWork, MaintenanceJob, SyncJob};
pub use os::{JobHandler, OsScheduler, SchedulingError};
pub use runtime::{Conditions, TaskRun, TokioOsScheduler, DEFAULT_MAX_PENDING};
pub use scheduler::{BackgroundScheduler, JobStatusMap};
pub use task::{BackgroundTask, TaskCompletion};
