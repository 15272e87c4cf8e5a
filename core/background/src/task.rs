//! A single background run handed to a job handler by the OS.

use std::sync::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Reports the end of a run to the OS exactly once.
pub struct TaskCompletion {
    sender: Mutex<Option<oneshot::Sender<bool>>>,
}

impl TaskCompletion {
    /// Create a completion flag and the receiver the OS waits on.
    pub fn new() -> (Self, oneshot::Receiver<bool>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                sender: Mutex::new(Some(sender)),
            },
            receiver,
        )
    }

    /// Report the run as finished. Returns `false` if it was already reported.
    pub fn complete(&self, success: bool) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match sender {
            Some(sender) => {
                // The OS may have stopped listening; the run still counts as reported.
                let _ = sender.send(success);
                true
            }
            None => false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

/// One OS-granted execution window for a registered job.
pub struct BackgroundTask {
    pub job_id: String,
    /// Cancelled by the OS when the window ends.
    pub expiration: CancellationToken,
    pub completion: TaskCompletion,
}

impl BackgroundTask {
    /// Create a task and the receiver its completion is reported to.
    pub fn new(job_id: impl Into<String>, expiration: CancellationToken) -> (Self, oneshot::Receiver<bool>) {
        let (completion, receiver) = TaskCompletion::new();
        (
            Self {
                job_id: job_id.into(),
                expiration,
                completion,
            },
            receiver,
        )
    }
}
