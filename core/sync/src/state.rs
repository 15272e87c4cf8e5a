//! Observable sync state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use fitsync_common::{AccountStatus, Error, ErrorKind};

/// Why the remote account could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountCause {
    Indeterminate,
    NoAccount,
    Restricted,
    TemporarilyUnavailable,
    /// The status check itself failed.
    Unknown,
}

impl AccountCause {
    /// Cause for a non-available account status.
    pub fn from_status(status: AccountStatus) -> Option<Self> {
        match status {
            AccountStatus::Available => None,
            AccountStatus::Indeterminate => Some(AccountCause::Indeterminate),
            AccountStatus::NoAccount => Some(AccountCause::NoAccount),
            AccountStatus::Restricted => Some(AccountCause::Restricted),
            AccountStatus::TemporarilyUnavailable => Some(AccountCause::TemporarilyUnavailable),
        }
    }
}

impl fmt::Display for AccountCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccountCause::Indeterminate => "account status indeterminate",
            AccountCause::NoAccount => "no account",
            AccountCause::Restricted => "account restricted",
            AccountCause::TemporarilyUnavailable => "account temporarily unavailable",
            AccountCause::Unknown => "account status unknown",
        };
        f.write_str(s)
    }
}

/// Why a sync pass failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", content = "detail", rename_all = "snake_case")]
pub enum SyncFailure {
    /// The remote account cannot be used.
    Account(AccountCause),
    /// The network could not be reached.
    Offline(String),
    /// The remote store failed in a way retries did not fix.
    Remote(String),
    /// Local durable state could not be read or written.
    Persistence(String),
    /// The execution window ended before the pass finished.
    Expired,
}

impl SyncFailure {
    /// Map an error raised by a sync step.
    pub fn from_error(err: &Error) -> Self {
        if let Error::AccountUnavailable(status) = err {
            return AccountCause::from_status(*status)
                .map(SyncFailure::Account)
                .unwrap_or(SyncFailure::Account(AccountCause::Unknown));
        }
        match err.kind() {
            ErrorKind::Connectivity => SyncFailure::Offline(err.to_string()),
            ErrorKind::Persistence => SyncFailure::Persistence(err.to_string()),
            _ => SyncFailure::Remote(err.to_string()),
        }
    }
}

impl From<SyncFailure> for Error {
    fn from(failure: SyncFailure) -> Self {
        match failure {
            SyncFailure::Account(cause) => Error::AccountUnavailable(match cause {
                AccountCause::NoAccount => AccountStatus::NoAccount,
                AccountCause::Restricted => AccountStatus::Restricted,
                AccountCause::TemporarilyUnavailable => AccountStatus::TemporarilyUnavailable,
                AccountCause::Indeterminate | AccountCause::Unknown => AccountStatus::Indeterminate,
            }),
            SyncFailure::Offline(detail) => Error::Network(detail),
            SyncFailure::Remote(detail) => Error::ServiceUnavailable(detail),
            SyncFailure::Persistence(detail) => Error::Persistence(detail),
            SyncFailure::Expired => Error::Cancelled("execution window expired".to_string()),
        }
    }
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncFailure::Account(cause) => write!(f, "{}", cause),
            SyncFailure::Offline(detail) => write!(f, "offline: {}", detail),
            SyncFailure::Remote(detail) => write!(f, "remote error: {}", detail),
            SyncFailure::Persistence(detail) => write!(f, "local storage error: {}", detail),
            SyncFailure::Expired => f.write_str("execution window expired"),
        }
    }
}

/// Lifecycle of the sync coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Completed { at: DateTime<Utc> },
    Failed { failure: SyncFailure },
}

impl SyncState {
    pub fn is_syncing(&self) -> bool {
        matches!(self, SyncState::Syncing)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Idle => f.write_str("idle"),
            SyncState::Syncing => f.write_str("syncing"),
            SyncState::Completed { at } => write!(f, "completed at {}", at.to_rfc3339()),
            SyncState::Failed { failure } => write!(f, "failed: {}", failure),
        }
    }
}

/// Progress of the running pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub total_operations: usize,
    pub completed_operations: usize,
    pub current_operation_label: Option<String>,
}

/// Snapshot published to observers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncState,
    /// Time of the last pass that reached `Completed`.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Present only while `state` is `Syncing`.
    pub progress: Option<SyncProgress>,
}

impl SyncStatus {
    pub(crate) fn begin(&mut self) {
        self.state = SyncState::Syncing;
        self.progress = Some(SyncProgress::default());
    }

    pub(crate) fn complete(&mut self, at: DateTime<Utc>) {
        self.state = SyncState::Completed { at };
        self.last_sync_at = Some(at);
        self.progress = None;
    }

    pub(crate) fn fail(&mut self, failure: SyncFailure) {
        self.state = SyncState::Failed { failure };
        self.progress = None;
    }
}
