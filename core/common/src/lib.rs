//! Common utilities and types shared across fitsync modules.
//!
//! This module provides the record model, the queued-operation model and the
//! error taxonomy used by the storage, sync and background crates.

pub mod duration;
pub mod error;
pub mod types;

pub use error::{Error, ErrorKind, Result};
pub use types::{
    AccountStatus, ChangeToken, EntityType, OperationKind, PendingOperation, Record, RecordId,
};
