//! Storage backends for fitsync.
//!
//! This crate defines the two sides a sync pass moves records between:
//! the [`RemoteStore`] (the authoritative cloud database) and the on-device
//! [`LocalStore`], plus the durable [`QueueStore`] and [`TokenStore`] that
//! hold pending mutations and incremental-fetch cursors.
//!
//! # Backends
//! - [`memory`]: in-process doubles with failure injection, for tests
//! - [`file`]: JSON documents on disk for the queue and tokens
//! - [`sqlite`]: a single SQLite database holding all local state
//! - [`directory`]: a remote store backed by a shared directory

pub mod directory;
pub mod file;
pub mod local;
pub mod memory;
pub mod policy;
pub mod remote;
pub mod sqlite;

pub use directory::DirectoryRemoteStore;
pub use file::{JsonFileQueueStore, JsonFileTokenStore};
pub use local::{LocalStore, QueueStore, TokenStore};
pub use memory::{MemoryLocalStore, MemoryQueueStore, MemoryRemoteStore, MemoryTokenStore, RemoteOp};
pub use policy::apply_save_policy;
pub use remote::{FetchPage, PageCursor, RecordQuery, RemoteStore, SavePolicy};
pub use sqlite::SqliteStore;
