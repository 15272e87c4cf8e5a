//! On-device store interfaces: records, queued operations and change tokens.

use async_trait::async_trait;

use fitsync_common::{ChangeToken, EntityType, PendingOperation, Record, RecordId, Result};

use crate::remote::RecordQuery;

/// Local persistent cache of remote records.
///
/// Each call is one transaction: either every record in it is written or none.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Insert or replace records.
    async fn upsert(&self, records: Vec<Record>) -> Result<()>;

    /// Delete records; unknown ids are ignored.
    async fn delete(&self, entity_type: &EntityType, ids: &[RecordId]) -> Result<()>;

    /// Return every record matching `query`.
    async fn query(&self, query: &RecordQuery) -> Result<Vec<Record>>;
}

/// Durable backing for the operation queue.
///
/// Implementations must make `store` atomic: after a crash, `load` returns
/// either the previous or the new list, never a mix.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Load the persisted queue in FIFO order.
    async fn load(&self) -> Result<Vec<PendingOperation>>;

    /// Replace the persisted queue with `operations`.
    async fn store(&self, operations: &[PendingOperation]) -> Result<()>;

    /// Reclaim space after many removals.
    async fn compact(&self) -> Result<()> {
        Ok(())
    }
}

/// Durable per-entity-type change tokens.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load_token(&self, entity_type: &EntityType) -> Result<Option<ChangeToken>>;

    async fn store_token(&self, entity_type: &EntityType, token: &ChangeToken) -> Result<()>;

    /// Forget every token, forcing the next incremental fetch to start over.
    async fn clear_tokens(&self) -> Result<()>;
}
