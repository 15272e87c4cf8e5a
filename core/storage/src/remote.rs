//! Remote record store trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use fitsync_common::{AccountStatus, ChangeToken, EntityType, Record, RecordId, Result};

/// How a saved record is merged into the version already held remotely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SavePolicy {
    /// Overwrite only the fields the client changed locally.
    #[default]
    ChangedFields,
    /// Replace every field with the client's version.
    AllFields,
}

/// Selects records of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub entity_type: EntityType,
    /// Restrict to these ids.
    pub ids: Option<BTreeSet<RecordId>>,
    /// Restrict to records modified strictly after this time.
    pub modified_after: Option<DateTime<Utc>>,
}

impl RecordQuery {
    /// Every record of `entity_type`.
    pub fn all(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            ids: None,
            modified_after: None,
        }
    }

    /// Records of `entity_type` with the given ids.
    pub fn by_ids(entity_type: EntityType, ids: impl IntoIterator<Item = RecordId>) -> Self {
        Self {
            entity_type,
            ids: Some(ids.into_iter().collect()),
            modified_after: None,
        }
    }

    pub fn modified_after(mut self, at: DateTime<Utc>) -> Self {
        self.modified_after = Some(at);
        self
    }

    /// Check whether a record satisfies this query.
    pub fn matches(&self, record: &Record) -> bool {
        if record.entity_type != self.entity_type {
            return false;
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&record.id) {
                return false;
            }
        }
        match self.modified_after {
            Some(after) => record.modified_at > after,
            None => true,
        }
    }
}

/// Position inside a paged fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor(pub String);

/// One page of a fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchPage {
    pub records: Vec<Record>,
    /// Records removed remotely since the requested token. Always empty for full fetches.
    pub deleted: Vec<RecordId>,
    /// Cursor for the next page; `None` on the last page.
    pub next_cursor: Option<PageCursor>,
    /// Token covering everything up to the end of this fetch.
    pub change_token: Option<ChangeToken>,
}

/// Remote store trait for the authoritative record service.
///
/// Errors must be classifiable through `Error::is_retryable`: transport,
/// throttling and timeouts are retryable, permission and schema problems are
/// terminal.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get the store name (e.g., "memory", "directory").
    fn name(&self) -> &str;

    /// Report whether the remote account can be used.
    async fn account_status(&self) -> Result<AccountStatus>;

    /// Save records in one request.
    ///
    /// # Postconditions
    /// - Every record is merged according to `policy`
    /// - Returns the stored versions in request order
    /// - Saving a version identical to the stored one changes nothing
    async fn save(&self, records: Vec<Record>, policy: SavePolicy) -> Result<Vec<Record>>;

    /// Delete records in one request.
    ///
    /// Deleting a record that does not exist succeeds.
    async fn delete(&self, entity_type: &EntityType, ids: Vec<RecordId>) -> Result<Vec<RecordId>>;

    /// Fetch one page of records matching `query`.
    ///
    /// With `changed_since`, only records changed after that token are
    /// returned, together with ids deleted since then.
    async fn fetch(
        &self,
        query: &RecordQuery,
        changed_since: Option<&ChangeToken>,
        cursor: Option<&PageCursor>,
    ) -> Result<FetchPage>;
}
