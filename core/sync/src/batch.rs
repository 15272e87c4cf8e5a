//! Batch executor: applies record mutations to the remote store.
//!
//! Saves are split into chunks no larger than the remote store accepts and
//! dispatched through a bounded worker pool. Transient failures are retried
//! per chunk; everything else surfaces as a [`BatchError`] naming the chunk.

use futures::stream::{self, Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use fitsync_common::{
    ChangeToken, EntityType, Error, OperationKind, PendingOperation, Record, RecordId, Result,
};
use fitsync_storage::{FetchPage, PageCursor, RecordQuery, RemoteStore, SavePolicy};

use crate::queue::Outcome;
use crate::retry::{RetryConfig, RetryExecutor};

/// Largest number of records the remote store accepts per request.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 400;

/// Default number of concurrent remote requests.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Batch executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Records per remote request.
    pub max_batch_size: usize,
    /// Remote requests in flight at once.
    pub concurrency: usize,
    /// Merge policy for full saves.
    pub save_policy: SavePolicy,
}

impl BatchConfig {
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_save_policy(mut self, policy: SavePolicy) -> Self {
        self.save_policy = policy;
        self
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            save_policy: SavePolicy::default(),
        }
    }
}

/// A batch save that failed part-way.
#[derive(Debug, Error)]
#[error("Chunk {chunk_index} failed ({applied} records already saved): {source}")]
pub struct BatchError {
    /// Index of the first chunk that failed.
    pub chunk_index: usize,
    /// Records confirmed by chunks that succeeded.
    pub applied: usize,
    pub source: Error,
}

impl From<BatchError> for Error {
    fn from(err: BatchError) -> Self {
        err.source
    }
}

/// Everything a complete fetch returned.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub records: Vec<Record>,
    pub deleted: Vec<RecordId>,
    /// Token from the last page.
    pub change_token: Option<ChangeToken>,
    pub pages: usize,
}

/// Executes record mutations and fetches against a [`RemoteStore`].
pub struct BatchExecutor {
    remote: Arc<dyn RemoteStore>,
    config: BatchConfig,
    retry: RetryExecutor,
    pool: Arc<Semaphore>,
}

impl BatchExecutor {
    /// Create an executor. Zero sizes in `config` are treated as one.
    pub fn new(remote: Arc<dyn RemoteStore>, config: BatchConfig, retry: RetryConfig) -> Self {
        let config = BatchConfig {
            max_batch_size: config.max_batch_size.max(1),
            concurrency: config.concurrency.max(1),
            ..config
        };
        let pool = Arc::new(Semaphore::new(config.concurrency));
        Self {
            remote,
            config,
            retry: RetryExecutor::new(retry),
            pool,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Save records with the configured policy.
    pub async fn save_batch(&self, records: Vec<Record>) -> std::result::Result<Vec<Record>, BatchError> {
        self.save_with_policy(records, self.config.save_policy).await
    }

    /// Save records, one remote request per chunk.
    ///
    /// Results are returned in input order. When any chunk fails, the error
    /// names the lowest failing chunk; chunks that did succeed stay applied
    /// and resubmitting them is a no-op.
    pub async fn save_with_policy(
        &self,
        records: Vec<Record>,
        policy: SavePolicy,
    ) -> std::result::Result<Vec<Record>, BatchError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let chunks: Vec<Vec<Record>> = records
            .chunks(self.config.max_batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        debug!(
            "Saving {} records in {} chunks via {}",
            records.len(),
            chunks.len(),
            self.remote.name()
        );

        let chunk_count = chunks.len();
        let mut join_set: JoinSet<(usize, Result<Vec<Record>>)> = JoinSet::new();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let remote = Arc::clone(&self.remote);
            let pool = Arc::clone(&self.pool);
            let retry = self.retry.clone();

            join_set.spawn(async move {
                let _permit = match pool.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            index,
                            Err(Error::Cancelled("Worker pool closed unexpectedly".to_string())),
                        );
                    }
                };
                let result = retry
                    .execute(|| remote.save(chunk.clone(), policy))
                    .await;
                (index, result)
            });
        }

        let mut saved: BTreeMap<usize, Vec<Record>> = BTreeMap::new();
        let mut failures: BTreeMap<usize, Error> = BTreeMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Ok(records))) => {
                    saved.insert(index, records);
                }
                Ok((index, Err(err))) => {
                    failures.insert(index, err);
                }
                Err(join_err) => {
                    warn!("Save task aborted: {}", join_err);
                }
            }
        }
        for index in 0..chunk_count {
            if !saved.contains_key(&index) && !failures.contains_key(&index) {
                failures.insert(index, Error::Cancelled("Save task aborted".to_string()));
            }
        }

        if let Some((chunk_index, source)) = failures.into_iter().next() {
            let applied = saved.values().map(Vec::len).sum();
            warn!(
                "Batch save failed at chunk {} after {} records: {}",
                chunk_index, applied, source
            );
            return Err(BatchError {
                chunk_index,
                applied,
                source,
            });
        }

        Ok(saved.into_values().flatten().collect())
    }

    /// Delete records, one remote request per chunk.
    pub async fn delete(&self, entity_type: &EntityType, ids: Vec<RecordId>) -> Result<Vec<RecordId>> {
        let mut deleted = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.config.max_batch_size) {
            let _permit = self
                .pool
                .acquire()
                .await
                .map_err(|_| Error::Cancelled("Worker pool closed unexpectedly".to_string()))?;
            let confirmed = self
                .retry
                .execute(|| self.remote.delete(entity_type, chunk.to_vec()))
                .await?;
            deleted.extend(confirmed);
        }
        Ok(deleted)
    }

    /// Stream the pages of one fetch, following cursors until the last page.
    pub fn fetch_stream<'a>(
        &'a self,
        query: &'a RecordQuery,
        changed_since: Option<&'a ChangeToken>,
    ) -> impl Stream<Item = Result<FetchPage>> + Send + 'a {
        // `Some(cursor)` is the next page to request; `None` ends the stream.
        stream::try_unfold(Some(None::<PageCursor>), move |next| async move {
            let Some(cursor) = next else {
                return Ok(None);
            };
            let page = self
                .remote
                .fetch(query, changed_since, cursor.as_ref())
                .await?;
            let following = page.next_cursor.clone().map(Some);
            Ok(Some((page, following)))
        })
    }

    /// Fetch every page matching `query`.
    ///
    /// A transient failure on any page restarts the fetch from the first page.
    pub async fn fetch(
        &self,
        query: &RecordQuery,
        changed_since: Option<&ChangeToken>,
    ) -> Result<FetchResult> {
        self.retry
            .execute(|| async {
                let pages: Vec<FetchPage> = self.fetch_stream(query, changed_since).try_collect().await?;
                let mut result = FetchResult {
                    pages: pages.len(),
                    ..FetchResult::default()
                };
                for page in pages {
                    result.records.extend(page.records);
                    result.deleted.extend(page.deleted);
                    if page.change_token.is_some() {
                        result.change_token = page.change_token;
                    }
                }
                Ok(result)
            })
            .await
    }

    /// Apply one queued operation and return the confirmed record, if any.
    ///
    /// `Save` uses the configured policy; `Modify` only ever writes the
    /// fields marked as changed.
    pub async fn submit(&self, op: &PendingOperation) -> Result<Option<Record>> {
        match (op.kind, &op.payload) {
            (OperationKind::Delete, _) => {
                self.delete(&op.entity_type, vec![op.record_id.clone()])
                    .await?;
                Ok(None)
            }
            (kind, Some(record)) => {
                let policy = match kind {
                    OperationKind::Modify => SavePolicy::ChangedFields,
                    _ => self.config.save_policy,
                };
                let mut saved = self.save_with_policy(vec![record.clone()], policy).await?;
                Ok(saved.pop())
            }
            (kind, None) => Err(Error::InvalidInput(format!(
                "{} operation {} has no payload",
                kind, op.id
            ))),
        }
    }

    /// Apply one queued operation and classify the result.
    pub async fn apply(&self, op: &PendingOperation) -> Outcome {
        Outcome::from_result(self.submit(op).await.map(|_| ()))
    }
}

impl Outcome {
    /// Classify the result of a remote call.
    pub fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Outcome::Success,
            Err(err) if err.is_retryable() => Outcome::Retryable(err.to_string()),
            Err(err) => Outcome::Terminal(err.to_string()),
        }
    }
}
