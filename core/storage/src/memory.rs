//! In-memory stores for testing and development.
//!
//! All data is stored in memory and lost on drop. The remote store can be
//! switched offline and told to fail specific calls, which is how the sync
//! engine's failure handling is exercised.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use fitsync_common::{
    AccountStatus, ChangeToken, EntityType, Error, PendingOperation, Record, RecordId, Result,
};

use crate::local::{LocalStore, QueueStore, TokenStore};
use crate::policy::apply_save_policy;
use crate::remote::{FetchPage, PageCursor, RecordQuery, RemoteStore, SavePolicy};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type RecordKey = (EntityType, RecordId);

/// Remote call categories that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOp {
    AccountStatus,
    Save,
    Delete,
    Fetch,
}

struct ScheduledFailure {
    op: RemoteOp,
    /// Calls of `op` to let through before failing.
    skip: usize,
    make: fn() -> Error,
}

#[derive(Debug, Clone)]
struct Stored {
    record: Record,
    seq: u64,
}

struct RemoteState {
    account: AccountStatus,
    records: BTreeMap<RecordKey, Stored>,
    tombstones: BTreeMap<RecordKey, u64>,
    seq: u64,
    page_size: usize,
    failures: Vec<ScheduledFailure>,
    rejected: HashMap<RecordId, fn() -> Error>,
    save_requests: Vec<usize>,
    save_log: Vec<RecordId>,
}

impl RemoteState {
    fn take_failure(&mut self, op: RemoteOp) -> Option<Error> {
        let index = self.failures.iter().position(|f| f.op == op)?;
        if self.failures[index].skip > 0 {
            self.failures[index].skip -= 1;
            return None;
        }
        Some((self.failures.remove(index).make)())
    }

    fn bump(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn check_account(&self) -> Result<()> {
        if self.account.is_available() {
            Ok(())
        } else {
            Err(Error::AccountUnavailable(self.account))
        }
    }
}

/// In-memory remote store.
///
/// Keeps a change sequence so that change tokens are the sequence number of
/// the last change covered.
pub struct MemoryRemoteStore {
    state: Mutex<RemoteState>,
}

impl MemoryRemoteStore {
    /// Create an empty, reachable remote store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RemoteState {
                account: AccountStatus::Available,
                records: BTreeMap::new(),
                tombstones: BTreeMap::new(),
                seq: 0,
                page_size: 100,
                failures: Vec::new(),
                rejected: HashMap::new(),
                save_requests: Vec::new(),
                save_log: Vec::new(),
            }),
        }
    }

    /// Change the reported account status. Anything but `Available` makes
    /// every other call fail with `AccountUnavailable`.
    pub fn set_account_status(&self, status: AccountStatus) {
        lock(&self.state).account = status;
    }

    /// Records returned per fetch page.
    pub fn set_page_size(&self, page_size: usize) {
        lock(&self.state).page_size = page_size.max(1);
    }

    /// Let `skip` calls of `op` succeed, then fail the next one with `make()`.
    pub fn fail_after(&self, op: RemoteOp, skip: usize, make: fn() -> Error) {
        lock(&self.state)
            .failures
            .push(ScheduledFailure { op, skip, make });
    }

    /// Fail the next call of `op`.
    pub fn fail_next(&self, op: RemoteOp, make: fn() -> Error) {
        self.fail_after(op, 0, make);
    }

    /// Reject every save request containing `id`.
    pub fn reject_record(&self, id: RecordId, make: fn() -> Error) {
        lock(&self.state).rejected.insert(id, make);
    }

    /// Write a record as if another device saved it.
    pub fn insert_remote(&self, record: Record) {
        let mut state = lock(&self.state);
        let seq = state.bump();
        let key = (record.entity_type.clone(), record.id.clone());
        state.tombstones.remove(&key);
        state.records.insert(key, Stored { record, seq });
    }

    /// Delete a record as if another device removed it.
    pub fn remove_remote(&self, entity_type: &EntityType, id: &RecordId) {
        let mut state = lock(&self.state);
        let key = (entity_type.clone(), id.clone());
        if state.records.remove(&key).is_some() {
            let seq = state.bump();
            state.tombstones.insert(key, seq);
        }
    }

    /// Get a stored record.
    pub fn record(&self, entity_type: &EntityType, id: &RecordId) -> Option<Record> {
        lock(&self.state)
            .records
            .get(&(entity_type.clone(), id.clone()))
            .map(|s| s.record.clone())
    }

    /// All stored records of one type, ordered by id.
    pub fn records(&self, entity_type: &EntityType) -> Vec<Record> {
        lock(&self.state)
            .records
            .iter()
            .filter(|((t, _), _)| t == entity_type)
            .map(|(_, s)| s.record.clone())
            .collect()
    }

    /// Size of every successful save request, in call order.
    pub fn save_requests(&self) -> Vec<usize> {
        lock(&self.state).save_requests.clone()
    }

    /// Ids of every saved record, in the order they were applied.
    pub fn save_log(&self) -> Vec<RecordId> {
        lock(&self.state).save_log.clone()
    }

    /// Number of state changes so far.
    pub fn change_count(&self) -> u64 {
        lock(&self.state).seq
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_token(token: &ChangeToken) -> Result<u64> {
    token
        .as_str()
        .parse()
        .map_err(|_| Error::InvalidInput(format!("Unrecognized change token: {}", token)))
}

fn parse_cursor(cursor: Option<&PageCursor>) -> Result<usize> {
    match cursor {
        Some(PageCursor(raw)) => raw
            .parse()
            .map_err(|_| Error::InvalidInput(format!("Unrecognized page cursor: {}", raw))),
        None => Ok(0),
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn account_status(&self) -> Result<AccountStatus> {
        let mut state = lock(&self.state);
        if let Some(err) = state.take_failure(RemoteOp::AccountStatus) {
            return Err(err);
        }
        Ok(state.account)
    }

    async fn save(&self, records: Vec<Record>, policy: SavePolicy) -> Result<Vec<Record>> {
        let mut state = lock(&self.state);
        state.check_account()?;
        if let Some(err) = state.take_failure(RemoteOp::Save) {
            return Err(err);
        }
        if let Some(make) = records.iter().find_map(|r| state.rejected.get(&r.id)) {
            return Err(make());
        }

        let mut saved = Vec::with_capacity(records.len());
        for incoming in &records {
            let key = (incoming.entity_type.clone(), incoming.id.clone());
            let existing = state.records.get(&key).map(|s| s.record.clone());
            let merged = apply_save_policy(existing.as_ref(), incoming, policy);

            if existing.as_ref() != Some(&merged) {
                let seq = state.bump();
                state.tombstones.remove(&key);
                state.records.insert(
                    key,
                    Stored {
                        record: merged.clone(),
                        seq,
                    },
                );
            }
            state.save_log.push(incoming.id.clone());
            saved.push(merged);
        }

        state.save_requests.push(records.len());
        Ok(saved)
    }

    async fn delete(&self, entity_type: &EntityType, ids: Vec<RecordId>) -> Result<Vec<RecordId>> {
        let mut state = lock(&self.state);
        state.check_account()?;
        if let Some(err) = state.take_failure(RemoteOp::Delete) {
            return Err(err);
        }

        for id in &ids {
            let key = (entity_type.clone(), id.clone());
            if state.records.remove(&key).is_some() {
                let seq = state.bump();
                state.tombstones.insert(key, seq);
            }
        }
        Ok(ids)
    }

    async fn fetch(
        &self,
        query: &RecordQuery,
        changed_since: Option<&ChangeToken>,
        cursor: Option<&PageCursor>,
    ) -> Result<FetchPage> {
        let mut state = lock(&self.state);
        state.check_account()?;
        if let Some(err) = state.take_failure(RemoteOp::Fetch) {
            return Err(err);
        }

        let since = changed_since.map(parse_token).transpose()?;
        let offset = parse_cursor(cursor)?;

        let mut matching: Vec<&Stored> = state
            .records
            .values()
            .filter(|s| query.matches(&s.record))
            .filter(|s| match since {
                Some(since) => s.seq > since,
                None => true,
            })
            .collect();
        if since.is_some() {
            matching.sort_by_key(|s| s.seq);
        }

        let end = (offset + state.page_size).min(matching.len());
        let records = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|s| s.record.clone())
            .collect();
        let next_cursor = (end < matching.len()).then(|| PageCursor(end.to_string()));

        // Deletions ride on the first page only.
        let deleted = match since {
            Some(since) if offset == 0 => state
                .tombstones
                .iter()
                .filter(|((t, _), seq)| t == &query.entity_type && **seq > since)
                .map(|((_, id), _)| id.clone())
                .collect(),
            _ => Vec::new(),
        };

        Ok(FetchPage {
            records,
            deleted,
            next_cursor,
            change_token: Some(ChangeToken::new(state.seq.to_string())),
        })
    }
}

/// In-memory local store.
#[derive(Default)]
pub struct MemoryLocalStore {
    records: Mutex<BTreeMap<RecordKey, Record>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity_type: &EntityType, id: &RecordId) -> Option<Record> {
        lock(&self.records)
            .get(&(entity_type.clone(), id.clone()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.records).is_empty()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn upsert(&self, records: Vec<Record>) -> Result<()> {
        let mut stored = lock(&self.records);
        for record in records {
            stored.insert((record.entity_type.clone(), record.id.clone()), record);
        }
        Ok(())
    }

    async fn delete(&self, entity_type: &EntityType, ids: &[RecordId]) -> Result<()> {
        let mut stored = lock(&self.records);
        for id in ids {
            stored.remove(&(entity_type.clone(), id.clone()));
        }
        Ok(())
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<Record>> {
        Ok(lock(&self.records)
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect())
    }
}

/// In-memory queue store with optional write-failure injection.
#[derive(Default)]
pub struct MemoryQueueStore {
    operations: Mutex<Vec<PendingOperation>>,
    failing_writes: Mutex<usize>,
    writes: Mutex<usize>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-existing entries, as if left behind by an earlier process.
    pub fn with_operations(operations: Vec<PendingOperation>) -> Self {
        Self {
            operations: Mutex::new(operations),
            ..Self::default()
        }
    }

    /// Make the next `count` writes fail with a persistence error.
    pub fn fail_writes(&self, count: usize) {
        *lock(&self.failing_writes) = count;
    }

    /// What a restarted process would load.
    pub fn persisted(&self) -> Vec<PendingOperation> {
        lock(&self.operations).clone()
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> usize {
        *lock(&self.writes)
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn load(&self) -> Result<Vec<PendingOperation>> {
        Ok(lock(&self.operations).clone())
    }

    async fn store(&self, operations: &[PendingOperation]) -> Result<()> {
        {
            let mut failing = lock(&self.failing_writes);
            if *failing > 0 {
                *failing -= 1;
                return Err(Error::Persistence("Injected queue write failure".to_string()));
            }
        }
        *lock(&self.operations) = operations.to_vec();
        *lock(&self.writes) += 1;
        Ok(())
    }
}

/// In-memory token store.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<EntityType, ChangeToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load_token(&self, entity_type: &EntityType) -> Result<Option<ChangeToken>> {
        Ok(lock(&self.tokens).get(entity_type).cloned())
    }

    async fn store_token(&self, entity_type: &EntityType, token: &ChangeToken) -> Result<()> {
        lock(&self.tokens).insert(entity_type.clone(), token.clone());
        Ok(())
    }

    async fn clear_tokens(&self) -> Result<()> {
        lock(&self.tokens).clear();
        Ok(())
    }
}
