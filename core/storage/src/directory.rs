//! Filesystem-backed remote store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use fitsync_common::{AccountStatus, ChangeToken, EntityType, Error, Record, RecordId, Result};

use crate::policy::apply_save_policy;
use crate::remote::{FetchPage, PageCursor, RecordQuery, RemoteStore, SavePolicy};

const SEQUENCE_FILE: &str = ".sequence";
const ACCOUNT_FILE: &str = ".account";
const TOMBSTONE_DIR: &str = ".tombstones";

/// Record file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    record: Record,
    seq: u64,
}

/// Remote store kept in a directory, e.g. on a mounted network share.
///
/// Layout: `<root>/<entity_type>/<record_id>.json` per record,
/// `<root>/.tombstones/<entity_type>/<record_id>` per deletion and a
/// `<root>/.sequence` change counter. An optional `<root>/.account` file
/// holding a JSON `AccountStatus` overrides the reported account status.
/// I/O failures are reported as `ServiceUnavailable` so callers retry them.
pub struct DirectoryRemoteStore {
    root: PathBuf,
    page_size: usize,
    /// Serializes writers so the sequence counter stays consistent.
    write_lock: Mutex<()>,
}

fn unavailable(context: &str, e: std::io::Error) -> Error {
    Error::ServiceUnavailable(format!("{}: {}", context, e))
}

fn validate_component(id: &RecordId) -> Result<()> {
    let raw = id.as_str();
    if raw.contains('/') || raw.contains('\\') || raw.starts_with('.') {
        return Err(Error::InvalidRecord(format!(
            "Record id not storable in a directory: {}",
            raw
        )));
    }
    Ok(())
}

impl DirectoryRemoteStore {
    /// Create a store rooted at `root`.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self {
            root,
            page_size: 200,
            write_lock: Mutex::new(()),
        })
    }

    /// Set the number of records returned per fetch page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn entity_dir(&self, entity_type: &EntityType) -> PathBuf {
        self.root.join(entity_type.as_str())
    }

    fn record_path(&self, entity_type: &EntityType, id: &RecordId) -> PathBuf {
        self.entity_dir(entity_type).join(format!("{}.json", id))
    }

    fn tombstone_path(&self, entity_type: &EntityType, id: &RecordId) -> PathBuf {
        self.root
            .join(TOMBSTONE_DIR)
            .join(entity_type.as_str())
            .join(id.as_str())
    }

    async fn current_seq(&self) -> Result<u64> {
        match fs::read_to_string(self.root.join(SEQUENCE_FILE)).await {
            Ok(raw) => raw
                .trim()
                .parse()
                .map_err(|_| Error::Serialization(format!("Corrupt sequence file: {}", raw))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(unavailable("Failed to read sequence", e)),
        }
    }

    async fn next_seq(&self) -> Result<u64> {
        let seq = self.current_seq().await? + 1;
        fs::write(self.root.join(SEQUENCE_FILE), seq.to_string())
            .await
            .map_err(|e| unavailable("Failed to write sequence", e))?;
        Ok(seq)
    }

    async fn read_stored(&self, path: &Path) -> Result<Option<StoredRecord>> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::Serialization(format!("Corrupt record {:?}: {}", path, e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable("Failed to read record", e)),
        }
    }

    async fn list_stored(&self, entity_type: &EntityType) -> Result<Vec<StoredRecord>> {
        let dir = self.entity_dir(entity_type);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(unavailable("Failed to list records", e)),
        };

        let mut stored = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| unavailable("Failed to list records", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = self.read_stored(&path).await? {
                stored.push(record);
            }
        }
        Ok(stored)
    }

    async fn list_tombstones(&self, entity_type: &EntityType, since: u64) -> Result<Vec<RecordId>> {
        let dir = self.root.join(TOMBSTONE_DIR).join(entity_type.as_str());
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(unavailable("Failed to list tombstones", e)),
        };

        let mut deleted = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| unavailable("Failed to list tombstones", e))?
        {
            let raw = fs::read_to_string(entry.path())
                .await
                .map_err(|e| unavailable("Failed to read tombstone", e))?;
            let seq: u64 = raw.trim().parse().unwrap_or(0);
            if seq > since {
                let name = entry.file_name().to_string_lossy().into_owned();
                deleted.push(RecordId::new(name)?);
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl RemoteStore for DirectoryRemoteStore {
    fn name(&self) -> &str {
        "directory"
    }

    async fn account_status(&self) -> Result<AccountStatus> {
        if !self.root.exists() {
            return Ok(AccountStatus::NoAccount);
        }
        match fs::read_to_string(self.root.join(ACCOUNT_FILE)).await {
            Ok(raw) => serde_json::from_str(raw.trim())
                .map_err(|e| Error::Serialization(format!("Corrupt account file: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AccountStatus::Available),
            Err(e) => Err(unavailable("Failed to read account status", e)),
        }
    }

    async fn save(&self, records: Vec<Record>, policy: SavePolicy) -> Result<Vec<Record>> {
        for record in &records {
            validate_component(&record.id)?;
        }

        let _guard = self.write_lock.lock().await;
        let mut saved = Vec::with_capacity(records.len());

        for incoming in &records {
            let path = self.record_path(&incoming.entity_type, &incoming.id);
            let existing = self.read_stored(&path).await?.map(|s| s.record);
            let merged = apply_save_policy(existing.as_ref(), incoming, policy);

            if existing.as_ref() != Some(&merged) {
                let seq = self.next_seq().await?;
                let stored = StoredRecord {
                    record: merged.clone(),
                    seq,
                };
                let json = serde_json::to_vec_pretty(&stored)
                    .map_err(|e| Error::Serialization(e.to_string()))?;

                fs::create_dir_all(self.entity_dir(&incoming.entity_type))
                    .await
                    .map_err(|e| unavailable("Failed to create entity directory", e))?;
                fs::write(&path, json)
                    .await
                    .map_err(|e| unavailable("Failed to write record", e))?;

                let tombstone = self.tombstone_path(&incoming.entity_type, &incoming.id);
                if tombstone.exists() {
                    fs::remove_file(&tombstone)
                        .await
                        .map_err(|e| unavailable("Failed to clear tombstone", e))?;
                }
                debug!("Stored {}/{} at seq {}", incoming.entity_type, incoming.id, seq);
            }
            saved.push(merged);
        }

        Ok(saved)
    }

    async fn delete(&self, entity_type: &EntityType, ids: Vec<RecordId>) -> Result<Vec<RecordId>> {
        for id in &ids {
            validate_component(id)?;
        }

        let _guard = self.write_lock.lock().await;
        for id in &ids {
            let path = self.record_path(entity_type, id);
            if !path.exists() {
                continue;
            }
            fs::remove_file(&path)
                .await
                .map_err(|e| unavailable("Failed to delete record", e))?;

            let seq = self.next_seq().await?;
            let tombstone = self.tombstone_path(entity_type, id);
            if let Some(parent) = tombstone.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| unavailable("Failed to create tombstone directory", e))?;
            }
            fs::write(&tombstone, seq.to_string())
                .await
                .map_err(|e| unavailable("Failed to write tombstone", e))?;
        }
        Ok(ids)
    }

    async fn fetch(
        &self,
        query: &RecordQuery,
        changed_since: Option<&ChangeToken>,
        cursor: Option<&PageCursor>,
    ) -> Result<FetchPage> {
        let since = match changed_since {
            Some(token) => Some(token.as_str().parse::<u64>().map_err(|_| {
                Error::InvalidInput(format!("Unrecognized change token: {}", token))
            })?),
            None => None,
        };
        let offset = match cursor {
            Some(PageCursor(raw)) => raw
                .parse::<usize>()
                .map_err(|_| Error::InvalidInput(format!("Unrecognized page cursor: {}", raw)))?,
            None => 0,
        };

        // Read the counter first so the token never skips a concurrent write.
        let token_seq = self.current_seq().await?;

        let mut matching: Vec<StoredRecord> = self
            .list_stored(&query.entity_type)
            .await?
            .into_iter()
            .filter(|s| query.matches(&s.record))
            .filter(|s| match since {
                Some(since) => s.seq > since,
                None => true,
            })
            .collect();
        matching.sort_by(|a, b| a.seq.cmp(&b.seq).then_with(|| a.record.id.cmp(&b.record.id)));

        let end = (offset + self.page_size).min(matching.len());
        let records = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|s| s.record.clone())
            .collect();
        let next_cursor = (end < matching.len()).then(|| PageCursor(end.to_string()));

        let deleted = match since {
            Some(since) if offset == 0 => self.list_tombstones(&query.entity_type, since).await?,
            _ => Vec::new(),
        };

        Ok(FetchPage {
            records,
            deleted,
            next_cursor,
            change_token: Some(ChangeToken::new(token_seq.to_string())),
        })
    }
}
