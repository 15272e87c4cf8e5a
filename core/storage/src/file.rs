//! JSON-file backed queue and token stores.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use fitsync_common::{ChangeToken, EntityType, Error, PendingOperation, Result};

use crate::local::{QueueStore, TokenStore};

/// Write `contents` to `path` atomically: temp file, fsync, rename.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::Persistence(format!("Failed to create {:?}: {}", parent, e)))?;
    }

    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)
        .await
        .map_err(|e| Error::Persistence(format!("Failed to create {:?}: {}", tmp_path, e)))?;
    file.write_all(contents)
        .await
        .map_err(|e| Error::Persistence(format!("Failed to write {:?}: {}", tmp_path, e)))?;
    file.sync_all()
        .await
        .map_err(|e| Error::Persistence(format!("Failed to sync {:?}: {}", tmp_path, e)))?;
    drop(file);

    fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Persistence(format!("Failed to replace {:?}: {}", path, e)))
}

/// Read `path`, returning `None` if it does not exist.
async fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Persistence(format!("Failed to read {:?}: {}", path, e))),
    }
}

/// Queue store that keeps the whole queue in a single JSON document.
pub struct JsonFileQueueStore {
    path: PathBuf,
}

impl JsonFileQueueStore {
    /// Create a store persisting to `path`. The file is created on first write.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl QueueStore for JsonFileQueueStore {
    async fn load(&self) -> Result<Vec<PendingOperation>> {
        let Some(content) = read_optional(&self.path).await? else {
            return Ok(Vec::new());
        };

        let operations: Vec<PendingOperation> = serde_json::from_str(&content)
            .map_err(|e| Error::Serialization(format!("Corrupt queue file {:?}: {}", self.path, e)))?;
        for op in &operations {
            op.validate()?;
        }

        debug!("Loaded {} queued operations from {:?}", operations.len(), self.path);
        Ok(operations)
    }

    async fn store(&self, operations: &[PendingOperation]) -> Result<()> {
        let json = serde_json::to_vec_pretty(operations)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        write_atomic(&self.path, &json).await
    }
}

/// Token store that keeps all change tokens in one JSON object.
pub struct JsonFileTokenStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles.
    lock: Mutex<()>,
}

impl JsonFileTokenStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<BTreeMap<EntityType, ChangeToken>> {
        match read_optional(&self.path).await? {
            Some(content) => serde_json::from_str(&content)
                .map_err(|e| Error::Serialization(format!("Corrupt token file {:?}: {}", self.path, e))),
            None => Ok(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl TokenStore for JsonFileTokenStore {
    async fn load_token(&self, entity_type: &EntityType) -> Result<Option<ChangeToken>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(entity_type))
    }

    async fn store_token(&self, entity_type: &EntityType, token: &ChangeToken) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut tokens = self.read_all().await?;
        tokens.insert(entity_type.clone(), token.clone());
        let json = serde_json::to_vec_pretty(&tokens)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        write_atomic(&self.path, &json).await
    }

    async fn clear_tokens(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        write_atomic(&self.path, b"{}").await
    }
}
