//! SQLite-backed local store, operation queue and change tokens.
//!
//! One database holds the three pieces of on-device sync state so a single
//! file can be backed up or wiped together.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use fitsync_common::{
    ChangeToken, EntityType, Error, OperationKind, PendingOperation, Record, RecordId, Result,
};

use crate::local::{LocalStore, QueueStore, TokenStore};
use crate::remote::RecordQuery;

fn db_err(e: rusqlite::Error) -> Error {
    Error::Persistence(format!("SQLite: {}", e))
}

fn json_err(e: serde_json::Error) -> Error {
    Error::Serialization(e.to_string())
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Serialization(format!("Bad timestamp {}: {}", raw, e)))
}

/// Raw `records` row before JSON decoding.
struct RecordRow {
    entity_type: String,
    id: String,
    fields: String,
    modified_at: String,
    changed_fields: String,
}

impl RecordRow {
    fn into_record(self) -> Result<Record> {
        let fields: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(&self.fields).map_err(json_err)?;
        let changed_fields: BTreeSet<String> =
            serde_json::from_str(&self.changed_fields).map_err(json_err)?;
        Ok(Record {
            id: RecordId::new(self.id)?,
            entity_type: EntityType::new(self.entity_type)?,
            fields,
            modified_at: parse_time(&self.modified_at)?,
            changed_fields,
        })
    }
}

/// Raw `pending_operations` row before decoding.
struct OperationRow {
    id: String,
    kind: String,
    entity_type: String,
    record_id: String,
    payload: Option<String>,
    enqueued_at: String,
}

impl OperationRow {
    fn into_operation(self) -> Result<PendingOperation> {
        let payload = self
            .payload
            .map(|raw| serde_json::from_str::<Record>(&raw))
            .transpose()
            .map_err(json_err)?;
        let op = PendingOperation {
            id: self.id,
            kind: self.kind.parse::<OperationKind>()?,
            entity_type: EntityType::new(self.entity_type)?,
            record_id: RecordId::new(self.record_id)?,
            payload,
            enqueued_at: parse_time(&self.enqueued_at)?,
        };
        op.validate()?;
        Ok(op)
    }
}

/// SQLite store implementing [`LocalStore`], [`QueueStore`] and [`TokenStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open a database file.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(db_err)?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS records (
                entity_type TEXT NOT NULL,
                id TEXT NOT NULL,
                fields TEXT NOT NULL,
                modified_at TEXT NOT NULL,
                changed_fields TEXT NOT NULL,
                PRIMARY KEY (entity_type, id)
            );

            CREATE TABLE IF NOT EXISTS pending_operations (
                position INTEGER PRIMARY KEY,
                id TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                record_id TEXT NOT NULL,
                payload TEXT,
                enqueued_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS change_tokens (
                entity_type TEXT PRIMARY KEY,
                token TEXT NOT NULL
            );
            "#,
        )
        .map_err(db_err)?;

        info!("Sync database opened at {:?}", db_path.as_ref());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of cached records of one type.
    pub fn record_count(&self, entity_type: &EntityType) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM records WHERE entity_type = ?1",
                [entity_type.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count as usize)
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn upsert(&self, records: Vec<Record>) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare(
                    r#"
                    INSERT OR REPLACE INTO records
                    (entity_type, id, fields, modified_at, changed_fields)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                )
                .map_err(db_err)?;
            for record in &records {
                stmt.execute(params![
                    record.entity_type.as_str(),
                    record.id.as_str(),
                    serde_json::to_string(&record.fields).map_err(json_err)?,
                    record.modified_at.to_rfc3339(),
                    serde_json::to_string(&record.changed_fields).map_err(json_err)?,
                ])
                .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;
        debug!("Upserted {} local records", records.len());
        Ok(())
    }

    async fn delete(&self, entity_type: &EntityType, ids: &[RecordId]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare("DELETE FROM records WHERE entity_type = ?1 AND id = ?2")
                .map_err(db_err)?;
            for id in ids {
                stmt.execute(params![entity_type.as_str(), id.as_str()])
                    .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<Record>> {
        let rows: Vec<RecordRow> = {
            let conn = self.conn();
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT entity_type, id, fields, modified_at, changed_fields
                    FROM records WHERE entity_type = ?1 ORDER BY id
                    "#,
                )
                .map_err(db_err)?;
            let mapped = stmt
                .query_map([query.entity_type.as_str()], |row| {
                    Ok(RecordRow {
                        entity_type: row.get(0)?,
                        id: row.get(1)?,
                        fields: row.get(2)?,
                        modified_at: row.get(3)?,
                        changed_fields: row.get(4)?,
                    })
                })
                .map_err(db_err)?;
            mapped.collect::<rusqlite::Result<_>>().map_err(db_err)?
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record = row.into_record()?;
            if query.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl QueueStore for SqliteStore {
    async fn load(&self) -> Result<Vec<PendingOperation>> {
        let rows: Vec<OperationRow> = {
            let conn = self.conn();
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT id, kind, entity_type, record_id, payload, enqueued_at
                    FROM pending_operations ORDER BY position
                    "#,
                )
                .map_err(db_err)?;
            let mapped = stmt
                .query_map([], |row| {
                    Ok(OperationRow {
                        id: row.get(0)?,
                        kind: row.get(1)?,
                        entity_type: row.get(2)?,
                        record_id: row.get(3)?,
                        payload: row.get(4)?,
                        enqueued_at: row.get(5)?,
                    })
                })
                .map_err(db_err)?;
            mapped.collect::<rusqlite::Result<_>>().map_err(db_err)?
        };

        rows.into_iter().map(OperationRow::into_operation).collect()
    }

    async fn store(&self, operations: &[PendingOperation]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM pending_operations", [])
            .map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare(
                    r#"
                    INSERT INTO pending_operations
                    (position, id, kind, entity_type, record_id, payload, enqueued_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                )
                .map_err(db_err)?;
            for (position, op) in operations.iter().enumerate() {
                let payload = op
                    .payload
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .map_err(json_err)?;
                stmt.execute(params![
                    position as i64,
                    op.id,
                    op.kind.to_string(),
                    op.entity_type.as_str(),
                    op.record_id.as_str(),
                    payload,
                    op.enqueued_at.to_rfc3339(),
                ])
                .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)
    }

    async fn compact(&self) -> Result<()> {
        self.conn().execute_batch("VACUUM").map_err(db_err)?;
        debug!("Sync database vacuumed");
        Ok(())
    }
}

#[async_trait]
impl TokenStore for SqliteStore {
    async fn load_token(&self, entity_type: &EntityType) -> Result<Option<ChangeToken>> {
        let token: Option<String> = self
            .conn()
            .query_row(
                "SELECT token FROM change_tokens WHERE entity_type = ?1",
                [entity_type.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(token.map(ChangeToken::new))
    }

    async fn store_token(&self, entity_type: &EntityType, token: &ChangeToken) -> Result<()> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO change_tokens (entity_type, token) VALUES (?1, ?2)",
                params![entity_type.as_str(), token.as_str()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn clear_tokens(&self) -> Result<()> {
        self.conn()
            .execute("DELETE FROM change_tokens", [])
            .map_err(db_err)?;
        Ok(())
    }
}
