//! Common types used throughout fitsync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Tag identifying a record schema (e.g. "goal", "workout", "meal").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    /// Create a new entity type tag.
    ///
    /// # Errors
    /// - Returns error if the tag is empty or contains a path separator
    pub fn new(tag: impl Into<String>) -> crate::Result<Self> {
        let tag = tag.into();
        if tag.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Entity type cannot be empty".to_string(),
            ));
        }
        if tag.contains('/') || tag.contains('\\') {
            return Err(crate::Error::InvalidInput(format!(
                "Entity type cannot contain separators: {}",
                tag
            )));
        }
        Ok(Self(tag))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Remote-store identifier of a record.
///
/// May be generated locally before the record ever reached the remote store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Create a record id from an existing identifier.
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Record id cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Generate a fresh local identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque cursor marking how far incremental fetch has been applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeToken(String);

impl ChangeToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A snapshot of one record as exchanged between local and remote stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub entity_type: EntityType,
    pub fields: BTreeMap<String, serde_json::Value>,
    /// Time of the write that produced this version.
    pub modified_at: DateTime<Utc>,
    /// Fields edited locally since the last confirmed save. Empty means all fields.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub changed_fields: BTreeSet<String>,
}

impl Record {
    /// Create an empty record.
    pub fn new(entity_type: EntityType, id: RecordId) -> Self {
        Self {
            id,
            entity_type,
            fields: BTreeMap::new(),
            modified_at: Utc::now(),
            changed_fields: BTreeSet::new(),
        }
    }

    /// Builder-style field setter that does not mark the field as changed.
    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Set the modification time.
    pub fn with_modified_at(mut self, at: DateTime<Utc>) -> Self {
        self.modified_at = at;
        self
    }

    /// Record a local edit of a single field.
    pub fn set_field(&mut self, name: impl Into<String>, value: serde_json::Value) {
        let name = name.into();
        self.fields.insert(name.clone(), value);
        self.changed_fields.insert(name);
        self.modified_at = Utc::now();
    }

    /// Get a field value.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    /// Whether only a subset of fields was edited locally.
    pub fn has_partial_changes(&self) -> bool {
        !self.changed_fields.is_empty()
    }

    /// Clear the change set after the remote store confirmed the write.
    pub fn mark_clean(&mut self) {
        self.changed_fields.clear();
    }

    /// Same id, type and field values, ignoring timestamps and change sets.
    pub fn same_content(&self, other: &Record) -> bool {
        self.id == other.id && self.entity_type == other.entity_type && self.fields == other.fields
    }
}

/// Remote account availability as reported by the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountStatus {
    Available,
    NoAccount,
    Restricted,
    /// The status could not be determined (often offline).
    Indeterminate,
    TemporarilyUnavailable,
}

impl AccountStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, AccountStatus::Available)
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccountStatus::Available => "available",
            AccountStatus::NoAccount => "no account",
            AccountStatus::Restricted => "restricted",
            AccountStatus::Indeterminate => "indeterminate",
            AccountStatus::TemporarilyUnavailable => "temporarily unavailable",
        };
        f.write_str(s)
    }
}

/// Kind of queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Save,
    Delete,
    Modify,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Save => "save",
            OperationKind::Delete => "delete",
            OperationKind::Modify => "modify",
        };
        f.write_str(s)
    }
}

impl FromStr for OperationKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "save" => Ok(OperationKind::Save),
            "delete" => Ok(OperationKind::Delete),
            "modify" => Ok(OperationKind::Modify),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown operation kind: {}",
                other
            ))),
        }
    }
}

/// A mutation waiting to be applied to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Unique ID for this entry.
    pub id: String,
    pub kind: OperationKind,
    pub entity_type: EntityType,
    pub record_id: RecordId,
    /// Record snapshot; present for Save/Modify, absent for Delete.
    pub payload: Option<Record>,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingOperation {
    /// Queue a full save of `record`.
    pub fn save(record: Record) -> Self {
        Self::with_payload(OperationKind::Save, record)
    }

    /// Queue a partial update of `record`; only its changed fields are applied.
    pub fn modify(record: Record) -> Self {
        Self::with_payload(OperationKind::Modify, record)
    }

    /// Queue a deletion.
    pub fn delete(entity_type: EntityType, record_id: RecordId) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: OperationKind::Delete,
            entity_type,
            record_id,
            payload: None,
            enqueued_at: Utc::now(),
        }
    }

    fn with_payload(kind: OperationKind, record: Record) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            entity_type: record.entity_type.clone(),
            record_id: record.id.clone(),
            payload: Some(record),
            enqueued_at: Utc::now(),
        }
    }

    /// Check the payload/kind invariants of an entry read from storage.
    ///
    /// # Errors
    /// - Save/Modify without payload, Delete with payload
    /// - Payload whose id or entity type disagrees with the entry
    pub fn validate(&self) -> crate::Result<()> {
        match (&self.kind, &self.payload) {
            (OperationKind::Delete, Some(_)) => Err(crate::Error::InvalidInput(format!(
                "Delete operation {} carries a payload",
                self.id
            ))),
            (OperationKind::Save | OperationKind::Modify, None) => {
                Err(crate::Error::InvalidInput(format!(
                    "{} operation {} has no payload",
                    self.kind, self.id
                )))
            }
            (_, Some(record))
                if record.id != self.record_id || record.entity_type != self.entity_type =>
            {
                Err(crate::Error::InvalidInput(format!(
                    "Payload of operation {} does not match {}/{}",
                    self.id, self.entity_type, self.record_id
                )))
            }
            _ => Ok(()),
        }
    }

    /// Short human-readable label, used for progress reporting.
    pub fn label(&self) -> String {
        format!("{} {}/{}", self.kind, self.entity_type, self.record_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn goal(id: &str) -> Record {
        Record::new(EntityType::new("goal").unwrap(), RecordId::new(id).unwrap())
    }

    #[test]
    fn test_entity_type_validation() {
        assert!(EntityType::new("goal").is_ok());
        assert!(EntityType::new("").is_err());
        assert!(EntityType::new("a/b").is_err());
    }

    #[test]
    fn test_record_id_generation() {
        let a = RecordId::generate();
        let b = RecordId::generate();
        assert_ne!(a, b);
        assert!(RecordId::new("").is_err());
    }

    #[test]
    fn test_set_field_tracks_changes() {
        let mut record = goal("g1").with_field("title", json!("Run"));
        assert!(!record.has_partial_changes());

        record.set_field("target", json!(10));
        assert!(record.changed_fields.contains("target"));
        assert!(!record.changed_fields.contains("title"));

        record.mark_clean();
        assert!(!record.has_partial_changes());
    }

    #[test]
    fn test_operation_constructors() {
        let save = PendingOperation::save(goal("g1"));
        assert_eq!(save.kind, OperationKind::Save);
        assert_eq!(save.record_id.as_str(), "g1");
        assert!(save.validate().is_ok());

        let delete = PendingOperation::delete(
            EntityType::new("goal").unwrap(),
            RecordId::new("g1").unwrap(),
        );
        assert!(delete.payload.is_none());
        assert!(delete.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_mismatched_payload() {
        let mut op = PendingOperation::save(goal("g1"));
        op.record_id = RecordId::new("other").unwrap();
        assert!(op.validate().is_err());

        let mut op = PendingOperation::modify(goal("g1"));
        op.payload = None;
        assert!(op.validate().is_err());
    }

    #[test]
    fn test_operation_kind_roundtrip_str() {
        for kind in [OperationKind::Save, OperationKind::Delete, OperationKind::Modify] {
            assert_eq!(kind.to_string().parse::<OperationKind>().unwrap(), kind);
        }
        assert!("upsert".parse::<OperationKind>().is_err());
    }

    #[test]
    fn test_operation_serialization() {
        let op = PendingOperation::save(goal("g1").with_field("title", json!("Swim")));
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"kind\":\"save\""));
        let restored: PendingOperation = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, op);
    }
}
