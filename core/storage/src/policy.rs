//! Save-policy merge shared by every remote store implementation.

use fitsync_common::Record;

use crate::remote::SavePolicy;

/// Merge `incoming` into the stored version under `policy`.
///
/// With [`SavePolicy::ChangedFields`] only the fields listed in
/// `incoming.changed_fields` are written; a changed field missing from
/// `incoming.fields` is removed. A record without a change set is written
/// whole. Concurrent edits of the same field resolve to whichever save
/// arrives last. The stored timestamp never moves backwards, so resubmitting
/// an already applied record yields the stored version unchanged.
pub fn apply_save_policy(existing: Option<&Record>, incoming: &Record, policy: SavePolicy) -> Record {
    let mut merged = match existing {
        Some(current) if policy == SavePolicy::ChangedFields && incoming.has_partial_changes() => {
            let mut merged = current.clone();
            for name in &incoming.changed_fields {
                match incoming.fields.get(name) {
                    Some(value) => {
                        merged.fields.insert(name.clone(), value.clone());
                    }
                    None => {
                        merged.fields.remove(name);
                    }
                }
            }
            merged.modified_at = current.modified_at.max(incoming.modified_at);
            merged
        }
        Some(current) => {
            let mut merged = incoming.clone();
            merged.modified_at = current.modified_at.max(incoming.modified_at);
            merged
        }
        None => incoming.clone(),
    };
    merged.mark_clean();
    merged
}
