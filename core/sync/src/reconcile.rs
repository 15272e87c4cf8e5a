//! Merging fetched remote records into the local store.
//!
//! Planning is pure: given the local records, the fetched remote state and
//! the ids still pending in the queue, it decides what to write and what to
//! delete. Applying the plan is the coordinator's job.

use std::collections::{BTreeMap, BTreeSet};

use fitsync_common::{Record, RecordId};

/// Local writes needed to bring one entity type up to date.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    /// Remote versions to write locally.
    pub upserts: Vec<Record>,
    /// Local records to delete.
    pub deletes: Vec<RecordId>,
    /// Records missing remotely that were kept because they are still queued.
    pub preserved: Vec<RecordId>,
    /// Remote records whose local copy was already current or newer.
    pub unchanged: usize,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// Whether the remote version should replace the local one.
///
/// Last write wins by modification time; a tie goes to the remote store
/// since it is authoritative. Identical content is never rewritten.
pub fn remote_wins(local: Option<&Record>, remote: &Record) -> bool {
    match local {
        None => true,
        Some(local) => remote.modified_at >= local.modified_at && !local.same_content(remote),
    }
}

fn index(local: &[Record]) -> BTreeMap<&RecordId, &Record> {
    local.iter().map(|r| (&r.id, r)).collect()
}

fn merge_changed(plan: &mut MergePlan, local: &BTreeMap<&RecordId, &Record>, remote: &[Record]) {
    for record in remote {
        if remote_wins(local.get(&record.id).copied(), record) {
            let mut incoming = record.clone();
            incoming.mark_clean();
            plan.upserts.push(incoming);
        } else {
            plan.unchanged += 1;
        }
    }
}

fn delete_unless_pending(plan: &mut MergePlan, id: &RecordId, pending: &BTreeSet<RecordId>) {
    if pending.contains(id) {
        plan.preserved.push(id.clone());
    } else {
        plan.deletes.push(id.clone());
    }
}

/// Plan a merge against the complete remote state of one entity type.
///
/// Local records the remote store no longer has are deleted unless an
/// operation for them is still queued.
pub fn plan_full(local: &[Record], remote: &[Record], pending: &BTreeSet<RecordId>) -> MergePlan {
    let local_index = index(local);
    let remote_ids: BTreeSet<&RecordId> = remote.iter().map(|r| &r.id).collect();

    let mut plan = MergePlan::default();
    merge_changed(&mut plan, &local_index, remote);
    for id in local_index.keys() {
        if !remote_ids.contains(id) {
            delete_unless_pending(&mut plan, id, pending);
        }
    }
    plan
}

/// Plan a merge of the changes since the last change token.
pub fn plan_delta(
    local: &[Record],
    changed: &[Record],
    deleted: &[RecordId],
    pending: &BTreeSet<RecordId>,
) -> MergePlan {
    let local_index = index(local);

    let mut plan = MergePlan::default();
    merge_changed(&mut plan, &local_index, changed);
    for id in deleted {
        if local_index.contains_key(id) {
            delete_unless_pending(&mut plan, id, pending);
        }
    }
    plan
}
