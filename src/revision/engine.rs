//! Revision engine: append-only deltas, version reconstruction, rollback.
//!
//! Invariant preserved on every write: the stored current `data` of an item
//! equals the forward application of every revision's delta, in id order,
//! starting from the class default. Reconstruction walks backwards from the
//! current record with inverse patches; rollback expresses the undo as a new
//! forward revision and only ever touches prior rows' tag metadata.
//!
//! Exclusivity: all read-then-write operations take `&mut` on the storage,
//! so at most one mutation per storage handle is in flight. Callers sharding
//! by item id can run edits to different items in parallel.

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::delta::{self, ConsistencyError, Delta};
use crate::ident::{ActorId, Stamp, WallClock};
use crate::item::{ensure_element_ids, DeletionReason, DeletionRow, ItemRow, RevisionRow, RevisionTag};
use crate::schema::{SchemaRegistry, SEARCH_DELIMITER};
use crate::store::{RowId, Storage, StoreError};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
    #[error("unknown class `{0}`")]
    UnknownClass(String),
    #[error("item {item} belongs to class `{actual}`, not `{given}`")]
    ClassMismatch {
        item: RowId,
        actual: String,
        given: String,
    },
    #[error("item {0} not found")]
    ItemNotFound(RowId),
    #[error("revision {0} not found")]
    RevisionNotFound(RowId),
    #[error("item {0} has no revision history")]
    NoHistory(RowId),
    #[error("nothing changed; refusing to commit an empty revision")]
    NoChange,
    #[error("rollback would not change item {0}")]
    RollbackNoChange(RowId),
    #[error("item {item} is still referenced by {count} other item(s)")]
    StillReferenced { item: RowId, count: usize },
    #[error("item {0} is predefined and cannot be deleted")]
    Predefined(RowId),
    #[error("migration transform failed at version {step}: {message}")]
    TransformFailed { step: usize, message: String },
    #[error("item {item}: replayed history does not reach the stored current record")]
    ReplayDiverged { item: RowId },
}

/// Result of a committed change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Committed {
    pub item_id: RowId,
    pub revision_id: RowId,
}

/// Result of a rollback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// The undone run included the creation: the item was soft-deleted.
    Deleted,
    /// A new revision tagged `Rollback` was committed.
    Committed { revision_id: RowId },
}

/// One row of an item's change list: revision metadata plus the serialized
/// patch weight, for "(+123 bytes)"-style rendering.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeSummary {
    pub revision_id: RowId,
    pub actor: ActorId,
    pub at: WallClock,
    pub is_minor: bool,
    pub tags: Vec<RevisionTag>,
    pub patch_size: usize,
}

/// An item that holds a reference to some other item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferencingItem {
    pub class_name: String,
    pub display_name: String,
}

/// The engine borrows the registry and storage for one operation at a time;
/// nothing is cached across calls.
pub struct RevisionEngine<'a> {
    registry: &'a SchemaRegistry,
    store: &'a mut Storage,
}

impl<'a> RevisionEngine<'a> {
    pub fn new(registry: &'a SchemaRegistry, store: &'a mut Storage) -> Self {
        Self { registry, store }
    }

    /// Commit a validated, permission-filtered record.
    ///
    /// `item_id = None` creates the item (delta against the class default,
    /// flagged as creation). Array elements without a stable id are assigned
    /// one here, before diffing.
    pub fn commit_change(
        &mut self,
        class: &str,
        item_id: Option<RowId>,
        mut data: Value,
        stamp: Stamp,
        is_minor: bool,
        tags: Vec<RevisionTag>,
    ) -> Result<Committed, EngineError> {
        if self.registry.class(class).is_none() {
            return Err(EngineError::UnknownClass(class.to_string()));
        }
        ensure_element_ids(&mut data);

        let (prev, existing_row) = match item_id {
            Some(id) => {
                let row = self
                    .store
                    .items
                    .select_by_id(id)?
                    .ok_or(EngineError::ItemNotFound(id))?;
                if row.class != class {
                    return Err(EngineError::ClassMismatch {
                        item: id,
                        actual: row.class,
                        given: class.to_string(),
                    });
                }
                (row.data.clone(), Some(row))
            }
            None => {
                let default = self
                    .registry
                    .get_default(class)
                    .ok_or_else(|| EngineError::UnknownClass(class.to_string()))?;
                (default, None)
            }
        };
        let is_creation = existing_row.is_none();

        let patch = match delta::diff(&prev, &data) {
            Some(patch) => patch,
            None if is_creation => Delta::empty(),
            None => return Err(EngineError::NoChange),
        };

        let search_text = self.registry.search_text(class, &data);
        let item_id = match existing_row {
            Some(mut row) => {
                row.data = data;
                row.search_text = search_text;
                let id = row.id;
                self.store.items.update_by_id(id, row)?;
                id
            }
            None => self.store.items.create_row(ItemRow {
                id: 0,
                class: class.to_string(),
                data,
                search_text,
                is_predefined: false,
            })?,
        };

        let revision_id = self.store.revisions.create_row(RevisionRow {
            id: 0,
            item_id,
            actor: stamp.by,
            at: stamp.at,
            patch,
            is_minor,
            is_creation,
            tags,
        })?;
        debug!(item_id, revision_id, class, is_creation, "committed change");
        Ok(Committed {
            item_id,
            revision_id,
        })
    }

    /// All revisions of an item in ascending id order.
    pub fn revisions_of(&self, item_id: RowId) -> Result<Vec<RevisionRow>, EngineError> {
        let mut revs = self
            .store
            .revisions
            .select_by_predicate(&|r: &RevisionRow| r.item_id == item_id)?;
        revs.sort_by_key(|r| r.id);
        Ok(revs)
    }

    /// Change list of an item, ascending: one summary per revision, each
    /// carrying its encoded patch size. Consecutive entries give the size
    /// delta between revisions.
    pub fn change_list(&self, item_id: RowId) -> Result<Vec<ChangeSummary>, EngineError> {
        Ok(self
            .revisions_of(item_id)?
            .into_iter()
            .map(|r| ChangeSummary {
                revision_id: r.id,
                actor: r.actor,
                at: r.at,
                is_minor: r.is_minor,
                patch_size: r.patch.encoded_size(),
                tags: r.tags,
            })
            .collect())
    }

    /// Smallest revision id greater than `revision_id` for the same item.
    pub fn next_revision(&self, revision_id: RowId) -> Result<Option<RevisionRow>, EngineError> {
        let rev = self
            .store
            .revisions
            .select_by_id(revision_id)?
            .ok_or(EngineError::RevisionNotFound(revision_id))?;
        let later = self
            .store
            .revisions
            .select_by_predicate(&|r: &RevisionRow| r.item_id == rev.item_id && r.id > rev.id)?;
        Ok(later.into_iter().min_by_key(|r| r.id))
    }

    /// Reconstruct the state immediately after `revision_id` by walking every
    /// later revision backwards from the current record, undoing each one.
    pub fn reconstruct_at(&self, revision_id: RowId) -> Result<Value, EngineError> {
        let rev = self
            .store
            .revisions
            .select_by_id(revision_id)?
            .ok_or(EngineError::RevisionNotFound(revision_id))?;
        let (row, _) = self
            .store
            .find_item(rev.item_id)?
            .ok_or(EngineError::ItemNotFound(rev.item_id))?;

        let mut later = self
            .store
            .revisions
            .select_by_predicate(&|r: &RevisionRow| r.item_id == rev.item_id && r.id > rev.id)?;
        later.sort_by_key(|r| std::cmp::Reverse(r.id));

        let mut state = row.data;
        for r in &later {
            delta::unapply(&mut state, &r.patch).map_err(|e| {
                warn!(
                    item_id = rev.item_id,
                    revision_id = r.id,
                    error = %e,
                    "inverse patch failed during reconstruction"
                );
                e
            })?;
        }
        Ok(state)
    }

    /// Undo the contiguous run of most-recent revisions authored by the
    /// latest revision's actor. When the latest revision is itself a
    /// rollback, only that single revision is undone. A run that includes
    /// the creation deletes the item instead of editing it.
    pub fn rollback(&mut self, item_id: RowId, stamp: Stamp) -> Result<RollbackOutcome, EngineError> {
        let mut revs = self.revisions_of(item_id)?;
        revs.reverse();
        let latest = revs.first().ok_or(EngineError::NoHistory(item_id))?.clone();

        let run: Vec<RevisionRow> = if latest.has_tag(RevisionTag::Rollback) {
            vec![latest]
        } else {
            let actor = latest.actor.clone();
            revs.into_iter().take_while(|r| r.actor == actor).collect()
        };

        if run.iter().any(|r| r.is_creation) {
            info!(item_id, undone = run.len(), "rollback reaches creation; deleting item");
            self.delete_item(item_id, stamp, DeletionReason::Rollback, "rollback of creation")?;
            return Ok(RollbackOutcome::Deleted);
        }

        let row = self
            .store
            .items
            .select_by_id(item_id)?
            .ok_or(EngineError::ItemNotFound(item_id))?;
        let mut state = row.data.clone();
        for r in &run {
            delta::unapply(&mut state, &r.patch)?;
        }
        let Some(patch) = delta::diff(&row.data, &state) else {
            return Err(EngineError::RollbackNoChange(item_id));
        };

        let mut updated = row;
        updated.search_text = self.registry.search_text(&updated.class, &state);
        updated.data = state;
        self.store.items.update_by_id(item_id, updated)?;

        let revision_id = self.store.revisions.create_row(RevisionRow {
            id: 0,
            item_id,
            actor: stamp.by,
            at: stamp.at,
            patch,
            is_minor: false,
            is_creation: false,
            tags: vec![RevisionTag::Rollback],
        })?;

        // Tag-only mutation of the undone run; the rows are otherwise
        // append-only.
        for r in run {
            let mut tagged = r;
            if !tagged.has_tag(RevisionTag::Reverted) {
                tagged.tags.push(RevisionTag::Reverted);
                self.store.revisions.update_by_id(tagged.id, tagged)?;
            }
        }
        info!(item_id, revision_id, "rollback committed");
        Ok(RollbackOutcome::Committed { revision_id })
    }

    /// Soft-delete: move the row to the deleted-items store and log it.
    /// Refused while other records still reference the item.
    pub fn delete_item(
        &mut self,
        item_id: RowId,
        stamp: Stamp,
        reason: DeletionReason,
        reason_text: &str,
    ) -> Result<(), EngineError> {
        let row = self
            .store
            .items
            .select_by_id(item_id)?
            .ok_or(EngineError::ItemNotFound(item_id))?;
        if row.is_predefined {
            return Err(EngineError::Predefined(item_id));
        }
        let referencing = self.find_referencing_items(item_id)?;
        if !referencing.is_empty() {
            return Err(EngineError::StillReferenced {
                item: item_id,
                count: referencing.len(),
            });
        }

        self.store.items.delete_by_id(item_id)?;
        self.store.deleted_items.create_row(row.clone())?;
        self.store.deletion_log.create_row(DeletionRow {
            id: 0,
            class: row.class,
            item_id,
            actor: stamp.by,
            at: stamp.at,
            reason_code: reason,
            reason_text: reason_text.to_string(),
            is_deletion: true,
        })?;
        info!(item_id, "item soft-deleted");
        Ok(())
    }

    /// Recover a soft-deleted item.
    pub fn restore_item(&mut self, item_id: RowId, stamp: Stamp) -> Result<(), EngineError> {
        let row = self
            .store
            .deleted_items
            .select_by_id(item_id)?
            .ok_or(EngineError::ItemNotFound(item_id))?;
        self.store.deleted_items.delete_by_id(item_id)?;
        self.store.items.create_row(row.clone())?;
        self.store.deletion_log.create_row(DeletionRow {
            id: 0,
            class: row.class,
            item_id,
            actor: stamp.by,
            at: stamp.at,
            reason_code: DeletionReason::UserRequest,
            reason_text: String::new(),
            is_deletion: false,
        })?;
        info!(item_id, "item restored");
        Ok(())
    }

    /// Items whose expanded reference paths contain `item_id`. Non-empty
    /// means the item is undeletable.
    pub fn find_referencing_items(&self, item_id: RowId) -> Result<Vec<ReferencingItem>, EngineError> {
        let (target, _) = self
            .store
            .find_item(item_id)?
            .ok_or(EngineError::ItemNotFound(item_id))?;

        let mut out = Vec::new();
        let classes = self
            .registry
            .dynamic_classes()
            .chain(self.registry.static_classes());
        for class in classes {
            let paths = self.registry.reference_paths(&class.name, &target.class);
            if paths.is_empty() {
                continue;
            }
            let rows = self.store.items.select_by_predicate(&|r: &ItemRow| {
                r.class == class.name && r.id != item_id
            })?;
            for row in rows {
                let references = paths.iter().any(|p| {
                    crate::path::expand(p, &row.data).iter().any(|vp| {
                        crate::path::read(&row.data, vp)
                            .and_then(Value::as_i64)
                            .is_some_and(|v| v == item_id)
                    })
                });
                if references {
                    out.push(ReferencingItem {
                        class_name: row.class.clone(),
                        display_name: display_name_of(&row),
                    });
                }
            }
        }
        Ok(out)
    }

    /// Substring lookup over derived search text.
    pub fn find_by_name(&self, query: &str) -> Result<Vec<ItemRow>, EngineError> {
        let needle = query.to_lowercase();
        let mut rows = self.store.items.select_by_predicate(&|r: &ItemRow| {
            r.search_text.to_lowercase().contains(&needle)
        })?;
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    /// Seed one row per static class that does not have one yet.
    pub fn seed_statics(&mut self, stamp: Stamp) -> Result<(), EngineError> {
        let statics: Vec<String> = self
            .registry
            .static_classes()
            .map(|c| c.name.clone())
            .collect();
        for class in statics {
            let existing = self
                .store
                .items
                .select_by_predicate(&|r: &ItemRow| r.class == class && r.is_predefined)?;
            if !existing.is_empty() {
                continue;
            }
            let default = self
                .registry
                .get_default(&class)
                .ok_or_else(|| EngineError::UnknownClass(class.clone()))?;
            let committed =
                self.commit_change(&class, None, default, stamp.clone(), true, Vec::new())?;
            let mut row = self
                .store
                .items
                .select_by_id(committed.item_id)?
                .ok_or(EngineError::ItemNotFound(committed.item_id))?;
            row.is_predefined = true;
            self.store.items.update_by_id(committed.item_id, row)?;
        }
        Ok(())
    }
}

/// Leading search-text segment, used when listing referencing items.
fn display_name_of(row: &ItemRow) -> String {
    row.search_text
        .split(SEARCH_DELIMITER)
        .next()
        .unwrap_or_default()
        .to_string()
}
