//! Retro-migration: rewrite an item's entire delta chain through a
//! caller-supplied transform.
//!
//! Replays every version forward from the class default, transforms each one
//! in sequence, recomputes the deltas between consecutive transformed
//! versions and overwrites the stored patches plus the current record. This
//! is an offline maintenance operation: it requires a [`BackupReceipt`] and
//! per-item exclusivity, and halts the item on any consistency violation
//! rather than partially applying.

use serde_json::Value;
use tracing::{error, info};

use super::delta::{self, Delta};
use super::engine::EngineError;
use crate::item::RevisionRow;
use crate::schema::SchemaRegistry;
use crate::store::{BackupReceipt, RowId, Storage};

/// Version transform. Receives the original version at step i and the
/// already-transformed version at step i-1 (`None` at step 0), so stable
/// identifiers introduced in an earlier transformed version can be reused
/// instead of minted again.
pub type Transform<'t> = dyn Fn(&Value, Option<&Value>) -> Result<Value, String> + 't;

/// Retro-migration tool. Constructing one requires proof that a full backup
/// snapshot was taken first; a failed migration is otherwise irrecoverable.
pub struct RetroMigrator<'a> {
    registry: &'a SchemaRegistry,
    store: &'a mut Storage,
    #[allow(dead_code)]
    backup: BackupReceipt,
}

impl<'a> RetroMigrator<'a> {
    pub fn new(registry: &'a SchemaRegistry, store: &'a mut Storage, backup: BackupReceipt) -> Self {
        Self {
            registry,
            store,
            backup,
        }
    }

    /// Migrate one item. The stored history must replay cleanly to the
    /// current record before anything is rewritten.
    pub fn migrate(&mut self, item_id: RowId, transform: &Transform<'_>) -> Result<(), EngineError> {
        let mut revs = self
            .store
            .revisions
            .select_by_predicate(&|r: &RevisionRow| r.item_id == item_id)?;
        revs.sort_by_key(|r| r.id);
        if revs.is_empty() {
            return Err(EngineError::NoHistory(item_id));
        }

        let (row, location) = self
            .store
            .find_item(item_id)?
            .ok_or(EngineError::ItemNotFound(item_id))?;
        let default = self
            .registry
            .get_default(&row.class)
            .ok_or_else(|| EngineError::UnknownClass(row.class.clone()))?;

        // Forward replay: one version per revision, plus the default.
        let mut versions: Vec<Value> = Vec::with_capacity(revs.len() + 1);
        let mut state = default;
        versions.push(state.clone());
        for rev in &revs {
            delta::apply(&mut state, &rev.patch).map_err(|e| {
                error!(item_id, revision_id = rev.id, error = %e, "forward replay failed");
                e
            })?;
            versions.push(state.clone());
        }

        // The replay yields one version per revision plus the default, so a
        // truncated or corrupted chain surfaces as an apply failure above or
        // as divergence from the stored record here. Nothing is rewritten
        // unless the whole chain replays cleanly.
        if versions.last() != Some(&row.data) {
            error!(
                item_id,
                versions = versions.len(),
                "replayed history does not reach the stored record"
            );
            return Err(EngineError::ReplayDiverged { item: item_id });
        }

        let mut transformed: Vec<Value> = Vec::with_capacity(versions.len());
        for (step, original) in versions.iter().enumerate() {
            let t = transform(original, transformed.last()).map_err(|message| {
                EngineError::TransformFailed { step, message }
            })?;
            transformed.push(t);
        }

        for (idx, rev) in revs.iter().enumerate() {
            let patch = delta::diff(&transformed[idx], &transformed[idx + 1])
                .unwrap_or_else(Delta::empty);
            let mut rewritten = rev.clone();
            rewritten.patch = patch;
            self.store.revisions.update_by_id(rewritten.id, rewritten)?;
        }

        let mut updated = row;
        let last = transformed
            .pop()
            .unwrap_or_else(|| unreachable!("versions is never empty"));
        updated.search_text = self.registry.search_text(&updated.class, &last);
        updated.data = last;
        self.store.update_item(location, updated)?;

        info!(item_id, revisions = revs.len(), "retro-migration complete");
        Ok(())
    }
}
