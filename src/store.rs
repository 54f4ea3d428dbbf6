//! Abstract keyed-row store.
//!
//! The engine never issues query language: it consumes exactly five
//! operations (create, select by id, select by predicate, update, delete)
//! over flat rows with an auto-incrementing integer id. Any backing engine
//! can sit behind [`RowStore`]; [`MemStore`] is the in-memory one used by
//! tests and small deployments.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::ident::WallClock;
use crate::item::{DeletionRow, ItemRow, RevisionRow};

pub type RowId = i64;

#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum StoreError {
    #[error("row {id} not found")]
    RowNotFound { id: RowId },
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("backup snapshot failed: {0}")]
    Snapshot(String),
}

/// A flat keyed row. `id() == 0` means "not yet assigned".
pub trait Row: Clone {
    fn id(&self) -> RowId;
    fn set_id(&mut self, id: RowId);
}

pub trait RowStore<R: Row> {
    /// Insert a row. A zero id is replaced by the next auto-increment value;
    /// a nonzero id is kept as-is (used when moving rows between stores).
    fn create_row(&mut self, row: R) -> Result<RowId, StoreError>;
    fn select_by_id(&self, id: RowId) -> Result<Option<R>, StoreError>;
    fn select_by_predicate(&self, pred: &dyn Fn(&R) -> bool) -> Result<Vec<R>, StoreError>;
    fn update_by_id(&mut self, id: RowId, row: R) -> Result<(), StoreError>;
    fn delete_by_id(&mut self, id: RowId) -> Result<(), StoreError>;
}

/// In-memory row store backed by an ordered map, so predicate selects come
/// back in id order.
#[derive(Clone, Debug, Default)]
pub struct MemStore<R> {
    rows: BTreeMap<RowId, R>,
    next_id: RowId,
}

impl<R> MemStore<R> {
    pub fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl<R: Row> RowStore<R> for MemStore<R> {
    fn create_row(&mut self, mut row: R) -> Result<RowId, StoreError> {
        let id = if row.id() == 0 {
            self.next_id += 1;
            self.next_id
        } else {
            self.next_id = self.next_id.max(row.id());
            row.id()
        };
        row.set_id(id);
        self.rows.insert(id, row);
        Ok(id)
    }

    fn select_by_id(&self, id: RowId) -> Result<Option<R>, StoreError> {
        Ok(self.rows.get(&id).cloned())
    }

    fn select_by_predicate(&self, pred: &dyn Fn(&R) -> bool) -> Result<Vec<R>, StoreError> {
        Ok(self.rows.values().filter(|r| pred(r)).cloned().collect())
    }

    fn update_by_id(&mut self, id: RowId, mut row: R) -> Result<(), StoreError> {
        if !self.rows.contains_key(&id) {
            return Err(StoreError::RowNotFound { id });
        }
        row.set_id(id);
        self.rows.insert(id, row);
        Ok(())
    }

    fn delete_by_id(&mut self, id: RowId) -> Result<(), StoreError> {
        self.rows
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::RowNotFound { id })
    }
}

/// Where an item row currently lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemLocation {
    Live,
    Deleted,
}

/// The four row tables the engine operates on.
pub struct Storage {
    pub items: Box<dyn RowStore<ItemRow> + Send>,
    /// Soft-deleted items, recoverable until purged out-of-band.
    pub deleted_items: Box<dyn RowStore<ItemRow> + Send>,
    pub revisions: Box<dyn RowStore<RevisionRow> + Send>,
    pub deletion_log: Box<dyn RowStore<DeletionRow> + Send>,
}

impl Storage {
    pub fn in_memory() -> Self {
        Self {
            items: Box::new(MemStore::new()),
            deleted_items: Box::new(MemStore::new()),
            revisions: Box::new(MemStore::new()),
            deletion_log: Box::new(MemStore::new()),
        }
    }

    /// Find an item row in the live or the deleted table.
    pub fn find_item(&self, id: RowId) -> Result<Option<(ItemRow, ItemLocation)>, StoreError> {
        if let Some(row) = self.items.select_by_id(id)? {
            return Ok(Some((row, ItemLocation::Live)));
        }
        if let Some(row) = self.deleted_items.select_by_id(id)? {
            return Ok(Some((row, ItemLocation::Deleted)));
        }
        Ok(None)
    }

    pub fn update_item(&mut self, location: ItemLocation, row: ItemRow) -> Result<(), StoreError> {
        match location {
            ItemLocation::Live => self.items.update_by_id(row.id, row),
            ItemLocation::Deleted => self.deleted_items.update_by_id(row.id, row),
        }
    }

    /// Serialize items and revisions for a full backup. Retro-migration
    /// requires the receipt this returns; the caller is responsible for
    /// keeping the bytes somewhere safe.
    pub fn snapshot_for_backup(&self) -> Result<BackupReceipt, StoreError> {
        let items = self.items.select_by_predicate(&|_| true)?;
        let deleted = self.deleted_items.select_by_predicate(&|_| true)?;
        let revisions = self.revisions.select_by_predicate(&|_| true)?;
        let snapshot = serde_json::json!({
            "items": items,
            "deleted_items": deleted,
            "revisions": revisions,
        });
        let bytes =
            serde_json::to_vec(&snapshot).map_err(|e| StoreError::Snapshot(e.to_string()))?;
        Ok(BackupReceipt {
            taken_at: WallClock::now(),
            item_count: items.len() + deleted.len(),
            revision_count: revisions.len(),
            bytes,
        })
    }
}

/// Proof that a full backup snapshot was taken. Required to construct the
/// retro-migrator; holds the serialized snapshot for the caller to persist.
#[derive(Clone, Debug)]
pub struct BackupReceipt {
    pub taken_at: WallClock,
    pub item_count: usize,
    pub revision_count: usize,
    pub bytes: Vec<u8>,
}
