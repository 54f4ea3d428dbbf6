//! Persisted row shapes: items, revisions, deletion-log entries.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::ident::{ActorId, WallClock};
use crate::path::{element_value_mut, is_element, ELEMENT_ID_KEY, ELEMENT_VALUE_KEY};
use crate::revision::Delta;
use crate::store::{Row, RowId};

/// One item instance. Static (singleton) items carry `is_predefined = true`
/// and are seeded at startup, never created or deleted through the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemRow {
    pub id: RowId,
    pub class: String,
    pub data: Value,
    /// Derived concatenation of every queryable field value.
    pub search_text: String,
    pub is_predefined: bool,
}

impl Row for ItemRow {
    fn id(&self) -> RowId {
        self.id
    }
    fn set_id(&mut self, id: RowId) {
        self.id = id;
    }
}

/// Small integer tag codes attached to revisions. Tags are the only part of
/// a revision that is ever mutated after append.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevisionTag {
    /// This revision was undone by a later rollback.
    Reverted,
    /// This revision is itself a rollback.
    Rollback,
}

#[derive(Debug, Error, Clone)]
#[error("unknown revision tag code {0}")]
pub struct UnknownTagCode(pub u8);

impl RevisionTag {
    pub fn code(self) -> u8 {
        match self {
            RevisionTag::Reverted => 0,
            RevisionTag::Rollback => 1,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, UnknownTagCode> {
        match code {
            0 => Ok(RevisionTag::Reverted),
            1 => Ok(RevisionTag::Rollback),
            other => Err(UnknownTagCode(other)),
        }
    }

    /// Wire form: delimiter-joined codes, e.g. `"0,1"`.
    pub fn join(tags: &[RevisionTag]) -> String {
        tags.iter()
            .map(|t| t.code().to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn parse_joined(s: &str) -> Result<Vec<RevisionTag>, UnknownTagCode> {
        s.split(',')
            .filter(|p| !p.is_empty())
            .map(|p| {
                let code: u8 = p.parse().map_err(|_| UnknownTagCode(u8::MAX))?;
                RevisionTag::from_code(code)
            })
            .collect()
    }
}

/// One committed structural delta plus metadata. Strictly ordered by id per
/// item; append-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RevisionRow {
    pub id: RowId,
    pub item_id: RowId,
    pub actor: ActorId,
    pub at: WallClock,
    /// Delta from the state before this revision to the state after.
    pub patch: Delta,
    pub is_minor: bool,
    pub is_creation: bool,
    pub tags: Vec<RevisionTag>,
}

impl RevisionRow {
    pub fn has_tag(&self, tag: RevisionTag) -> bool {
        self.tags.contains(&tag)
    }
}

impl Row for RevisionRow {
    fn id(&self) -> RowId {
        self.id
    }
    fn set_id(&mut self, id: RowId) {
        self.id = id;
    }
}

/// Why an item left (or re-entered) the live table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionReason {
    UserRequest,
    /// Rollback of a run that included the item's creation.
    Rollback,
}

impl DeletionReason {
    pub fn code(self) -> u8 {
        match self {
            DeletionReason::UserRequest => 0,
            DeletionReason::Rollback => 1,
        }
    }
}

/// Deletion-log entry. Not part of the revision chain; `is_deletion = false`
/// records a restoration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeletionRow {
    pub id: RowId,
    pub class: String,
    pub item_id: RowId,
    pub actor: ActorId,
    pub at: WallClock,
    pub reason_code: DeletionReason,
    pub reason_text: String,
    pub is_deletion: bool,
}

impl Row for DeletionRow {
    fn id(&self) -> RowId {
        self.id
    }
    fn set_id(&mut self, id: RowId) {
        self.id = id;
    }
}

/// Wrap every array element that lacks one in a `{eid, value}` carrier with
/// a fresh stable id, recursively. Existing ids are preserved, which is what
/// makes move/delete detection in the diff engine possible.
pub fn ensure_element_ids(value: &mut Value) {
    match value {
        Value::Array(items) => {
            for elem in items.iter_mut() {
                if !is_element(elem) {
                    let inner = std::mem::take(elem);
                    let mut wrapper = serde_json::Map::with_capacity(2);
                    wrapper.insert(ELEMENT_ID_KEY.to_string(), Value::String(fresh_element_id()));
                    wrapper.insert(ELEMENT_VALUE_KEY.to_string(), inner);
                    *elem = Value::Object(wrapper);
                }
                ensure_element_ids(element_value_mut(elem));
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                ensure_element_ids(v);
            }
        }
        _ => {}
    }
}

fn fresh_element_id() -> String {
    Uuid::new_v4().simple().to_string()
}
