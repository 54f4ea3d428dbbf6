//! Structural deltas: tree-shaped diffs between two versions of a record.
//!
//! A delta mirrors only the changed locations. Objects carry a sub-delta per
//! changed field. Arrays are diffed by the stable per-element id (`eid`), so
//! reordering produces move marks rather than wholesale replacement: value
//! changes and insertions are keyed by NEW index, deletions and moves by OLD
//! index.
//!
//! Every delta is invertible. Both application directions verify that the
//! value they are rewriting matches the state the delta recorded; a mismatch
//! means corrupted history and surfaces as a [`ConsistencyError`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::path::{element_id, element_value, element_value_mut};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConsistencyError {
    #[error("stored value does not match the delta's recorded state at {context}")]
    ValueMismatch { context: String },
    #[error("delta shape does not match the value tree at {context}")]
    ShapeMismatch { context: String },
    #[error("array slot {index} resolved twice while patching")]
    SlotConflict { index: usize },
    #[error("array slot {index} left unresolved while patching")]
    SlotUnfilled { index: usize },
}

/// Entry keyed by NEW index in an array delta.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "body", rename_all = "snake_case")]
pub enum ArrayEntry {
    /// Element (with its wrapper) that did not exist before.
    Insert(Value),
    /// In-place change of an element's payload.
    Change(Delta),
}

/// Mark keyed by OLD index in an array delta.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "body", rename_all = "snake_case")]
pub enum OldMark {
    MovedTo(usize),
    /// Removed element, kept whole so the delta stays invertible.
    Removed(Value),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Delta {
    /// Leaf replacement. `before` is kept for inversion and integrity checks.
    Scalar { before: Value, after: Value },
    Object {
        fields: BTreeMap<String, Delta>,
    },
    Array {
        #[serde(with = "index_keys")]
        entries: BTreeMap<usize, ArrayEntry>,
        #[serde(with = "index_keys")]
        olds: BTreeMap<usize, OldMark>,
    },
}

/// Index-keyed maps on the wire. JSON object keys are strings, so the usize
/// keys are rendered as decimal strings and parsed back on read; without
/// this, persisted array deltas cannot be deserialized.
mod index_keys {
    use std::collections::BTreeMap;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<V, S>(map: &BTreeMap<usize, V>, ser: S) -> Result<S::Ok, S::Error>
    where
        V: Serialize,
        S: Serializer,
    {
        ser.collect_map(map.iter().map(|(k, v)| (k.to_string(), v)))
    }

    pub fn deserialize<'de, V, D>(de: D) -> Result<BTreeMap<usize, V>, D::Error>
    where
        V: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, V>::deserialize(de)?;
        raw.into_iter()
            .map(|(k, v)| {
                k.parse::<usize>()
                    .map(|k| (k, v))
                    .map_err(|_| D::Error::custom(format!("non-numeric index key `{k}`")))
            })
            .collect()
    }
}

impl Delta {
    /// The delta of a creation whose data equals the class default.
    pub fn empty() -> Self {
        Delta::Object {
            fields: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Delta::Object { fields } => fields.is_empty(),
            Delta::Array { entries, olds } => entries.is_empty() && olds.is_empty(),
            Delta::Scalar { .. } => false,
        }
    }

    /// Serialized byte size, used for change-list summaries.
    pub fn encoded_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// Compute the structural delta from `before` to `after`; `None` when equal.
pub fn diff(before: &Value, after: &Value) -> Option<Delta> {
    if before == after {
        return None;
    }
    match (before, after) {
        (Value::Object(a), Value::Object(b)) => {
            // Key presence is part of the state: a dropped or added field has
            // no per-field representation (null means present-as-null), so
            // differing key sets replace the object wholesale.
            if a.len() != b.len() || a.keys().any(|k| !b.contains_key(k)) {
                return Some(Delta::Scalar {
                    before: before.clone(),
                    after: after.clone(),
                });
            }
            let mut fields = BTreeMap::new();
            for (key, va) in a {
                let vb = b.get(key.as_str()).unwrap_or(&Value::Null);
                if let Some(d) = diff(va, vb) {
                    fields.insert(key.clone(), d);
                }
            }
            Some(Delta::Object { fields })
        }
        (Value::Array(a), Value::Array(b)) => diff_arrays(a, b),
        _ => Some(Delta::Scalar {
            before: before.clone(),
            after: after.clone(),
        }),
    }
}

fn diff_arrays(a: &[Value], b: &[Value]) -> Option<Delta> {
    let scalar_fallback = || {
        Some(Delta::Scalar {
            before: Value::Array(a.to_vec()),
            after: Value::Array(b.to_vec()),
        })
    };

    // Id-based diffing needs every element wrapped with a unique eid;
    // anything else degrades to whole-array replacement.
    let mut old_index: BTreeMap<&str, usize> = BTreeMap::new();
    for (i, elem) in a.iter().enumerate() {
        let Some(id) = element_id(elem) else {
            return scalar_fallback();
        };
        if old_index.insert(id, i).is_some() {
            return scalar_fallback();
        }
    }
    let mut new_ids: BTreeSet<&str> = BTreeSet::new();
    for elem in b {
        let Some(id) = element_id(elem) else {
            return scalar_fallback();
        };
        if !new_ids.insert(id) {
            return scalar_fallback();
        }
    }

    let mut entries: BTreeMap<usize, ArrayEntry> = BTreeMap::new();
    let mut olds: BTreeMap<usize, OldMark> = BTreeMap::new();

    for (j, elem) in b.iter().enumerate() {
        let id = element_id(elem).unwrap_or_default();
        match old_index.get(id) {
            None => {
                entries.insert(j, ArrayEntry::Insert(elem.clone()));
            }
            Some(&i) => {
                if i != j {
                    olds.insert(i, OldMark::MovedTo(j));
                }
                if let Some(d) = diff(element_value(&a[i]), element_value(elem)) {
                    entries.insert(j, ArrayEntry::Change(d));
                }
            }
        }
    }
    for (i, elem) in a.iter().enumerate() {
        let id = element_id(elem).unwrap_or_default();
        if !new_ids.contains(id) {
            olds.insert(i, OldMark::Removed(elem.clone()));
        }
    }

    if entries.is_empty() && olds.is_empty() {
        None
    } else {
        Some(Delta::Array { entries, olds })
    }
}

fn place(slots: &mut [Option<Value>], index: usize, value: Value) -> Result<(), ConsistencyError> {
    let slot = slots
        .get_mut(index)
        .ok_or(ConsistencyError::SlotUnfilled { index })?;
    if slot.is_some() {
        return Err(ConsistencyError::SlotConflict { index });
    }
    *slot = Some(value);
    Ok(())
}

fn collect(slots: Vec<Option<Value>>) -> Result<Vec<Value>, ConsistencyError> {
    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| slot.ok_or(ConsistencyError::SlotUnfilled { index }))
        .collect()
}

/// Apply a delta forward, mutating `current` from the before-state to the
/// after-state.
pub fn apply(current: &mut Value, delta: &Delta) -> Result<(), ConsistencyError> {
    match delta {
        Delta::Scalar { before, after } => {
            if current != before {
                return Err(ConsistencyError::ValueMismatch {
                    context: summarize(before),
                });
            }
            *current = after.clone();
            Ok(())
        }
        Delta::Object { fields } => {
            let Some(map) = current.as_object_mut() else {
                return Err(ConsistencyError::ShapeMismatch {
                    context: "expected an object".into(),
                });
            };
            for (key, d) in fields {
                match map.get_mut(key) {
                    Some(v) => apply(v, d)?,
                    None => {
                        // Field introduced by this delta (schema grew).
                        let mut v = Value::Null;
                        apply(&mut v, d)?;
                        map.insert(key.clone(), v);
                    }
                }
            }
            Ok(())
        }
        Delta::Array { entries, olds } => apply_array(current, entries, olds),
    }
}

fn apply_array(
    current: &mut Value,
    entries: &BTreeMap<usize, ArrayEntry>,
    olds: &BTreeMap<usize, OldMark>,
) -> Result<(), ConsistencyError> {
    let Some(arr) = current.as_array() else {
        return Err(ConsistencyError::ShapeMismatch {
            context: "expected an array".into(),
        });
    };
    let old_len = arr.len();
    if olds.keys().next_back().is_some_and(|&i| i >= old_len) {
        return Err(ConsistencyError::ShapeMismatch {
            context: "old-index mark beyond array length".into(),
        });
    }

    let removed = olds
        .values()
        .filter(|m| matches!(m, OldMark::Removed(_)))
        .count();
    let inserted = entries
        .values()
        .filter(|e| matches!(e, ArrayEntry::Insert(_)))
        .count();
    let new_len = old_len - removed + inserted;
    let mut slots: Vec<Option<Value>> = vec![None; new_len];

    for (i, elem) in arr.iter().enumerate() {
        match olds.get(&i) {
            Some(OldMark::Removed(expected)) => {
                if elem != expected {
                    return Err(ConsistencyError::ValueMismatch {
                        context: format!("removed element at old index {i}"),
                    });
                }
            }
            Some(OldMark::MovedTo(k)) => place(&mut slots, *k, elem.clone())?,
            None => place(&mut slots, i, elem.clone())?,
        }
    }
    for (j, entry) in entries {
        match entry {
            ArrayEntry::Insert(e) => place(&mut slots, *j, e.clone())?,
            ArrayEntry::Change(d) => {
                let slot = slots
                    .get_mut(*j)
                    .and_then(Option::as_mut)
                    .ok_or(ConsistencyError::SlotUnfilled { index: *j })?;
                apply(element_value_mut(slot), d)?;
            }
        }
    }

    *current = Value::Array(collect(slots)?);
    Ok(())
}

/// Apply a delta in reverse, mutating `current` from the after-state back to
/// the before-state.
pub fn unapply(current: &mut Value, delta: &Delta) -> Result<(), ConsistencyError> {
    match delta {
        Delta::Scalar { before, after } => {
            if current != after {
                return Err(ConsistencyError::ValueMismatch {
                    context: summarize(after),
                });
            }
            *current = before.clone();
            Ok(())
        }
        Delta::Object { fields } => {
            let Some(map) = current.as_object_mut() else {
                return Err(ConsistencyError::ShapeMismatch {
                    context: "expected an object".into(),
                });
            };
            for (key, d) in fields {
                match map.get_mut(key) {
                    Some(v) => unapply(v, d)?,
                    None => {
                        let mut v = Value::Null;
                        unapply(&mut v, d)?;
                        map.insert(key.clone(), v);
                    }
                }
            }
            Ok(())
        }
        Delta::Array { entries, olds } => unapply_array(current, entries, olds),
    }
}

fn unapply_array(
    current: &mut Value,
    entries: &BTreeMap<usize, ArrayEntry>,
    olds: &BTreeMap<usize, OldMark>,
) -> Result<(), ConsistencyError> {
    let Some(arr) = current.as_array_mut() else {
        return Err(ConsistencyError::ShapeMismatch {
            context: "expected an array".into(),
        });
    };

    // Undo in-place payload changes first, at their new indices.
    for (j, entry) in entries {
        if let ArrayEntry::Change(d) = entry {
            let elem = arr.get_mut(*j).ok_or(ConsistencyError::ShapeMismatch {
                context: format!("change entry beyond array length at {j}"),
            })?;
            unapply(element_value_mut(elem), d)?;
        }
    }

    let new_len = arr.len();
    let inserted = entries
        .values()
        .filter(|e| matches!(e, ArrayEntry::Insert(_)))
        .count();
    let removed = olds
        .values()
        .filter(|m| matches!(m, OldMark::Removed(_)))
        .count();
    if new_len + removed < inserted {
        return Err(ConsistencyError::ShapeMismatch {
            context: "more insertions than the array holds".into(),
        });
    }
    let old_len = new_len + removed - inserted;
    let mut slots: Vec<Option<Value>> = vec![None; old_len];

    let insert_targets: BTreeSet<usize> = entries
        .iter()
        .filter(|(_, e)| matches!(e, ArrayEntry::Insert(_)))
        .map(|(&j, _)| j)
        .collect();
    let moved_targets: BTreeSet<usize> = olds
        .values()
        .filter_map(|m| match m {
            OldMark::MovedTo(k) => Some(*k),
            OldMark::Removed(_) => None,
        })
        .collect();

    for (i, mark) in olds {
        match mark {
            OldMark::Removed(v) => place(&mut slots, *i, v.clone())?,
            OldMark::MovedTo(k) => {
                let elem = arr.get(*k).ok_or(ConsistencyError::ShapeMismatch {
                    context: format!("move target {k} beyond array length"),
                })?;
                place(&mut slots, *i, elem.clone())?;
            }
        }
    }
    for (j, elem) in arr.iter().enumerate() {
        if insert_targets.contains(&j) {
            if let Some(ArrayEntry::Insert(expected)) = entries.get(&j) {
                if elem != expected {
                    return Err(ConsistencyError::ValueMismatch {
                        context: format!("inserted element at index {j}"),
                    });
                }
            }
            continue;
        }
        if moved_targets.contains(&j) {
            continue;
        }
        // Kept in place: old index equals new index.
        place(&mut slots, j, elem.clone())?;
    }

    *current = Value::Array(collect(slots)?);
    Ok(())
}

fn summarize(v: &Value) -> String {
    let s = v.to_string();
    // Truncate by characters, not bytes: the serialized value may hold
    // multibyte text and a byte slice could split a code point.
    match s.char_indices().nth(60) {
        Some((i, _)) => format!("{}…", &s[..i]),
        None => s,
    }
}
