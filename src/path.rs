//! Path algebra: generic addressing into nested value trees.
//!
//! A property path may fan out across arrays (`Elements` step); a value path
//! is fully resolved and addresses exactly one location. These four
//! primitives (`expand`, `read`, `write`, `find_paths`) are the only
//! tree-walking code in the engine; every higher component is expressed in
//! terms of them.
//!
//! Array elements in stored data are wrappers `{"eid": ..., "value": ...}`
//! carrying a stable per-element id for the diff engine. The algebra unwraps
//! `value` at index steps, so callers above this module never see `eid`.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::schema::{ObjectStructure, Property, PropertyContent};

/// Key carrying the stable element id inside an array-element wrapper.
pub const ELEMENT_ID_KEY: &str = "eid";
/// Key carrying the element payload inside an array-element wrapper.
pub const ELEMENT_VALUE_KEY: &str = "value";

/// One step of a property path.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PropStep {
    Field(String),
    /// Array marker: fans out across every element at this level.
    Elements,
}

pub type PropPath = Vec<PropStep>;

/// One step of a fully-resolved value path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueStep {
    Field(String),
    Index(usize),
}

pub type ValuePath = Vec<ValueStep>;

/// Render a value path in dotted/bracketed form: `names[0].title`.
pub fn fmt_value_path(path: &[ValueStep]) -> String {
    let mut out = String::new();
    for step in path {
        match step {
            ValueStep::Field(name) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(name);
            }
            ValueStep::Index(i) => {
                out.push('[');
                out.push_str(&i.to_string());
                out.push(']');
            }
        }
    }
    out
}

impl fmt::Display for PropStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropStep::Field(name) => f.write_str(name),
            PropStep::Elements => f.write_str("[]"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path `{path}` has no value to write through (missing intermediate)")]
    MissingIntermediate { path: String },
    #[error("path `{path}` expects an array, found something else")]
    NotAnArray { path: String },
}

/// True if `v` is an array-element wrapper.
pub fn is_element(v: &Value) -> bool {
    match v {
        Value::Object(map) => {
            map.len() == 2 && map.contains_key(ELEMENT_ID_KEY) && map.contains_key(ELEMENT_VALUE_KEY)
        }
        _ => false,
    }
}

/// Payload of an array element, tolerating unwrapped (malformed) elements.
pub fn element_value(v: &Value) -> &Value {
    if is_element(v) {
        &v[ELEMENT_VALUE_KEY]
    } else {
        v
    }
}

pub fn element_value_mut(v: &mut Value) -> &mut Value {
    if is_element(v) {
        v.get_mut(ELEMENT_VALUE_KEY).unwrap_or_else(|| unreachable!())
    } else {
        v
    }
}

/// Stable id of an array element, if it carries one.
pub fn element_id(v: &Value) -> Option<&str> {
    if is_element(v) {
        v[ELEMENT_ID_KEY].as_str()
    } else {
        None
    }
}

/// Expand a property path against a concrete value tree.
///
/// Every `Elements` marker fans out across the array at that level, in
/// ascending index order. A branch whose intermediate location is absent in
/// `value` contributes no paths (callers working from structurally-complete
/// records never hit that case).
pub fn expand(path: &[PropStep], value: &Value) -> Vec<ValuePath> {
    let mut out = Vec::new();
    expand_into(path, value, &mut Vec::new(), &mut out);
    out
}

fn expand_into(path: &[PropStep], value: &Value, prefix: &mut ValuePath, out: &mut Vec<ValuePath>) {
    let Some((step, rest)) = path.split_first() else {
        out.push(prefix.clone());
        return;
    };
    match step {
        PropStep::Field(name) => {
            let Some(child) = value.get(name.as_str()) else {
                return;
            };
            prefix.push(ValueStep::Field(name.clone()));
            expand_into(rest, child, prefix, out);
            prefix.pop();
        }
        PropStep::Elements => {
            let Some(items) = value.as_array() else {
                return;
            };
            for (i, elem) in items.iter().enumerate() {
                prefix.push(ValueStep::Index(i));
                expand_into(rest, element_value(elem), prefix, out);
                prefix.pop();
            }
        }
    }
}

/// Read the value at a resolved path.
///
/// Returns `None` when the path is not present, which is distinct from
/// `Some(&Value::Null)` (present but null).
pub fn read<'a>(value: &'a Value, path: &[ValueStep]) -> Option<&'a Value> {
    let mut cur = value;
    for step in path {
        cur = match step {
            ValueStep::Field(name) => cur.get(name.as_str())?,
            ValueStep::Index(i) => element_value(cur.as_array()?.get(*i)?),
        };
    }
    Some(cur)
}

/// Write `new_value` at a resolved path, mutating `value` in place.
///
/// Writing through a missing intermediate is not supported: callers must
/// pre-expand paths from a structurally-complete record.
pub fn write(value: &mut Value, path: &[ValueStep], new_value: Value) -> Result<(), PathError> {
    let mut cur = value;
    let mut walked: ValuePath = Vec::with_capacity(path.len());
    for step in path {
        walked.push(step.clone());
        cur = match step {
            ValueStep::Field(name) => {
                cur.get_mut(name.as_str()).ok_or_else(|| PathError::MissingIntermediate {
                    path: fmt_value_path(&walked),
                })?
            }
            ValueStep::Index(i) => {
                let arr = cur.as_array_mut().ok_or_else(|| PathError::NotAnArray {
                    path: fmt_value_path(&walked),
                })?;
                let elem = arr.get_mut(*i).ok_or_else(|| PathError::MissingIntermediate {
                    path: fmt_value_path(&walked),
                })?;
                element_value_mut(elem)
            }
        };
    }
    *cur = new_value;
    Ok(())
}

/// Every property path in `structure` whose descriptor satisfies `predicate`.
///
/// Descends into nested shapes only when the predicate at that level is
/// false, so a matching property's children are not separately enumerated.
/// Array depth contributes one `Elements` step per dimension.
pub fn find_paths(structure: &ObjectStructure, predicate: &dyn Fn(&Property) -> bool) -> Vec<PropPath> {
    let mut out = Vec::new();
    find_paths_into(structure, predicate, &mut Vec::new(), &mut out);
    out
}

fn find_paths_into(
    structure: &ObjectStructure,
    predicate: &dyn Fn(&Property) -> bool,
    prefix: &mut PropPath,
    out: &mut Vec<PropPath>,
) {
    for prop in &structure.properties {
        prefix.push(PropStep::Field(prop.name.clone()));
        for _ in 0..prop.array_depth {
            prefix.push(PropStep::Elements);
        }
        if predicate(prop) {
            out.push(prefix.clone());
        } else if let PropertyContent::Structure(nested) = &prop.content {
            find_paths_into(nested, predicate, prefix, out);
        }
        for _ in 0..prop.array_depth {
            prefix.pop();
        }
        prefix.pop();
    }
}
