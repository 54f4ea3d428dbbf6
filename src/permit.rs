//! Permission filter: merge a non-privileged submission into the stored
//! record along the class's openly-editable paths, rejecting everything
//! out-of-band.

use serde_json::Value;

use crate::path;
use crate::schema::SchemaRegistry;

/// Result of filtering one submission.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterOutcome {
    /// The record to validate and commit.
    Merged(Value),
    /// Restricted actors may never create items.
    RejectedCreation,
    /// The submission's shape does not match the stored record closely
    /// enough for an openly-editable path to resolve.
    RejectedMalformed,
}

impl FilterOutcome {
    pub fn merged(self) -> Option<Value> {
        match self {
            FilterOutcome::Merged(v) => Some(v),
            _ => None,
        }
    }
}

/// Filter `submitted` by the actor's privilege.
///
/// Privileged actors pass through unchanged. Otherwise every openly-editable
/// path is expanded against the *existing* record and the submitted value at
/// each resolved location is copied into a deep copy of the existing record;
/// nothing else from the submission survives.
pub fn filter_by_permission(
    registry: &SchemaRegistry,
    class: &str,
    submitted: &Value,
    existing: Option<&Value>,
    is_privileged: bool,
) -> FilterOutcome {
    if is_privileged {
        return FilterOutcome::Merged(submitted.clone());
    }
    let Some(existing) = existing else {
        return FilterOutcome::RejectedCreation;
    };

    let mut merged = existing.clone();
    for prop_path in registry.open_paths(class) {
        for value_path in path::expand(prop_path, existing) {
            let Some(value) = path::read(submitted, &value_path) else {
                return FilterOutcome::RejectedMalformed;
            };
            if path::write(&mut merged, &value_path, value.clone()).is_err() {
                return FilterOutcome::RejectedMalformed;
            }
        }
    }
    FilterOutcome::Merged(merged)
}
