//! Structural validation of a record against its compiled class descriptor.
//!
//! All violations are collected before returning, so one submission reports
//! every problem at once. Validation never crashes on malformed input: a
//! rule returning `Err` becomes a reported violation like any other.

use std::fmt;

use serde_json::Value;

use crate::path::element_value;
use crate::schema::{ClassDescriptor, ObjectStructure, PrimitiveKind, Property, PropertyContent};

/// One field-addressed violation, suitable for direct display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    /// Dotted/bracketed path; empty for violations of class-level rules.
    pub path: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "`{}` {}", self.path, self.message)
        }
    }
}

/// Validate `data` against a class descriptor, returning every violation.
pub fn validate(class: &ClassDescriptor, data: &Value) -> Vec<Violation> {
    let mut out = Vec::new();
    validate_structure(&class.structure, data, "", &mut out);
    out
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn validate_structure(structure: &ObjectStructure, data: &Value, path: &str, out: &mut Vec<Violation>) {
    // Attached rules run against the local sub-record first.
    for rule in &structure.rules {
        match (rule.check)(data) {
            Ok(true) => {}
            Ok(false) => out.push(Violation {
                path: path.to_string(),
                message: rule.message.clone(),
            }),
            Err(e) => out.push(Violation {
                path: path.to_string(),
                message: format!("rule check failed: {e}"),
            }),
        }
    }

    for prop in &structure.properties {
        let field_path = join_path(path, &prop.name);
        let v = data.get(&prop.name).unwrap_or(&Value::Null);
        validate_value(prop, prop.array_depth, v, &field_path, out);
    }
}

fn validate_value(prop: &Property, depth: u8, v: &Value, path: &str, out: &mut Vec<Violation>) {
    if depth > 0 {
        let Some(items) = v.as_array() else {
            out.push(Violation {
                path: path.to_string(),
                message: "must be a list".into(),
            });
            return;
        };
        for (i, elem) in items.iter().enumerate() {
            let elem_path = format!("{path}[{i}]");
            validate_value(prop, depth - 1, element_value(elem), &elem_path, out);
        }
        return;
    }

    match &prop.content {
        PropertyContent::Structure(nested) => {
            if v.is_object() {
                validate_structure(nested, v, path, out);
            } else {
                out.push(Violation {
                    path: path.to_string(),
                    message: "must be a record".into(),
                });
            }
        }
        PropertyContent::Primitive(kind) => validate_primitive(prop, *kind, v, path, out),
    }
}

fn validate_primitive(prop: &Property, kind: PrimitiveKind, v: &Value, path: &str, out: &mut Vec<Violation>) {
    let empty = match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    };
    if empty {
        // Null is accepted (fields are optional) unless the field feeds the
        // item's search text, in which case a value is required.
        if prop.is_queryable {
            out.push(Violation {
                path: path.to_string(),
                message: "must give a name".into(),
            });
        }
        return;
    }

    let ok = match kind {
        PrimitiveKind::ShortText | PrimitiveKind::LongText | PrimitiveKind::FileRef => v.is_string(),
        PrimitiveKind::Choice => v
            .as_str()
            .is_some_and(|s| prop.arguments.iter().any(|a| a == s)),
        PrimitiveKind::Integer | PrimitiveKind::Reference => {
            v.as_i64().is_some() || v.as_u64().is_some()
        }
        PrimitiveKind::Boolean => v.is_boolean(),
        PrimitiveKind::Date => v.as_str().is_some_and(is_iso_date),
    };
    if !ok {
        out.push(Violation {
            path: path.to_string(),
            message: format!("must be {}", kind.describe()),
        });
    }
}

fn is_iso_date(s: &str) -> bool {
    let b = s.as_bytes();
    if b.len() != 10 || b[4] != b'-' || b[7] != b'-' {
        return false;
    }
    let digits = |range: std::ops::Range<usize>| b[range].iter().all(u8::is_ascii_digit);
    if !digits(0..4) || !digits(5..7) || !digits(8..10) {
        return false;
    }
    let month: u8 = s[5..7].parse().unwrap_or(0);
    let day: u8 = s[8..10].parse().unwrap_or(0);
    (1..=12).contains(&month) && (1..=31).contains(&day)
}
