//! Schema registry: compiled classes plus everything derived from them.
//!
//! Built once at startup from the static schema text, immutable afterwards.
//! Owns the default-value trees and the cached path sets (query, reference,
//! openly-editable) every other component consumes.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::cpt::{self, CompileError, RuleBook, SchemaSource};
use super::property::{
    ClassDescriptor, ClassKind, ObjectStructure, PrimitiveKind, PropertyContent,
};
use crate::path::{self, PropPath};

/// Delimiter between search-text segments. Stripped from contributing field
/// values during derivation, so it can never occur inside a segment.
pub const SEARCH_DELIMITER: char = '\u{1f}';

/// Recursively produce the default value tree for a structure: `{}` per
/// object with every field present, `[]` per array, null per primitive.
pub fn build_default(structure: &ObjectStructure) -> Value {
    let mut map = Map::new();
    for prop in &structure.properties {
        let v = if prop.is_array() {
            Value::Array(Vec::new())
        } else {
            match &prop.content {
                PropertyContent::Primitive(_) => Value::Null,
                PropertyContent::Structure(nested) => build_default(nested),
            }
        };
        map.insert(prop.name.clone(), v);
    }
    Value::Object(map)
}

/// Compiled class descriptors plus derived defaults and path caches.
#[derive(Debug)]
pub struct SchemaRegistry {
    dynamic: BTreeMap<String, ClassDescriptor>,
    statics: BTreeMap<String, ClassDescriptor>,
    defaults: BTreeMap<String, Value>,
    query_paths: BTreeMap<String, Vec<PropPath>>,
    open_paths: BTreeMap<String, Vec<PropPath>>,
    /// (from class, to class) -> reference paths.
    reference_paths: BTreeMap<(String, String), Vec<PropPath>>,
}

/// Compile a schema source and derive the registry. Any compile error is
/// fatal at startup.
pub fn build_registry(source: &SchemaSource, rules: &RuleBook) -> Result<SchemaRegistry, CompileError> {
    let compiled = cpt::compile_source(source, rules)?;

    let mut dynamic = BTreeMap::new();
    let mut statics = BTreeMap::new();
    let mut defaults = BTreeMap::new();
    let mut query_paths = BTreeMap::new();
    let mut open_paths = BTreeMap::new();

    for class in &compiled.classes {
        defaults.insert(class.name.clone(), build_default(&class.structure));
        query_paths.insert(
            class.name.clone(),
            path::find_paths(&class.structure, &|p| p.is_queryable),
        );
        open_paths.insert(
            class.name.clone(),
            path::find_paths(&class.structure, &|p| p.is_openly_editable),
        );
        match class.kind {
            ClassKind::Dynamic => dynamic.insert(class.name.clone(), class.clone()),
            ClassKind::Static => statics.insert(class.name.clone(), class.clone()),
        };
    }

    // Reference paths per class pair, for referential-integrity checks.
    let mut reference_paths = BTreeMap::new();
    let all = dynamic.values().chain(statics.values());
    for from in all {
        for to_name in dynamic.keys() {
            let paths = path::find_paths(&from.structure, &|p| {
                matches!(p.content, PropertyContent::Primitive(PrimitiveKind::Reference))
                    && p.reference_target() == Some(to_name.as_str())
            });
            if !paths.is_empty() {
                reference_paths.insert((from.name.clone(), to_name.clone()), paths);
            }
        }
    }

    Ok(SchemaRegistry {
        dynamic,
        statics,
        defaults,
        query_paths,
        open_paths,
        reference_paths,
    })
}

impl SchemaRegistry {
    /// Look up a class by name, dynamic or static.
    pub fn class(&self, name: &str) -> Option<&ClassDescriptor> {
        self.dynamic.get(name).or_else(|| self.statics.get(name))
    }

    pub fn dynamic_classes(&self) -> impl Iterator<Item = &ClassDescriptor> {
        self.dynamic.values()
    }

    pub fn static_classes(&self) -> impl Iterator<Item = &ClassDescriptor> {
        self.statics.values()
    }

    /// Fresh copy of the class's default-value tree.
    pub fn get_default(&self, class: &str) -> Option<Value> {
        self.defaults.get(class).cloned()
    }

    pub fn query_paths(&self, class: &str) -> &[PropPath] {
        self.query_paths.get(class).map_or(&[], Vec::as_slice)
    }

    pub fn open_paths(&self, class: &str) -> &[PropPath] {
        self.open_paths.get(class).map_or(&[], Vec::as_slice)
    }

    /// Paths in `from` that reference instances of `to`.
    pub fn reference_paths(&self, from: &str, to: &str) -> &[PropPath] {
        self.reference_paths
            .get(&(from.to_string(), to.to_string()))
            .map_or(&[], Vec::as_slice)
    }

    /// Derive the search text for a record: every queryable leaf value,
    /// resolved in path order, joined by [`SEARCH_DELIMITER`].
    pub fn search_text(&self, class: &str, data: &Value) -> String {
        let mut segments: Vec<String> = Vec::new();
        for prop_path in self.query_paths(class) {
            for value_path in path::expand(prop_path, data) {
                let Some(v) = path::read(data, &value_path) else {
                    continue;
                };
                let segment = match v {
                    Value::Null => continue,
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if segment.is_empty() {
                    continue;
                }
                segments.push(segment.replace(SEARCH_DELIMITER, ""));
            }
        }
        segments.join(&SEARCH_DELIMITER.to_string())
    }
}
