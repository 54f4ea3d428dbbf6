//! Schema source loading from a directory of `.cpt` files.
//!
//! Layout: `shapes/*.cpt` for reusable shapes, `classes/*.cpt` for dynamic
//! classes, `statics/*.cpt` for singleton classes. The file stem is the
//! shape/class name. Any IO failure is fatal at startup, like a compile
//! error.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::cpt::{ClassDef, SchemaSource, ShapeDef};
use super::property::ClassKind;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read schema file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("schema file {path} has no usable name")]
    BadName { path: PathBuf },
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<(String, String)>, SourceError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir).map_err(|source| SourceError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| SourceError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("cpt") {
            continue;
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| SourceError::BadName { path: path.clone() })?
            .to_string();
        let text = fs::read_to_string(&path).map_err(|source| SourceError::Io {
            path: path.clone(),
            source,
        })?;
        out.push((name, text));
    }
    // Deterministic order regardless of directory iteration order.
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// Load a schema source tree from `root`.
pub fn load_dir(root: &Path) -> Result<SchemaSource, SourceError> {
    let shapes = read_dir_sorted(&root.join("shapes"))?
        .into_iter()
        .map(|(name, text)| ShapeDef { name, text })
        .collect();
    let mut classes: Vec<ClassDef> = read_dir_sorted(&root.join("classes"))?
        .into_iter()
        .map(|(name, text)| ClassDef {
            name,
            kind: ClassKind::Dynamic,
            text,
        })
        .collect();
    classes.extend(
        read_dir_sorted(&root.join("statics"))?
            .into_iter()
            .map(|(name, text)| ClassDef {
                name,
                kind: ClassKind::Static,
                text,
            }),
    );
    Ok(SchemaSource { shapes, classes })
}
