//! kardex: a wiki engine for structured, versioned records.
//!
//! Item shapes are declared in the CPT schema language and compiled at
//! startup into an immutable [`schema::SchemaRegistry`]. Storage, defaults,
//! search-text derivation, validation, partial-permission editing and
//! revision history all operate generically over that compiled tree.
//!
//! The write path: a submission passes through
//! [`permit::filter_by_permission`] (unless the actor is privileged), is
//! checked by [`validate::validate`], and is committed via
//! [`revision::RevisionEngine::commit_change`], which appends a structural
//! delta. Historical reads, rollback and retro-migration live in
//! [`revision`].

#![forbid(unsafe_code)]

pub mod error;
pub mod ident;
pub mod item;
pub mod path;
pub mod permit;
pub mod revision;
pub mod schema;
pub mod store;
pub mod telemetry;
pub mod validate;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the surface most embedders need at the crate root.
pub use ident::{ActorId, Stamp, WallClock};
pub use item::{DeletionReason, DeletionRow, ItemRow, RevisionRow, RevisionTag};
pub use permit::{filter_by_permission, FilterOutcome};
pub use revision::{
    ChangeSummary, Committed, ReferencingItem, RetroMigrator, RevisionEngine, RollbackOutcome,
};
pub use schema::{
    build_registry, compile, ClassDef, ClassKind, Rule, RuleBook, SchemaRegistry, SchemaSource,
    ShapeDef,
};
pub use store::{BackupReceipt, MemStore, RowId, RowStore, Storage};
pub use validate::{validate, Violation};
