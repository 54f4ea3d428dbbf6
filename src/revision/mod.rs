//! Append-only diff/patch revision history.

mod delta;
mod engine;
mod migrate;

pub use delta::{apply, diff, unapply, ArrayEntry, ConsistencyError, Delta, OldMark};
pub use engine::{
    ChangeSummary, Committed, EngineError, ReferencingItem, RevisionEngine, RollbackOutcome,
};
pub use migrate::{RetroMigrator, Transform};
