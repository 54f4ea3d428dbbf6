use thiserror::Error;

use crate::revision::{ConsistencyError, EngineError};
use crate::schema::{CompileError, SourceError};
use crate::store::StoreError;

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the canonical capability
/// errors. Validation failures and permission rejections are values, not
/// errors; see [`crate::validate::Violation`] and
/// [`crate::permit::FilterOutcome`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
}

impl Error {
    /// Whether retrying with the same inputs could ever succeed. Compile and
    /// consistency errors never recover without intervention; store errors
    /// may be transient depending on the backend.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Store(_))
    }
}
