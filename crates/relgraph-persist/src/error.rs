//! Error types for relgraph-persist.
//!
//! [`PersistError`] wraps the core and dependency errors and adds the
//! failures specific to analysis and plan application. A missing row
//! surfacing from the core is lifted into [`PersistError::EntityMissing`]
//! so callers match one variant regardless of where the fetch happened.

use relgraph_core::{CoreError, ErrorClass, Value};
use relgraph_deps::DependencyError;
use thiserror::Error;

/// Errors produced by persistence analysis and plan application.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error(transparent)]
    Core(CoreError),

    /// Ordering an operation group failed, typically on a cycle of new rows.
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    /// A row needed for analysis or application does not exist.
    #[error("entity missing: {entity_type} with key {key}")]
    EntityMissing { entity_type: String, key: Value },

    /// The request cannot be analysed as given.
    #[error("illegal persist state: {reason}")]
    IllegalPersistState { reason: String },

    /// Applying the plan would break a table constraint.
    #[error("constraint violation on '{table}': {reason}")]
    ConstraintViolation { table: String, reason: String },

    /// The stored version no longer matches the one the entity was read at.
    #[error("optimistic lock failed for {entity_type} with key {key}: expected version {expected}, found {found}")]
    OptimisticLock {
        entity_type: String,
        key: Value,
        expected: Value,
        found: Value,
    },
}

impl From<CoreError> for PersistError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::EntityMissing { entity_type, key } => {
                PersistError::EntityMissing { entity_type, key }
            }
            CoreError::Dependency(err) => PersistError::Dependency(err),
            other => PersistError::Core(other),
        }
    }
}

impl PersistError {
    /// Returns the broad class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            PersistError::Core(err) => err.class(),
            PersistError::Dependency(_) => ErrorClass::Configuration,
            PersistError::EntityMissing { .. } => ErrorClass::MissingEntity,
            PersistError::IllegalPersistState { .. } => ErrorClass::Identity,
            PersistError::ConstraintViolation { .. } | PersistError::OptimisticLock { .. } => {
                ErrorClass::Conflict
            }
        }
    }

    /// Returns true if retrying (after re-fetching) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::MissingEntity | ErrorClass::Conflict
        )
    }

    pub(crate) fn illegal(reason: impl Into<String>) -> Self {
        PersistError::IllegalPersistState {
            reason: reason.into(),
        }
    }

    pub(crate) fn constraint(table: &str, reason: impl Into<String>) -> Self {
        PersistError::ConstraintViolation {
            table: table.to_string(),
            reason: reason.into(),
        }
    }
}
