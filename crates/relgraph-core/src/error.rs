//! Core error types for relgraph-core.
//!
//! Uses `thiserror` for structured, matchable variants. Every variant maps to
//! an [`ErrorClass`] so callers can tell broken schemas and caller bugs from
//! conditions worth retrying.

use relgraph_deps::DependencyError;
use thiserror::Error;

use crate::id::{ContextId, EntityId};
use crate::value::Value;

/// Broad classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Broken schema or definitions. Fatal.
    Configuration,
    /// Identity-map misuse by the caller. Fatal.
    Identity,
    /// A required row is gone. Retryable after a re-fetch.
    MissingEntity,
    /// Concurrent modification or constraint conflict at apply time.
    Conflict,
}

/// Errors produced by the relgraph-core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Two entity types share a name.
    #[error("duplicate entity type: '{name}'")]
    DuplicateEntityType { name: String },

    /// An entity type name is not in the definition set.
    #[error("unknown entity type: '{name}'")]
    UnknownEntityType { name: String },

    /// An entity type declares no node with the given name.
    #[error("entity type '{entity_type}' has no node '{node}'")]
    NodeNotDefined { entity_type: String, node: String },

    /// A node was used as the wrong kind (value/ref/to-many).
    #[error("node '{entity_type}.{node}' is not a {expected} node")]
    NodeKindMismatch {
        entity_type: String,
        node: String,
        expected: &'static str,
    },

    /// The schema is internally inconsistent.
    #[error("invalid schema: {reason}")]
    Schema { reason: String },

    /// A concrete subtype of an abstract type declares no fixed value.
    #[error("downcast candidate '{candidate}' of '{abstract_type}' declares no fixed-value nodes")]
    NoFixedValues {
        abstract_type: String,
        candidate: String,
    },

    /// More than one concrete subtype matches equally well.
    #[error("ambiguous downcast of '{abstract_type}': candidates {candidates:?}")]
    AmbiguousDowncast {
        abstract_type: String,
        candidates: Vec<String>,
    },

    /// No concrete subtype matches the entity's fixed values.
    #[error("no concrete subtype of '{abstract_type}' matches the entity's fixed values")]
    NoDowncastCandidate { abstract_type: String },

    /// Dependency ordering over the schema failed.
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    /// Schema source could not be parsed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A primary key that was already set was changed.
    #[error("primary key of '{entity_type}' is immutable: {previous} -> {attempted}")]
    KeyImmutable {
        entity_type: String,
        previous: Value,
        attempted: Value,
    },

    /// An operation is not legal in the entity's current state.
    #[error("illegal state: {reason}")]
    IllegalState { reason: String },

    /// A must-exist lookup missed.
    #[error("entity not found in {context}: {id}")]
    EntityNotFound { context: ContextId, id: EntityId },

    /// An entity from another context was handed to this one.
    #[error("entity {id} belongs to {owner}, not {context}")]
    ForeignEntity {
        id: EntityId,
        owner: ContextId,
        context: ContextId,
    },

    /// Two entities of different types were mixed.
    #[error("type mismatch: expected '{expected}', found '{found}'")]
    TypeMismatch { expected: String, found: String },

    /// A row needed to complete an operation does not exist.
    #[error("entity missing: {entity_type} with key {key}")]
    EntityMissing { entity_type: String, key: Value },

    /// A fetch was required but could not run.
    #[error("fetch failed: {reason}")]
    Fetch { reason: String },
}

impl CoreError {
    /// Returns the broad class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            CoreError::DuplicateEntityType { .. }
            | CoreError::UnknownEntityType { .. }
            | CoreError::NodeNotDefined { .. }
            | CoreError::NodeKindMismatch { .. }
            | CoreError::Schema { .. }
            | CoreError::NoFixedValues { .. }
            | CoreError::AmbiguousDowncast { .. }
            | CoreError::NoDowncastCandidate { .. }
            | CoreError::Dependency(_)
            | CoreError::Serialization(_)
            | CoreError::Fetch { .. } => ErrorClass::Configuration,
            CoreError::KeyImmutable { .. }
            | CoreError::IllegalState { .. }
            | CoreError::EntityNotFound { .. }
            | CoreError::ForeignEntity { .. }
            | CoreError::TypeMismatch { .. } => ErrorClass::Identity,
            CoreError::EntityMissing { .. } => ErrorClass::MissingEntity,
        }
    }

    /// Returns true if retrying (after re-fetching) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::MissingEntity | ErrorClass::Conflict
        )
    }

    pub(crate) fn illegal_state(reason: impl Into<String>) -> Self {
        CoreError::IllegalState {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes() {
        let missing = CoreError::EntityMissing {
            entity_type: "Order".into(),
            key: Value::Int(1),
        };
        assert_eq!(missing.class(), ErrorClass::MissingEntity);
        assert!(missing.is_retryable());

        let key = CoreError::KeyImmutable {
            entity_type: "Order".into(),
            previous: Value::Int(1),
            attempted: Value::Int(2),
        };
        assert_eq!(key.class(), ErrorClass::Identity);
        assert!(!key.is_retryable());

        let cycle = CoreError::from(DependencyError::Unbuilt { pending: 1 });
        assert_eq!(cycle.class(), ErrorClass::Configuration);
    }

    #[test]
    fn messages_carry_type_and_key() {
        let err = CoreError::EntityMissing {
            entity_type: "LineItem".into(),
            key: Value::Int(3),
        };
        assert_eq!(err.to_string(), "entity missing: LineItem with key 3");
    }
}
