//! Error types for relgraph-deps.

use thiserror::Error;

/// Errors produced while ordering a dependency tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    /// An ordering pass made no progress: the remaining nodes sit on or
    /// behind a dependency cycle and can never be ordered.
    #[error(
        "infinite loop while ordering dependencies: {unresolved} node(s) cannot be ordered, cycles: {cycles:?}"
    )]
    InfiniteLoop {
        unresolved: usize,
        cycles: Vec<Vec<String>>,
    },

    /// `order` was called while some nodes still had unbuilt dependencies.
    #[error("dependency tree ordered before {pending} node(s) had their dependencies built")]
    Unbuilt { pending: usize },
}
