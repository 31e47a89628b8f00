//! Generic dependency ordering for relgraph.
//!
//! Provides [`DependencyTree`], a topological sort over a caller-defined node
//! abstraction whose edges are discovered lazily. The same engine orders
//! persist operations (insert before reference, delete after referrer) and
//! schema DDL (create referenced tables first).
//!
//! # Modules
//!
//! - [`error`]: DependencyError enum
//! - [`tree`]: DependencyRules trait, DependencyTree and DependencyOrder

pub mod error;
pub mod tree;

pub use error::DependencyError;
pub use tree::{sort, DependencyOrder, DependencyRules, DependencyTree};
