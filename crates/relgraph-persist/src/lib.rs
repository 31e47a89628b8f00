//! Persistence planning for relgraph entity graphs.
//!
//! Given a [`PersistRequest`] naming entities to save and delete, the
//! [`PersistAnalyser`] walks the relations reachable from them inside one
//! [`EntityContext`](relgraph_core::EntityContext) and produces a
//! [`PersistPlan`]: ordered create, update and delete groups plus the
//! depends-on group of rows whose freshness the writes rely on.
//!
//! [`MemoryDatabase`] is an in-memory row store that acts as the context's
//! fetcher and applies plans with relational constraints, so a plan's order
//! can be checked end to end.
//!
//! # Modules
//!
//! - [`analyser`] -- request classification and group ordering
//! - [`group`] -- ordered, deduplicating operation groups
//! - [`plan`] -- requests and plans
//! - [`memory`] -- in-memory row store and plan application
//! - [`error`] -- error types

pub mod analyser;
pub mod error;
pub mod group;
pub mod memory;
pub mod plan;

pub use analyser::{AnalyserConfig, PersistAnalyser};
pub use error::PersistError;
pub use group::{OperationGroup, OperationKind};
pub use memory::{ApplyReport, MemoryDatabase, Row};
pub use plan::{PersistPlan, PersistRequest};
