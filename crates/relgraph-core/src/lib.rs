//! Core data model for relgraph.
//!
//! relgraph keeps an in-memory graph of typed entities mirroring rows of a
//! relational schema. This crate holds everything below the persistence
//! analyser: the schema metadata, the node model, entities and their
//! lifecycle, the weak identity map and the entity context.
//!
//! # Modules
//!
//! - [`value`]: Value, ColumnType
//! - [`id`]: EntityId, ContextId
//! - [`schema`]: DefinitionSet, EntityType, NodeDefinition, downcast tables,
//!   DDL ordering
//! - [`node`]: ValueNode, RefNode, ToManyNode
//! - [`entity`]: Entity, EntityState, EntityRef
//! - [`entities`]: the identity map (Entities, EntityInfo)
//! - [`context`]: EntityContext, ContextConfig
//! - [`fetch`]: the Fetcher trait
//! - [`error`]: CoreError, ErrorClass

pub mod context;
pub mod entities;
pub mod entity;
pub mod error;
pub mod fetch;
pub mod id;
pub mod node;
pub mod schema;
pub mod value;

pub use context::{ContextConfig, EntityContext};
pub use entities::{Association, Entities, EntityInfo};
pub use entity::{Entity, EntityRef, EntityState, WeakEntityRef};
pub use error::{CoreError, ErrorClass};
pub use fetch::Fetcher;
pub use id::{ContextId, EntityId};
pub use node::{Node, NodeValue, RefNode, ToManyNode, ValueNode};
pub use schema::{
    ddl_order, table_ranks, DefinitionSet, EntityType, EntityTypeDef, NodeDefinition, NodeKind,
    RelationKind, SchemaSource,
};
pub use value::{ColumnType, Value};
