//! Schema metadata: entity types, node definitions and the definition set.
//!
//! A [`SchemaSource`] is the serde input form (JSON or builder calls). A
//! [`DefinitionSet`] is the validated, immutable registry built from it.
//! Subtypes inherit their parent's nodes; abstract types get a closed
//! [`DowncastTable`] mapping fixed-value tuples to concrete subtypes.
//!
//! # Modules
//!
//! - [`definition`]: RelationKind, NodeKind, NodeDefinition, EntityType and
//!   the source-side EntityTypeDef / SchemaSource
//! - [`registry`]: DefinitionSet construction and validation
//! - [`downcast`]: DowncastTable
//! - [`ddl`]: table ordering through the dependency engine

pub mod ddl;
pub mod definition;
pub mod downcast;
pub mod registry;

pub use ddl::{ddl_order, table_ranks};
pub use definition::{
    EntityType, EntityTypeDef, NodeDefinition, NodeKind, RelationKind, SchemaSource,
};
pub use downcast::{DowncastCandidate, DowncastTable};
pub use registry::DefinitionSet;
