//! Entity type and node definitions.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::value::{ColumnType, Value};

/// How a relation governs cascades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// Plain link. Never cascades.
    Refers,
    /// The target is part of the owner: cascades create, update and delete.
    Owns,
    /// The owner relies on the target being current: freshness check only.
    Depends,
}

/// Shape of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    /// Scalar column.
    Value,
    /// To-one relation stored as a foreign-key column.
    Ref { target: String },
    /// To-many relation, stored on the target as `foreign_node`.
    ToMany {
        target: String,
        #[serde(default)]
        foreign_node: Option<String>,
    },
}

fn default_nullable() -> bool {
    true
}

/// Definition of one node of an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub name: String,
    /// Column name. Defaults to the node name for value and ref nodes;
    /// always `None` for to-many nodes.
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub column_type: Option<ColumnType>,
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Cascade behaviour. `None` on a relation node means [`RelationKind::Refers`].
    #[serde(default)]
    pub relation: Option<RelationKind>,
    #[serde(default)]
    pub optimistic_lock: bool,
    #[serde(default)]
    pub primary_key: bool,
    /// Discriminator value pinned by a concrete subtype.
    #[serde(default)]
    pub fixed_value: Option<Value>,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Set on a ref node that a to-many collection of its target points
    /// back through. Derived when the definition set is built.
    #[serde(skip)]
    pub back_reference: bool,
}

impl NodeDefinition {
    fn base(
        name: &str,
        column: Option<&str>,
        column_type: Option<ColumnType>,
        kind: NodeKind,
    ) -> Self {
        NodeDefinition {
            name: name.to_string(),
            column: column.map(str::to_string),
            column_type,
            kind,
            relation: None,
            optimistic_lock: false,
            primary_key: false,
            fixed_value: None,
            nullable: true,
            back_reference: false,
        }
    }

    /// A scalar node.
    pub fn value(name: &str, column: &str, column_type: ColumnType) -> Self {
        Self::base(name, Some(column), Some(column_type), NodeKind::Value)
    }

    /// The primary-key node.
    pub fn key(name: &str, column: &str, column_type: ColumnType) -> Self {
        let mut def = Self::value(name, column, column_type);
        def.primary_key = true;
        def.nullable = false;
        def
    }

    /// A to-one relation.
    pub fn reference(name: &str, column: &str, target: &str, relation: RelationKind) -> Self {
        let mut def = Self::base(
            name,
            Some(column),
            Some(ColumnType::BigInt),
            NodeKind::Ref {
                target: target.to_string(),
            },
        );
        def.relation = Some(relation);
        def
    }

    /// A to-many relation whose rows point back through `foreign_node`.
    pub fn to_many(name: &str, target: &str, foreign_node: &str, relation: RelationKind) -> Self {
        let mut def = Self::base(
            name,
            None,
            None,
            NodeKind::ToMany {
                target: target.to_string(),
                foreign_node: Some(foreign_node.to_string()),
            },
        );
        def.relation = Some(relation);
        def
    }

    /// Marks this node as the optimistic-lock version.
    pub fn with_optimistic_lock(mut self) -> Self {
        self.optimistic_lock = true;
        self
    }

    /// Pins a fixed discriminator value.
    pub fn with_fixed_value(mut self, value: impl Into<Value>) -> Self {
        self.fixed_value = Some(value.into());
        self
    }

    /// Marks this node as NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Overrides the column type.
    pub fn with_column_type(mut self, column_type: ColumnType) -> Self {
        self.column_type = Some(column_type);
        self
    }

    pub fn is_value(&self) -> bool {
        matches!(self.kind, NodeKind::Value)
    }

    pub fn is_ref(&self) -> bool {
        matches!(self.kind, NodeKind::Ref { .. })
    }

    pub fn is_to_many(&self) -> bool {
        matches!(self.kind, NodeKind::ToMany { .. })
    }

    /// Target entity type of a relation node.
    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Ref { target } | NodeKind::ToMany { target, .. } => Some(target),
            NodeKind::Value => None,
        }
    }

    /// Back-pointing ref node on the target of a to-many node.
    pub fn foreign_node(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::ToMany { foreign_node, .. } => foreign_node.as_deref(),
            _ => None,
        }
    }

    /// Effective relation kind; plain links default to `Refers`.
    pub fn relation_kind(&self) -> RelationKind {
        self.relation.unwrap_or(RelationKind::Refers)
    }

    pub fn owns(&self) -> bool {
        self.relation_kind() == RelationKind::Owns
    }

    /// Column name, falling back to the node name.
    pub fn column_name(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.name)
    }
}

/// A resolved entity type: inherited nodes merged, key located.
#[derive(Debug, Clone, Serialize)]
pub struct EntityType {
    name: String,
    table: String,
    key_node: String,
    nodes: IndexMap<String, NodeDefinition>,
    is_abstract: bool,
    extends: Option<String>,
}

impl EntityType {
    pub(crate) fn new(
        name: String,
        table: String,
        key_node: String,
        nodes: IndexMap<String, NodeDefinition>,
        is_abstract: bool,
        extends: Option<String>,
    ) -> Self {
        EntityType {
            name,
            table,
            key_node,
            nodes,
            is_abstract,
            extends,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Name of the primary-key node.
    pub fn key_node(&self) -> &str {
        &self.key_node
    }

    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    /// Name of the parent type, for subtypes.
    pub fn extends(&self) -> Option<&str> {
        self.extends.as_deref()
    }

    /// All node definitions in declaration order (inherited first).
    pub fn nodes(&self) -> impl Iterator<Item = &NodeDefinition> {
        self.nodes.values()
    }

    pub fn node(&self, name: &str) -> Option<&NodeDefinition> {
        self.nodes.get(name)
    }

    /// Looks up a node, failing with [`CoreError::NodeNotDefined`].
    pub fn require_node(&self, name: &str) -> Result<&NodeDefinition, CoreError> {
        self.nodes.get(name).ok_or_else(|| CoreError::NodeNotDefined {
            entity_type: self.name.clone(),
            node: name.to_string(),
        })
    }

    /// Fixed-value nodes with their pinned values.
    pub fn fixed_values(&self) -> Vec<(&str, &Value)> {
        self.nodes
            .values()
            .filter_map(|def| def.fixed_value.as_ref().map(|v| (def.name.as_str(), v)))
            .collect()
    }

    /// The optimistic-lock node, if the type declares one.
    pub fn optimistic_lock_node(&self) -> Option<&NodeDefinition> {
        self.nodes.values().find(|def| def.optimistic_lock)
    }
}

/// Source form of an entity type, as written in a schema file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityTypeDef {
    pub name: String,
    /// Table name; subtypes inherit their parent's table when absent.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
    #[serde(default)]
    pub extends: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
}

impl EntityTypeDef {
    /// A root type stored in `table`.
    pub fn new(name: &str, table: &str) -> Self {
        EntityTypeDef {
            name: name.to_string(),
            table: Some(table.to_string()),
            ..Default::default()
        }
    }

    /// A subtype inheriting `parent`'s table and nodes.
    pub fn subtype(name: &str, parent: &str) -> Self {
        EntityTypeDef {
            name: name.to_string(),
            extends: Some(parent.to_string()),
            ..Default::default()
        }
    }

    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn node(mut self, def: NodeDefinition) -> Self {
        self.nodes.push(def);
        self
    }

    pub fn key(self, name: &str, column: &str, column_type: ColumnType) -> Self {
        self.node(NodeDefinition::key(name, column, column_type))
    }

    pub fn value(self, name: &str, column: &str, column_type: ColumnType) -> Self {
        self.node(NodeDefinition::value(name, column, column_type))
    }

    pub fn reference(self, name: &str, column: &str, target: &str, relation: RelationKind) -> Self {
        self.node(NodeDefinition::reference(name, column, target, relation))
    }

    pub fn to_many(
        self,
        name: &str,
        target: &str,
        foreign_node: &str,
        relation: RelationKind,
    ) -> Self {
        self.node(NodeDefinition::to_many(name, target, foreign_node, relation))
    }
}

/// A whole schema in source form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSource {
    #[serde(default)]
    pub namespace: Option<String>,
    pub types: Vec<EntityTypeDef>,
}

impl SchemaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, def: EntityTypeDef) -> Self {
        self.types.push(def);
        self
    }

    /// Parses a JSON schema document.
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        Ok(serde_json::from_str(json)?)
    }
}
