//! The in-memory mirror of one row.
//!
//! An [`Entity`] owns one [`Node`] per node definition of its type, a
//! lifecycle [`EntityState`], and a synthetic [`EntityId`] that survives
//! copies into other contexts. Entities are shared as [`EntityRef`]
//! (`Rc<RefCell<Entity>>`); the identity map only keeps weak handles.
//! Dropping the last strong handle queues the id on the owning context's
//! reclaim channel.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::{ContextId, EntityId};
use crate::node::{Node, NodeValue, RefNode, ToManyNode, ValueNode};
use crate::schema::{EntityType, NodeDefinition, NodeKind};
use crate::value::Value;

/// Shared handle to an entity.
pub type EntityRef = Rc<RefCell<Entity>>;

/// Non-owning handle to an entity.
pub type WeakEntityRef = Weak<RefCell<Entity>>;

/// Lifecycle state of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    NotLoaded,
    Loading,
    Loaded,
    /// Terminal.
    Deleted,
}

pub struct Entity {
    id: EntityId,
    context: ContextId,
    entity_type: Arc<EntityType>,
    nodes: IndexMap<String, Node>,
    state: EntityState,
    reclaim: Option<Sender<EntityId>>,
}

fn fresh_node(def: &NodeDefinition) -> Node {
    match &def.kind {
        NodeKind::Value => Node::Value(ValueNode::loaded(
            def.fixed_value.clone().unwrap_or(Value::Null),
        )),
        NodeKind::Ref { .. } => Node::Ref(RefNode::null().back_reference(def.back_reference)),
        NodeKind::ToMany { .. } => Node::ToMany(ToManyNode::empty()),
    }
}

fn unloaded_node(def: &NodeDefinition) -> Node {
    match &def.kind {
        NodeKind::Value => Node::Value(ValueNode::unloaded()),
        NodeKind::Ref { .. } => {
            Node::Ref(RefNode::unloaded().back_reference(def.back_reference))
        }
        NodeKind::ToMany { .. } => Node::ToMany(ToManyNode::unknown()),
    }
}

impl Entity {
    /// A new, not yet persisted entity: null key, state LOADED, value nodes
    /// at their fixed value or `Null`, collections fetched and empty.
    pub fn fresh(
        id: EntityId,
        context: ContextId,
        entity_type: Arc<EntityType>,
        reclaim: Option<Sender<EntityId>>,
    ) -> Self {
        let nodes = entity_type
            .nodes()
            .map(|def| (def.name.clone(), fresh_node(def)))
            .collect();
        Entity {
            id,
            context,
            entity_type,
            nodes,
            state: EntityState::Loaded,
            reclaim,
        }
    }

    /// A placeholder for the row with `key`: state NOTLOADED, everything but
    /// the key unknown.
    pub fn placeholder(
        id: EntityId,
        context: ContextId,
        entity_type: Arc<EntityType>,
        key: Value,
        reclaim: Option<Sender<EntityId>>,
    ) -> Self {
        let key_node = entity_type.key_node().to_string();
        let nodes = entity_type
            .nodes()
            .map(|def| {
                let node = if def.name == key_node {
                    Node::Value(ValueNode::loaded(key.clone()))
                } else {
                    unloaded_node(def)
                };
                (def.name.clone(), node)
            })
            .collect();
        Entity {
            id,
            context,
            entity_type,
            nodes,
            state: EntityState::NotLoaded,
            reclaim,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    /// The context this entity belongs to.
    pub fn context_id(&self) -> ContextId {
        self.context
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.entity_type
    }

    pub fn type_name(&self) -> &str {
        self.entity_type.name()
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    /// Primary key, `Null` until persisted.
    pub fn key(&self) -> Value {
        self.nodes
            .get(self.entity_type.key_node())
            .and_then(Node::as_value)
            .and_then(ValueNode::get)
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn has_key(&self) -> bool {
        !self.key().is_null()
    }

    /// `Type#key` or `Type(new)`.
    pub fn label(&self) -> String {
        let key = self.key();
        if key.is_null() {
            format!("{}(new)", self.type_name())
        } else {
            format!("{}#{}", self.type_name(), key)
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.nodes.iter().map(|(name, node)| (name.as_str(), node))
    }

    pub fn node(&self, name: &str) -> Result<&Node, CoreError> {
        self.nodes.get(name).ok_or_else(|| self.undefined(name))
    }

    fn node_mut(&mut self, name: &str) -> Result<&mut Node, CoreError> {
        match self.nodes.get_mut(name) {
            Some(node) => Ok(node),
            None => Err(CoreError::NodeNotDefined {
                entity_type: self.entity_type.name().to_string(),
                node: name.to_string(),
            }),
        }
    }

    fn undefined(&self, name: &str) -> CoreError {
        CoreError::NodeNotDefined {
            entity_type: self.entity_type.name().to_string(),
            node: name.to_string(),
        }
    }

    fn mismatch(&self, name: &str, expected: &'static str) -> CoreError {
        CoreError::NodeKindMismatch {
            entity_type: self.entity_type.name().to_string(),
            node: name.to_string(),
            expected,
        }
    }

    pub fn value_node(&self, name: &str) -> Result<&ValueNode, CoreError> {
        self.node(name)?
            .as_value()
            .ok_or_else(|| self.mismatch(name, "value"))
    }

    pub fn ref_node(&self, name: &str) -> Result<&RefNode, CoreError> {
        self.node(name)?
            .as_reference()
            .ok_or_else(|| self.mismatch(name, "ref"))
    }

    pub fn to_many(&self, name: &str) -> Result<&ToManyNode, CoreError> {
        self.node(name)?
            .as_to_many()
            .ok_or_else(|| self.mismatch(name, "to-many"))
    }

    pub(crate) fn value_node_mut(&mut self, name: &str) -> Result<&mut ValueNode, CoreError> {
        let err = self.mismatch(name, "value");
        self.node_mut(name)?.as_value_mut().ok_or(err)
    }

    pub(crate) fn ref_node_mut(&mut self, name: &str) -> Result<&mut RefNode, CoreError> {
        let err = self.mismatch(name, "ref");
        self.node_mut(name)?.as_reference_mut().ok_or(err)
    }

    pub(crate) fn to_many_mut(&mut self, name: &str) -> Result<&mut ToManyNode, CoreError> {
        let err = self.mismatch(name, "to-many");
        self.node_mut(name)?.as_to_many_mut().ok_or(err)
    }

    /// Current value of a value node; `None` when not loaded.
    pub fn value(&self, name: &str) -> Result<Option<&Value>, CoreError> {
        Ok(self.value_node(name)?.get())
    }

    /// Sets a value node. The key node is not settable here; keys are
    /// assigned through the context so the identity map stays in sync.
    pub fn set_value(&mut self, name: &str, value: impl Into<Value>) -> Result<(), CoreError> {
        let value = value.into();
        if self.state == EntityState::Deleted {
            return Err(CoreError::illegal_state(format!(
                "cannot modify deleted entity {}",
                self.label()
            )));
        }
        if name == self.entity_type.key_node() {
            let previous = self.key();
            return Err(if previous.is_null() {
                CoreError::illegal_state(format!(
                    "key of {} is assigned by the context, not set directly",
                    self.type_name()
                ))
            } else {
                CoreError::KeyImmutable {
                    entity_type: self.type_name().to_string(),
                    previous,
                    attempted: value,
                }
            });
        }
        let def = self.entity_type.require_node(name)?;
        if let Some(column_type) = def.column_type {
            if !column_type.accepts(&value) {
                return Err(CoreError::TypeMismatch {
                    expected: format!("{column_type:?}"),
                    found: value.to_string(),
                });
            }
        }
        self.value_node_mut(name)?.set(value);
        Ok(())
    }

    /// Writes the key node. Callers keep the identity map in sync.
    pub(crate) fn set_key(&mut self, key: Value) -> Result<(), CoreError> {
        let key_node = self.entity_type.key_node().to_string();
        self.value_node_mut(&key_node)?.load(key);
        Ok(())
    }

    /// Moves to `state`. Leaving DELETED is illegal.
    pub fn set_state(&mut self, state: EntityState) -> Result<(), CoreError> {
        if self.state == EntityState::Deleted && state != EntityState::Deleted {
            return Err(CoreError::illegal_state(format!(
                "{} is deleted and cannot become {:?}",
                self.label(),
                state
            )));
        }
        tracing::trace!(entity = %self.label(), from = ?self.state, to = ?state, "state change");
        self.state = state;
        Ok(())
    }

    /// Forgets everything but the key and identity. The entity becomes
    /// NOTLOADED and all relation change tracking is cleared.
    pub fn unload(&mut self) -> Result<(), CoreError> {
        if self.state == EntityState::Deleted {
            return Err(CoreError::illegal_state(format!(
                "cannot unload deleted entity {}",
                self.label()
            )));
        }
        let key_node = self.entity_type.key_node().to_string();
        for (name, node) in self.nodes.iter_mut() {
            match node {
                Node::Value(n) if *name != key_node => n.unload(),
                Node::Value(_) => {}
                Node::Ref(n) => n.unload(),
                Node::ToMany(n) => n.unload(),
            }
        }
        self.state = EntityState::NotLoaded;
        Ok(())
    }

    /// True if any node has pending changes.
    pub fn is_dirty(&self) -> bool {
        self.nodes.values().any(Node::is_dirty)
    }

    /// Copies value-node contents from `other`, which must have the same
    /// type. The key is copied only while this entity has none; the copied
    /// key is returned so the caller can register it.
    pub fn copy_value_nodes_to_me(&mut self, other: &Entity) -> Result<Option<Value>, CoreError> {
        if self.type_name() != other.type_name() {
            return Err(CoreError::TypeMismatch {
                expected: self.type_name().to_string(),
                found: other.type_name().to_string(),
            });
        }
        let key_node = self.entity_type.key_node().to_string();
        let mut adopted = None;
        for (name, node) in other.nodes() {
            let Node::Value(source) = node else { continue };
            if name == key_node {
                if !self.has_key() && !other.key().is_null() {
                    adopted = Some(other.key());
                    self.value_node_mut(name)?.load(other.key());
                }
                continue;
            }
            *self.value_node_mut(name)? = source.clone();
        }
        Ok(adopted)
    }

    /// Rebinds to a concrete subtype. Nodes the subtype adds start unknown;
    /// existing nodes keep their contents.
    pub(crate) fn rebind(&mut self, concrete: Arc<EntityType>) {
        let mut old = std::mem::take(&mut self.nodes);
        self.nodes = concrete
            .nodes()
            .map(|def| {
                let node = old
                    .shift_remove(&def.name)
                    .unwrap_or_else(|| unloaded_node(def));
                (def.name.clone(), node)
            })
            .collect();
        self.entity_type = concrete;
    }

    /// Makes all pending changes the new clean state.
    pub fn accept_changes(&mut self) {
        for node in self.nodes.values_mut() {
            match node {
                Node::Value(n) => n.accept_changes(),
                Node::Ref(n) => n.clear(),
                Node::ToMany(n) => n.clear(),
            }
        }
    }

    /// Drops every live relation handle. Used to break cycles of forward
    /// references when the owning context goes away.
    pub(crate) fn detach_relations(&mut self) {
        for node in self.nodes.values_mut() {
            match node {
                Node::Ref(n) => {
                    n.forget_reference();
                    n.clear();
                }
                Node::ToMany(n) => n.unload(),
                Node::Value(_) => {}
            }
        }
    }

    /// Raw contents of a value node, for fetchers.
    pub fn raw_value(&self, name: &str) -> Option<&NodeValue> {
        self.nodes.get(name).and_then(Node::as_value).map(ValueNode::value)
    }
}

impl Drop for Entity {
    fn drop(&mut self) {
        if let Some(reclaim) = &self.reclaim {
            // The receiver is gone once the context is dropped.
            let _ = reclaim.send(self.id);
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("type", &self.entity_type.name())
            .field("key", &self.key())
            .field("state", &self.state)
            .field("context", &self.context)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DefinitionSet, EntityTypeDef, NodeDefinition, RelationKind, SchemaSource};
    use crate::value::ColumnType;

    fn defs() -> DefinitionSet {
        DefinitionSet::new(
            SchemaSource::new()
                .entity(
                    EntityTypeDef::new("Order", "orders")
                        .key("id", "id", ColumnType::BigInt)
                        .value("note", "note", ColumnType::Varchar)
                        .reference("customer", "customer_id", "Customer", RelationKind::Refers)
                        .to_many("items", "LineItem", "order", RelationKind::Owns),
                )
                .entity(
                    EntityTypeDef::new("Customer", "customer").key("id", "id", ColumnType::BigInt),
                )
                .entity(
                    EntityTypeDef::new("LineItem", "line_item")
                        .key("id", "id", ColumnType::BigInt)
                        .reference("order", "order_id", "Order", RelationKind::Refers),
                )
                .entity(
                    EntityTypeDef::new("Flagged", "flagged")
                        .key("id", "id", ColumnType::BigInt)
                        .node(
                            NodeDefinition::value("kind", "kind", ColumnType::Varchar)
                                .with_fixed_value("F"),
                        ),
                ),
        )
        .unwrap()
    }

    fn order_placeholder(key: i64) -> Entity {
        let ty = defs().get("Order").unwrap();
        Entity::placeholder(EntityId::new(), ContextId(0), ty, Value::Int(key), None)
    }

    #[test]
    fn fresh_entity_defaults() {
        let defs = defs();
        let order = Entity::fresh(EntityId::new(), ContextId(0), defs.get("Order").unwrap(), None);
        assert_eq!(order.state(), EntityState::Loaded);
        assert_eq!(order.key(), Value::Null);
        assert_eq!(order.value("note").unwrap(), Some(&Value::Null));
        assert!(order.to_many("items").unwrap().is_fetched());
        assert_eq!(order.label(), "Order(new)");

        let flagged = Entity::fresh(

            EntityId::new(),

            ContextId(0),

            defs.get("Flagged").unwrap(),

            None,

        );
        assert_eq!(flagged.value("kind").unwrap(), Some(&Value::from("F")));
    }

    #[test]
    fn placeholder_is_not_loaded() {
        let order = order_placeholder(7);
        assert_eq!(order.state(), EntityState::NotLoaded);
        assert_eq!(order.key(), Value::Int(7));
        assert_eq!(order.value("note").unwrap(), None);
        assert_eq!(order.to_many("items").unwrap().fetched(), None);
        assert_eq!(order.label(), "Order#7");
    }

    #[test]
    fn key_cannot_be_set_directly() {
        let mut order = order_placeholder(7);
        let err = order.set_value("id", 8i64).unwrap_err();
        assert!(matches!(err, CoreError::KeyImmutable { .. }));
        assert_eq!(order.key(), Value::Int(7));

        let defs = defs();
        let mut fresh = Entity::fresh(
            EntityId::new(),
            ContextId(0),
            defs.get("Order").unwrap(),
            None,
        );
        let err = fresh.set_value("id", 1i64).unwrap_err();
        assert!(matches!(err, CoreError::IllegalState { .. }));
    }

    #[test]
    fn set_value_checks_kind_and_type() {
        let mut order = order_placeholder(1);
        assert!(matches!(
            order.set_value("customer", 1i64),
            Err(CoreError::NodeKindMismatch { .. })
        ));
        assert!(matches!(
            order.set_value("note", 5i64),
            Err(CoreError::TypeMismatch { .. })
        ));
        assert!(matches!(
            order.set_value("missing", 5i64),
            Err(CoreError::NodeNotDefined { .. })
        ));
        order.set_value("note", "rush").unwrap();
        assert!(order.is_dirty());
    }

    #[test]
    fn deleted_is_terminal() {
        let mut order = order_placeholder(1);
        order.set_state(EntityState::Deleted).unwrap();
        assert!(order.set_state(EntityState::Loaded).is_err());
        assert!(order.set_state(EntityState::Deleted).is_ok());
        assert!(order.unload().is_err());
    }

    #[test]
    fn unload_keeps_key_and_forgets_the_rest() {
        let mut order = order_placeholder(3);
        order.set_state(EntityState::Loaded).unwrap();
        order.value_node_mut("note").unwrap().load(Value::from("x"));
        order.ref_node_mut("customer").unwrap().load(Value::Int(4));
        order.to_many_mut("items").unwrap().set_fetched(Vec::new());

        order.unload().unwrap();
        assert_eq!(order.state(), EntityState::NotLoaded);
        assert_eq!(order.key(), Value::Int(3));
        assert_eq!(order.value("note").unwrap(), None);
        assert_eq!(order.ref_node("customer").unwrap().key(), &Value::Null);
        assert!(!order.ref_node("customer").unwrap().is_loaded());
        assert_eq!(order.to_many("items").unwrap().fetched(), None);
        assert!(!order.is_dirty());
    }

    #[test]
    fn copy_value_nodes_requires_same_type() {
        let defs = defs();
        let mut order = Entity::fresh(
            EntityId::new(),
            ContextId(0),
            defs.get("Order").unwrap(),
            None,
        );
        let customer = Entity::fresh(
            EntityId::new(),
            ContextId(0),
            defs.get("Customer").unwrap(),
            None,
        );
        assert!(matches!(
            order.copy_value_nodes_to_me(&customer),
            Err(CoreError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn copy_value_nodes_adopts_key_only_when_null() {
        let defs = defs();
        let mut source = order_placeholder(5);
        source.value_node_mut("note").unwrap().load(Value::from("hello"));

        let mut target = Entity::fresh(

            EntityId::new(),

            ContextId(0),

            defs.get("Order").unwrap(),

            None,

        );
        let adopted = target.copy_value_nodes_to_me(&source).unwrap();
        assert_eq!(adopted, Some(Value::Int(5)));
        assert_eq!(target.key(), Value::Int(5));
        assert_eq!(target.value("note").unwrap(), Some(&Value::from("hello")));

        let mut keyed = order_placeholder(9);
        assert_eq!(keyed.copy_value_nodes_to_me(&source).unwrap(), None);
        assert_eq!(keyed.key(), Value::Int(9));
    }
}
