//! Ordered, deduplicating groups of entities for one DML kind.

use std::fmt;

use indexmap::IndexMap;
use relgraph_core::{EntityId, EntityRef};
use serde::Serialize;

use crate::error::PersistError;

/// The kind of operation a group holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    /// Read-only freshness check.
    DependsOn,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::DependsOn => "depends_on",
        };
        f.write_str(name)
    }
}

/// Entities scheduled for one operation kind, in execution order. Each
/// entity appears at most once.
#[derive(Clone)]
pub struct OperationGroup {
    kind: OperationKind,
    entities: IndexMap<EntityId, EntityRef>,
}

impl OperationGroup {
    pub fn new(kind: OperationKind) -> Self {
        OperationGroup {
            kind,
            entities: IndexMap::new(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Appends `entity`. Returns false if it is already present.
    pub fn push(&mut self, entity: &EntityRef) -> bool {
        let id = entity.borrow().id();
        if self.entities.contains_key(&id) {
            return false;
        }
        self.entities.insert(id, entity.clone());
        true
    }

    /// Removes `id`, keeping the order of the rest.
    pub fn remove(&mut self, id: EntityId) -> bool {
        self.entities.shift_remove(&id).is_some()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRef> {
        self.entities.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    /// Appends every entity of `other`. Both groups must be of one kind.
    pub fn merge(&mut self, other: OperationGroup) -> Result<(), PersistError> {
        if other.kind != self.kind {
            return Err(PersistError::illegal(format!(
                "cannot merge a {} group into a {} group",
                other.kind, self.kind
            )));
        }
        for (id, entity) in other.entities {
            self.entities.entry(id).or_insert(entity);
        }
        Ok(())
    }

    /// Replaces the order. `order` must hold exactly the current members.
    pub fn reorder(&mut self, order: Vec<EntityRef>) -> Result<(), PersistError> {
        let mut reordered = IndexMap::with_capacity(order.len());
        for entity in order {
            let id = entity.borrow().id();
            if !self.entities.contains_key(&id) {
                return Err(PersistError::illegal(format!(
                    "reorder of {} group names non-member {}",
                    self.kind,
                    entity.borrow().label()
                )));
            }
            reordered.insert(id, entity);
        }
        if reordered.len() != self.entities.len() {
            return Err(PersistError::illegal(format!(
                "reorder of {} group covers {} of {} members",
                self.kind,
                reordered.len(),
                self.entities.len()
            )));
        }
        self.entities = reordered;
        Ok(())
    }

    /// The same members in reverse order.
    pub fn reversed(mut self) -> Self {
        self.entities.reverse();
        self
    }

    /// `Type#key` / `Type(new)` labels in order.
    pub fn labels(&self) -> Vec<String> {
        self.entities.values().map(|e| e.borrow().label()).collect()
    }
}

impl fmt::Debug for OperationGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationGroup")
            .field("kind", &self.kind)
            .field("entities", &self.labels())
            .finish()
    }
}

impl fmt::Display for OperationGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=[{}]", self.kind, self.labels().join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relgraph_core::{
        ColumnType, DefinitionSet, EntityContext, EntityTypeDef, SchemaSource, Value,
    };
    use std::sync::Arc;

    fn ctx() -> EntityContext {
        let defs = DefinitionSet::new(
            SchemaSource::new()
                .entity(EntityTypeDef::new("Item", "item").key("id", "id", ColumnType::BigInt)),
        )
        .unwrap();
        EntityContext::new(Arc::new(defs))
    }

    #[test]
    fn push_deduplicates_and_keeps_order() {
        let ctx = ctx();
        let a = ctx.get_or_create("Item", Value::Int(1)).unwrap();
        let b = ctx.get_or_create("Item", Value::Int(2)).unwrap();
        let mut group = OperationGroup::new(OperationKind::Update);
        assert!(group.push(&a));
        assert!(group.push(&b));
        assert!(!group.push(&a));
        assert_eq!(group.labels(), vec!["Item#1", "Item#2"]);
        assert_eq!(group.to_string(), "update=[Item#1, Item#2]");

        assert!(group.remove(a.borrow().id()));
        assert!(!group.contains(a.borrow().id()));
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn merge_requires_same_kind() {
        let ctx = ctx();
        let a = ctx.get_or_create("Item", Value::Int(1)).unwrap();
        let mut update = OperationGroup::new(OperationKind::Update);
        let mut other = OperationGroup::new(OperationKind::Update);
        other.push(&a);
        update.merge(other).unwrap();
        assert_eq!(update.len(), 1);

        let delete = OperationGroup::new(OperationKind::Delete);
        assert!(matches!(
            update.merge(delete),
            Err(PersistError::IllegalPersistState { .. })
        ));
    }

    #[test]
    fn reorder_and_reverse() {
        let ctx = ctx();
        let a = ctx.get_or_create("Item", Value::Int(1)).unwrap();
        let b = ctx.get_or_create("Item", Value::Int(2)).unwrap();
        let c = ctx.get_or_create("Item", Value::Int(3)).unwrap();
        let mut group = OperationGroup::new(OperationKind::Delete);
        for e in [&a, &b, &c] {
            group.push(e);
        }
        group.reorder(vec![c.clone(), a.clone(), b.clone()]).unwrap();
        assert_eq!(group.labels(), vec!["Item#3", "Item#1", "Item#2"]);
        assert_eq!(
            group.clone().reversed().labels(),
            vec!["Item#2", "Item#1", "Item#3"]
        );
        assert!(group.reorder(vec![a.clone()]).is_err());
    }
}
