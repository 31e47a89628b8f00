//! The entity context: one identity-map-scoped unit of work.
//!
//! An [`EntityContext`] owns the identity map and the definition set, and is
//! the only place that mutates relations and keys, so back-references and
//! key indexes stay consistent. It is single-threaded by construction
//! (`Rc`/`RefCell`). Contexts never share entities; data moves between them
//! through [`EntityContext::import`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::entities::Entities;
use crate::entity::{Entity, EntityRef, EntityState};
use crate::error::CoreError;
use crate::fetch::Fetcher;
use crate::id::{ContextId, EntityId};
use crate::schema::{DefinitionSet, EntityType, NodeDefinition};
use crate::value::Value;

/// Per-context settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// When false, every tracked entity is pinned in memory.
    pub allow_garbage_collection: bool,
    /// When false, [`EntityContext::check_fetched`] never fetches.
    pub lazy_loading: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            allow_garbage_collection: true,
            lazy_loading: true,
        }
    }
}

pub struct EntityContext {
    id: ContextId,
    defs: Arc<DefinitionSet>,
    entities: RefCell<Entities>,
    fetcher: RefCell<Option<Rc<dyn Fetcher>>>,
    config: ContextConfig,
}

impl EntityContext {
    pub fn new(defs: Arc<DefinitionSet>) -> Self {
        Self::with_config(defs, ContextConfig::default())
    }

    pub fn with_config(defs: Arc<DefinitionSet>, config: ContextConfig) -> Self {
        let id = ContextId::next();
        tracing::debug!(context = %id, ?config, "context created");
        EntityContext {
            id,
            defs,
            entities: RefCell::new(Entities::new(id, config.allow_garbage_collection)),
            fetcher: RefCell::new(None),
            config,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn definitions(&self) -> &Arc<DefinitionSet> {
        &self.defs
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn set_fetcher(&self, fetcher: Rc<dyn Fetcher>) {
        *self.fetcher.borrow_mut() = Some(fetcher);
    }

    /// Runs `f` against the identity map.
    pub fn with_entities<R>(&self, f: impl FnOnce(&mut Entities) -> R) -> R {
        f(&mut self.entities.borrow_mut())
    }

    /// Fails unless `entity` belongs to this context.
    pub fn check_member(&self, entity: &EntityRef) -> Result<(), CoreError> {
        let e = entity.borrow();
        if e.context_id() == self.id {
            Ok(())
        } else {
            Err(CoreError::ForeignEntity {
                id: e.id(),
                owner: e.context_id(),
                context: self.id,
            })
        }
    }

    // -----------------------------------------------------------------------
    // Creation and lookup
    // -----------------------------------------------------------------------

    /// Creates and tracks a new, unsaved entity of a concrete type.
    pub fn new_entity(&self, type_name: &str) -> Result<EntityRef, CoreError> {
        let entity_type = self.defs.get(type_name)?;
        if entity_type.is_abstract() {
            return Err(CoreError::illegal_state(format!(
                "cannot instantiate abstract type '{type_name}'"
            )));
        }
        let mut entities = self.entities.borrow_mut();
        let entity = Rc::new(RefCell::new(Entity::fresh(
            EntityId::new(),
            self.id,
            entity_type,
            Some(entities.reclaim_sender()),
        )));
        entities.add(&entity, None)?;
        Ok(entity)
    }

    /// Returns the tracked entity for (type's table, `key`), creating a
    /// NOTLOADED placeholder on a miss.
    pub fn get_or_create(&self, type_name: &str, key: Value) -> Result<EntityRef, CoreError> {
        self.get_or_create_from_query(type_name, key, None)
    }

    /// Like [`get_or_create`](Self::get_or_create), recording the query that
    /// produced the row.
    pub fn get_or_create_from_query(
        &self,
        type_name: &str,
        key: Value,
        source_query: Option<&str>,
    ) -> Result<EntityRef, CoreError> {
        if key.is_null() {
            return Err(CoreError::illegal_state(format!(
                "cannot look up '{type_name}' by a null key"
            )));
        }
        let entity_type = self.defs.get(type_name)?;
        let existing = self
            .entities
            .borrow_mut()
            .get_by_key(entity_type.table(), &key);
        if let Some(existing) = existing {
            self.check_related_type(&existing, entity_type.name())?;
            return Ok(existing);
        }

        let mut entities = self.entities.borrow_mut();
        let entity = Rc::new(RefCell::new(Entity::placeholder(
            EntityId::new(),
            self.id,
            entity_type,
            key,
            Some(entities.reclaim_sender()),
        )));
        entities.add(&entity, source_query)?;
        Ok(entity)
    }

    fn check_related_type(&self, entity: &EntityRef, type_name: &str) -> Result<(), CoreError> {
        let found = entity.borrow().type_name().to_string();
        if self.defs.is_a(&found, type_name) || self.defs.is_a(type_name, &found) {
            Ok(())
        } else {
            Err(CoreError::TypeMismatch {
                expected: type_name.to_string(),
                found,
            })
        }
    }

    pub fn get_by_key(&self, type_name: &str, key: &Value) -> Result<Option<EntityRef>, CoreError> {
        let entity_type = self.defs.get(type_name)?;
        Ok(self.entities.borrow_mut().get_by_key(entity_type.table(), key))
    }

    pub fn get_by_uuid(&self, id: EntityId) -> Option<EntityRef> {
        self.entities.borrow_mut().get_by_uuid(id)
    }

    pub fn require_by_uuid(&self, id: EntityId) -> Result<EntityRef, CoreError> {
        self.entities.borrow_mut().require_by_uuid(id)
    }

    /// Gives a key-null entity its primary key and indexes it. Every entity
    /// pointing at it learns the key too.
    pub fn assign_key(&self, entity: &EntityRef, key: Value) -> Result<(), CoreError> {
        self.check_member(entity)?;
        let (id, previous) = {
            let e = entity.borrow();
            (e.id(), e.key())
        };
        if !previous.is_null() {
            if previous == key {
                return Ok(());
            }
            return Err(CoreError::KeyImmutable {
                entity_type: entity.borrow().type_name().to_string(),
                previous,
                attempted: key,
            });
        }
        self.entities
            .borrow_mut()
            .key_changed(id, &Value::Null, &key)?;
        entity.borrow_mut().set_key(key.clone())?;

        let referrers = self.entities.borrow_mut().referrers(id);
        for (referrer, node) in referrers {
            referrer
                .borrow_mut()
                .ref_node_mut(&node)?
                .update_target_key(key.clone());
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Relations
    // -----------------------------------------------------------------------

    fn definition(&self, entity: &EntityRef, node: &str) -> Result<NodeDefinition, CoreError> {
        Ok(entity.borrow().entity_type().require_node(node)?.clone())
    }

    fn require_kind(
        &self,
        entity: &EntityRef,
        def: &NodeDefinition,
        ok: bool,
        expected: &'static str,
    ) -> Result<(), CoreError> {
        if ok {
            Ok(())
        } else {
            Err(CoreError::NodeKindMismatch {
                entity_type: entity.borrow().type_name().to_string(),
                node: def.name.clone(),
                expected,
            })
        }
    }

    /// Points `node` of `entity` at `target`, tracking the change and the
    /// back-reference.
    pub fn set_reference(
        &self,
        entity: &EntityRef,
        node: &str,
        target: Option<&EntityRef>,
    ) -> Result<(), CoreError> {
        self.check_member(entity)?;
        let def = self.definition(entity, node)?;
        self.require_kind(entity, &def, def.is_ref(), "ref")?;
        if let Some(target) = target {
            self.check_member(target)?;
            self.check_related_type(target, def.target().unwrap_or_default())?;
        }
        if entity.borrow().state() == EntityState::Deleted {
            return Err(CoreError::illegal_state(format!(
                "cannot modify deleted entity {}",
                entity.borrow().label()
            )));
        }

        let target_key = target.map(|t| t.borrow().key()).unwrap_or(Value::Null);
        let old = entity.borrow().ref_node(node)?.reference();
        entity
            .borrow_mut()
            .ref_node_mut(node)?
            .set_reference(target.cloned(), target_key);

        let old_id = old.as_ref().map(|o| o.borrow().id());
        let new_id = target.map(|t| t.borrow().id());
        let mut entities = self.entities.borrow_mut();
        if let Some(old_id) = old_id {
            entities.remove_association(old_id, entity, node);
        }
        if let Some(new_id) = new_id {
            entities.add_association(new_id, entity, node);
        }
        Ok(())
    }

    /// Returns the live target of a reference, resolving it by key through
    /// the identity map when needed. Fetches `entity` first if the node is
    /// not loaded.
    pub fn resolve_reference(
        &self,
        entity: &EntityRef,
        node: &str,
    ) -> Result<Option<EntityRef>, CoreError> {
        self.check_member(entity)?;
        let def = self.definition(entity, node)?;
        self.require_kind(entity, &def, def.is_ref(), "ref")?;
        if !entity.borrow().ref_node(node)?.is_loaded() {
            self.check_fetched(entity)?;
        }

        let (current, key) = {
            let e = entity.borrow();
            let r = e.ref_node(node)?;
            (r.reference(), r.key().clone())
        };
        if current.is_some() {
            return Ok(current);
        }
        if key.is_null() {
            return Ok(None);
        }

        let target = self.get_or_create(def.target().unwrap_or_default(), key)?;
        entity.borrow_mut().ref_node_mut(node)?.resolve(Rc::clone(&target));
        let target_id = target.borrow().id();
        self.entities
            .borrow_mut()
            .add_association(target_id, entity, node);
        Ok(Some(target))
    }

    /// Re-resolves a keyed reference from its key.
    pub fn refresh_ref(
        &self,
        entity: &EntityRef,
        node: &str,
    ) -> Result<Option<EntityRef>, CoreError> {
        self.check_member(entity)?;
        let has_key = !entity.borrow().ref_node(node)?.key().is_null();
        if has_key {
            let old = entity.borrow_mut().ref_node_mut(node)?.forget_reference();
            if let Some(old) = old {
                let old_id = old.borrow().id();
                self.entities
                    .borrow_mut()
                    .remove_association(old_id, entity, node);
            }
        }
        self.resolve_reference(entity, node)
    }

    /// Foreign key a reference would be written with: the live target's key
    /// when resolved, otherwise the stored key.
    pub fn reference_key(&self, entity: &EntityRef, node: &str) -> Result<Value, CoreError> {
        let e = entity.borrow();
        let r = e.ref_node(node)?;
        let key = match r.reference() {
            Some(target) if Rc::ptr_eq(&target, entity) => e.key(),
            Some(target) => {
                let key = target.borrow().key();
                key
            }
            None => r.key().clone(),
        };
        Ok(key)
    }

    /// Adds `child` to a to-many collection and points the child's foreign
    /// reference at `owner`.
    pub fn add_to_many(
        &self,
        owner: &EntityRef,
        node: &str,
        child: &EntityRef,
    ) -> Result<bool, CoreError> {
        self.check_member(owner)?;
        self.check_member(child)?;
        let def = self.definition(owner, node)?;
        self.require_kind(owner, &def, def.is_to_many(), "to-many")?;
        self.check_related_type(child, def.target().unwrap_or_default())?;

        let added = owner.borrow_mut().to_many_mut(node)?.add(Rc::clone(child));
        if let Some(foreign) = def.foreign_node() {
            let points_at_owner = child.borrow().ref_node(foreign)?.points_at(owner);
            if !points_at_owner {
                self.set_reference(child, foreign, Some(owner))?;
            }
        }
        Ok(added)
    }

    /// Removes `child` from a to-many collection and unlinks its foreign
    /// reference if it still points at `owner`.
    pub fn remove_from_many(
        &self,
        owner: &EntityRef,
        node: &str,
        child: &EntityRef,
    ) -> Result<bool, CoreError> {
        self.check_member(owner)?;
        self.check_member(child)?;
        let def = self.definition(owner, node)?;
        self.require_kind(owner, &def, def.is_to_many(), "to-many")?;

        let removed = owner.borrow_mut().to_many_mut(node)?.remove(child);
        if removed {
            if let Some(foreign) = def.foreign_node() {
                let owner_key = owner.borrow().key();
                let points_at_owner = {
                    let c = child.borrow();
                    let r = c.ref_node(foreign)?;
                    match r.reference() {
                        Some(target) => Rc::ptr_eq(&target, owner),
                        None => !owner_key.is_null() && r.key() == &owner_key,
                    }
                };
                if points_at_owner {
                    self.set_reference(child, foreign, None)?;
                }
            }
        }
        Ok(removed)
    }

    /// Live entities pointing at `entity`, with the node they use.
    pub fn referrers(&self, entity: &EntityRef) -> Vec<(EntityRef, String)> {
        let id = entity.borrow().id();
        self.entities.borrow_mut().referrers(id)
    }

    // -----------------------------------------------------------------------
    // Fetching
    // -----------------------------------------------------------------------

    fn fetcher(&self) -> Result<Rc<dyn Fetcher>, CoreError> {
        self.fetcher.borrow().clone().ok_or_else(|| CoreError::Fetch {
            reason: format!("no fetcher configured for {}", self.id),
        })
    }

    /// Loads `entity` through the fetcher. LOADING while the fetch runs,
    /// LOADED after, NOTLOADED again on failure.
    pub fn fetch(&self, entity: &EntityRef) -> Result<(), CoreError> {
        self.check_member(entity)?;
        let (label, has_key, state) = {
            let e = entity.borrow();
            (e.label(), e.has_key(), e.state())
        };
        if !has_key {
            return Err(CoreError::illegal_state(format!("cannot fetch {label}: no key")));
        }
        if state == EntityState::Deleted {
            return Err(CoreError::illegal_state(format!("cannot fetch deleted {label}")));
        }
        let fetcher = self.fetcher()?;

        entity.borrow_mut().set_state(EntityState::Loading)?;
        tracing::debug!(entity = %label, "fetching entity");
        let result = fetcher.fetch_entity(self, entity);

        let mut e = entity.borrow_mut();
        if e.state() == EntityState::Loading {
            e.set_state(if result.is_ok() {
                EntityState::Loaded
            } else {
                EntityState::NotLoaded
            })?;
        }
        result
    }

    /// Loads the to-many collection `node` of `owner`.
    pub fn fetch_to_many(&self, owner: &EntityRef, node: &str) -> Result<(), CoreError> {
        self.check_member(owner)?;
        let def = self.definition(owner, node)?;
        self.require_kind(owner, &def, def.is_to_many(), "to-many")?;
        let fetcher = self.fetcher()?;
        tracing::debug!(owner = %owner.borrow().label(), node, "fetching collection");
        fetcher.fetch_to_many(self, owner, node)
    }

    /// Fetches `entity` if it is NOTLOADED and has a key. Returns whether a
    /// fetch ran. Never fires for key-null entities or with lazy loading off.
    pub fn check_fetched(&self, entity: &EntityRef) -> Result<bool, CoreError> {
        if !self.config.lazy_loading {
            return Ok(false);
        }
        let (state, has_key) = {
            let e = entity.borrow();
            (e.state(), e.has_key())
        };
        if state == EntityState::NotLoaded && has_key {
            self.fetch(entity)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // -----------------------------------------------------------------------
    // Loading hooks
    // -----------------------------------------------------------------------

    /// Stores a fetched scalar. The node becomes clean.
    pub fn load_value(
        &self,
        entity: &EntityRef,
        node: &str,
        value: Value,
    ) -> Result<(), CoreError> {
        let mut e = entity.borrow_mut();
        if node == e.entity_type().key_node() {
            let key = e.key();
            if key != value {
                return Err(CoreError::KeyImmutable {
                    entity_type: e.type_name().to_string(),
                    previous: key,
                    attempted: value,
                });
            }
            return Ok(());
        }
        e.value_node_mut(node)?.load(value);
        Ok(())
    }

    /// Stores a fetched foreign key. The target resolves lazily.
    pub fn load_reference(
        &self,
        entity: &EntityRef,
        node: &str,
        key: Value,
    ) -> Result<(), CoreError> {
        let old = entity.borrow().ref_node(node)?.reference();
        entity.borrow_mut().ref_node_mut(node)?.load(key);
        let dropped = old.filter(|_| {
            entity
                .borrow()
                .ref_node(node)
                .map(|r| r.reference().is_none())
                .unwrap_or(false)
        });
        if let Some(old) = dropped {
            let old_id = old.borrow().id();
            self.entities
                .borrow_mut()
                .remove_association(old_id, entity, node);
        }
        Ok(())
    }

    /// Installs the fetched members of a collection.
    pub fn load_to_many(
        &self,
        owner: &EntityRef,
        node: &str,
        children: Vec<EntityRef>,
    ) -> Result<(), CoreError> {
        for child in &children {
            self.check_member(child)?;
        }
        owner.borrow_mut().to_many_mut(node)?.set_fetched(children);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------------

    /// Rebinds an abstract entity to the concrete type its fixed-value nodes
    /// select. Concrete entities are returned unchanged.
    pub fn downcast(&self, entity: &EntityRef) -> Result<Arc<EntityType>, CoreError> {
        self.check_member(entity)?;
        let entity_type = Arc::clone(entity.borrow().entity_type());
        if !entity_type.is_abstract() {
            return Ok(entity_type);
        }
        let concrete = {
            let e = entity.borrow();
            self.defs
                .downcast(&entity_type, |node| e.value(node).ok().flatten().cloned())?
        };
        let id = {
            let mut e = entity.borrow_mut();
            e.rebind(Arc::clone(&concrete));
            e.id()
        };
        self.entities.borrow_mut().retype(id, Arc::clone(&concrete));
        tracing::debug!(%id, from = entity_type.name(), to = concrete.name(), "downcast");
        Ok(concrete)
    }

    /// Stops tracking `entity`.
    pub fn remove(&self, entity: &EntityRef) -> bool {
        let id = entity.borrow().id();
        self.entities.borrow_mut().remove(id)
    }

    pub fn set_allow_garbage_collection(&self, allow: bool) {
        self.entities.borrow_mut().set_allow_garbage_collection(allow);
    }

    /// Sweeps collected entities out of the identity map.
    pub fn reconcile(&self) -> usize {
        self.entities.borrow_mut().reconcile()
    }

    /// Number of live tracked entities.
    pub fn len(&self) -> usize {
        self.entities.borrow_mut().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -----------------------------------------------------------------------
    // Copying between contexts
    // -----------------------------------------------------------------------

    /// Copies `other` from another context into this one: matched by id,
    /// else by key, else created. Values, state, key and resolved
    /// references are copied; nothing is aliased.
    pub fn import(&self, other: &EntityRef) -> Result<EntityRef, CoreError> {
        let mut visited = HashMap::new();
        self.import_inner(other, &mut visited)
    }

    fn import_inner(
        &self,
        other: &EntityRef,
        visited: &mut HashMap<EntityId, EntityRef>,
    ) -> Result<EntityRef, CoreError> {
        let (id, owner, type_name, key, state) = {
            let o = other.borrow();
            (o.id(), o.context_id(), o.type_name().to_string(), o.key(), o.state())
        };
        if owner == self.id {
            return Ok(Rc::clone(other));
        }
        if let Some(done) = visited.get(&id) {
            return Ok(Rc::clone(done));
        }
        let entity_type = self.defs.get(&type_name)?;

        let by_key = if key.is_null() {
            None
        } else {
            self.get_by_key(&type_name, &key)?
        };
        let local = match self.get_by_uuid(id).or(by_key) {
            Some(local) => local,
            None => self.track_copy(id, &entity_type, &key)?,
        };
        visited.insert(id, Rc::clone(&local));

        let local_type = Arc::clone(local.borrow().entity_type());
        if local_type.name() != entity_type.name() {
            if !self.defs.is_a(entity_type.name(), local_type.name()) {
                return Err(CoreError::TypeMismatch {
                    expected: local_type.name().to_string(),
                    found: type_name,
                });
            }
            let local_id = {
                let mut l = local.borrow_mut();
                l.rebind(Arc::clone(&entity_type));
                l.id()
            };
            self.entities
                .borrow_mut()
                .retype(local_id, Arc::clone(&entity_type));
        }

        if !key.is_null() && !local.borrow().has_key() {
            self.assign_key(&local, key.clone())?;
        }
        local.borrow_mut().copy_value_nodes_to_me(&other.borrow())?;

        for def in entity_type.nodes().filter(|d| d.is_ref()) {
            let (loaded, target, target_key) = {
                let o = other.borrow();
                let r = o.ref_node(&def.name)?;
                (r.is_loaded(), r.reference(), r.key().clone())
            };
            if !loaded {
                continue;
            }
            match target {
                Some(target) => {
                    let imported = self.import_inner(&target, visited)?;
                    self.bind_reference(&local, &def.name, &imported)?;
                }
                None => self.load_reference(&local, &def.name, target_key)?,
            }
        }

        for def in entity_type.nodes().filter(|d| d.is_to_many()) {
            let children = {
                let o = other.borrow();
                let many = o.to_many(&def.name)?;
                many.is_fetched().then(|| many.list().to_vec())
            };
            if let Some(children) = children {
                let imported = children
                    .iter()
                    .map(|child| self.import_inner(child, visited))
                    .collect::<Result<Vec<_>, _>>()?;
                self.load_to_many(&local, &def.name, imported)?;
            }
        }

        if state != EntityState::Loading {
            local.borrow_mut().set_state(state)?;
        }
        tracing::trace!(entity = %local.borrow().label(), from = %owner, "imported");
        Ok(local)
    }

    fn track_copy(
        &self,
        id: EntityId,
        entity_type: &Arc<EntityType>,
        key: &Value,
    ) -> Result<EntityRef, CoreError> {
        let mut entities = self.entities.borrow_mut();
        let sender = Some(entities.reclaim_sender());
        let entity = if key.is_null() {
            Entity::fresh(id, self.id, Arc::clone(entity_type), sender)
        } else {
            Entity::placeholder(id, self.id, Arc::clone(entity_type), key.clone(), sender)
        };
        let entity = Rc::new(RefCell::new(entity));
        entities.add(&entity, None)?;
        Ok(entity)
    }

    /// Binds a resolved target without recording a change.
    fn bind_reference(
        &self,
        entity: &EntityRef,
        node: &str,
        target: &EntityRef,
    ) -> Result<(), CoreError> {
        let (target_id, target_key) = {
            let t = target.borrow();
            (t.id(), t.key())
        };
        {
            let mut e = entity.borrow_mut();
            let r = e.ref_node_mut(node)?;
            r.load(target_key);
            r.resolve(Rc::clone(target));
        }
        self.entities
            .borrow_mut()
            .add_association(target_id, entity, node);
        Ok(())
    }
}

impl Drop for EntityContext {
    fn drop(&mut self) {
        // Forward references can still form cycles (rows pointing at each
        // other); break them so the entities of a dropped context are freed.
        let live = self.entities.get_mut().live();
        for entity in live {
            if let Ok(mut e) = entity.try_borrow_mut() {
                e.detach_relations();
            }
        }
    }
}

impl std::fmt::Debug for EntityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityContext")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntityTypeDef, NodeDefinition, RelationKind, SchemaSource};
    use crate::value::ColumnType;
    use std::cell::Cell;

    fn defs() -> Arc<DefinitionSet> {
        let source = SchemaSource::new()
            .entity(EntityTypeDef::new("Customer", "customer").key("id", "id", ColumnType::BigInt))
            .entity(
                EntityTypeDef::new("Order", "orders")
                    .key("id", "id", ColumnType::BigInt)
                    .value("note", "note", ColumnType::Varchar)
                    .reference("customer", "customer_id", "Customer", RelationKind::Refers)
                    .to_many("items", "LineItem", "order", RelationKind::Owns),
            )
            .entity(
                EntityTypeDef::new("LineItem", "line_item")
                    .key("id", "id", ColumnType::BigInt)
                    .reference("order", "order_id", "Order", RelationKind::Refers),
            )
            .entity(
                EntityTypeDef::new("Vehicle", "vehicle")
                    .abstract_type()
                    .key("id", "id", ColumnType::BigInt)
                    .value("kind", "kind", ColumnType::Varchar),
            )
            .entity(
                EntityTypeDef::subtype("Car", "Vehicle")
                    .node(
                        NodeDefinition::value("kind", "kind", ColumnType::Varchar)
                            .with_fixed_value("CAR"),
                    )
                    .value("doors", "doors", ColumnType::Integer),
            );
        Arc::new(DefinitionSet::new(source).unwrap())
    }

    /// Answers every fetch with a fixed note and counts calls.
    struct NoteFetcher {
        calls: Cell<usize>,
    }

    impl Fetcher for NoteFetcher {
        fn fetch_entity(&self, ctx: &EntityContext, entity: &EntityRef) -> Result<(), CoreError> {
            self.calls.set(self.calls.get() + 1);
            if entity.borrow().key() == Value::Int(404) {
                return Err(CoreError::EntityMissing {
                    entity_type: entity.borrow().type_name().to_string(),
                    key: Value::Int(404),
                });
            }
            ctx.load_value(entity, "note", Value::from("fetched"))?;
            ctx.load_reference(entity, "customer", Value::Int(1))
        }

        fn fetch_to_many(
            &self,
            ctx: &EntityContext,
            owner: &EntityRef,
            node: &str,
        ) -> Result<(), CoreError> {
            self.calls.set(self.calls.get() + 1);
            ctx.load_to_many(owner, node, Vec::new())
        }
    }

    #[test]
    fn new_entities_are_tracked_and_keyed_once() {
        let ctx = EntityContext::new(defs());
        let order = ctx.new_entity("Order").unwrap();
        assert_eq!(ctx.len(), 1);

        ctx.assign_key(&order, Value::Int(5)).unwrap();
        let found = ctx.get_by_key("Order", &Value::Int(5)).unwrap().unwrap();
        assert!(Rc::ptr_eq(&found, &order));

        ctx.assign_key(&order, Value::Int(5)).unwrap();
        assert!(matches!(
            ctx.assign_key(&order, Value::Int(6)),
            Err(CoreError::KeyImmutable { .. })
        ));
        assert!(ctx.new_entity("Vehicle").is_err());
    }

    #[test]
    fn get_or_create_returns_one_identity() {
        let ctx = EntityContext::new(defs());
        let a = ctx.get_or_create("Order", Value::Int(7)).unwrap();
        let b = ctx.get_or_create("Order", Value::Int(7)).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(a.borrow().state(), EntityState::NotLoaded);
        assert!(matches!(
            ctx.get_or_create("Customer", Value::Null),
            Err(CoreError::IllegalState { .. })
        ));
    }

    #[test]
    fn references_track_back_references() {
        let ctx = EntityContext::new(defs());
        let order = ctx.new_entity("Order").unwrap();
        let alice = ctx.get_or_create("Customer", Value::Int(1)).unwrap();
        let bob = ctx.get_or_create("Customer", Value::Int(2)).unwrap();

        ctx.set_reference(&order, "customer", Some(&alice)).unwrap();
        assert_eq!(ctx.referrers(&alice).len(), 1);

        ctx.set_reference(&order, "customer", Some(&bob)).unwrap();
        assert!(ctx.referrers(&alice).is_empty());
        let refs = ctx.referrers(&bob);
        assert_eq!(refs[0].1, "customer");
        assert!(Rc::ptr_eq(&refs[0].0, &order));

        let orphan = order.borrow().ref_node("customer").unwrap().orphan().is_none();
        assert!(orphan, "a new entity's null reference has no previous target");
    }

    #[test]
    fn reference_type_is_checked() {
        let ctx = EntityContext::new(defs());
        let order = ctx.new_entity("Order").unwrap();
        let item = ctx.new_entity("LineItem").unwrap();
        assert!(matches!(
            ctx.set_reference(&order, "customer", Some(&item)),
            Err(CoreError::TypeMismatch { .. })
        ));
        assert!(matches!(
            ctx.set_reference(&order, "note", None),
            Err(CoreError::NodeKindMismatch { .. })
        ));
    }

    #[test]
    fn assign_key_updates_referring_foreign_keys() {
        let ctx = EntityContext::new(defs());
        let order = ctx.new_entity("Order").unwrap();
        let customer = ctx.new_entity("Customer").unwrap();
        ctx.set_reference(&order, "customer", Some(&customer)).unwrap();
        assert_eq!(ctx.reference_key(&order, "customer").unwrap(), Value::Null);

        ctx.assign_key(&customer, Value::Int(9)).unwrap();
        assert_eq!(order.borrow().ref_node("customer").unwrap().key(), &Value::Int(9));
        assert_eq!(ctx.reference_key(&order, "customer").unwrap(), Value::Int(9));
    }

    #[test]
    fn to_many_links_foreign_reference() {
        let ctx = EntityContext::new(defs());
        let order = ctx.new_entity("Order").unwrap();
        let item = ctx.new_entity("LineItem").unwrap();
        assert!(ctx.add_to_many(&order, "items", &item).unwrap());
        let back = ctx.resolve_reference(&item, "order").unwrap().unwrap();
        assert!(Rc::ptr_eq(&back, &order));

        assert!(ctx.remove_from_many(&order, "items", &item).unwrap());
        assert!(item.borrow().ref_node("order").unwrap().reference().is_none());
        assert!(order.borrow().to_many("items").unwrap().is_empty());
    }

    #[test]
    fn check_fetched_loads_placeholders_only() {
        let ctx = EntityContext::new(defs());
        let fetcher = Rc::new(NoteFetcher { calls: Cell::new(0) });
        ctx.set_fetcher(fetcher.clone());

        let order = ctx.get_or_create("Order", Value::Int(7)).unwrap();
        assert!(ctx.check_fetched(&order).unwrap());
        assert_eq!(order.borrow().state(), EntityState::Loaded);
        assert_eq!(order.borrow().value("note").unwrap(), Some(&Value::from("fetched")));
        assert!(!ctx.check_fetched(&order).unwrap());

        let fresh = ctx.new_entity("Order").unwrap();
        assert!(!ctx.check_fetched(&fresh).unwrap());
        assert_eq!(fetcher.calls.get(), 1);

        let customer = ctx.resolve_reference(&order, "customer").unwrap().unwrap();
        assert_eq!(customer.borrow().key(), Value::Int(1));
    }

    #[test]
    fn failed_fetch_leaves_entity_unloaded() {
        let ctx = EntityContext::new(defs());
        ctx.set_fetcher(Rc::new(NoteFetcher { calls: Cell::new(0) }));
        let order = ctx.get_or_create("Order", Value::Int(404)).unwrap();
        let err = ctx.check_fetched(&order).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(order.borrow().state(), EntityState::NotLoaded);
    }

    #[test]
    fn lazy_loading_can_be_disabled() {
        let config = ContextConfig {
            lazy_loading: false,
            ..ContextConfig::default()
        };
        let ctx = EntityContext::with_config(defs(), config);
        let order = ctx.get_or_create("Order", Value::Int(7)).unwrap();
        assert!(!ctx.check_fetched(&order).unwrap());
        assert!(matches!(ctx.fetch(&order), Err(CoreError::Fetch { .. })));
    }

    #[test]
    fn config_defaults_from_empty_json() {
        let config: ContextConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ContextConfig::default());
        assert!(config.allow_garbage_collection);
    }

    #[test]
    fn downcast_rebinds_abstract_placeholder() {
        let ctx = EntityContext::new(defs());
        let vehicle = ctx.get_or_create("Vehicle", Value::Int(3)).unwrap();
        ctx.load_value(&vehicle, "kind", Value::from("CAR")).unwrap();
        let concrete = ctx.downcast(&vehicle).unwrap();
        assert_eq!(concrete.name(), "Car");
        assert_eq!(vehicle.borrow().type_name(), "Car");
        assert_eq!(vehicle.borrow().value("doors").unwrap(), None);
        let again = ctx.get_by_key("Car", &Value::Int(3)).unwrap().unwrap();
        assert!(Rc::ptr_eq(&again, &vehicle));
    }

    #[test]
    fn foreign_entities_are_rejected() {
        let defs = defs();
        let a = EntityContext::new(Arc::clone(&defs));
        let b = EntityContext::new(defs);
        let order = a.new_entity("Order").unwrap();
        let customer = b.new_entity("Customer").unwrap();
        assert!(matches!(
            a.set_reference(&order, "customer", Some(&customer)),
            Err(CoreError::ForeignEntity { .. })
        ));
    }

    #[test]
    fn import_copies_without_aliasing() {
        let defs = defs();
        let source = EntityContext::new(Arc::clone(&defs));
        let target = EntityContext::new(defs);

        let customer = source.get_or_create("Customer", Value::Int(1)).unwrap();
        let order = source.get_or_create("Order", Value::Int(7)).unwrap();
        source.load_value(&order, "note", Value::from("hi")).unwrap();
        source.set_reference(&order, "customer", Some(&customer)).unwrap();
        order.borrow_mut().set_state(EntityState::Loaded).unwrap();

        let copy = target.import(&order).unwrap();
        assert!(!Rc::ptr_eq(&copy, &order));
        let c = copy.borrow();
        assert_eq!(c.id(), order.borrow().id());
        assert_eq!(c.context_id(), target.id());
        assert_eq!(c.key(), Value::Int(7));
        assert_eq!(c.state(), EntityState::Loaded);
        assert_eq!(c.value("note").unwrap(), Some(&Value::from("hi")));
        let local_customer = c.ref_node("customer").unwrap().reference().unwrap();
        assert_eq!(local_customer.borrow().context_id(), target.id());
        drop(c);

        let again = target.import(&order).unwrap();
        assert!(Rc::ptr_eq(&again, &copy));
    }

    #[test]
    fn linked_owner_and_child_are_collected() {
        let ctx = EntityContext::new(defs());
        let order = ctx.new_entity("Order").unwrap();
        let item = ctx.new_entity("LineItem").unwrap();
        ctx.add_to_many(&order, "items", &item).unwrap();
        let order_id = order.borrow().id();
        let item_id = item.borrow().id();

        // The collection keeps its members alive.
        drop(item);
        assert!(ctx.get_by_uuid(item_id).is_some());

        drop(order);
        ctx.reconcile();
        assert!(ctx.get_by_uuid(order_id).is_none());
        assert!(ctx.get_by_uuid(item_id).is_none());
        assert!(ctx.is_empty());
    }

    #[test]
    fn collected_owner_resolves_again_by_key() {
        let ctx = EntityContext::new(defs());
        let order = ctx.new_entity("Order").unwrap();
        let item = ctx.new_entity("LineItem").unwrap();
        ctx.add_to_many(&order, "items", &item).unwrap();
        ctx.assign_key(&order, Value::Int(7)).unwrap();
        let order_id = order.borrow().id();
        drop(order);

        assert!(ctx.get_by_uuid(order_id).is_none());
        assert_eq!(ctx.reference_key(&item, "order").unwrap(), Value::Int(7));
        let placeholder = ctx.resolve_reference(&item, "order").unwrap().unwrap();
        assert_eq!(placeholder.borrow().key(), Value::Int(7));
        assert_eq!(placeholder.borrow().state(), EntityState::NotLoaded);
    }

    #[test]
    fn dropped_handles_leave_the_identity_map() {
        let ctx = EntityContext::new(defs());
        let order = ctx.get_or_create("Order", Value::Int(7)).unwrap();
        let id = order.borrow().id();
        drop(order);
        assert!(ctx.get_by_uuid(id).is_none());
        assert!(ctx.get_by_key("Order", &Value::Int(7)).unwrap().is_none());
        assert!(ctx.is_empty());
    }
}
