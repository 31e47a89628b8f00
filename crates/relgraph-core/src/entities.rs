//! The identity map of one context.
//!
//! [`Entities`] guarantees at most one live entity per synthetic id and per
//! (table, primary key). It holds only weak handles, so entities stay
//! collectible. Dropped entities announce themselves on the reclaim channel
//! and are swept out of every index by [`Entities::reconcile`], which runs at
//! the start of every public operation.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use smallvec::SmallVec;

use crate::entity::{EntityRef, WeakEntityRef};
use crate::error::CoreError;
use crate::id::{ContextId, EntityId};
use crate::schema::EntityType;
use crate::value::Value;

/// A back-reference: `referrer` points at the tracked entity through `node`.
#[derive(Debug, Clone)]
pub struct Association {
    pub referrer: WeakEntityRef,
    pub node: String,
}

/// Identity-map entry for one entity.
#[derive(Debug)]
pub struct EntityInfo {
    entity_type: Arc<EntityType>,
    id: EntityId,
    key: Option<Value>,
    source_query: Option<String>,
    handle: WeakEntityRef,
    pinned: Option<EntityRef>,
    associations: SmallVec<[Association; 4]>,
}

impl EntityInfo {
    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.entity_type
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn key(&self) -> Option<&Value> {
        self.key.as_ref()
    }

    /// Label of the query that loaded the entity, if any.
    pub fn source_query(&self) -> Option<&str> {
        self.source_query.as_deref()
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }

    /// The entity, if it is still alive.
    pub fn entity(&self) -> Option<EntityRef> {
        self.handle.upgrade()
    }
}

type KeyIndex = (String, Value);

/// Weak identity map. See the module docs.
#[derive(Debug)]
pub struct Entities {
    context: ContextId,
    by_id: IndexMap<EntityId, EntityInfo>,
    by_key: HashMap<KeyIndex, EntityId>,
    by_type: HashMap<String, IndexSet<EntityId>>,
    reclaim_tx: Sender<EntityId>,
    reclaim_rx: Receiver<EntityId>,
    allow_gc: bool,
}

impl Entities {
    pub fn new(context: ContextId, allow_garbage_collection: bool) -> Self {
        let (reclaim_tx, reclaim_rx) = channel();
        Entities {
            context,
            by_id: IndexMap::new(),
            by_key: HashMap::new(),
            by_type: HashMap::new(),
            reclaim_tx,
            reclaim_rx,
            allow_gc: allow_garbage_collection,
        }
    }

    /// Sender new entities use to announce their drop.
    pub fn reclaim_sender(&self) -> Sender<EntityId> {
        self.reclaim_tx.clone()
    }

    /// Drains the reclaim queue, removing collected entities from every
    /// index. Returns the number of entries removed. Never fails.
    pub fn reconcile(&mut self) -> usize {
        let mut removed = 0;
        while let Ok(id) = self.reclaim_rx.try_recv() {
            let Some(info) = self.by_id.get(&id) else {
                tracing::trace!(%id, "reclaimed entity was no longer tracked");
                continue;
            };
            if info.handle.strong_count() > 0 {
                // A copy with the same id was registered after the drop.
                continue;
            }
            if let Some(info) = self.by_id.shift_remove(&id) {
                self.unindex(&info);
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(context = %self.context, removed, "reconciled collected entities");
        }
        removed
    }

    fn unindex(&mut self, info: &EntityInfo) {
        if let Some(ids) = self.by_type.get_mut(info.entity_type.name()) {
            ids.shift_remove(&info.id);
        }
        if let Some(key) = &info.key {
            let index = (info.entity_type.table().to_string(), key.clone());
            match self.by_key.get(&index) {
                Some(owner) if *owner == info.id => {
                    self.by_key.remove(&index);
                }
                _ => tracing::debug!(
                    id = %info.id,
                    entity_type = info.entity_type.name(),
                    %key,
                    "key index out of sync with id index"
                ),
            }
        }
    }

    /// Starts tracking `entity`. Returns false if it is already tracked, or
    /// if another live entity already holds its (table, key).
    pub fn add(
        &mut self,
        entity: &EntityRef,
        source_query: Option<&str>,
    ) -> Result<bool, CoreError> {
        self.reconcile();
        let e = entity.borrow();
        if e.context_id() != self.context {
            return Err(CoreError::ForeignEntity {
                id: e.id(),
                owner: e.context_id(),
                context: self.context,
            });
        }
        if self.by_id.contains_key(&e.id()) {
            return Ok(false);
        }
        let key = e.key().non_null();
        if let Some(key) = &key {
            let index = (e.entity_type().table().to_string(), key.clone());
            if self.by_key.contains_key(&index) {
                return Ok(false);
            }
            self.by_key.insert(index, e.id());
        }
        self.by_type
            .entry(e.type_name().to_string())
            .or_default()
            .insert(e.id());
        let info = EntityInfo {
            entity_type: Arc::clone(e.entity_type()),
            id: e.id(),
            key,
            source_query: source_query.map(str::to_string),
            handle: Rc::downgrade(entity),
            pinned: (!self.allow_gc).then(|| Rc::clone(entity)),
            associations: SmallVec::new(),
        };
        tracing::trace!(entity = %e.label(), pinned = info.pinned.is_some(), "tracking entity");
        self.by_id.insert(e.id(), info);
        Ok(true)
    }

    /// Stops tracking `id`. Returns false if it was not tracked.
    pub fn remove(&mut self, id: EntityId) -> bool {
        self.reconcile();
        match self.by_id.shift_remove(&id) {
            Some(info) => {
                self.unindex(&info);
                true
            }
            None => false,
        }
    }

    pub fn get_by_uuid(&mut self, id: EntityId) -> Option<EntityRef> {
        self.reconcile();
        self.by_id.get(&id).and_then(EntityInfo::entity)
    }

    /// Like [`get_by_uuid`](Self::get_by_uuid), failing on a miss.
    pub fn require_by_uuid(&mut self, id: EntityId) -> Result<EntityRef, CoreError> {
        self.get_by_uuid(id).ok_or(CoreError::EntityNotFound {
            context: self.context,
            id,
        })
    }

    pub fn get_by_key(&mut self, table: &str, key: &Value) -> Option<EntityRef> {
        self.reconcile();
        let id = self.by_key.get(&(table.to_string(), key.clone()))?;
        self.by_id.get(id).and_then(EntityInfo::entity)
    }

    pub fn info(&mut self, id: EntityId) -> Option<&EntityInfo> {
        self.reconcile();
        self.by_id.get(&id)
    }

    /// Records the key of `id`. Only a null key may become non-null.
    pub fn key_changed(
        &mut self,
        id: EntityId,
        previous: &Value,
        new_key: &Value,
    ) -> Result<(), CoreError> {
        self.reconcile();
        let context = self.context;
        let info = self
            .by_id
            .get_mut(&id)
            .ok_or(CoreError::EntityNotFound { context, id })?;
        if !previous.is_null() || info.key.is_some() {
            return Err(CoreError::KeyImmutable {
                entity_type: info.entity_type.name().to_string(),
                previous: info.key.clone().unwrap_or_else(|| previous.clone()),
                attempted: new_key.clone(),
            });
        }
        if new_key.is_null() {
            return Err(CoreError::illegal_state(format!(
                "cannot assign a null key to {}",
                info.entity_type.name()
            )));
        }
        let index = (info.entity_type.table().to_string(), new_key.clone());
        if let Some(holder) = self.by_key.get(&index) {
            if *holder != id {
                return Err(CoreError::illegal_state(format!(
                    "key {} of table '{}' is already held by entity {}",
                    new_key, index.0, holder
                )));
            }
        }
        info.key = Some(new_key.clone());
        self.by_key.insert(index, id);
        Ok(())
    }

    /// Live entities of exactly type `name`, in insertion order.
    pub fn of_type(&mut self, name: &str) -> Vec<EntityRef> {
        self.reconcile();
        let Some(ids) = self.by_type.get(name) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.by_id.get(id))
            .filter_map(EntityInfo::entity)
            .collect()
    }

    /// All live tracked entities, in insertion order.
    pub fn live(&mut self) -> Vec<EntityRef> {
        self.reconcile();
        self.by_id.values().filter_map(EntityInfo::entity).collect()
    }

    /// Moves an entity to a new type index after a downcast.
    pub fn retype(&mut self, id: EntityId, entity_type: Arc<EntityType>) {
        self.reconcile();
        let Some(info) = self.by_id.get_mut(&id) else { return };
        if let Some(ids) = self.by_type.get_mut(info.entity_type.name()) {
            ids.shift_remove(&id);
        }
        self.by_type
            .entry(entity_type.name().to_string())
            .or_default()
            .insert(id);
        info.entity_type = entity_type;
    }

    pub fn len(&mut self) -> usize {
        self.reconcile();
        self.by_id.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    pub fn allow_garbage_collection(&self) -> bool {
        self.allow_gc
    }

    /// `false` pins every tracked entity (and every entity added later);
    /// `true` releases the pins. Index entries stay either way.
    pub fn set_allow_garbage_collection(&mut self, allow: bool) {
        self.reconcile();
        self.allow_gc = allow;
        let mut released = Vec::new();
        for info in self.by_id.values_mut() {
            if allow {
                if let Some(pin) = info.pinned.take() {
                    released.push(pin);
                }
            } else if info.pinned.is_none() {
                info.pinned = info.handle.upgrade();
            }
        }
        tracing::debug!(
            context = %self.context,
            allow,
            released = released.len(),
            "garbage collection toggled"
        );
        // Dropping the pins may queue reclaims for the next operation.
        drop(released);
    }

    /// Records that `referrer` points at `target` through `node`.
    pub fn add_association(&mut self, target: EntityId, referrer: &EntityRef, node: &str) {
        self.reconcile();
        let Some(info) = self.by_id.get_mut(&target) else { return };
        let weak = Rc::downgrade(referrer);
        let exists = info
            .associations
            .iter()
            .any(|a| a.node == node && a.referrer.ptr_eq(&weak));
        if !exists {
            info.associations.push(Association {
                referrer: weak,
                node: node.to_string(),
            });
        }
    }

    pub fn remove_association(&mut self, target: EntityId, referrer: &EntityRef, node: &str) {
        self.reconcile();
        let Some(info) = self.by_id.get_mut(&target) else { return };
        let weak = Rc::downgrade(referrer);
        info.associations
            .retain(|a| !(a.node == node && a.referrer.ptr_eq(&weak)));
    }

    /// Live entities pointing at `target`, with the node they point through.
    /// Dead referrers are pruned.
    pub fn referrers(&mut self, target: EntityId) -> Vec<(EntityRef, String)> {
        self.reconcile();
        let Some(info) = self.by_id.get_mut(&target) else {
            return Vec::new();
        };
        info.associations.retain(|a| a.referrer.strong_count() > 0);
        info.associations
            .iter()
            .filter_map(|a| a.referrer.upgrade().map(|r| (r, a.node.clone())))
            .collect()
    }
}
