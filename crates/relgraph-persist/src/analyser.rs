//! Persistence analysis.
//!
//! [`PersistAnalyser`] walks the entity graph reachable from a
//! [`PersistRequest`] and classifies every entity into one of four groups:
//!
//! - **create**: entities without a key, plus new entities they reach;
//! - **update**: keyed entities being saved, plus owned entities they reach;
//! - **delete**: entities being deleted, plus everything they own;
//! - **depends-on**: loaded entities a write relies on, checked for freshness.
//!
//! Only OWNS relations cascade updates and deletes. Unfetched collections are
//! never walked as if empty: saves skip them, deletes fetch them. Deletes
//! load what they cascade through whether or not the context loads lazily.
//!
//! Requesting an entity that an earlier request already classified, directly
//! or by cascade, replays the whole request list with the new request last,
//! so nothing keeps a stale classification. A delete reaching an entity that
//! is already scheduled for update takes it over.
//!
//! Finalization orders the create group so every row follows the rows it
//! references, and the delete group in the opposite direction. With
//! deadlock avoidance on, ties are broken by table DDL rank so concurrent
//! writers touch tables in one global order.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use relgraph_core::{
    table_ranks, EntityContext, EntityId, EntityRef, EntityState, RelationKind, Value,
};
use relgraph_deps::{sort, DependencyRules};
use serde::{Deserialize, Serialize};

use crate::error::PersistError;
use crate::group::{OperationGroup, OperationKind};
use crate::plan::{PersistPlan, PersistRequest};

/// Analyser settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyserConfig {
    /// Stably sort independent operations by table rank.
    pub deadlock_avoidance: bool,
}

impl Default for AnalyserConfig {
    fn default() -> Self {
        AnalyserConfig {
            deadlock_avoidance: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Node snapshots
// ---------------------------------------------------------------------------

// Snapshots are taken before recursing so no entity borrow is held across a
// classification or a fetch.

struct RefSnapshot {
    node: String,
    target_type: String,
    relation: RelationKind,
    target: Option<EntityRef>,
    key: Value,
    changed: bool,
    orphan: Option<EntityRef>,
    previous_key: Option<Value>,
}

struct ManySnapshot {
    node: String,
    relation: RelationKind,
    fetched: bool,
    list: Vec<EntityRef>,
    removed: Vec<EntityRef>,
}

fn ref_snapshots(entity: &EntityRef) -> Vec<RefSnapshot> {
    let e = entity.borrow();
    e.entity_type()
        .nodes()
        .filter(|def| def.is_ref())
        .filter_map(|def| {
            let node = e.ref_node(&def.name).ok()?;
            Some(RefSnapshot {
                node: def.name.clone(),
                target_type: def.target().unwrap_or_default().to_string(),
                relation: def.relation_kind(),
                target: node.reference(),
                key: node.key().clone(),
                changed: node.is_changed(),
                orphan: node.orphan(),
                previous_key: node.previous_key().cloned(),
            })
        })
        .collect()
}

fn many_snapshot(entity: &EntityRef, name: &str) -> Option<ManySnapshot> {
    let e = entity.borrow();
    let def = e.entity_type().node(name)?;
    let node = e.to_many(name).ok()?;
    Some(ManySnapshot {
        node: def.name.clone(),
        relation: def.relation_kind(),
        fetched: node.is_fetched(),
        list: node.list().to_vec(),
        removed: node.removed().to_vec(),
    })
}

fn many_snapshots(entity: &EntityRef) -> Vec<ManySnapshot> {
    let names: Vec<String> = entity
        .borrow()
        .entity_type()
        .nodes()
        .filter(|def| def.is_to_many())
        .map(|def| def.name.clone())
        .collect();
    names
        .iter()
        .filter_map(|name| many_snapshot(entity, name))
        .collect()
}

fn has_key(entity: &EntityRef) -> bool {
    entity.borrow().has_key()
}

fn is_loaded(entity: &EntityRef) -> bool {
    entity.borrow().state() == EntityState::Loaded
}

fn id_of(entity: &EntityRef) -> EntityId {
    entity.borrow().id()
}

// ---------------------------------------------------------------------------
// Analyser
// ---------------------------------------------------------------------------

/// A top-level request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    Save,
    Delete,
}

/// Classifies a request into ordered operation groups. One analyser runs
/// one pass; [`analyse`](Self::analyse) consumes it.
pub struct PersistAnalyser<'ctx> {
    ctx: &'ctx EntityContext,
    config: AnalyserConfig,
    create: OperationGroup,
    update: OperationGroup,
    delete: OperationGroup,
    depends_on: OperationGroup,
    analysing: HashSet<EntityId>,
    roots: Vec<(Root, EntityRef)>,
    loaded_during_analysis: IndexMap<EntityId, EntityRef>,
}

impl<'ctx> PersistAnalyser<'ctx> {
    pub fn new(ctx: &'ctx EntityContext) -> Self {
        Self::with_config(ctx, AnalyserConfig::default())
    }

    pub fn with_config(ctx: &'ctx EntityContext, config: AnalyserConfig) -> Self {
        PersistAnalyser {
            ctx,
            config,
            create: OperationGroup::new(OperationKind::Create),
            update: OperationGroup::new(OperationKind::Update),
            delete: OperationGroup::new(OperationKind::Delete),
            depends_on: OperationGroup::new(OperationKind::DependsOn),
            analysing: HashSet::new(),
            roots: Vec::new(),
            loaded_during_analysis: IndexMap::new(),
        }
    }

    /// Classifies every entity of `request` and returns the ordered plan.
    /// On error nothing is returned.
    pub fn analyse(mut self, request: &PersistRequest) -> Result<PersistPlan, PersistError> {
        tracing::debug!(
            context = %self.ctx.id(),
            saves = request.saves().len(),
            deletes = request.deletes().len(),
            "analysing persist request"
        );
        for entity in request.saves() {
            self.save(entity)?;
        }
        for entity in request.deletes() {
            self.delete(entity)?;
        }
        self.finish()
    }

    /// Classifies `entity` for saving. An entity classified earlier in this
    /// pass is re-classified along with everything it cascades into.
    pub fn save(&mut self, entity: &EntityRef) -> Result<(), PersistError> {
        self.request(Root::Save, entity)
    }

    /// Classifies `entity` for deletion. An entity classified earlier in
    /// this pass is re-classified along with everything it cascades into.
    pub fn delete(&mut self, entity: &EntityRef) -> Result<(), PersistError> {
        self.request(Root::Delete, entity)
    }

    fn request(&mut self, root: Root, entity: &EntityRef) -> Result<(), PersistError> {
        self.check_member(entity)?;
        let id = id_of(entity);
        let seen = self.analysing.contains(&id);
        self.roots.retain(|(_, e)| id_of(e) != id);
        self.roots.push((root, entity.clone()));
        if seen {
            tracing::debug!(
                entity = %entity.borrow().label(),
                requests = self.roots.len(),
                "re-classifying, replaying requests"
            );
            self.replay()
        } else {
            self.classify_root(root, entity)
        }
    }

    /// Clears every group and classifies the recorded requests again.
    /// Entities fetched so far stay loaded.
    fn replay(&mut self) -> Result<(), PersistError> {
        for kind in [
            OperationKind::Create,
            OperationKind::Update,
            OperationKind::Delete,
            OperationKind::DependsOn,
        ] {
            *self.group_mut(kind) = OperationGroup::new(kind);
        }
        self.analysing.clear();
        let roots = self.roots.clone();
        for (root, entity) in &roots {
            self.classify_root(*root, entity)?;
        }
        Ok(())
    }

    fn classify_root(&mut self, root: Root, entity: &EntityRef) -> Result<(), PersistError> {
        self.unschedule(id_of(entity));
        match root {
            Root::Save => self.save_entity(entity),
            Root::Delete => self.delete_entity(entity),
        }
    }

    /// Orders the groups and hands them over.
    pub fn finish(self) -> Result<PersistPlan, PersistError> {
        let ranks = if self.config.deadlock_avoidance {
            match table_ranks(self.ctx.definitions()) {
                Ok(ranks) => Some(ranks),
                Err(err) => {
                    tracing::debug!(%err, "table ranks unavailable, keeping dependency order");
                    None
                }
            }
        } else {
            None
        };

        let PersistAnalyser {
            ctx,
            create,
            mut update,
            delete,
            depends_on,
            loaded_during_analysis,
            ..
        } = self;

        let create = order_group(ctx, create, ranks.as_ref(), false)?;
        let delete = order_group(ctx, delete, ranks.as_ref(), true)?;
        if let Some(ranks) = &ranks {
            let mut order: Vec<EntityRef> = update.iter().cloned().collect();
            order.sort_by_key(|e| rank(ranks, e));
            update.reorder(order)?;
        }

        let plan = PersistPlan {
            create,
            update,
            delete,
            depends_on,
            loaded_during_analysis: loaded_during_analysis.into_values().collect(),
        };
        tracing::debug!(%plan, "analysis complete");
        Ok(plan)
    }

    fn check_member(&self, entity: &EntityRef) -> Result<(), PersistError> {
        let e = entity.borrow();
        if e.context_id() == self.ctx.id() {
            return Ok(());
        }
        Err(PersistError::illegal(format!(
            "{} belongs to {}, but the analysis runs in {}",
            e.label(),
            e.context_id(),
            self.ctx.id()
        )))
    }

    /// Marks `entity` as under analysis. False if it already is.
    fn enter(&mut self, entity: &EntityRef) -> Result<bool, PersistError> {
        self.check_member(entity)?;
        Ok(self.analysing.insert(id_of(entity)))
    }

    fn group_mut(&mut self, kind: OperationKind) -> &mut OperationGroup {
        match kind {
            OperationKind::Create => &mut self.create,
            OperationKind::Update => &mut self.update,
            OperationKind::Delete => &mut self.delete,
            OperationKind::DependsOn => &mut self.depends_on,
        }
    }

    fn schedule(&mut self, kind: OperationKind, entity: &EntityRef) {
        self.depends_on.remove(id_of(entity));
        self.group_mut(kind).push(entity);
        tracing::trace!(entity = %entity.borrow().label(), %kind, "scheduled");
    }

    fn unschedule(&mut self, id: EntityId) {
        self.create.remove(id);
        self.update.remove(id);
        self.delete.remove(id);
        self.depends_on.remove(id);
        self.analysing.remove(&id);
    }

    fn is_scheduled_for_write(&self, id: EntityId) -> bool {
        self.create.contains(id) || self.update.contains(id) || self.delete.contains(id)
    }

    /// Loads a keyed NOTLOADED entity. Runs regardless of the context's
    /// lazy-loading setting.
    fn fetch_if_needed(&mut self, entity: &EntityRef) -> Result<(), PersistError> {
        let (state, keyed) = {
            let e = entity.borrow();
            (e.state(), e.has_key())
        };
        if state != EntityState::NotLoaded || !keyed {
            return Ok(());
        }
        self.ctx.fetch(entity)?;
        tracing::debug!(entity = %entity.borrow().label(), "fetched during analysis");
        self.loaded_during_analysis
            .insert(id_of(entity), entity.clone());
        Ok(())
    }

    /// The live target of a reference: the bound entity, or a tracked one
    /// with the stored key. Never creates placeholders.
    fn live_target(&self, r: &RefSnapshot) -> Result<Option<EntityRef>, PersistError> {
        if let Some(target) = &r.target {
            return Ok(Some(target.clone()));
        }
        if r.key.is_null() {
            return Ok(None);
        }
        Ok(self.ctx.get_by_key(&r.target_type, &r.key)?)
    }

    /// The previous target a changed reference moved away from.
    fn orphan_target(&self, r: &RefSnapshot) -> Result<Option<EntityRef>, PersistError> {
        if !r.changed {
            return Ok(None);
        }
        if let Some(orphan) = &r.orphan {
            return Ok(Some(orphan.clone()));
        }
        match &r.previous_key {
            Some(key) if !key.is_null() => {
                Ok(Some(self.ctx.get_or_create(&r.target_type, key.clone())?))
            }
            _ => Ok(None),
        }
    }

    fn save_entity(&mut self, entity: &EntityRef) -> Result<(), PersistError> {
        self.check_member(entity)?;
        if entity.borrow().state() == EntityState::Deleted {
            return Err(PersistError::illegal(format!(
                "cannot save deleted {}",
                entity.borrow().label()
            )));
        }
        if has_key(entity) {
            self.update_entity(entity)
        } else {
            self.create_entity(entity)
        }
    }

    fn create_entity(&mut self, entity: &EntityRef) -> Result<(), PersistError> {
        if !self.enter(entity)? {
            return Ok(());
        }
        tracing::trace!(entity = %entity.borrow().label(), "analysing create");

        for r in ref_snapshots(entity) {
            let Some(target) = self.live_target(&r)? else {
                continue;
            };
            if !has_key(&target) {
                self.save_entity(&target)?;
            } else if r.relation == RelationKind::Depends && is_loaded(&target) {
                self.depends_on_entity(&target)?;
            }
        }

        self.schedule(OperationKind::Create, entity);

        for many in many_snapshots(entity) {
            if !many.fetched {
                continue;
            }
            for child in &many.list {
                if !has_key(child) {
                    self.save_entity(child)?;
                } else if many.relation == RelationKind::Owns && is_loaded(child) {
                    self.update_entity(child)?;
                }
            }
        }
        Ok(())
    }

    fn update_entity(&mut self, entity: &EntityRef) -> Result<(), PersistError> {
        if !self.enter(entity)? {
            return Ok(());
        }
        tracing::trace!(entity = %entity.borrow().label(), "analysing update");

        for r in ref_snapshots(entity) {
            if let Some(target) = self.live_target(&r)? {
                if !has_key(&target) {
                    self.save_entity(&target)?;
                } else if is_loaded(&target) {
                    match r.relation {
                        RelationKind::Owns => self.update_entity(&target)?,
                        RelationKind::Depends => self.depends_on_entity(&target)?,
                        RelationKind::Refers => {}
                    }
                }
            }
            if r.relation == RelationKind::Owns {
                if let Some(orphan) = self.orphan_target(&r)? {
                    if has_key(&orphan) {
                        tracing::debug!(
                            orphan = %orphan.borrow().label(),
                            node = %r.node,
                            "deleting orphaned owned reference"
                        );
                        self.delete_entity(&orphan)?;
                    }
                }
            }
        }

        self.schedule(OperationKind::Update, entity);

        for many in many_snapshots(entity) {
            if !many.fetched {
                tracing::trace!(node = %many.node, "skipping unfetched collection");
                continue;
            }
            for child in &many.list {
                if !has_key(child) {
                    self.save_entity(child)?;
                } else if many.relation == RelationKind::Owns && is_loaded(child) {
                    self.update_entity(child)?;
                }
            }
            for child in &many.removed {
                if !has_key(child) {
                    continue;
                }
                if many.relation == RelationKind::Owns {
                    self.delete_entity(child)?;
                } else if is_loaded(child) {
                    // The unlinked child carries a nulled foreign key.
                    self.update_entity(child)?;
                }
            }
        }
        Ok(())
    }

    fn delete_entity(&mut self, entity: &EntityRef) -> Result<(), PersistError> {
        self.check_member(entity)?;
        if !has_key(entity) {
            tracing::debug!(entity = %entity.borrow().label(), "delete of unsaved entity ignored");
            return Ok(());
        }
        if !self.enter(entity)? {
            let id = id_of(entity);
            if !self.update.contains(id) {
                return Ok(());
            }
            tracing::debug!(entity = %entity.borrow().label(), "delete replaces update");
            self.update.remove(id);
        }
        tracing::trace!(entity = %entity.borrow().label(), "analysing delete");
        self.fetch_if_needed(entity)?;

        let owned = many_snapshots(entity)
            .into_iter()
            .filter(|many| many.relation == RelationKind::Owns);
        for many in owned {
            let many = if many.fetched {
                many
            } else {
                self.ctx.fetch_to_many(entity, &many.node)?;
                let fetched = many_snapshot(entity, &many.node).unwrap_or(many);
                for child in &fetched.list {
                    self.loaded_during_analysis
                        .entry(id_of(child))
                        .or_insert_with(|| child.clone());
                }
                fetched
            };
            for child in many.list.iter().chain(many.removed.iter()) {
                if has_key(child) {
                    self.delete_entity(child)?;
                }
            }
        }

        self.schedule(OperationKind::Delete, entity);

        let owned = ref_snapshots(entity)
            .into_iter()
            .filter(|r| r.relation == RelationKind::Owns);
        for r in owned {
            if let Some(target) = self.ctx.resolve_reference(entity, &r.node)? {
                if has_key(&target) {
                    self.delete_entity(&target)?;
                }
            }
            if let Some(orphan) = self.orphan_target(&r)? {
                if has_key(&orphan) {
                    self.delete_entity(&orphan)?;
                }
            }
        }
        Ok(())
    }

    fn depends_on_entity(&mut self, entity: &EntityRef) -> Result<(), PersistError> {
        self.check_member(entity)?;
        let id = id_of(entity);
        if self.is_scheduled_for_write(id) || self.depends_on.contains(id) {
            return Ok(());
        }
        if !has_key(entity) || !is_loaded(entity) {
            return Ok(());
        }
        self.depends_on.push(entity);
        tracing::trace!(entity = %entity.borrow().label(), "depends on");

        for r in ref_snapshots(entity) {
            if let Some(target) = self.live_target(&r)? {
                if is_loaded(&target) {
                    self.depends_on_entity(&target)?;
                }
            }
        }
        for many in many_snapshots(entity) {
            let walked = matches!(many.relation, RelationKind::Depends | RelationKind::Owns);
            if !walked || !many.fetched {
                continue;
            }
            for child in &many.list {
                if is_loaded(child) {
                    self.depends_on_entity(child)?;
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Group ordering
// ---------------------------------------------------------------------------

/// Orders the members of one group by the references between them.
struct GroupRules<'a> {
    ctx: &'a EntityContext,
    members: HashSet<EntityId>,
    include_previous: bool,
}

impl DependencyRules for GroupRules<'_> {
    type Item = EntityRef;
    type Key = EntityId;
    type Error = PersistError;

    fn key(&self, item: &EntityRef) -> EntityId {
        id_of(item)
    }

    fn dependencies_of(&mut self, item: &EntityRef) -> Result<Vec<EntityRef>, PersistError> {
        let mut deps = Vec::new();
        for r in ref_snapshots(item) {
            let mut candidates = Vec::new();
            match &r.target {
                Some(target) => candidates.push(target.clone()),
                None if !r.key.is_null() => {
                    candidates.extend(self.ctx.get_by_key(&r.target_type, &r.key)?);
                }
                None => {}
            }
            if self.include_previous {
                match (&r.orphan, &r.previous_key) {
                    (Some(orphan), _) => candidates.push(orphan.clone()),
                    (None, Some(key)) if !key.is_null() => {
                        candidates.extend(self.ctx.get_by_key(&r.target_type, key)?);
                    }
                    _ => {}
                }
            }
            deps.extend(
                candidates
                    .into_iter()
                    .filter(|c| self.members.contains(&id_of(c))),
            );
        }
        Ok(deps)
    }
}

fn rank(ranks: &HashMap<String, usize>, entity: &EntityRef) -> usize {
    ranks
        .get(entity.borrow().entity_type().table())
        .copied()
        .unwrap_or(usize::MAX)
}

/// Sorts a group so every entity follows the members it references, then
/// optionally reverses it (delete order).
fn order_group(
    ctx: &EntityContext,
    mut group: OperationGroup,
    ranks: Option<&HashMap<String, usize>>,
    reverse: bool,
) -> Result<OperationGroup, PersistError> {
    let rules = GroupRules {
        ctx,
        members: group.ids().collect(),
        include_previous: reverse,
    };
    let mut order = sort(rules, group.iter().cloned())?;
    if let Some(ranks) = ranks {
        order = order.map_layers(|layer| layer.sort_by_key(|e| rank(ranks, e)));
    }
    if reverse {
        order = order.reversed();
    }
    group.reorder(order.into_vec())?;
    Ok(group)
}
