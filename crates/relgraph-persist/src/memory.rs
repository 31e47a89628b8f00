//! In-memory row store.
//!
//! [`MemoryDatabase`] keeps one map of rows per table and serves as the
//! [`Fetcher`] for an [`EntityContext`]. [`MemoryDatabase::apply`] executes a
//! [`PersistPlan`] against it with the constraints a relational store would
//! enforce: primary keys, NOT NULL, foreign-key existence on write and on
//! delete, and optimistic-lock versions.
//!
//! Application is all-or-nothing. Every operation runs against a working copy
//! of the tables; the copy replaces the stored tables only when the whole plan
//! succeeded, and only then are keys, versions and states written back to the
//! entities.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use relgraph_core::{
    ColumnType, CoreError, DefinitionSet, Entity, EntityContext, EntityId, EntityRef, EntityState,
    EntityType, Fetcher, NodeDefinition, Value,
};
use serde::Serialize;

use crate::error::PersistError;
use crate::plan::PersistPlan;

/// Column values of one row, by column name.
pub type Row = IndexMap<String, Value>;

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: HashMap<String, IndexMap<Value, Row>>,
}

impl Tables {
    fn get(&self, table: &str, key: &Value) -> Option<&Row> {
        self.rows.get(table).and_then(|rows| rows.get(key))
    }

    fn contains(&self, table: &str, key: &Value) -> bool {
        self.get(table, key).is_some()
    }

    fn insert(&mut self, table: &str, key: Value, row: Row) {
        self.rows
            .entry(table.to_string())
            .or_default()
            .insert(key, row);
    }

    fn remove(&mut self, table: &str, key: &Value) -> Option<Row> {
        self.rows.get_mut(table).and_then(|rows| rows.shift_remove(key))
    }

    fn iter(&self, table: &str) -> impl Iterator<Item = (&Value, &Row)> {
        self.rows.get(table).into_iter().flat_map(|rows| rows.iter())
    }

    /// One past the largest integer key of `table`.
    fn next_key(&self, table: &str) -> i64 {
        self.iter(table)
            .filter_map(|(key, _)| key.as_int())
            .max()
            .unwrap_or(0)
            + 1
    }
}

/// Counts of what [`MemoryDatabase::apply`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub checked: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// Table rows held in memory.
pub struct MemoryDatabase {
    defs: Arc<DefinitionSet>,
    tables: RefCell<Tables>,
}

fn row_matches_type(entity_type: &EntityType, row: &Row) -> bool {
    entity_type.fixed_values().into_iter().all(|(node, value)| {
        entity_type
            .node(node)
            .is_some_and(|def| row.get(def.column_name()) == Some(value))
    })
}

fn key_column(entity_type: &EntityType) -> Result<String, PersistError> {
    Ok(entity_type
        .require_node(entity_type.key_node())?
        .column_name()
        .to_string())
}

impl MemoryDatabase {
    pub fn new(defs: Arc<DefinitionSet>) -> Self {
        MemoryDatabase {
            defs,
            tables: RefCell::new(Tables::default()),
        }
    }

    pub fn definitions(&self) -> &Arc<DefinitionSet> {
        &self.defs
    }

    /// Inserts a row for `type_name` from node values. Fixed values are
    /// filled in, a missing integer key is allocated and a missing lock
    /// version starts at 1. Returns the key.
    pub fn insert<'a, I>(&self, type_name: &str, values: I) -> Result<Value, PersistError>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        let entity_type = self.defs.get(type_name)?;
        let mut row = Row::new();
        for (node, value) in values {
            let def = entity_type.require_node(node)?;
            if def.is_to_many() {
                return Err(PersistError::illegal(format!(
                    "'{type_name}.{node}' is a collection and has no column"
                )));
            }
            row.insert(def.column_name().to_string(), value);
        }
        for (node, value) in entity_type.fixed_values() {
            let def = entity_type.require_node(node)?;
            row.insert(def.column_name().to_string(), value.clone());
        }
        if let Some(lock) = entity_type.optimistic_lock_node() {
            row.entry(lock.column_name().to_string())
                .or_insert(Value::Int(1));
        }

        let key_column = key_column(&entity_type)?;
        let mut tables = self.tables.borrow_mut();
        let table = entity_type.table();
        let key = match row.get(&key_column) {
            Some(key) if !key.is_null() => key.clone(),
            _ => {
                let key = self.allocate_key(&tables, &entity_type)?;
                row.insert(key_column, key.clone());
                key
            }
        };
        if tables.contains(table, &key) {
            return Err(PersistError::constraint(
                table,
                format!("duplicate primary key {key}"),
            ));
        }
        tables.insert(table, key.clone(), row);
        tracing::trace!(table, %key, "row inserted");
        Ok(key)
    }

    /// The row of `type_name` with `key`, if present.
    pub fn row(&self, type_name: &str, key: &Value) -> Result<Option<Row>, PersistError> {
        let entity_type = self.defs.get(type_name)?;
        Ok(self
            .tables
            .borrow()
            .get(entity_type.table(), key)
            .filter(|row| row_matches_type(&entity_type, row))
            .cloned())
    }

    /// Number of rows of `type_name`.
    pub fn count(&self, type_name: &str) -> Result<usize, PersistError> {
        let entity_type = self.defs.get(type_name)?;
        Ok(self
            .tables
            .borrow()
            .iter(entity_type.table())
            .filter(|(_, row)| row_matches_type(&entity_type, row))
            .count())
    }

    fn allocate_key(
        &self,
        tables: &Tables,
        entity_type: &EntityType,
    ) -> Result<Value, PersistError> {
        let def = entity_type.require_node(entity_type.key_node())?;
        match def.column_type {
            Some(ColumnType::Integer | ColumnType::BigInt) => {
                Ok(Value::Int(tables.next_key(entity_type.table())))
            }
            other => Err(PersistError::illegal(format!(
                "cannot allocate a {other:?} key for '{}'",
                entity_type.name()
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Plan application
    // -----------------------------------------------------------------------

    /// Executes `plan`: freshness checks, then creates, updates and deletes
    /// in plan order. The key write-backs are checked against the context
    /// before the store is committed, so on error the store and the entities
    /// are unchanged.
    pub fn apply(
        &self,
        ctx: &EntityContext,
        plan: &PersistPlan,
    ) -> Result<ApplyReport, PersistError> {
        let mut work = self.tables.borrow().clone();
        let mut allocated: HashMap<EntityId, Value> = HashMap::new();
        let mut versions: Vec<(EntityRef, String, Value)> = Vec::new();
        let mut report = ApplyReport::default();

        for entity in plan.depends_on().iter() {
            self.check_current(&work, &entity.borrow())?;
            report.checked += 1;
        }
        for entity in plan.create().iter() {
            let (key, version) = self.apply_create(&mut work, &entity.borrow(), &allocated)?;
            allocated.insert(entity.borrow().id(), key);
            if let Some((node, version)) = version {
                versions.push((entity.clone(), node, version));
            }
            report.created += 1;
        }
        for entity in plan.update().iter() {
            if let Some(written) = self.apply_update(&mut work, &entity.borrow(), &allocated)? {
                if let Some((node, version)) = written {
                    versions.push((entity.clone(), node, version));
                }
                report.updated += 1;
            }
        }
        for entity in plan.delete().iter() {
            self.apply_delete(&mut work, &entity.borrow())?;
            report.deleted += 1;
        }

        self.check_write_backs(ctx, plan, &allocated)?;
        *self.tables.borrow_mut() = work;

        for entity in plan.create().iter() {
            let id = entity.borrow().id();
            if let Some(key) = allocated.get(&id) {
                ctx.assign_key(entity, key.clone())?;
            }
        }
        for (entity, node, version) in versions {
            ctx.load_value(&entity, &node, version)?;
        }
        for entity in plan.create().iter().chain(plan.update().iter()) {
            entity.borrow_mut().accept_changes();
        }
        for entity in plan.delete().iter() {
            entity.borrow_mut().set_state(EntityState::Deleted)?;
        }

        tracing::info!(
            checked = report.checked,
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            "plan applied"
        );
        Ok(report)
    }

    /// Fails if an allocated key cannot be handed to its entity: the entity
    /// left the context, or another tracked entity already holds the key.
    fn check_write_backs(
        &self,
        ctx: &EntityContext,
        plan: &PersistPlan,
        allocated: &HashMap<EntityId, Value>,
    ) -> Result<(), PersistError> {
        for entity in plan.create().iter() {
            ctx.check_member(entity)?;
            let (id, type_name, label) = {
                let e = entity.borrow();
                (e.id(), e.type_name().to_string(), e.label())
            };
            let Some(key) = allocated.get(&id) else {
                continue;
            };
            ctx.require_by_uuid(id)?;
            if let Some(holder) = ctx.get_by_key(&type_name, key)? {
                if !Rc::ptr_eq(&holder, entity) {
                    return Err(PersistError::illegal(format!(
                        "allocated key {} of {} is already held by {}",
                        key,
                        label,
                        holder.borrow().label()
                    )));
                }
            }
        }
        Ok(())
    }

    fn stored_row<'t>(&self, tables: &'t Tables, entity: &Entity) -> Result<&'t Row, PersistError> {
        tables
            .get(entity.entity_type().table(), &entity.key())
            .ok_or_else(|| PersistError::EntityMissing {
                entity_type: entity.type_name().to_string(),
                key: entity.key(),
            })
    }

    /// Compares the version the entity was read at with the stored one.
    fn check_lock(&self, entity: &Entity, row: &Row) -> Result<(), PersistError> {
        let Some(lock) = entity.entity_type().optimistic_lock_node() else {
            return Ok(());
        };
        let Some(expected) = entity.value_node(&lock.name)?.lock_value() else {
            return Ok(());
        };
        let found = row.get(lock.column_name()).cloned().unwrap_or(Value::Null);
        if *expected != found {
            return Err(PersistError::OptimisticLock {
                entity_type: entity.type_name().to_string(),
                key: entity.key(),
                expected: expected.clone(),
                found,
            });
        }
        Ok(())
    }

    fn check_current(&self, tables: &Tables, entity: &Entity) -> Result<(), PersistError> {
        let row = self.stored_row(tables, entity)?;
        self.check_lock(entity, row)
    }

    /// Foreign key a reference is written with. References to entities
    /// created earlier in this plan use their allocated keys.
    fn foreign_key(
        &self,
        entity: &Entity,
        def: &NodeDefinition,
        allocated: &HashMap<EntityId, Value>,
    ) -> Result<Value, PersistError> {
        let node = entity.ref_node(&def.name)?;
        let Some(target) = node.reference() else {
            return Ok(node.key().clone());
        };
        let target = target.borrow();
        let key = target.key();
        if !key.is_null() {
            return Ok(key);
        }
        allocated.get(&target.id()).cloned().ok_or_else(|| {
            PersistError::constraint(
                entity.entity_type().table(),
                format!(
                    "{}.{} references unsaved {}",
                    entity.label(),
                    def.name,
                    target.label()
                ),
            )
        })
    }

    fn check_foreign_key(
        &self,
        tables: &Tables,
        entity: &Entity,
        def: &NodeDefinition,
        fk: &Value,
    ) -> Result<(), PersistError> {
        if fk.is_null() {
            return Ok(());
        }
        let target = self.defs.get(def.target().unwrap_or_default())?;
        if tables.contains(target.table(), fk) {
            return Ok(());
        }
        Err(PersistError::constraint(
            entity.entity_type().table(),
            format!(
                "{}.{} references missing {} row {fk}",
                entity.label(),
                def.name,
                target.table()
            ),
        ))
    }

    fn check_not_null(
        &self,
        entity: &Entity,
        def: &NodeDefinition,
        value: &Value,
    ) -> Result<(), PersistError> {
        if def.nullable || !value.is_null() {
            return Ok(());
        }
        Err(PersistError::constraint(
            entity.entity_type().table(),
            format!("{}.{} is NOT NULL", entity.label(), def.name),
        ))
    }

    /// Inserts the row of a new entity. Returns the allocated key and the
    /// initial lock version.
    fn apply_create(
        &self,
        tables: &mut Tables,
        entity: &Entity,
        allocated: &HashMap<EntityId, Value>,
    ) -> Result<(Value, Option<(String, Value)>), PersistError> {
        let entity_type = Arc::clone(entity.entity_type());
        if entity_type.is_abstract() {
            return Err(PersistError::illegal(format!(
                "cannot insert abstract {}",
                entity.label()
            )));
        }
        let key = self.allocate_key(tables, &entity_type)?;
        let mut allocated = allocated.clone();
        allocated.insert(entity.id(), key.clone());

        let mut row = Row::new();
        let mut version = None;
        let mut foreign_keys = Vec::new();
        for def in entity_type.nodes() {
            let value = if def.is_to_many() {
                continue;
            } else if def.primary_key {
                key.clone()
            } else if def.optimistic_lock {
                version = Some((def.name.clone(), Value::Int(1)));
                Value::Int(1)
            } else if def.is_ref() {
                let fk = self.foreign_key(entity, def, &allocated)?;
                foreign_keys.push((def, fk.clone()));
                fk
            } else {
                match &def.fixed_value {
                    Some(fixed) => fixed.clone(),
                    None => entity.value(&def.name)?.cloned().unwrap_or(Value::Null),
                }
            };
            self.check_not_null(entity, def, &value)?;
            row.insert(def.column_name().to_string(), value);
        }

        // Checked after the insert so a self-reference finds its own row.
        tables.insert(entity_type.table(), key.clone(), row);
        for (def, fk) in &foreign_keys {
            self.check_foreign_key(tables, entity, def, fk)?;
        }
        tracing::debug!(entity = %entity.label(), %key, "insert");
        Ok((key, version))
    }

    /// Writes the dirty columns of an existing row. `None` if nothing was
    /// written; otherwise the bumped lock version, if the type has one.
    #[allow(clippy::type_complexity)]
    fn apply_update(
        &self,
        tables: &mut Tables,
        entity: &Entity,
        allocated: &HashMap<EntityId, Value>,
    ) -> Result<Option<Option<(String, Value)>>, PersistError> {
        let entity_type = Arc::clone(entity.entity_type());
        let mut row = self.stored_row(tables, entity)?.clone();
        self.check_lock(entity, &row)?;

        let mut written = false;
        for def in entity_type.nodes() {
            if def.is_value() {
                let node = entity.value_node(&def.name)?;
                let Some(value) = node.get().filter(|_| node.is_dirty()) else {
                    continue;
                };
                self.check_not_null(entity, def, value)?;
                row.insert(def.column_name().to_string(), value.clone());
                written = true;
            } else if def.is_ref() {
                let node = entity.ref_node(&def.name)?;
                if !node.is_loaded() || !node.is_changed() {
                    continue;
                }
                let fk = self.foreign_key(entity, def, allocated)?;
                self.check_not_null(entity, def, &fk)?;
                self.check_foreign_key(tables, entity, def, &fk)?;
                row.insert(def.column_name().to_string(), fk);
                written = true;
            }
        }
        if !written {
            return Ok(None);
        }

        let version = match entity_type.optimistic_lock_node() {
            Some(lock) => {
                let column = lock.column_name().to_string();
                let next = row
                    .get(&column)
                    .and_then(Value::as_int)
                    .unwrap_or(0)
                    + 1;
                row.insert(column, Value::Int(next));
                Some((lock.name.clone(), Value::Int(next)))
            }
            None => None,
        };
        tables.insert(entity_type.table(), entity.key(), row);
        tracing::debug!(entity = %entity.label(), "update");
        Ok(Some(version))
    }

    /// Removes the row of `entity`, refusing while any other row still
    /// references it.
    fn apply_delete(&self, tables: &mut Tables, entity: &Entity) -> Result<(), PersistError> {
        let row = self.stored_row(tables, entity)?;
        self.check_lock(entity, row)?;

        let table = entity.entity_type().table().to_string();
        let key = entity.key();
        for entity_type in self.defs.types() {
            for def in entity_type.nodes().filter(|d| d.is_ref()) {
                let target_table = match self.defs.try_get(def.target().unwrap_or_default()) {
                    Some(target) => target.table(),
                    None => continue,
                };
                if target_table != table {
                    continue;
                }
                let column = def.column_name();
                let referrer = tables.iter(entity_type.table()).find(|(row_key, row)| {
                    row.get(column) == Some(&key)
                        && !(entity_type.table() == table && *row_key == &key)
                });
                if let Some((row_key, _)) = referrer {
                    return Err(PersistError::constraint(
                        &table,
                        format!(
                            "{} is still referenced by {} row {row_key} through '{column}'",
                            entity.label(),
                            entity_type.table()
                        ),
                    ));
                }
            }
        }

        tables.remove(&table, &key);
        tracing::debug!(entity = %entity.label(), "delete");
        Ok(())
    }
}

impl Fetcher for MemoryDatabase {
    fn fetch_entity(&self, ctx: &EntityContext, entity: &EntityRef) -> Result<(), CoreError> {
        let (mut entity_type, key) = {
            let e = entity.borrow();
            (Arc::clone(e.entity_type()), e.key())
        };
        let row = self
            .tables
            .borrow()
            .get(entity_type.table(), &key)
            .filter(|row| row_matches_type(&entity_type, row))
            .cloned()
            .ok_or_else(|| CoreError::EntityMissing {
                entity_type: entity_type.name().to_string(),
                key: key.clone(),
            })?;

        let load_values = |entity_type: &EntityType| -> Result<(), CoreError> {
            for def in entity_type.nodes().filter(|d| d.is_value()) {
                let value = row.get(def.column_name()).cloned().unwrap_or(Value::Null);
                ctx.load_value(entity, &def.name, value)?;
            }
            Ok(())
        };

        if entity_type.is_abstract() {
            load_values(&entity_type)?;
            entity_type = ctx.downcast(entity)?;
        }
        load_values(&entity_type)?;
        for def in entity_type.nodes().filter(|d| d.is_ref()) {
            let fk = row.get(def.column_name()).cloned().unwrap_or(Value::Null);
            ctx.load_reference(entity, &def.name, fk)?;
        }
        tracing::trace!(entity = %entity.borrow().label(), "row loaded");
        Ok(())
    }

    fn fetch_to_many(
        &self,
        ctx: &EntityContext,
        owner: &EntityRef,
        node: &str,
    ) -> Result<(), CoreError> {
        let (owner_type, owner_key) = {
            let o = owner.borrow();
            (Arc::clone(o.entity_type()), o.key())
        };
        let def = owner_type.require_node(node)?;
        let target_name = def.target().unwrap_or_default();
        let target_type = self.defs.get(target_name)?;
        let foreign = def.foreign_node().ok_or_else(|| CoreError::Schema {
            reason: format!("'{}.{node}' has no foreign node", owner_type.name()),
        })?;
        let fk_column = target_type.require_node(foreign)?.column_name().to_string();

        let keys: Vec<Value> = if owner_key.is_null() {
            Vec::new()
        } else {
            self.tables
                .borrow()
                .iter(target_type.table())
                .filter(|(_, row)| {
                    row.get(&fk_column) == Some(&owner_key) && row_matches_type(&target_type, row)
                })
                .map(|(key, _)| key.clone())
                .collect()
        };

        let query = format!("{}.{node}", owner_type.name());
        let mut children = Vec::with_capacity(keys.len());
        for key in keys {
            let child = ctx.get_or_create_from_query(target_name, key, Some(&query))?;
            let state = child.borrow().state();
            if state == EntityState::NotLoaded {
                ctx.fetch(&child)?;
            }
            children.push(child);
        }
        tracing::trace!(
            owner = %owner.borrow().label(),
            node,
            count = children.len(),
            "collection loaded"
        );
        ctx.load_to_many(owner, node, children)
    }
}
