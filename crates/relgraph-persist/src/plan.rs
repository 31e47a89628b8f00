//! Requests in, plans out.

use std::fmt;

use relgraph_core::{EntityContext, EntityId, EntityRef};

use crate::error::PersistError;
use crate::group::{OperationGroup, OperationKind};

/// Entities the caller wants saved and deleted.
#[derive(Clone, Default)]
pub struct PersistRequest {
    save: Vec<EntityRef>,
    delete: Vec<EntityRef>,
}

impl PersistRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(mut self, entity: &EntityRef) -> Self {
        self.save.push(entity.clone());
        self
    }

    pub fn delete(mut self, entity: &EntityRef) -> Self {
        self.delete.push(entity.clone());
        self
    }

    pub fn saves(&self) -> &[EntityRef] {
        &self.save
    }

    pub fn deletes(&self) -> &[EntityRef] {
        &self.delete
    }

    pub fn is_empty(&self) -> bool {
        self.save.is_empty() && self.delete.is_empty()
    }
}

/// The ordered result of analysis.
///
/// Execute `depends_on` checks first, then `create`, `update` and `delete`
/// in that order. Within each group, entities are in execution order.
pub struct PersistPlan {
    pub(crate) create: OperationGroup,
    pub(crate) update: OperationGroup,
    pub(crate) delete: OperationGroup,
    pub(crate) depends_on: OperationGroup,
    pub(crate) loaded_during_analysis: Vec<EntityRef>,
}

impl PersistPlan {
    pub fn create(&self) -> &OperationGroup {
        &self.create
    }

    pub fn update(&self) -> &OperationGroup {
        &self.update
    }

    pub fn delete(&self) -> &OperationGroup {
        &self.delete
    }

    pub fn depends_on(&self) -> &OperationGroup {
        &self.depends_on
    }

    pub fn group(&self, kind: OperationKind) -> &OperationGroup {
        match kind {
            OperationKind::Create => &self.create,
            OperationKind::Update => &self.update,
            OperationKind::Delete => &self.delete,
            OperationKind::DependsOn => &self.depends_on,
        }
    }

    /// Entities the analyser had to fetch itself.
    pub fn loaded_during_analysis(&self) -> &[EntityRef] {
        &self.loaded_during_analysis
    }

    /// True if nothing needs writing.
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }

    /// Copies every entity scheduled for write into `target`, skipping those
    /// the analyser only loaded. Returns the copies in plan order.
    pub fn copy_changes_into(
        &self,
        target: &EntityContext,
    ) -> Result<Vec<EntityRef>, PersistError> {
        let skipped: Vec<EntityId> = self
            .loaded_during_analysis
            .iter()
            .map(|e| e.borrow().id())
            .collect();
        let mut copies = Vec::new();
        for group in [&self.create, &self.update, &self.delete] {
            for entity in group.iter() {
                if skipped.contains(&entity.borrow().id()) {
                    continue;
                }
                copies.push(target.import(entity)?);
            }
        }
        tracing::debug!(
            copied = copies.len(),
            skipped = skipped.len(),
            context = %target.id(),
            "copied plan changes"
        );
        Ok(copies)
    }
}

impl fmt::Display for PersistPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.create, self.update, self.delete, self.depends_on
        )
    }
}

impl fmt::Debug for PersistPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistPlan")
            .field("create", &self.create)
            .field("update", &self.update)
            .field("delete", &self.delete)
            .field("depends_on", &self.depends_on)
            .field("loaded_during_analysis", &self.loaded_during_analysis.len())
            .finish()
    }
}
