//! The loading seam between a context and its backing store.

use crate::context::EntityContext;
use crate::entity::EntityRef;
use crate::error::CoreError;

/// Loads entity contents on demand.
///
/// Implementations fill nodes through the context's loading hooks
/// ([`EntityContext::load_value`], [`EntityContext::load_reference`],
/// [`EntityContext::load_to_many`]) and may downcast abstract entities.
/// A row that does not exist is [`CoreError::EntityMissing`].
///
/// The context holds no borrow of the entity while a fetcher runs.
pub trait Fetcher {
    /// Loads every node of `entity`, which has a non-null key.
    fn fetch_entity(&self, ctx: &EntityContext, entity: &EntityRef) -> Result<(), CoreError>;

    /// Loads the to-many collection `node` of `owner`.
    fn fetch_to_many(
        &self,
        ctx: &EntityContext,
        owner: &EntityRef,
        node: &str,
    ) -> Result<(), CoreError>;
}
