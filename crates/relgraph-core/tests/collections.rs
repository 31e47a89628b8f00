//! Property tests for to-many change tracking.

use std::cell::RefCell;
use std::rc::Rc;

use proptest::prelude::*;
use relgraph_core::{
    ColumnType, ContextId, DefinitionSet, Entity, EntityId, EntityRef, EntityTypeDef,
    SchemaSource, ToManyNode,
};

fn pool(size: usize) -> Vec<EntityRef> {
    let defs = DefinitionSet::new(
        SchemaSource::new()
            .entity(EntityTypeDef::new("Item", "item").key("id", "id", ColumnType::BigInt)),
    )
    .unwrap();
    let ty = defs.get("Item").unwrap();
    (0..size)
        .map(|_| {
            Rc::new(RefCell::new(Entity::fresh(
                EntityId::new(),
                ContextId(0),
                ty.clone(),
                None,
            )))
        })
        .collect()
}

fn has(list: &[EntityRef], e: &EntityRef) -> bool {
    list.iter().any(|x| Rc::ptr_eq(x, e))
}

proptest! {
    #[test]
    fn additions_and_removals_stay_consistent(
        initial in 0usize..6,
        ops in prop::collection::vec((any::<bool>(), 0usize..10), 0..40),
    ) {
        let entities = pool(10);
        let mut node = ToManyNode::unknown();
        node.set_fetched(entities[..initial].to_vec());

        for (add, idx) in ops {
            let e = &entities[idx];
            if add {
                node.add(e.clone());
            } else {
                node.remove(e);
            }
        }

        for e in node.added() {
            prop_assert!(has(node.list(), e));
            prop_assert!(!has(node.removed(), e));
        }
        for e in node.removed() {
            prop_assert!(!has(node.list(), e));
        }
        // The list is the fetched contents minus removals plus additions.
        for (i, e) in entities.iter().enumerate() {
            let expected = (i < initial && !has(node.removed(), e)) || has(node.added(), e);
            prop_assert_eq!(has(node.list(), e), expected);
        }
        // Removals only ever name fetched members; additions only new ones.
        for e in node.removed() {
            prop_assert!(has(&entities[..initial], e));
        }
        for e in node.added() {
            prop_assert!(!has(&entities[..initial], e));
        }
    }
}
