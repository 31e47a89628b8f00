//! Classification and ordering of persist requests.

mod common;

use std::sync::Arc;

use common::{context, database, seed, shop};
use relgraph_core::{
    ColumnType, ContextConfig, DefinitionSet, EntityContext, EntityState, EntityTypeDef,
    RelationKind, SchemaSource, Value,
};
use relgraph_persist::{AnalyserConfig, PersistAnalyser, PersistError, PersistRequest};

fn labels(group: &relgraph_persist::OperationGroup) -> Vec<String> {
    group.labels()
}

#[test]
fn new_graph_is_created_referenced_rows_first() {
    let defs = shop();
    let db = database(&defs);
    let ctx = context(&defs, &db);

    let customer = ctx.new_entity("Customer").unwrap();
    customer.borrow_mut().set_value("name", "Ada").unwrap();
    let order = ctx.new_entity("Order").unwrap();
    ctx.set_reference(&order, "customer", Some(&customer)).unwrap();
    let item = ctx.new_entity("LineItem").unwrap();
    ctx.add_to_many(&order, "items", &item).unwrap();

    let plan = PersistAnalyser::new(&ctx)
        .analyse(&PersistRequest::new().save(&order))
        .unwrap();
    insta::assert_snapshot!(
        plan.to_string(),
        @"create=[Customer(new), Order(new), LineItem(new)] update=[] delete=[] depends_on=[]"
    );
}

#[test]
fn removed_owned_child_is_deleted_with_owner_updated() {
    let defs = shop();
    let db = database(&defs);
    seed(&db);
    let ctx = context(&defs, &db);

    let order = ctx.get_or_create("Order", Value::Int(7)).unwrap();
    ctx.fetch(&order).unwrap();
    ctx.fetch_to_many(&order, "items").unwrap();
    let item = ctx.get_by_key("LineItem", &Value::Int(3)).unwrap().unwrap();
    assert!(ctx.remove_from_many(&order, "items", &item).unwrap());

    let plan = PersistAnalyser::new(&ctx)
        .analyse(&PersistRequest::new().save(&order))
        .unwrap();
    assert!(plan.create().is_empty());
    assert_eq!(labels(plan.update()), vec!["Order#7"]);
    assert_eq!(labels(plan.delete()), vec!["LineItem#3"]);
    assert!(plan.depends_on().is_empty());
}

#[test]
fn delete_cascades_through_owned_collections_children_first() {
    let defs = shop();
    let db = database(&defs);
    seed(&db);
    db.insert("LineItem", [("id", Value::Int(4)), ("order", Value::Int(7))])
        .unwrap();
    db.insert("Shipment", [("id", Value::Int(11)), ("order", Value::Int(7))])
        .unwrap();
    let ctx = context(&defs, &db);

    let order = ctx.get_or_create("Order", Value::Int(7)).unwrap();
    let plan = PersistAnalyser::new(&ctx)
        .analyse(&PersistRequest::new().delete(&order))
        .unwrap();

    let deleted = labels(plan.delete());
    assert_eq!(deleted.len(), 3);
    assert_eq!(deleted.last().map(String::as_str), Some("Order#7"));
    assert!(deleted.contains(&"LineItem#3".to_string()));
    assert!(deleted.contains(&"LineItem#4".to_string()));
    // Shipments are only referred to, never owned.
    assert!(!deleted.iter().any(|l| l.starts_with("Shipment")));

    // The order and both items were loaded by the analysis itself.
    assert_eq!(plan.loaded_during_analysis().len(), 3);
    assert_eq!(order.borrow().state(), EntityState::Loaded);
}

#[test]
fn unfetched_collection_is_left_alone_on_save() {
    let defs = shop();
    let db = database(&defs);
    seed(&db);
    let ctx = context(&defs, &db);

    let order = ctx.get_or_create("Order", Value::Int(7)).unwrap();
    ctx.fetch(&order).unwrap();
    order.borrow_mut().set_value("note", "rush").unwrap();

    let plan = PersistAnalyser::new(&ctx)
        .analyse(&PersistRequest::new().save(&order))
        .unwrap();
    assert_eq!(plan.to_string(), "create=[] update=[Order#7] delete=[] depends_on=[]");
    assert!(!order.borrow().to_many("items").unwrap().is_fetched());
    assert!(plan.loaded_during_analysis().is_empty());
}

#[test]
fn reclassifying_an_entity_replaces_its_earlier_group() {
    let defs = shop();
    let db = database(&defs);
    seed(&db);
    let ctx = context(&defs, &db);
    let order = ctx.get_or_create("Order", Value::Int(7)).unwrap();

    let mut analyser = PersistAnalyser::new(&ctx);
    analyser.save(&order).unwrap();
    analyser.delete(&order).unwrap();
    let plan = analyser.finish().unwrap();

    assert!(plan.update().is_empty());
    assert_eq!(labels(plan.delete()), vec!["LineItem#3", "Order#7"]);
}

#[test]
fn reclassifying_a_saved_owner_as_deleted_takes_its_children_along() {
    let defs = shop();
    let db = database(&defs);
    seed(&db);
    let ctx = context(&defs, &db);
    let order = ctx.get_or_create("Order", Value::Int(7)).unwrap();
    ctx.fetch(&order).unwrap();
    ctx.fetch_to_many(&order, "items").unwrap();

    let mut analyser = PersistAnalyser::new(&ctx);
    analyser.save(&order).unwrap();
    analyser.delete(&order).unwrap();
    let plan = analyser.finish().unwrap();
    assert_eq!(
        plan.to_string(),
        "create=[] update=[] delete=[LineItem#3, Order#7] depends_on=[]"
    );

    db.apply(&ctx, &plan).unwrap();
    assert_eq!(db.count("Order").unwrap(), 0);
    assert_eq!(db.count("LineItem").unwrap(), 0);
}

#[test]
fn reclassifying_a_deleted_owner_as_saved_keeps_its_children() {
    let defs = shop();
    let db = database(&defs);
    seed(&db);
    let ctx = context(&defs, &db);
    let order = ctx.get_or_create("Order", Value::Int(7)).unwrap();
    ctx.fetch(&order).unwrap();
    ctx.fetch_to_many(&order, "items").unwrap();

    let mut analyser = PersistAnalyser::new(&ctx);
    analyser.delete(&order).unwrap();
    analyser.save(&order).unwrap();
    let plan = analyser.finish().unwrap();
    assert_eq!(
        plan.to_string(),
        "create=[] update=[Order#7, LineItem#3] delete=[] depends_on=[]"
    );
}

#[test]
fn explicit_delete_overrides_a_cascaded_update() {
    let defs = shop();
    let db = database(&defs);
    seed(&db);
    let ctx = context(&defs, &db);
    let order = ctx.get_or_create("Order", Value::Int(7)).unwrap();
    ctx.fetch(&order).unwrap();
    ctx.fetch_to_many(&order, "items").unwrap();
    let item = ctx.get_by_key("LineItem", &Value::Int(3)).unwrap().unwrap();

    let plan = PersistAnalyser::new(&ctx)
        .analyse(&PersistRequest::new().save(&order).delete(&item))
        .unwrap();
    assert_eq!(labels(plan.update()), vec!["Order#7"]);
    assert_eq!(labels(plan.delete()), vec!["LineItem#3"]);
}

fn households() -> Arc<DefinitionSet> {
    let source = SchemaSource::new()
        .entity(
            EntityTypeDef::new("Address", "address")
                .key("id", "id", ColumnType::BigInt)
                .value("street", "street", ColumnType::Varchar),
        )
        .entity(
            EntityTypeDef::new("Person", "person")
                .key("id", "id", ColumnType::BigInt)
                .reference("address", "address_id", "Address", RelationKind::Owns),
        );
    Arc::new(DefinitionSet::new(source).unwrap())
}

#[test]
fn delete_loads_owned_references_without_lazy_loading() {
    let defs = households();
    let db = database(&defs);
    db.insert("Address", [("id", Value::Int(1)), ("street", Value::from("Main"))])
        .unwrap();
    db.insert("Person", [("id", Value::Int(2)), ("address", Value::Int(1))])
        .unwrap();
    let config = ContextConfig {
        lazy_loading: false,
        ..ContextConfig::default()
    };
    let ctx = EntityContext::with_config(Arc::clone(&defs), config);
    ctx.set_fetcher(db.clone());

    let person = ctx.get_or_create("Person", Value::Int(2)).unwrap();
    let plan = PersistAnalyser::new(&ctx)
        .analyse(&PersistRequest::new().delete(&person))
        .unwrap();
    assert_eq!(labels(plan.delete()), vec!["Person#2", "Address#1"]);
    assert_eq!(plan.loaded_during_analysis().len(), 2);
    assert_eq!(person.borrow().state(), EntityState::Loaded);
}

#[test]
fn deleting_an_unsaved_entity_plans_nothing() {
    let defs = shop();
    let db = database(&defs);
    let ctx = context(&defs, &db);
    let customer = ctx.new_entity("Customer").unwrap();

    let mut analyser = PersistAnalyser::new(&ctx);
    analyser.save(&customer).unwrap();
    analyser.delete(&customer).unwrap();
    let plan = analyser.finish().unwrap();
    assert!(plan.is_empty());
}

#[test]
fn entities_of_another_context_are_rejected() {
    let defs = shop();
    let db = database(&defs);
    let ctx = context(&defs, &db);
    let other = EntityContext::new(defs.clone());
    let stranger = other.new_entity("Customer").unwrap();

    let err = PersistAnalyser::new(&ctx)
        .analyse(&PersistRequest::new().save(&stranger))
        .unwrap_err();
    assert!(matches!(err, PersistError::IllegalPersistState { .. }));
}

#[test]
fn depended_on_rows_are_checked_not_written() {
    let defs = shop();
    let db = database(&defs);
    seed(&db);
    let ctx = context(&defs, &db);

    let order = ctx.get_or_create("Order", Value::Int(7)).unwrap();
    ctx.fetch(&order).unwrap();
    ctx.fetch_to_many(&order, "items").unwrap();
    let product = ctx.get_or_create("Product", Value::Int(5)).unwrap();
    ctx.fetch(&product).unwrap();

    let item = ctx.new_entity("LineItem").unwrap();
    ctx.set_reference(&item, "product", Some(&product)).unwrap();
    ctx.add_to_many(&order, "items", &item).unwrap();

    let plan = PersistAnalyser::new(&ctx)
        .analyse(&PersistRequest::new().save(&order))
        .unwrap();
    insta::assert_snapshot!(
        plan.to_string(),
        @"create=[LineItem(new)] update=[Order#7, LineItem#3] delete=[] depends_on=[Product#5]"
    );
}

#[test]
fn unloaded_dependency_is_not_checked() {
    let defs = shop();
    let db = database(&defs);
    seed(&db);
    let ctx = context(&defs, &db);

    let product = ctx.get_or_create("Product", Value::Int(5)).unwrap();
    let item = ctx.new_entity("LineItem").unwrap();
    ctx.set_reference(&item, "product", Some(&product)).unwrap();

    let plan = PersistAnalyser::new(&ctx)
        .analyse(&PersistRequest::new().save(&item))
        .unwrap();
    assert!(plan.depends_on().is_empty());
    assert_eq!(product.borrow().state(), EntityState::NotLoaded);
}

#[test]
fn missing_row_surfaces_as_entity_missing() {
    let defs = shop();
    let db = database(&defs);
    let ctx = context(&defs, &db);
    let ghost = ctx.get_or_create("Order", Value::Int(99)).unwrap();

    let err = PersistAnalyser::new(&ctx)
        .analyse(&PersistRequest::new().delete(&ghost))
        .unwrap_err();
    match err {
        PersistError::EntityMissing { entity_type, key } => {
            assert_eq!(entity_type, "Order");
            assert_eq!(key, Value::Int(99));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn saving_a_deleted_entity_is_illegal() {
    let defs = shop();
    let db = database(&defs);
    seed(&db);
    let ctx = context(&defs, &db);
    let customer = ctx.get_or_create("Customer", Value::Int(1)).unwrap();
    customer
        .borrow_mut()
        .set_state(EntityState::Deleted)
        .unwrap();

    let err = PersistAnalyser::new(&ctx)
        .analyse(&PersistRequest::new().save(&customer))
        .unwrap_err();
    assert!(matches!(err, PersistError::IllegalPersistState { .. }));
}

#[test]
fn cycle_between_new_rows_fails_ordering() {
    let defs = shop();
    let db = database(&defs);
    let ctx = context(&defs, &db);
    let a = ctx.new_entity("Person").unwrap();
    let b = ctx.new_entity("Person").unwrap();
    ctx.set_reference(&a, "partner", Some(&b)).unwrap();
    ctx.set_reference(&b, "partner", Some(&a)).unwrap();

    let err = PersistAnalyser::new(&ctx)
        .analyse(&PersistRequest::new().save(&a))
        .unwrap_err();
    assert!(matches!(err, PersistError::Dependency(_)));
}

#[test]
fn self_reference_does_not_block_creation() {
    let defs = shop();
    let db = database(&defs);
    let ctx = context(&defs, &db);
    let narcissus = ctx.new_entity("Person").unwrap();
    ctx.set_reference(&narcissus, "partner", Some(&narcissus))
        .unwrap();

    let plan = PersistAnalyser::new(&ctx)
        .analyse(&PersistRequest::new().save(&narcissus))
        .unwrap();
    assert_eq!(labels(plan.create()), vec!["Person(new)"]);
}

#[test]
fn updates_follow_table_rank_unless_disabled() {
    let defs = shop();
    let db = database(&defs);
    let ctx = context(&defs, &db);
    let item = ctx.get_or_create("LineItem", Value::Int(3)).unwrap();
    let order = ctx.get_or_create("Order", Value::Int(7)).unwrap();
    let customer = ctx.get_or_create("Customer", Value::Int(1)).unwrap();
    let request = PersistRequest::new()
        .save(&item)
        .save(&order)
        .save(&customer);

    let ranked = PersistAnalyser::new(&ctx).analyse(&request).unwrap();
    assert_eq!(
        labels(ranked.update()),
        vec!["Customer#1", "Order#7", "LineItem#3"]
    );

    let config = AnalyserConfig {
        deadlock_avoidance: false,
    };
    let unranked = PersistAnalyser::with_config(&ctx, config)
        .analyse(&request)
        .unwrap();
    assert_eq!(
        labels(unranked.update()),
        vec!["LineItem#3", "Order#7", "Customer#1"]
    );
}

#[test]
fn independent_creates_are_ranked_by_table() {
    let defs = shop();
    let db = database(&defs);
    let ctx = context(&defs, &db);
    let shipment = ctx.new_entity("Shipment").unwrap();
    let product = ctx.new_entity("Product").unwrap();

    let plan = PersistAnalyser::new(&ctx)
        .analyse(&PersistRequest::new().save(&shipment).save(&product))
        .unwrap();
    assert_eq!(labels(plan.create()), vec!["Product(new)", "Shipment(new)"]);
}
