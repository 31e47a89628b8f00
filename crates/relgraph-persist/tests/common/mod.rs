//! Shared shop schema and fixtures.

#![allow(dead_code)]

use std::rc::Rc;
use std::sync::Arc;

use relgraph_core::{
    ColumnType, DefinitionSet, EntityContext, EntityTypeDef, NodeDefinition, RelationKind,
    SchemaSource, Value,
};
use relgraph_persist::MemoryDatabase;

pub fn shop() -> Arc<DefinitionSet> {
    let source = SchemaSource::new()
        .entity(
            EntityTypeDef::new("Customer", "customer")
                .key("id", "id", ColumnType::BigInt)
                .value("name", "name", ColumnType::Varchar),
        )
        .entity(
            EntityTypeDef::new("Product", "product")
                .key("id", "id", ColumnType::BigInt)
                .value("name", "name", ColumnType::Varchar)
                .node(
                    NodeDefinition::value("version", "version", ColumnType::Integer)
                        .with_optimistic_lock(),
                ),
        )
        .entity(
            EntityTypeDef::new("Order", "orders")
                .key("id", "id", ColumnType::BigInt)
                .value("note", "note", ColumnType::Varchar)
                .node(
                    NodeDefinition::value("version", "version", ColumnType::Integer)
                        .with_optimistic_lock(),
                )
                .reference("customer", "customer_id", "Customer", RelationKind::Refers)
                .to_many("items", "LineItem", "order", RelationKind::Owns)
                .to_many("shipments", "Shipment", "order", RelationKind::Refers),
        )
        .entity(
            EntityTypeDef::new("LineItem", "line_item")
                .key("id", "id", ColumnType::BigInt)
                .value("sku", "sku", ColumnType::Varchar)
                .reference("order", "order_id", "Order", RelationKind::Refers)
                .reference("product", "product_id", "Product", RelationKind::Depends),
        )
        .entity(
            EntityTypeDef::new("Shipment", "shipment")
                .key("id", "id", ColumnType::BigInt)
                .reference("order", "order_id", "Order", RelationKind::Refers),
        )
        .entity(
            EntityTypeDef::new("Person", "person")
                .key("id", "id", ColumnType::BigInt)
                .reference("partner", "partner_id", "Person", RelationKind::Refers),
        );
    Arc::new(DefinitionSet::new(source).unwrap())
}

pub fn database(defs: &Arc<DefinitionSet>) -> Rc<MemoryDatabase> {
    Rc::new(MemoryDatabase::new(Arc::clone(defs)))
}

pub fn context(defs: &Arc<DefinitionSet>, db: &Rc<MemoryDatabase>) -> EntityContext {
    let ctx = EntityContext::new(Arc::clone(defs));
    ctx.set_fetcher(db.clone());
    ctx
}

/// Customer 1, Product 5, Order 7 for customer 1 with LineItem 3.
pub fn seed(db: &MemoryDatabase) {
    db.insert("Customer", [("id", Value::Int(1)), ("name", Value::from("Ada"))])
        .unwrap();
    db.insert("Product", [("id", Value::Int(5)), ("name", Value::from("Lamp"))])
        .unwrap();
    db.insert(
        "Order",
        [
            ("id", Value::Int(7)),
            ("customer", Value::Int(1)),
            ("note", Value::from("first")),
        ],
    )
    .unwrap();
    db.insert(
        "LineItem",
        [
            ("id", Value::Int(3)),
            ("order", Value::Int(7)),
            ("sku", Value::from("A-1")),
        ],
    )
    .unwrap();
}
