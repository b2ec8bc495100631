//! Typed query coordinator: filters, temporal windows, endpoint
//! hydration, traversals, aggregation and grouping.

mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;

use ontograph_core::{field, left_field, CompareOp};
use ontograph_runtime::Session;
use ontograph_store::{AggFunc, AggSpec, Having};

async fn seeded() -> (Arc<ontograph_runtime::Ontology>, Session) {
    let ontology = ontology();
    let mut session = session(&ontology);

    session.ensure(&customer("c1", "Alice", 30)).unwrap();
    session.ensure(&customer("c2", "Bob", 17)).unwrap();
    session.ensure(&customer("c3", "Cara", 45)).unwrap();
    session
        .ensure(&Product { sku: "p1".into(), price: 10.0 })
        .unwrap();
    session
        .ensure(&Product { sku: "p2".into(), price: 99.5 })
        .unwrap();
    session.commit().await.unwrap();

    for (customer_id, sku, order, qty) in [
        ("c1", "p1", "ord-1", 2),
        ("c1", "p2", "ord-2", 1),
        ("c2", "p1", "ord-3", 5),
    ] {
        session
            .ensure_relation(&Purchased {
                customer_id: customer_id.into(),
                product_sku: sku.into(),
                order_id: order.into(),
                quantity: qty,
            })
            .unwrap();
    }
    session.commit().await.unwrap();
    (ontology, session)
}

#[tokio::test]
async fn typed_collect_carries_meta() {
    let (_ontology, session) = seeded().await;

    let adults = session
        .query()
        .entities::<Customer>()
        .where_(field("age").ge(18))
        .order_by("age")
        .collect()
        .await
        .unwrap();

    assert_eq!(adults.len(), 2);
    assert_eq!(adults[0].name, "Alice");
    assert_eq!(adults[1].name, "Cara");
    let meta = adults[0].meta();
    assert_eq!(meta.type_name, "Customer");
    assert_eq!(meta.key.as_deref(), Some("c1"));
    assert_eq!(meta.commit_id, 1);
}

#[tokio::test]
async fn first_and_count() {
    let (_ontology, session) = seeded().await;
    let q = session.query();

    assert_eq!(q.entities::<Customer>().count().await.unwrap(), 3);
    let first = q
        .entities::<Customer>()
        .where_(field("name").eq("Bob"))
        .first()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.age, 17);

    let none = q
        .entities::<Customer>()
        .where_(field("name").eq("Nobody"))
        .first()
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn as_of_reads_an_earlier_view() {
    let ontology = ontology();
    let mut session = session(&ontology);
    session.ensure(&customer("c1", "Alice", 30)).unwrap();
    session.commit().await.unwrap();
    session.ensure(&customer("c1", "Alice", 31)).unwrap();
    session.commit().await.unwrap();

    let then = session
        .query()
        .entities::<Customer>()
        .as_of(1)
        .collect()
        .await
        .unwrap();
    assert_eq!(then[0].age, 30);

    let history = session
        .query()
        .entities::<Customer>()
        .with_history()
        .collect()
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].meta().commit_id, 1);
    assert_eq!(history[1].meta().commit_id, 2);

    let since = session
        .query()
        .entities::<Customer>()
        .history_since(1)
        .collect()
        .await
        .unwrap();
    assert_eq!(since.len(), 1);
    assert_eq!(since[0].age, 31);
}

#[tokio::test]
async fn relations_hydrate_endpoints() {
    let (_ontology, session) = seeded().await;

    let purchases = session
        .query()
        .relations::<Purchased>()
        .collect()
        .await
        .unwrap();
    assert_eq!(purchases.len(), 3);

    let ord_1 = purchases
        .iter()
        .find(|p| p.relation.order_id == "ord-1")
        .unwrap();
    assert_eq!(ord_1.relation.quantity, 2);
    assert_eq!(ord_1.left.as_ref().unwrap().name, "Alice");
    assert_eq!(ord_1.right.as_ref().unwrap().price, 10.0);
    assert_eq!(ord_1.meta().instance_key.as_deref(), Some("ord-1"));
}

#[tokio::test]
async fn endpoint_filters_on_relations() {
    let (_ontology, session) = seeded().await;

    let from_alice = session
        .query()
        .relations::<Purchased>()
        .where_(left_field("name").eq("Alice"))
        .collect()
        .await
        .unwrap();
    assert_eq!(from_alice.len(), 2);
    assert!(from_alice.iter().all(|p| p.relation.customer_id == "c1"));

    let big = session
        .query()
        .relations::<Purchased>()
        .where_(field("quantity").ge(5))
        .collect()
        .await
        .unwrap();
    assert_eq!(big.len(), 1);
    assert_eq!(big[0].relation.order_id, "ord-3");
}

#[tokio::test]
async fn relation_aggregates() {
    let (_ontology, session) = seeded().await;
    let q = session.query();

    assert_eq!(q.relations::<Purchased>().count().await.unwrap(), 3);
    assert_eq!(q.relations::<Purchased>().sum("quantity").await.unwrap(), json!(8.0));
    assert_eq!(q.relations::<Purchased>().max("quantity").await.unwrap(), json!(5));
}

#[tokio::test]
async fn group_by_entities_with_having() {
    let (_ontology, session) = seeded().await;

    let rows = session
        .query()
        .entities::<Customer>()
        .group_by("age")
        .having(Having { alias: "n".to_string(), op: CompareOp::Ge, value: json!(1) })
        .agg(&[AggSpec::count("n")])
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r["n"] == json!(1)));
}

#[tokio::test]
async fn group_relations_by_endpoint_field() {
    let (_ontology, session) = seeded().await;

    let rows = session
        .query()
        .relations::<Purchased>()
        .group_by("left.$.name")
        .agg(&[
            AggSpec::count("orders"),
            AggSpec::new("total_qty", AggFunc::Sum, "quantity"),
        ])
        .await
        .unwrap();

    let alice = rows.iter().find(|r| r["name"] == json!("Alice")).unwrap();
    assert_eq!(alice["orders"], json!(2));
    assert_eq!(alice["total_qty"], json!(3.0));
    let bob = rows.iter().find(|r| r["name"] == json!("Bob")).unwrap();
    assert_eq!(bob["orders"], json!(1));
}

#[tokio::test]
async fn traversal_follows_matching_side() {
    let (_ontology, session) = seeded().await;

    let paths = session
        .query()
        .entities::<Customer>()
        .where_(field("id").eq("c1"))
        .via::<Purchased>()
        .collect()
        .await
        .unwrap();

    assert_eq!(paths.len(), 1);
    let path = &paths[0];
    assert_eq!(path.source.name, "Alice");
    assert_eq!(path.relations.len(), 2);
    assert_eq!(path.entities.len(), 2);
    let skus: Vec<&str> = path.entities.iter().map(|n| n.key.as_str()).collect();
    assert!(skus.contains(&"p1") && skus.contains(&"p2"));

    let typed = path.entities[0].decode::<Product>().unwrap();
    assert!(typed.price > 0.0);
    assert!(path.entities[0].decode::<Customer>().is_err());
}

#[tokio::test]
async fn without_relations_dedupes_by_step() {
    let (_ontology, session) = seeded().await;

    // Two customers bought p1: the flattened view keeps one node for it.
    let nodes = session
        .query()
        .entities::<Customer>()
        .via::<Purchased>()
        .without_relations()
        .await
        .unwrap();

    let p1_nodes: Vec<_> = nodes.iter().filter(|n| n.key == "p1").collect();
    assert_eq!(p1_nodes.len(), 1);
    let p2_nodes: Vec<_> = nodes.iter().filter(|n| n.key == "p2").collect();
    assert_eq!(p2_nodes.len(), 1);
}

#[tokio::test]
async fn multi_step_traversal_walks_back() {
    let (_ontology, session) = seeded().await;

    // Customer -> Purchased -> Product -> Purchased -> Customer finds
    // everyone who bought something Alice bought.
    let paths = session
        .query()
        .entities::<Customer>()
        .where_(field("id").eq("c1"))
        .via::<Purchased>()
        .via::<Purchased>()
        .collect()
        .await
        .unwrap();

    let buyers: std::collections::BTreeSet<&str> = paths[0]
        .entities
        .iter()
        .filter(|n| n.step == 1)
        .map(|n| n.key.as_str())
        .collect();
    assert!(buyers.contains("c1"));
    assert!(buyers.contains("c2"));
}

#[tokio::test]
async fn existential_filter_through_the_builder() {
    let ontology = ontology();
    let mut session = session(&ontology);
    let mut alice = customer("c1", "Alice", 30);
    alice.email = Some("alice@example.com".into());
    session.ensure(&alice).unwrap();
    session.ensure(&customer("c2", "Bob", 41)).unwrap();
    session.commit().await.unwrap();

    let with_email = session
        .query()
        .entities::<Customer>()
        .where_(field("email").is_not_null())
        .collect()
        .await
        .unwrap();
    assert_eq!(with_email.len(), 1);
    assert_eq!(with_email[0].id, "c1");

    let without = session
        .query()
        .entities::<Customer>()
        .where_(field("email").is_null())
        .collect()
        .await
        .unwrap();
    assert_eq!(without.len(), 1);
    assert_eq!(without[0].id, "c2");
}

#[tokio::test]
async fn entity_aggregates_through_the_builder() {
    let (_ontology, session) = seeded().await;
    let q = session.query();

    assert_eq!(q.entities::<Customer>().sum("age").await.unwrap(), json!(92.0));
    assert_eq!(q.entities::<Customer>().min("age").await.unwrap(), json!(17));
    assert_eq!(
        q.entities::<Customer>()
            .where_(field("age").ge(18))
            .count()
            .await
            .unwrap(),
        2
    );
}
