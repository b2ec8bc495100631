//! Repository contract tests on the embedded backend.
//!
//! These exercise the behavioral contracts directly against SQLite:
//! commit ordering, latest-wins reads, temporal windows, the activation
//! boundary, filters, aggregates and the write lock.

use serde_json::{json, Map, Value};

use ontograph_core::{field, OntologyConfig, TypeName};
use ontograph_store::{
    AggFunc, AggSpec, DiagnosticReason, EndpointTypes, Having, QuerySpec, ReadWindow, Repository,
    SqliteStore,
};

fn store() -> SqliteStore {
    SqliteStore::open(":memory:", OntologyConfig::default()).unwrap()
}

fn fields(value: Value) -> Map<String, Value> {
    serde_json::from_value(value).unwrap()
}

async fn seed_customer(store: &SqliteStore, key: &str, payload: Value) -> u64 {
    let commit = store.create_commit(None).await.unwrap();
    store
        .insert_entity("Customer", key, &fields(payload), commit, None)
        .await
        .unwrap();
    commit
}

#[tokio::test]
async fn commits_are_dense_and_ordered() {
    let store = store();
    assert_eq!(store.get_head_commit_id().await.unwrap(), None);
    let c1 = store.create_commit(None).await.unwrap();
    let c2 = store.create_commit(None).await.unwrap();
    assert_eq!((c1, c2), (1, 2));
    assert_eq!(store.get_head_commit_id().await.unwrap(), Some(2));

    let listed = store.list_commits(10, None).await.unwrap();
    assert_eq!(listed.iter().map(|c| c.id).collect::<Vec<_>>(), vec![2, 1]);
    let since = store.list_commits(10, Some(1)).await.unwrap();
    assert_eq!(since.iter().map(|c| c.id).collect::<Vec<_>>(), vec![2]);
}

#[tokio::test]
async fn commit_metadata_round_trips() {
    let store = store();
    let meta = std::collections::BTreeMap::from([("namespace".to_string(), "default".to_string())]);
    let id = store.create_commit(Some(meta.clone())).await.unwrap();
    let record = store.get_commit(id).await.unwrap().unwrap();
    assert_eq!(record.metadata, Some(meta));
    assert!(store.get_commit(999).await.unwrap().is_none());
}

#[tokio::test]
async fn latest_wins_per_identity() {
    let store = store();
    seed_customer(&store, "c1", json!({"id": "c1", "name": "Alice", "age": 30})).await;
    seed_customer(&store, "c1", json!({"id": "c1", "name": "Alice", "age": 31})).await;

    let latest = store.get_latest_entity("Customer", "c1").await.unwrap().unwrap();
    assert_eq!(latest.fields["age"], 31);
    assert_eq!(latest.commit_id, 2);

    let rows = store.query_entities("Customer", &QuerySpec::latest()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].fields["age"], 31);
}

#[tokio::test]
async fn temporal_windows() {
    let store = store();
    seed_customer(&store, "c1", json!({"id": "c1", "name": "Alice", "age": 30})).await;
    seed_customer(&store, "c1", json!({"id": "c1", "name": "Alice", "age": 31})).await;
    seed_customer(&store, "c2", json!({"id": "c2", "name": "Bob", "age": 40})).await;

    let as_of_1 = store
        .query_entities("Customer", &QuerySpec::latest().with_window(ReadWindow::AsOf(1)))
        .await
        .unwrap();
    assert_eq!(as_of_1.len(), 1);
    assert_eq!(as_of_1[0].fields["age"], 30);

    let history = store
        .query_entities("Customer", &QuerySpec::latest().with_window(ReadWindow::WithHistory))
        .await
        .unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.windows(2).all(|w| w[0].commit_id <= w[1].commit_id));

    let since = store
        .query_entities(
            "Customer",
            &QuerySpec::latest().with_window(ReadWindow::HistorySince(1)),
        )
        .await
        .unwrap();
    assert_eq!(since.len(), 2);
}

#[tokio::test]
async fn filters_compile_and_apply() {
    let store = store();
    seed_customer(
        &store,
        "c1",
        json!({"id": "c1", "name": "Alice", "age": 30, "tier": "Gold",
               "events": [{"kind": "click"}]}),
    )
    .await;
    seed_customer(
        &store,
        "c2",
        json!({"id": "c2", "name": "Bob", "age": 17, "tier": "Silver", "events": []}),
    )
    .await;

    let adults = store
        .query_entities("Customer", &QuerySpec::latest().with_filter(field("age").ge(18)))
        .await
        .unwrap();
    assert_eq!(adults.len(), 1);
    assert_eq!(adults[0].key, "c1");

    let gold_or_young = store
        .query_entities(
            "Customer",
            &QuerySpec::latest().with_filter(field("tier").eq("Gold").or(field("age").lt(18))),
        )
        .await
        .unwrap();
    assert_eq!(gold_or_young.len(), 2);

    let clickers = store
        .query_entities(
            "Customer",
            &QuerySpec::latest()
                .with_filter(field("events").any_path("kind").unwrap().eq("click")),
        )
        .await
        .unwrap();
    assert_eq!(clickers.len(), 1);
    assert_eq!(clickers[0].key, "c1");

    let liked = store
        .query_entities(
            "Customer",
            &QuerySpec::latest().with_filter(field("name").starts_with("Al")),
        )
        .await
        .unwrap();
    assert_eq!(liked.len(), 1);
}

#[tokio::test]
async fn order_limit_offset() {
    let store = store();
    for (key, age) in [("a", 3), ("b", 1), ("c", 2)] {
        seed_customer(&store, key, json!({"id": key, "name": key, "age": age})).await;
    }
    let spec = QuerySpec {
        order_by: Some("age".to_string()),
        limit: Some(2),
        offset: Some(1),
        ..QuerySpec::default()
    };
    let rows = store.query_entities("Customer", &spec).await.unwrap();
    assert_eq!(rows.iter().map(|r| r.fields["age"].clone()).collect::<Vec<_>>(), vec![
        json!(2),
        json!(3)
    ]);
}

#[tokio::test]
async fn aggregates_over_latest_view() {
    let store = store();
    seed_customer(&store, "c1", json!({"id": "c1", "age": 30, "tags": ["a", "b"]})).await;
    seed_customer(&store, "c2", json!({"id": "c2", "age": 40, "tags": []})).await;
    // A newer version of c1 replaces the old payload in aggregates.
    seed_customer(&store, "c1", json!({"id": "c1", "age": 32, "tags": ["a"]})).await;

    assert_eq!(store.count_entities("Customer", None).await.unwrap(), 2);
    assert_eq!(
        store
            .aggregate_entities("Customer", AggFunc::Sum, "age", None)
            .await
            .unwrap(),
        json!(72.0)
    );
    assert_eq!(
        store
            .aggregate_entities("Customer", AggFunc::Max, "age", None)
            .await
            .unwrap(),
        json!(40)
    );
    assert_eq!(
        store
            .aggregate_entities("Customer", AggFunc::AvgLen, "tags", None)
            .await
            .unwrap(),
        json!(0.5)
    );
}

#[tokio::test]
async fn group_by_with_having() {
    let store = store();
    for (key, tier, spend) in [
        ("c1", "Gold", 100),
        ("c2", "Gold", 50),
        ("c3", "Silver", 10),
    ] {
        seed_customer(&store, key, json!({"id": key, "tier": tier, "spend": spend})).await;
    }
    let rows = store
        .group_by_entities(
            "Customer",
            "tier",
            &[
                AggSpec::count("n"),
                AggSpec::new("total", AggFunc::Sum, "spend"),
            ],
            None,
            Some(&Having {
                alias: "total".to_string(),
                op: ontograph_core::CompareOp::Gt,
                value: json!(20),
            }),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["tier"], "Gold");
    assert_eq!(rows[0]["n"], json!(2));
    assert_eq!(rows[0]["total"], json!(150.0));
}

#[tokio::test]
async fn relations_keyed_by_instance_key() {
    let store = store();
    let commit = store.create_commit(None).await.unwrap();
    store
        .insert_relation("Purchased", "c1", "p1", "ord-1", &fields(json!({"qty": 1})), commit, None)
        .await
        .unwrap();
    store
        .insert_relation("Purchased", "c1", "p1", "ord-2", &fields(json!({"qty": 5})), commit, None)
        .await
        .unwrap();

    let rows = store
        .query_relations("Purchased", &EndpointTypes::default(), &QuerySpec::latest())
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);

    let one = store
        .get_latest_relation("Purchased", "c1", "p1", "ord-2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(one.fields["qty"], 5);
}

#[tokio::test]
async fn endpoint_filters_restrict_relations() {
    let store = store();
    let commit = store.create_commit(None).await.unwrap();
    store
        .insert_entity("Customer", "c1", &fields(json!({"id": "c1", "tier": "Gold"})), commit, None)
        .await
        .unwrap();
    store
        .insert_entity(
            "Customer",
            "c2",
            &fields(json!({"id": "c2", "tier": "Silver"})),
            commit,
            None,
        )
        .await
        .unwrap();
    store
        .insert_entity("Product", "p1", &fields(json!({"sku": "p1", "price": 10})), commit, None)
        .await
        .unwrap();
    let c2 = store.create_commit(None).await.unwrap();
    for left in ["c1", "c2"] {
        store
            .insert_relation("Purchased", left, "p1", "", &fields(json!({"qty": 1})), c2, None)
            .await
            .unwrap();
    }

    let endpoints = EndpointTypes::new("Customer", "Product");
    let gold_only = store
        .query_relations(
            "Purchased",
            &endpoints,
            &QuerySpec::latest().with_filter(ontograph_core::left_field("tier").eq("Gold")),
        )
        .await
        .unwrap();
    assert_eq!(gold_only.len(), 1);
    assert_eq!(gold_only[0].left_key, "c1");

    // Endpoint filters without the endpoint type are an error.
    let err = store
        .query_relations(
            "Purchased",
            &EndpointTypes::default(),
            &QuerySpec::latest().with_filter(ontograph_core::left_field("tier").eq("Gold")),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("left endpoint"));
}

#[tokio::test]
async fn schema_versions_are_dense_and_content_addressed() {
    let store = store();
    let tn = TypeName::entity("Customer");
    let v1 = store
        .create_schema_version(&tn, r#"{"fields":{}}"#, "hash-1", Some("rt-1"), Some("initial"))
        .await
        .unwrap();
    let v2 = store
        .create_schema_version(&tn, r#"{"fields":{"a":{}}}"#, "hash-2", Some("rt-1"), None)
        .await
        .unwrap();
    assert_eq!((v1, v2), (1, 2));

    let current = store.get_current_schema_version(&tn).await.unwrap().unwrap();
    assert_eq!(current.schema_version_id, 2);
    assert_eq!(current.schema_hash, "hash-2");

    let all = store.list_schema_versions(&tn).await.unwrap();
    assert_eq!(all.iter().map(|v| v.schema_version_id).collect::<Vec<_>>(), vec![1, 2]);
}

#[tokio::test]
async fn v2_inserts_reject_stale_schema_versions() {
    let store = store();
    let tn = TypeName::entity("Customer");
    store
        .create_schema_version(&tn, r#"{"fields":{}}"#, "h1", None, Some("initial"))
        .await
        .unwrap();
    store
        .create_schema_version(&tn, r#"{"fields":{"a":{}}}"#, "h2", None, Some("migration"))
        .await
        .unwrap();

    let commit = store.create_commit(None).await.unwrap();
    let err = store
        .insert_entity("Customer", "c1", &fields(json!({"id": "c1"})), commit, Some(1))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("schema_version_id mismatch"));

    store
        .insert_entity("Customer", "c1", &fields(json!({"id": "c1"})), commit, Some(2))
        .await
        .unwrap();
}

#[tokio::test]
async fn activation_boundary_hides_older_versions() {
    let store = store();
    let tn = TypeName::entity("Customer");
    store
        .create_schema_version(&tn, r#"{"fields":{}}"#, "h1", None, Some("initial"))
        .await
        .unwrap();
    // v1 row at commit 1; activation follows the insert.
    seed_customer(&store, "c1", json!({"id": "c1", "name": "Alice"})).await;

    // New version activated at commit 2 with the row rewritten.
    store
        .create_schema_version(&tn, r#"{"fields":{"age":{}}}"#, "h2", None, Some("migration"))
        .await
        .unwrap();
    let c2 = store.create_commit(None).await.unwrap();
    store
        .insert_entity(
            "Customer",
            "c1",
            &fields(json!({"id": "c1", "name": "Alice", "age": 30})),
            c2,
            Some(2),
        )
        .await
        .unwrap();
    store.activate_schema_version(&tn, 2, c2).await.unwrap();

    // as_of before the activation commit: empty plus a diagnostic.
    let before = store
        .query_entities("Customer", &QuerySpec::latest().with_window(ReadWindow::AsOf(1)))
        .await
        .unwrap();
    assert!(before.is_empty());
    let diag = store.last_query_diagnostics().unwrap();
    assert_eq!(diag.reason, DiagnosticReason::CommitBeforeActivation);
    assert_eq!(diag.activation_commit_id, 2);

    // at/after activation: only rows carrying the current version.
    let after = store
        .query_entities("Customer", &QuerySpec::latest().with_window(ReadWindow::AsOf(2)))
        .await
        .unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].schema_version_id, Some(2));

    let latest = store.query_entities("Customer", &QuerySpec::latest()).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].fields["age"], 30);

    // History reads lift their lower bound to the activation boundary.
    let history = store
        .query_entities("Customer", &QuerySpec::latest().with_window(ReadWindow::WithHistory))
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].schema_version_id, Some(2));
}

#[tokio::test]
async fn dropped_types_read_empty_and_restart_lineage() {
    let store = store();
    let tn = TypeName::entity("Customer");
    store
        .create_schema_version(&tn, r#"{"fields":{}}"#, "h1", None, Some("initial"))
        .await
        .unwrap();
    seed_customer(&store, "c1", json!({"id": "c1"})).await;

    store.apply_schema_drop(&[tn.clone()], false, None).await.unwrap();
    assert!(store.get_latest_entity("Customer", "c1").await.unwrap().is_none());
    assert!(store
        .query_entities("Customer", &QuerySpec::latest())
        .await
        .unwrap()
        .is_empty());
    assert!(store.get_current_schema_version(&tn).await.unwrap().is_none());

    // Re-creating the type starts a fresh lineage at 1.
    let vid = store
        .create_schema_version(&tn, r#"{"fields":{}}"#, "h1", None, Some("initial"))
        .await
        .unwrap();
    assert_eq!(vid, 1);
    assert!(store.get_current_schema_version(&tn).await.unwrap().is_some());
}

#[tokio::test]
async fn purge_history_removes_rows() {
    let store = store();
    seed_customer(&store, "c1", json!({"id": "c1"})).await;
    let tn = TypeName::entity("Customer");
    store.apply_schema_drop(&[tn.clone()], true, None).await.unwrap();

    // Even after re-creation the purged history is gone.
    store
        .create_schema_version(&tn, r#"{"fields":{}}"#, "h1", None, Some("initial"))
        .await
        .unwrap();
    assert!(store.get_latest_entity("Customer", "c1").await.unwrap().is_none());
}

#[tokio::test]
async fn write_lock_contention_and_takeover() {
    let store = store();
    assert!(store.acquire_lock("owner-a", 100, 30_000).await.unwrap());
    // Second acquirer times out while the lease is live.
    assert!(!store.acquire_lock("owner-b", 50, 30_000).await.unwrap());

    // Renewal slides the expiry; only the owner can renew.
    assert!(store.renew_lock("owner-a", 30_000).await.unwrap());
    assert!(!store.renew_lock("owner-b", 30_000).await.unwrap());

    store.release_lock("owner-a").await.unwrap();
    assert!(store.acquire_lock("owner-b", 100, 10).await.unwrap());

    // An expired lease can be taken over.
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    assert!(store.acquire_lock("owner-c", 100, 30_000).await.unwrap());
}

#[tokio::test]
async fn commit_changes_inferred_operations() {
    let store = store();
    seed_customer(&store, "c1", json!({"id": "c1", "age": 1})).await;
    let c2 = seed_customer(&store, "c1", json!({"id": "c1", "age": 2})).await;

    let changes = store.list_commit_changes(c2).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].operation, ontograph_store::ChangeOp::UpdateVersion);
    assert_eq!(store.count_commit_operations(c2).await.unwrap(), 1);
}

#[tokio::test]
async fn transactions_roll_back_cleanly() {
    let store = store();
    store.begin_transaction().await.unwrap();
    let commit = store.create_commit(None).await.unwrap();
    store
        .insert_entity("Customer", "c1", &fields(json!({"id": "c1"})), commit, None)
        .await
        .unwrap();
    store.rollback_transaction().await.unwrap();

    assert_eq!(store.get_head_commit_id().await.unwrap(), None);
    assert!(store.get_latest_entity("Customer", "c1").await.unwrap().is_none());
}

#[tokio::test]
async fn latest_pages_iterate_in_key_order() {
    let store = store();
    for key in ["b", "a", "c"] {
        seed_customer(&store, key, json!({"id": key})).await;
    }
    let page1 = store.latest_entities_page("Customer", 0, 2).await.unwrap();
    let page2 = store.latest_entities_page("Customer", 2, 2).await.unwrap();
    assert_eq!(page1.iter().map(|r| r.key.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    assert_eq!(page2.iter().map(|r| r.key.as_str()).collect::<Vec<_>>(), vec!["c"]);
}
