//! Object backend tests against the in-memory object client.
//!
//! Covers initialization, the publish path (segments + manifest + head
//! CAS), head-mismatch detection, the leased lock object and the
//! advisory indices.

use serde_json::{json, Map, Value};
use std::sync::Arc;

use ontograph_core::{field, OntoError, OntologyConfig, TypeName};
use ontograph_store::{
    DiagnosticReason, EndpointTypes, MemoryObjectClient, ObjectClient, ObjectStore, PutCondition,
    QuerySpec, ReadWindow, Repository,
};

fn fields(value: Value) -> Map<String, Value> {
    serde_json::from_value(value).unwrap()
}

async fn initialized_store() -> (ObjectStore, Arc<MemoryObjectClient>) {
    let client = Arc::new(MemoryObjectClient::new());
    let store = ObjectStore::new(
        Arc::clone(&client) as Arc<dyn ObjectClient>,
        "bucket",
        "prefix",
        OntologyConfig::default(),
    );
    store.initialize(None).await.unwrap();
    (store, client)
}

async fn commit_customer(store: &ObjectStore, key: &str, payload: Value) -> u64 {
    assert!(store.acquire_lock("writer", 1_000, 30_000).await.unwrap());
    store.begin_transaction().await.unwrap();
    let commit = store.create_commit(None).await.unwrap();
    store
        .insert_entity("Customer", key, &fields(payload), commit, None)
        .await
        .unwrap();
    store.commit_transaction().await.unwrap();
    store.release_lock("writer").await.unwrap();
    commit
}

#[tokio::test]
async fn uninitialized_store_is_an_error() {
    let client = Arc::new(MemoryObjectClient::new());
    let store = ObjectStore::new(client, "bucket", "", OntologyConfig::default());
    let err = store.get_head_commit_id().await.unwrap_err();
    assert!(matches!(err, OntoError::UninitializedStorage(_)));
}

#[tokio::test]
async fn reinitialization_requires_confirmation() {
    let (store, _) = initialized_store().await;
    assert!(store.initialize(None).await.is_err());
    store.initialize(Some("reinitialize")).await.unwrap();
}

#[tokio::test]
async fn initialize_writes_meta_layout() {
    let (_, client) = initialized_store().await;
    for key in [
        "prefix/meta/head.json",
        "prefix/meta/engine.json",
        "prefix/meta/schema/registry.json",
        "prefix/meta/schema/types.json",
    ] {
        assert!(client.get(key).await.unwrap().is_some(), "missing {key}");
    }
}

#[tokio::test]
async fn publish_writes_segments_manifest_and_head() {
    let (store, client) = initialized_store().await;
    let commit = commit_customer(&store, "c1", json!({"id": "c1", "age": 30})).await;
    assert_eq!(commit, 1);
    assert_eq!(store.get_head_commit_id().await.unwrap(), Some(1));

    let keys = client.list("prefix/commits/").await.unwrap();
    assert!(keys.iter().any(|k| k.ends_with("manifest.json")));
    assert!(keys.iter().any(|k| k.contains("/entities/Customer")));

    let latest = store.get_latest_entity("Customer", "c1").await.unwrap().unwrap();
    assert_eq!(latest.fields["age"], 30);
    assert_eq!(latest.commit_id, 1);
}

#[tokio::test]
async fn manifest_chain_links_parents() {
    let (store, _) = initialized_store().await;
    commit_customer(&store, "c1", json!({"id": "c1", "age": 30})).await;
    commit_customer(&store, "c1", json!({"id": "c1", "age": 31})).await;

    let commits = store.list_commits(10, None).await.unwrap();
    assert_eq!(commits.iter().map(|c| c.id).collect::<Vec<_>>(), vec![2, 1]);

    let latest = store.query_entities("Customer", &QuerySpec::latest()).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].fields["age"], 31);

    let as_of = store
        .query_entities("Customer", &QuerySpec::latest().with_window(ReadWindow::AsOf(1)))
        .await
        .unwrap();
    assert_eq!(as_of[0].fields["age"], 30);

    let history = store
        .query_entities("Customer", &QuerySpec::latest().with_window(ReadWindow::WithHistory))
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn concurrent_head_movement_is_a_head_mismatch() {
    let (store, client) = initialized_store().await;
    assert!(store.acquire_lock("writer", 1_000, 30_000).await.unwrap());
    store.begin_transaction().await.unwrap();
    let commit = store.create_commit(None).await.unwrap();
    store
        .insert_entity("Customer", "c1", &fields(json!({"id": "c1"})), commit, None)
        .await
        .unwrap();

    // A concurrent writer rewrites head between plan and CAS; the stored
    // commit id is unchanged but the ETag moves.
    let (head_bytes, _) = client.get("prefix/meta/head.json").await.unwrap().unwrap();
    client
        .put("prefix/meta/head.json", head_bytes, PutCondition::None)
        .await
        .unwrap();

    let err = store.commit_transaction().await.unwrap_err();
    assert!(matches!(err, OntoError::HeadMismatch));
    store.release_lock("writer").await.unwrap();
}

#[tokio::test]
async fn commits_require_the_write_lock() {
    let (store, _) = initialized_store().await;
    store.begin_transaction().await.unwrap();
    let err = store.create_commit(None).await.unwrap_err();
    assert!(err.to_string().contains("write lock"));
}

#[tokio::test]
async fn lock_object_honors_leases() {
    let (store, _) = initialized_store().await;
    assert!(store.acquire_lock("owner-a", 200, 30_000).await.unwrap());
    assert!(!store.acquire_lock("owner-b", 50, 30_000).await.unwrap());

    assert!(store.renew_lock("owner-a", 30_000).await.unwrap());
    store.release_lock("owner-a").await.unwrap();

    // Expired leases are stolen with a conditional replace.
    assert!(store.acquire_lock("owner-b", 200, 10).await.unwrap());
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    assert!(store.acquire_lock("owner-c", 200, 30_000).await.unwrap());
}

#[tokio::test]
async fn filters_and_endpoint_predicates() {
    let (store, _) = initialized_store().await;
    assert!(store.acquire_lock("writer", 1_000, 30_000).await.unwrap());
    store.begin_transaction().await.unwrap();
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
        .insert_relation("Purchased", "c1", "p1", "", &fields(json!({"qty": 2})), commit, None)
        .await
        .unwrap();
    store
        .insert_relation("Purchased", "c2", "p1", "", &fields(json!({"qty": 9})), commit, None)
        .await
        .unwrap();
    store.commit_transaction().await.unwrap();
    store.release_lock("writer").await.unwrap();

    let filtered = store
        .query_entities("Customer", &QuerySpec::latest().with_filter(field("tier").eq("Gold")))
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);

    let endpoints = EndpointTypes::new("Customer", "Product");
    let gold_purchases = store
        .query_relations(
            "Purchased",
            &endpoints,
            &QuerySpec::latest().with_filter(ontograph_core::left_field("tier").eq("Gold")),
        )
        .await
        .unwrap();
    assert_eq!(gold_purchases.len(), 1);
    assert_eq!(gold_purchases[0].left_key, "c1");
}

#[tokio::test]
async fn indices_accelerate_but_chain_is_authoritative() {
    let (store, client) = initialized_store().await;
    commit_customer(&store, "c1", json!({"id": "c1", "age": 1})).await;
    commit_customer(&store, "c2", json!({"id": "c2", "age": 2})).await;

    let (index, _) = client
        .get("prefix/meta/indices/entities/Customer.json")
        .await
        .unwrap()
        .unwrap();
    let index: Value = serde_json::from_slice(&index).unwrap();
    assert_eq!(index["max_indexed_commit"], 2);
    assert_eq!(index["entries"].as_array().unwrap().len(), 2);

    // A stale index must not hide rows.
    client
        .put(
            "prefix/meta/indices/entities/Customer.json",
            serde_json::to_vec(&json!({
                "type_name": "Customer",
                "max_indexed_commit": 1,
                "entries": [],
            }))
            .unwrap(),
            PutCondition::None,
        )
        .await
        .unwrap();
    let rows = store.query_entities("Customer", &QuerySpec::latest()).await.unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn activation_boundary_on_object_backend() {
    let (store, _) = initialized_store().await;
    let tn = TypeName::entity("Customer");
    store
        .create_schema_version(&tn, r#"{"fields":{}}"#, "h1", None, Some("initial"))
        .await
        .unwrap();
    commit_customer(&store, "c1", json!({"id": "c1", "name": "Alice"})).await;

    store
        .create_schema_version(&tn, r#"{"fields":{"age":{}}}"#, "h2", None, Some("migration"))
        .await
        .unwrap();
    assert!(store.acquire_lock("writer", 1_000, 30_000).await.unwrap());
    store.begin_transaction().await.unwrap();
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
    store.commit_transaction().await.unwrap();
    store.release_lock("writer").await.unwrap();

    let before = store
        .query_entities("Customer", &QuerySpec::latest().with_window(ReadWindow::AsOf(1)))
        .await
        .unwrap();
    assert!(before.is_empty());
    let diag = store.last_query_diagnostics().unwrap();
    assert_eq!(diag.reason, DiagnosticReason::CommitBeforeActivation);

    let latest = store.query_entities("Customer", &QuerySpec::latest()).await.unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].fields["age"], 30);
}

#[tokio::test]
async fn dropped_types_read_empty() {
    let (store, _) = initialized_store().await;
    let tn = TypeName::entity("Customer");
    store
        .create_schema_version(&tn, r#"{"fields":{}}"#, "h1", None, Some("initial"))
        .await
        .unwrap();
    commit_customer(&store, "c1", json!({"id": "c1"})).await;

    assert!(store.acquire_lock("writer", 1_000, 30_000).await.unwrap());
    store.apply_schema_drop(&[tn.clone()], false, None).await.unwrap();
    store.release_lock("writer").await.unwrap();

    assert!(store.get_latest_entity("Customer", "c1").await.unwrap().is_none());
    assert!(store.get_current_schema_version(&tn).await.unwrap().is_none());

    let vid = store
        .create_schema_version(&tn, r#"{"fields":{}}"#, "h1", None, Some("initial"))
        .await
        .unwrap();
    assert_eq!(vid, 1);
}
