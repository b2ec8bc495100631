//! Event store contract tests, run against both backends.
//!
//! Any conforming implementation must pass these: claim ordering and
//! exclusivity, ack, release with backoff, dead-lettering after the retry
//! budget, namespace isolation, cleanup retention and replay.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use ontograph_core::{
    EventPayload, EventRecord, EventStatus, OntologyConfig,
};
use ontograph_store::{EventStore, MemoryObjectClient, ObjectClient, ObjectStore, SqliteStore};

#[derive(Debug, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: String,
}

impl EventPayload for OrderPlaced {
    const EVENT_TYPE: &'static str = "OrderPlaced";
}

#[derive(Debug, Serialize, Deserialize)]
struct Ping;

impl EventPayload for Ping {
    const EVENT_TYPE: &'static str = "Ping";
}

fn test_config() -> OntologyConfig {
    OntologyConfig {
        event_max_attempts: 3,
        event_backoff_base_ms: 10,
        event_backoff_max_ms: 50,
        ..OntologyConfig::default()
    }
}

fn sqlite_store() -> Arc<dyn EventStore> {
    Arc::new(SqliteStore::open(":memory:", test_config()).unwrap())
}

async fn object_store() -> Arc<dyn EventStore> {
    let client = Arc::new(MemoryObjectClient::new()) as Arc<dyn ObjectClient>;
    let store = ObjectStore::new(client, "bucket", "", test_config());
    store.initialize(None).await.unwrap();
    Arc::new(store)
}

async fn both_stores() -> Vec<(&'static str, Arc<dyn EventStore>)> {
    vec![("sqlite", sqlite_store()), ("object", object_store().await)]
}

fn order_event(order_id: &str) -> EventRecord {
    EventRecord::new(&OrderPlaced { order_id: order_id.to_string() }).unwrap()
}

#[tokio::test]
async fn claim_orders_by_priority_then_age() {
    for (name, store) in both_stores().await {
        let low = order_event("low").with_priority(10);
        let high = order_event("high").with_priority(200);
        let normal = order_event("normal");
        for event in [&low, &normal, &high] {
            store.enqueue(event, "ns").await.unwrap();
        }

        let claimed = store
            .claim("ns", "handler", "session", &["OrderPlaced".to_string()], 10, 30_000)
            .await
            .unwrap();
        let ids: Vec<&str> = claimed.iter().map(|c| c.event.id.as_str()).collect();
        assert_eq!(ids, vec![high.id.as_str(), normal.id.as_str(), low.id.as_str()], "{name}");
    }
}

#[tokio::test]
async fn claims_are_exclusive_while_leased() {
    for (name, store) in both_stores().await {
        store.enqueue(&order_event("o1"), "ns").await.unwrap();

        let first = store
            .claim("ns", "handler", "session-a", &["OrderPlaced".to_string()], 10, 30_000)
            .await
            .unwrap();
        assert_eq!(first.len(), 1, "{name}");

        // Same handler in another session cannot reclaim under the lease.
        let second = store
            .claim("ns", "handler", "session-b", &["OrderPlaced".to_string()], 10, 30_000)
            .await
            .unwrap();
        assert!(second.is_empty(), "{name}");

        // A different handler gets its own claim on the same event.
        let other = store
            .claim("ns", "other-handler", "session-b", &["OrderPlaced".to_string()], 10, 30_000)
            .await
            .unwrap();
        assert_eq!(other.len(), 1, "{name}");
    }
}

#[tokio::test]
async fn expired_leases_can_be_reclaimed() {
    for (name, store) in both_stores().await {
        store.enqueue(&order_event("o1"), "ns").await.unwrap();
        let first = store
            .claim("ns", "handler", "session-a", &["OrderPlaced".to_string()], 10, 10)
            .await
            .unwrap();
        assert_eq!(first.len(), 1, "{name}");

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let second = store
            .claim("ns", "handler", "session-b", &["OrderPlaced".to_string()], 10, 30_000)
            .await
            .unwrap();
        assert_eq!(second.len(), 1, "{name}");
    }
}

#[tokio::test]
async fn acked_events_are_not_reclaimed() {
    for (name, store) in both_stores().await {
        let event = order_event("o1");
        store.enqueue(&event, "ns").await.unwrap();
        store
            .claim("ns", "handler", "session", &["OrderPlaced".to_string()], 10, 30_000)
            .await
            .unwrap();
        store.ack("handler", &event.id, "ns").await.unwrap();

        let again = store
            .claim("ns", "handler", "session", &["OrderPlaced".to_string()], 10, 30_000)
            .await
            .unwrap();
        assert!(again.is_empty(), "{name}");

        let listed = store.list_events("ns", 10).await.unwrap();
        assert_eq!(listed[0].status, EventStatus::Acked, "{name}");
    }
}

#[tokio::test]
async fn release_applies_backoff_before_retry() {
    for (name, store) in both_stores().await {
        let event = order_event("o1");
        store.enqueue(&event, "ns").await.unwrap();
        store
            .claim("ns", "handler", "session", &["OrderPlaced".to_string()], 10, 30_000)
            .await
            .unwrap();
        store
            .release("handler", &event.id, "ns", Some("boom"))
            .await
            .unwrap();

        // Immediately after release the event is backing off.
        let immediate = store
            .claim("ns", "handler", "session", &["OrderPlaced".to_string()], 10, 30_000)
            .await
            .unwrap();
        assert!(immediate.is_empty(), "{name}");

        // Base 10ms * 2^1 + <=100ms jitter: eligible again shortly.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let retried = store
            .claim("ns", "handler", "session", &["OrderPlaced".to_string()], 10, 30_000)
            .await
            .unwrap();
        assert_eq!(retried.len(), 1, "{name}");

        let inspection = store.inspect_event(&event.id, Some("ns")).await.unwrap().unwrap();
        assert_eq!(inspection.claims.len(), 1, "{name}");
        assert_eq!(inspection.claims[0].attempts, 1, "{name}");
        assert_eq!(inspection.claims[0].last_error.as_deref(), Some("boom"), "{name}");
    }
}

#[tokio::test]
async fn exhausted_retries_dead_letter_exactly_once() {
    for (name, store) in both_stores().await {
        let event = order_event("o1");
        store.enqueue(&event, "ns").await.unwrap();

        // event_max_attempts = 3: three releases exhaust the budget.
        for attempt in 1..=3 {
            let claimed = store
                .claim("ns", "handler", "session", &["OrderPlaced".to_string()], 10, 10)
                .await
                .unwrap();
            assert_eq!(claimed.len(), 1, "{name} attempt {attempt}");
            store
                .release("handler", &event.id, "ns", Some("still failing"))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }

        let dead = store.list_dead_letters("ns", 10).await.unwrap();
        assert_eq!(dead.len(), 1, "{name}");
        assert_eq!(dead[0].event_id, event.id, "{name}");
        assert_eq!(dead[0].attempts, 3, "{name}");

        // An EventDeadLetter successor is enqueued with depth + 1.
        let successors = store
            .claim("ns", "dlq-handler", "session", &["EventDeadLetter".to_string()], 10, 30_000)
            .await
            .unwrap();
        assert_eq!(successors.len(), 1, "{name}");
        let successor = &successors[0].event;
        assert_eq!(successor.chain_depth, event.chain_depth + 1, "{name}");
        assert_eq!(successor.root_event_id, event.root_event_id, "{name}");
        assert_eq!(successor.payload["event_id"], json!(event.id), "{name}");

        // The original never comes back.
        let again = store
            .claim("ns", "handler", "session", &["OrderPlaced".to_string()], 10, 30_000)
            .await
            .unwrap();
        assert!(again.is_empty(), "{name}");
    }
}

#[tokio::test]
async fn namespaces_are_isolated() {
    for (name, store) in both_stores().await {
        store.enqueue(&order_event("oa"), "ns-a").await.unwrap();

        let from_b = store
            .claim("ns-b", "handler", "session", &["OrderPlaced".to_string()], 10, 30_000)
            .await
            .unwrap();
        assert!(from_b.is_empty(), "{name}");

        let from_a = store
            .claim("ns-a", "handler", "session", &["OrderPlaced".to_string()], 10, 30_000)
            .await
            .unwrap();
        assert_eq!(from_a.len(), 1, "{name}");
    }
}

#[tokio::test]
async fn sessions_register_heartbeat_and_expire() {
    for (name, store) in both_stores().await {
        let metadata = std::collections::BTreeMap::from([(
            "hostname".to_string(),
            json!("test-host"),
        )]);
        store.register_session("s1", "ns", &metadata).await.unwrap();
        store.heartbeat("s1", "ns").await.unwrap();

        let sessions = store.list_sessions("ns", 60_000).await.unwrap();
        assert_eq!(sessions.len(), 1, "{name}");
        assert!(!sessions[0].is_dead, "{name}");

        // A tiny TTL makes the same session count as dead.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let expired = store.list_sessions("ns", 1).await.unwrap();
        assert!(expired[0].is_dead, "{name}");
    }
}

#[tokio::test]
async fn list_namespaces_aggregates_queues() {
    for (name, store) in both_stores().await {
        store.enqueue(&order_event("o1"), "ns-a").await.unwrap();
        store.enqueue(&order_event("o2"), "ns-a").await.unwrap();
        store
            .register_session("s1", "ns-b", &std::collections::BTreeMap::new())
            .await
            .unwrap();

        let namespaces = store.list_namespaces(60_000).await.unwrap();
        let ns_a = namespaces.iter().find(|n| n.namespace == "ns-a").unwrap();
        assert_eq!(ns_a.pending_events, 2, "{name}");
        let ns_b = namespaces.iter().find(|n| n.namespace == "ns-b").unwrap();
        assert_eq!(ns_b.sessions, 1, "{name}");
    }
}

#[tokio::test]
async fn cleanup_preserves_dead_letters() {
    for (name, store) in both_stores().await {
        let doomed = order_event("doomed");
        store.enqueue(&doomed, "ns").await.unwrap();
        for _ in 0..3 {
            store
                .claim("ns", "handler", "session", &["OrderPlaced".to_string()], 10, 10)
                .await
                .unwrap();
            store.release("handler", &doomed.id, "ns", Some("x")).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
        assert_eq!(store.list_dead_letters("ns", 10).await.unwrap().len(), 1, "{name}");

        // Everything enqueued so far is older than the cutoff.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let removed = store.cleanup_events("ns", Utc::now()).await.unwrap();
        assert!(removed >= 1, "{name}");
        assert!(store.list_events("ns", 10).await.unwrap().is_empty(), "{name}");

        // Dead-letter records survive event retention.
        assert_eq!(store.list_dead_letters("ns", 10).await.unwrap().len(), 1, "{name}");
    }
}

#[tokio::test]
async fn replay_creates_a_fresh_root_event() {
    for (name, store) in both_stores().await {
        let original = order_event("o1");
        store.enqueue(&original, "ns").await.unwrap();

        let new_id = store.replay_event("ns", &original.id).await.unwrap();
        assert_ne!(new_id, original.id, "{name}");

        let inspected = store.inspect_event(&new_id, Some("ns")).await.unwrap().unwrap();
        assert_eq!(inspected.event.chain_depth, 0, "{name}");
        assert_eq!(inspected.event.root_event_id, new_id, "{name}");
        assert_eq!(inspected.event.payload, original.payload, "{name}");

        assert!(store.replay_event("ns", "missing").await.is_err(), "{name}");
    }
}

#[tokio::test]
async fn claim_respects_limit_and_type_subscription() {
    for (name, store) in both_stores().await {
        for i in 0..5 {
            store.enqueue(&order_event(&format!("o{i}")), "ns").await.unwrap();
        }
        store.enqueue(&EventRecord::new(&Ping).unwrap(), "ns").await.unwrap();

        let claimed = store
            .claim("ns", "handler", "session", &["OrderPlaced".to_string()], 3, 30_000)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 3, "{name}");
        assert!(claimed.iter().all(|c| c.event.event_type == "OrderPlaced"), "{name}");

        let none = store
            .claim("ns", "handler", "session", &[], 10, 30_000)
            .await
            .unwrap();
        assert!(none.is_empty(), "{name}");
    }
}
