//! Handler loop semantics: dispatch ordering, ack-then-flush, retries,
//! dead-lettering and chain-depth guards.

mod common;

use common::*;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ontograph_core::{EventRecord, OntologyConfig};
use ontograph_runtime::{EventHandler, HandlerContext, Session};
use ontograph_store::{EventStore, Repository};

struct CountingHandler {
    id: String,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl EventHandler for CountingHandler {
    fn handler_id(&self) -> String {
        self.id.clone()
    }

    fn event_type(&self) -> String {
        "OrderPlaced".to_string()
    }

    async fn handle(&self, _ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FailingHandler {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl EventHandler for FailingHandler {
    fn handler_id(&self) -> String {
        "tests.failing".to_string()
    }

    fn event_type(&self) -> String {
        "OrderPlaced".to_string()
    }

    async fn handle(&self, _ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("handler exploded")
    }
}

struct WritingHandler;

#[async_trait]
impl EventHandler for WritingHandler {
    fn handler_id(&self) -> String {
        "tests.writing".to_string()
    }

    fn event_type(&self) -> String {
        "OrderPlaced".to_string()
    }

    async fn handle(&self, ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
        let order_id = ctx.event.decode::<OrderPlaced>()?.order_id;
        ctx.ensure(&customer(&order_id, "FromHandler", 1))?;
        let follow_up = EventRecord::new(&OrderShipped { order_id })?;
        ctx.commit(Some(follow_up)).await?;
        Ok(())
    }
}

struct EmittingHandler;

#[async_trait]
impl EventHandler for EmittingHandler {
    fn handler_id(&self) -> String {
        "tests.emitting".to_string()
    }

    fn event_type(&self) -> String {
        "OrderPlaced".to_string()
    }

    async fn handle(&self, ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
        let order_id = ctx.event.decode::<OrderPlaced>()?.order_id;
        ctx.emit(EventRecord::new(&OrderShipped { order_id })?);
        Ok(())
    }
}

struct OrderProbe {
    id: String,
    priority: i64,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl EventHandler for OrderProbe {
    fn handler_id(&self) -> String {
        self.id.clone()
    }

    fn event_type(&self) -> String {
        "OrderPlaced".to_string()
    }

    fn priority(&self) -> i64 {
        self.priority
    }

    async fn handle(&self, _ctx: &mut HandlerContext<'_>) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(self.id.clone());
        Ok(())
    }
}

async fn enqueue_order(ontology: &Arc<ontograph_runtime::Ontology>, order_id: &str) {
    let event = EventRecord::new(&OrderPlaced { order_id: order_id.to_string() }).unwrap();
    ontology.backend().enqueue(&event, "default").await.unwrap();
}

#[tokio::test]
async fn handlers_process_and_ack_events() {
    let ontology = ontology();
    enqueue_order(&ontology, "ord-1").await;

    let calls = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(CountingHandler { id: "tests.counting".into(), calls: Arc::clone(&calls) });

    let mut session = session(&ontology);
    session.run(vec![handler], vec![], Some(2)).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let events = ontology.backend().list_events("default", 10).await.unwrap();
    assert_eq!(events[0].status, ontograph_core::EventStatus::Acked);
}

#[tokio::test]
async fn duplicate_handler_ids_are_rejected() {
    let ontology = ontology();
    let calls = Arc::new(AtomicUsize::new(0));
    let a = Arc::new(CountingHandler { id: "tests.dup".into(), calls: Arc::clone(&calls) });
    let b = Arc::new(CountingHandler { id: "tests.dup".into(), calls });

    let mut session = session(&ontology);
    let err = session.run(vec![a, b], vec![], Some(1)).await.unwrap_err();
    assert!(err.to_string().contains("duplicate handler"));
}

#[tokio::test]
async fn handlers_dispatch_by_priority_then_id() {
    let ontology = ontology();
    enqueue_order(&ontology, "ord-1").await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let low = Arc::new(OrderProbe { id: "a.low".into(), priority: 10, log: Arc::clone(&log) });
    let high = Arc::new(OrderProbe { id: "z.high".into(), priority: 200, log: Arc::clone(&log) });
    let mid_b = Arc::new(OrderProbe { id: "b.mid".into(), priority: 100, log: Arc::clone(&log) });
    let mid_a = Arc::new(OrderProbe { id: "a.mid".into(), priority: 100, log: Arc::clone(&log) });

    let mut session = session(&ontology);
    session
        .run(vec![low, high, mid_b, mid_a], vec![], Some(1))
        .await
        .unwrap();

    assert_eq!(
        log.lock().unwrap().clone(),
        vec!["z.high", "a.mid", "b.mid", "a.low"]
    );
}

#[tokio::test]
async fn failing_handlers_retry_then_dead_letter() {
    // fast_config: 3 attempts, 5ms base backoff.
    let ontology = ontology();
    enqueue_order(&ontology, "ord-1").await;

    let calls = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(FailingHandler { calls: Arc::clone(&calls) });

    let mut session = session(&ontology);
    // Enough iterations for three failed attempts across backoffs.
    session.run(vec![handler], vec![], Some(80)).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let dead = ontology.backend().list_dead_letters("default", 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].last_error.contains("handler exploded"));

    // Exactly one EventDeadLetter successor with depth + 1.
    let events = ontology.backend().list_events("default", 10).await.unwrap();
    let dlq: Vec<_> = events.iter().filter(|e| e.event_type == "EventDeadLetter").collect();
    assert_eq!(dlq.len(), 1);
}

#[tokio::test]
async fn handler_commit_with_event_chains_depth() {
    let ontology = ontology();
    enqueue_order(&ontology, "ord-1").await;

    let mut session = session(&ontology);
    session.run(vec![Arc::new(WritingHandler)], vec![], Some(2)).await.unwrap();

    // The handler's entity write landed.
    assert!(ontology
        .backend()
        .get_latest_entity("Customer", "ord-1")
        .await
        .unwrap()
        .is_some());

    // The follow-up event is a child of the original.
    let events = ontology.backend().list_events("default", 10).await.unwrap();
    let shipped = events.iter().find(|e| e.event_type == "OrderShipped").unwrap();
    let original = events.iter().find(|e| e.event_type == "OrderPlaced").unwrap();
    let inspected = ontology
        .backend()
        .inspect_event(&shipped.id, Some("default"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inspected.event.chain_depth, 1);
    assert_eq!(inspected.event.root_event_id, original.id);
}

#[tokio::test]
async fn chain_depth_limit_aborts_handler_commit() {
    let config = OntologyConfig { max_event_chain_depth: 0, ..fast_config() };
    let ontology = ontology_with(config);
    enqueue_order(&ontology, "ord-1").await;

    let mut session = session(&ontology);
    session.run(vec![Arc::new(WritingHandler)], vec![], Some(2)).await.unwrap();

    // The commit aborted: no row, claim released with the loop-limit error.
    assert!(ontology
        .backend()
        .get_latest_entity("Customer", "ord-1")
        .await
        .unwrap()
        .is_none());
    let events = ontology.backend().list_events("default", 10).await.unwrap();
    let original = events.iter().find(|e| e.event_type == "OrderPlaced").unwrap();
    let inspected = ontology
        .backend()
        .inspect_event(&original.id, Some("default"))
        .await
        .unwrap()
        .unwrap();
    assert!(inspected.claims[0]
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("chain depth"));
}

#[tokio::test]
async fn emitted_events_flush_after_ack() {
    let ontology = ontology();
    enqueue_order(&ontology, "ord-1").await;

    let mut session = session(&ontology);
    session.run(vec![Arc::new(EmittingHandler)], vec![], Some(2)).await.unwrap();

    let events = ontology.backend().list_events("default", 10).await.unwrap();
    let original = events.iter().find(|e| e.event_type == "OrderPlaced").unwrap();
    assert_eq!(original.status, ontograph_core::EventStatus::Acked);

    let shipped = events.iter().find(|e| e.event_type == "OrderShipped").unwrap();
    let inspected = ontology
        .backend()
        .inspect_event(&shipped.id, Some("default"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inspected.event.chain_depth, 1);
}

#[tokio::test]
async fn sessions_register_and_heartbeat() {
    let ontology = ontology();
    let mut session = session(&ontology);
    let session_id = session.session_id().to_string();
    session.run(vec![], vec![], Some(1)).await.unwrap();

    let sessions = ontology.backend().list_sessions("default", 60_000).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].record.session_id, session_id);
    assert!(sessions[0].record.metadata.contains_key("hostname"));
}

#[tokio::test]
async fn namespace_isolation_between_sessions() {
    let ontology = ontology();
    let event = EventRecord::new(&OrderPlaced { order_id: "ord-a".into() }).unwrap();
    ontology.backend().enqueue(&event, "ns-a").await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(CountingHandler { id: "tests.iso".into(), calls: Arc::clone(&calls) });

    // A session in ns-b never sees events enqueued in ns-a.
    let mut other = Session::new(Arc::clone(&ontology), Some("ns-b"));
    other.run(vec![handler], vec![], Some(2)).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn schedules_reject_bad_cron() {
    let ontology = ontology();
    let mut session = session(&ontology);
    let schedule =
        ontograph_core::Schedule::new("not a cron", &OrderPlaced { order_id: "x".into() }).unwrap();
    let err = session.run(vec![], vec![schedule], Some(1)).await.unwrap_err();
    assert!(err.to_string().contains("cron"));
}
