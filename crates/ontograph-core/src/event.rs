//! Durable event model.
//!
//! Events are serialized payloads tagged with a type discriminator; the
//! store never needs the concrete type. Handlers decode the payload back
//! through [`EventPayload`].

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::canonical::canonicalize;
use crate::error::Result;

/// Default event priority; higher runs first.
pub const DEFAULT_EVENT_PRIORITY: i64 = 100;

/// A typed event payload with a stable type discriminator.
pub trait EventPayload: Serialize + DeserializeOwned {
    /// Stable event-type string used for subscriptions and storage.
    const EVENT_TYPE: &'static str;

    /// Claim priority for events of this type.
    fn priority() -> i64 {
        DEFAULT_EVENT_PRIORITY
    }
}

/// A durable message as stored and claimed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub event_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub priority: i64,
    /// The original unit of work this event descends from.
    pub root_event_id: String,
    /// Predecessor count along the root chain.
    pub chain_depth: u32,
}

impl EventRecord {
    /// Wrap a typed payload into a fresh root event.
    pub fn new<E: EventPayload>(payload: &E) -> Result<Self> {
        let id = Uuid::new_v4().to_string();
        Ok(EventRecord {
            root_event_id: id.clone(),
            id,
            event_type: E::EVENT_TYPE.to_string(),
            payload: canonicalize(&serde_json::to_value(payload)?),
            created_at: Utc::now(),
            priority: E::priority(),
            chain_depth: 0,
        })
    }

    /// Same payload under a fresh identity (used by schedules and replay).
    pub fn clone_fresh(&self) -> Self {
        let id = Uuid::new_v4().to_string();
        EventRecord {
            root_event_id: id.clone(),
            id,
            event_type: self.event_type.clone(),
            payload: self.payload.clone(),
            created_at: Utc::now(),
            priority: self.priority,
            chain_depth: 0,
        }
    }

    /// Decode the payload back into its typed form.
    pub fn decode<E: EventPayload>(&self) -> Result<E> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// Enqueued automatically when a handler exhausts its retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDeadLetter {
    pub event_id: String,
    pub handler_id: String,
    pub attempts: u32,
    pub last_error: String,
}

impl EventPayload for EventDeadLetter {
    const EVENT_TYPE: &'static str = "EventDeadLetter";
}

/// Per `(event_id, handler_id)` claim state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub event_id: String,
    pub handler_id: String,
    pub session_id: String,
    pub claimed_at: DateTime<Utc>,
    pub lease_until: DateTime<Utc>,
    pub ack_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

/// A claimed event and its lease state.
#[derive(Debug, Clone)]
pub struct ClaimedEvent {
    pub event: EventRecord,
    pub lease_until: DateTime<Utc>,
}

/// Copy of an event whose handler exhausted its retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub event_id: String,
    pub handler_id: String,
    pub namespace: String,
    pub failed_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: String,
    pub event_type: String,
    pub event_payload: Value,
    pub root_event_id: String,
    pub chain_depth: u32,
}

/// A registered runtime session with its heartbeat state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub namespace: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub metadata: BTreeMap<String, Value>,
}

impl SessionRecord {
    /// Dead once the heartbeat is older than the session TTL.
    pub fn is_dead(&self, now: DateTime<Utc>, session_ttl_ms: u64) -> bool {
        now - self.last_heartbeat > chrono::Duration::milliseconds(session_ttl_ms as i64)
    }
}

/// Queue status of an event across its claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Claimed,
    Acked,
    DeadLettered,
}

/// Listing row for `list_events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSummary {
    pub id: String,
    pub event_type: String,
    pub created_at: DateTime<Utc>,
    pub priority: i64,
    pub status: EventStatus,
    pub handler: Option<String>,
    pub payload: Value,
}

/// Listing row for `list_dead_letters`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterSummary {
    pub event_id: String,
    pub event_type: String,
    pub handler_id: String,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

/// Aggregate view of one namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub namespace: String,
    pub sessions: usize,
    pub pending_events: usize,
    pub dead_letters: usize,
}

/// Full event view with claim history, for inspection tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventInspection {
    pub event: EventRecord,
    pub namespace: String,
    pub claims: Vec<ClaimRecord>,
}

/// A cron expression paired with a template event; the runtime enqueues a
/// fresh clone at each crossing.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub cron: String,
    pub template: EventRecord,
}

impl Schedule {
    pub fn new<E: EventPayload>(cron: impl Into<String>, payload: &E) -> Result<Self> {
        Ok(Schedule { cron: cron.into(), template: EventRecord::new(payload)? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: String,
        total: f64,
    }

    impl EventPayload for OrderPlaced {
        const EVENT_TYPE: &'static str = "OrderPlaced";
    }

    #[test]
    fn new_event_is_its_own_root() {
        let evt = EventRecord::new(&OrderPlaced { order_id: "o1".into(), total: 9.5 }).unwrap();
        assert_eq!(evt.root_event_id, evt.id);
        assert_eq!(evt.chain_depth, 0);
        assert_eq!(evt.event_type, "OrderPlaced");
        assert_eq!(evt.priority, DEFAULT_EVENT_PRIORITY);
    }

    #[test]
    fn decode_round_trip() {
        let evt = EventRecord::new(&OrderPlaced { order_id: "o1".into(), total: 9.5 }).unwrap();
        let decoded: OrderPlaced = evt.decode().unwrap();
        assert_eq!(decoded.order_id, "o1");
    }

    #[test]
    fn clone_fresh_gets_new_identity() {
        let evt = EventRecord::new(&OrderPlaced { order_id: "o1".into(), total: 1.0 }).unwrap();
        let cloned = evt.clone_fresh();
        assert_ne!(cloned.id, evt.id);
        assert_eq!(cloned.root_event_id, cloned.id);
        assert_eq!(cloned.payload, evt.payload);
    }

    #[test]
    fn payload_is_canonical() {
        let evt = EventRecord::new(&OrderPlaced { order_id: "o1".into(), total: 1.0 }).unwrap();
        assert_eq!(evt.payload, json!({"order_id": "o1", "total": 1.0}));
    }
}
