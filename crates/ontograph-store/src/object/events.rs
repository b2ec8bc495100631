//! Per-object event queue on the object backend.
//!
//! Events, claims, dead letters and sessions are individual JSON objects;
//! claim ownership is a conditional write on the claim object. Enqueue
//! here is a post-publish operation, so a commit-with-event is not
//! distributedly atomic on this backend.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

use ontograph_core::{
    ClaimRecord, ClaimedEvent, DeadLetterSummary, EventDeadLetter, EventInspection, EventRecord,
    EventStatus, EventSummary, NamespaceInfo, OntoError, Result, SessionRecord,
};

use super::client::{ObjectError, PutCondition};
use super::store::ObjectStore;
use crate::repository::{EventStore, SessionListing};

fn event_sort_key(created_at: DateTime<Utc>) -> String {
    format!("{:020}", created_at.timestamp_micros().max(0))
}

fn claim_to_json(claim: &ClaimRecord) -> Value {
    serde_json::to_value(claim).unwrap_or(Value::Null)
}

impl ObjectStore {
    fn events_prefix(&self, namespace: &str) -> String {
        self.k(&format!("events/{namespace}/"))
    }

    fn event_key(&self, namespace: &str, event: &EventRecord) -> String {
        self.k(&format!(
            "events/{namespace}/{}_{}.json",
            event_sort_key(event.created_at),
            event.id
        ))
    }

    fn claim_key(&self, namespace: &str, event_id: &str, handler_id: &str) -> String {
        self.k(&format!("claims/{namespace}/{event_id}/{handler_id}.json"))
    }

    fn dead_letter_key(&self, namespace: &str, event_id: &str, handler_id: &str) -> String {
        self.k(&format!("dead_letters/{namespace}/{event_id}/{handler_id}.json"))
    }

    fn session_key(&self, namespace: &str, session_id: &str) -> String {
        self.k(&format!("sessions/{namespace}/{session_id}.json"))
    }

    async fn load_namespace_events(&self, namespace: &str) -> Result<Vec<EventRecord>> {
        let keys = self
            .client
            .list(&self.events_prefix(namespace))
            .await
            .map_err(|e| OntoError::backend("list_events", e))?;
        let mut events = Vec::new();
        for key in keys {
            if let Some((doc, _)) = self.get_json(&key).await? {
                events.push(serde_json::from_value::<EventRecord>(doc)?);
            }
        }
        events.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(events)
    }

    async fn find_event(&self, namespace: &str, event_id: &str) -> Result<Option<EventRecord>> {
        let keys = self
            .client
            .list(&self.events_prefix(namespace))
            .await
            .map_err(|e| OntoError::backend("find_event", e))?;
        for key in keys {
            if key.ends_with(&format!("_{event_id}.json")) {
                if let Some((doc, _)) = self.get_json(&key).await? {
                    return Ok(Some(serde_json::from_value(doc)?));
                }
            }
        }
        Ok(None)
    }

    async fn load_claim(
        &self,
        namespace: &str,
        event_id: &str,
        handler_id: &str,
    ) -> Result<Option<(ClaimRecord, String)>> {
        let key = self.claim_key(namespace, event_id, handler_id);
        let Some((doc, etag)) = self.get_json(&key).await? else { return Ok(None) };
        Ok(Some((serde_json::from_value(doc)?, etag)))
    }
}

#[async_trait]
impl EventStore for ObjectStore {
    async fn enqueue(&self, event: &EventRecord, namespace: &str) -> Result<()> {
        let key = self.event_key(namespace, event);
        self.put_json_unchecked(&key, &serde_json::to_value(event)?).await?;
        debug!(event_id = %event.id, namespace, "event enqueued");
        Ok(())
    }

    async fn claim(
        &self,
        namespace: &str,
        handler_id: &str,
        session_id: &str,
        event_types: &[String],
        limit: usize,
        lease_ms: u64,
    ) -> Result<Vec<ClaimedEvent>> {
        if limit == 0 || event_types.is_empty() {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let lease_until = now + Duration::milliseconds(lease_ms as i64);
        let events = self.load_namespace_events(namespace).await?;

        let mut claimed = Vec::new();
        for event in events {
            if claimed.len() >= limit {
                break;
            }
            if !event_types.contains(&event.event_type) {
                continue;
            }

            let existing = self.load_claim(namespace, &event.id, handler_id).await?;
            let (claim, condition) = match existing {
                None => (
                    ClaimRecord {
                        event_id: event.id.clone(),
                        handler_id: handler_id.to_string(),
                        session_id: session_id.to_string(),
                        claimed_at: now,
                        lease_until,
                        ack_at: None,
                        attempts: 0,
                        available_at: now,
                        last_error: None,
                        dead_lettered_at: None,
                    },
                    PutCondition::IfNoneMatch,
                ),
                Some((existing, etag)) => {
                    let eligible = existing.ack_at.is_none()
                        && existing.dead_lettered_at.is_none()
                        && existing.lease_until <= now
                        && existing.available_at <= now;
                    if !eligible {
                        continue;
                    }
                    let mut claim = existing;
                    claim.session_id = session_id.to_string();
                    claim.claimed_at = now;
                    claim.lease_until = lease_until;
                    (claim, PutCondition::IfMatch(etag))
                }
            };

            let key = self.claim_key(namespace, &event.id, handler_id);
            match self.put_json(&key, &claim_to_json(&claim), condition).await {
                Ok(_) => claimed.push(ClaimedEvent { event, lease_until }),
                // Another process took the claim; skip it.
                Err(ObjectError::PreconditionFailed) => continue,
                Err(e) => return Err(OntoError::backend("claim", e)),
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, handler_id: &str, event_id: &str, namespace: &str) -> Result<()> {
        let Some((mut claim, etag)) = self.load_claim(namespace, event_id, handler_id).await?
        else {
            return Ok(());
        };
        claim.ack_at = Some(Utc::now());
        let key = self.claim_key(namespace, event_id, handler_id);
        self.put_json(&key, &claim_to_json(&claim), PutCondition::IfMatch(etag))
            .await
            .map_err(|e| OntoError::backend("ack", e))?;
        Ok(())
    }

    async fn release(
        &self,
        handler_id: &str,
        event_id: &str,
        namespace: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let Some((mut claim, etag)) = self.load_claim(namespace, event_id, handler_id).await?
        else {
            return Ok(());
        };
        let Some(event) = self.find_event(namespace, event_id).await? else {
            return Ok(());
        };

        let now = Utc::now();
        claim.attempts += 1;
        claim.last_error = Some(error.unwrap_or("handler failure").to_string());

        if claim.attempts >= self.config.event_max_attempts {
            claim.dead_lettered_at = Some(now);
            claim.lease_until = now;
            claim.available_at = now;
            let key = self.claim_key(namespace, event_id, handler_id);
            self.put_json(&key, &claim_to_json(&claim), PutCondition::IfMatch(etag))
                .await
                .map_err(|e| OntoError::backend("release", e))?;

            let dead = json!({
                "event_id": event_id,
                "handler_id": handler_id,
                "namespace": namespace,
                "failed_at": now,
                "attempts": claim.attempts,
                "last_error": claim.last_error,
                "event_type": event.event_type,
                "event_payload": event.payload,
                "root_event_id": event.root_event_id,
                "chain_depth": event.chain_depth,
            });
            self.put_json_unchecked(
                &self.dead_letter_key(namespace, event_id, handler_id),
                &dead,
            )
            .await?;

            let mut dead_evt = EventRecord::new(&EventDeadLetter {
                event_id: event_id.to_string(),
                handler_id: handler_id.to_string(),
                attempts: claim.attempts,
                last_error: claim.last_error.clone().unwrap_or_default(),
            })?;
            dead_evt.root_event_id = event.root_event_id.clone();
            dead_evt.chain_depth = event.chain_depth + 1;
            self.enqueue(&dead_evt, namespace).await?;
            debug!(event_id, handler_id, attempts = claim.attempts, "event dead-lettered");
        } else {
            let jitter: i64 = rand::thread_rng().gen_range(0..=100);
            let backoff_ms = (self
                .config
                .event_backoff_base_ms
                .saturating_mul(1u64 << claim.attempts.min(32)))
            .min(self.config.event_backoff_max_ms);
            claim.lease_until = now;
            claim.available_at = now + Duration::milliseconds(backoff_ms as i64 + jitter);
            let key = self.claim_key(namespace, event_id, handler_id);
            self.put_json(&key, &claim_to_json(&claim), PutCondition::IfMatch(etag))
                .await
                .map_err(|e| OntoError::backend("release", e))?;
        }
        Ok(())
    }

    async fn register_session(
        &self,
        session_id: &str,
        namespace: &str,
        metadata: &BTreeMap<String, Value>,
    ) -> Result<()> {
        let now = Utc::now();
        let existing = self.get_json(&self.session_key(namespace, session_id)).await?;
        let started_at = existing
            .as_ref()
            .and_then(|(doc, _)| doc.get("started_at").cloned())
            .unwrap_or_else(|| json!(now));
        let record = json!({
            "session_id": session_id,
            "namespace": namespace,
            "started_at": started_at,
            "last_heartbeat": now,
            "metadata": metadata,
        });
        self.put_json_unchecked(&self.session_key(namespace, session_id), &record).await?;
        Ok(())
    }

    async fn heartbeat(&self, session_id: &str, namespace: &str) -> Result<()> {
        let key = self.session_key(namespace, session_id);
        let Some((mut doc, _)) = self.get_json(&key).await? else { return Ok(()) };
        doc["last_heartbeat"] = json!(Utc::now());
        self.put_json_unchecked(&key, &doc).await?;
        Ok(())
    }

    async fn list_namespaces(&self, session_ttl_ms: u64) -> Result<Vec<NamespaceInfo>> {
        let mut namespaces = std::collections::BTreeSet::new();
        for prefix in ["events/", "sessions/", "dead_letters/"] {
            let keys = self
                .client
                .list(&self.k(prefix))
                .await
                .map_err(|e| OntoError::backend("list_namespaces", e))?;
            for key in keys {
                let rest = key.trim_start_matches(&self.k(prefix)).to_string();
                if let Some((ns, _)) = rest.split_once('/') {
                    namespaces.insert(ns.to_string());
                }
            }
        }

        let mut out = Vec::new();
        for ns in namespaces {
            let pending = self
                .client
                .list(&self.events_prefix(&ns))
                .await
                .map_err(|e| OntoError::backend("list_namespaces", e))?
                .len();
            let dead_letters = self
                .client
                .list(&self.k(&format!("dead_letters/{ns}/")))
                .await
                .map_err(|e| OntoError::backend("list_namespaces", e))?
                .len();
            let sessions = self.list_sessions(&ns, session_ttl_ms).await?;
            let live = sessions.iter().filter(|s| !s.is_dead).count();
            out.push(NamespaceInfo {
                namespace: ns,
                sessions: live,
                pending_events: pending,
                dead_letters,
            });
        }
        Ok(out)
    }

    async fn list_sessions(
        &self,
        namespace: &str,
        session_ttl_ms: u64,
    ) -> Result<Vec<SessionListing>> {
        let now = Utc::now();
        let keys = self
            .client
            .list(&self.k(&format!("sessions/{namespace}/")))
            .await
            .map_err(|e| OntoError::backend("list_sessions", e))?;
        let mut out = Vec::new();
        for key in keys {
            let Some((doc, _)) = self.get_json(&key).await? else { continue };
            let record: SessionRecord = serde_json::from_value(doc)?;
            let is_dead = record.is_dead(now, session_ttl_ms);
            out.push(SessionListing { record, is_dead });
        }
        out.sort_by(|a, b| b.record.last_heartbeat.cmp(&a.record.last_heartbeat));
        Ok(out)
    }

    async fn list_events(&self, namespace: &str, limit: usize) -> Result<Vec<EventSummary>> {
        let now = Utc::now();
        let events = self.load_namespace_events(namespace).await?;
        let mut out = Vec::new();
        for event in events.into_iter().take(limit) {
            let claim_keys = self
                .client
                .list(&self.k(&format!("claims/{namespace}/{}/", event.id)))
                .await
                .map_err(|e| OntoError::backend("list_events", e))?;
            let mut status = EventStatus::Pending;
            let mut handler = None;
            for key in claim_keys {
                let Some((doc, _)) = self.get_json(&key).await? else { continue };
                let claim: ClaimRecord = serde_json::from_value(doc)?;
                handler = Some(claim.handler_id.clone());
                if claim.dead_lettered_at.is_some() {
                    status = EventStatus::DeadLettered;
                    break;
                } else if claim.ack_at.is_some() {
                    status = EventStatus::Acked;
                } else if claim.lease_until > now && status == EventStatus::Pending {
                    status = EventStatus::Claimed;
                }
            }
            out.push(EventSummary {
                id: event.id.clone(),
                event_type: event.event_type.clone(),
                created_at: event.created_at,
                priority: event.priority,
                status,
                handler,
                payload: event.payload.clone(),
            });
        }
        Ok(out)
    }

    async fn list_dead_letters(
        &self,
        namespace: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterSummary>> {
        let keys = self
            .client
            .list(&self.k(&format!("dead_letters/{namespace}/")))
            .await
            .map_err(|e| OntoError::backend("list_dead_letters", e))?;
        let mut out = Vec::new();
        for key in keys {
            let Some((doc, _)) = self.get_json(&key).await? else { continue };
            out.push(DeadLetterSummary {
                event_id: doc.get("event_id").and_then(Value::as_str).unwrap_or_default().into(),
                event_type: doc
                    .get("event_type")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .into(),
                handler_id: doc
                    .get("handler_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .into(),
                attempts: doc.get("attempts").and_then(Value::as_u64).unwrap_or(0) as u32,
                last_error: doc
                    .get("last_error")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .into(),
                failed_at: doc
                    .get("failed_at")
                    .and_then(Value::as_str)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now),
            });
        }
        out.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        out.truncate(limit);
        Ok(out)
    }

    async fn cleanup_events(&self, namespace: &str, before: DateTime<Utc>) -> Result<usize> {
        let events = self.load_namespace_events(namespace).await?;
        let mut removed = 0;
        for event in events {
            if event.created_at >= before {
                continue;
            }
            let claim_keys = self
                .client
                .list(&self.k(&format!("claims/{namespace}/{}/", event.id)))
                .await
                .map_err(|e| OntoError::backend("cleanup_events", e))?;
            for key in claim_keys {
                self.client
                    .delete(&key)
                    .await
                    .map_err(|e| OntoError::backend("cleanup_events", e))?;
            }
            self.client
                .delete(&self.event_key(namespace, &event))
                .await
                .map_err(|e| OntoError::backend("cleanup_events", e))?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn replay_event(&self, namespace: &str, event_id: &str) -> Result<String> {
        let Some(event) = self.find_event(namespace, event_id).await? else {
            return Err(OntoError::backend(
                "replay_event",
                format!("event '{event_id}' not found"),
            ));
        };
        let fresh = event.clone_fresh();
        self.enqueue(&fresh, namespace).await?;
        Ok(fresh.id)
    }

    async fn inspect_event(
        &self,
        event_id: &str,
        namespace: Option<&str>,
    ) -> Result<Option<EventInspection>> {
        let namespaces: Vec<String> = match namespace {
            Some(ns) => vec![ns.to_string()],
            None => {
                let keys = self
                    .client
                    .list(&self.k("events/"))
                    .await
                    .map_err(|e| OntoError::backend("inspect_event", e))?;
                let mut seen = std::collections::BTreeSet::new();
                for key in keys {
                    let rest = key.trim_start_matches(&self.k("events/")).to_string();
                    if let Some((ns, _)) = rest.split_once('/') {
                        seen.insert(ns.to_string());
                    }
                }
                seen.into_iter().collect()
            }
        };

        for ns in namespaces {
            let Some(event) = self.find_event(&ns, event_id).await? else { continue };
            let claim_keys = self
                .client
                .list(&self.k(&format!("claims/{ns}/{event_id}/")))
                .await
                .map_err(|e| OntoError::backend("inspect_event", e))?;
            let mut claims = Vec::new();
            for key in claim_keys {
                if let Some((doc, _)) = self.get_json(&key).await? {
                    claims.push(serde_json::from_value::<ClaimRecord>(doc)?);
                }
            }
            claims.sort_by(|a, b| a.handler_id.cmp(&b.handler_id));
            return Ok(Some(EventInspection { event, namespace: ns, claims }));
        }
        Ok(None)
    }
}
