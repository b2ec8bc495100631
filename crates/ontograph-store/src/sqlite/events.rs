//! Event queue tables on the embedded backend.
//!
//! Enqueue participates in whatever transaction the connection is in, so a
//! commit-with-event is fully atomic here. Claims are guarded by a
//! conditional upsert; a row taken by another session is skipped.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use ontograph_core::{
    canonical_json, ClaimRecord, ClaimedEvent, DeadLetterSummary, EventDeadLetter,
    EventInspection, EventRecord, EventStatus, EventSummary, NamespaceInfo, OntoError, Result,
    SessionRecord,
};

use super::{now_iso, parse_iso, to_iso, SqliteStore};
use crate::repository::{EventStore, SessionListing};

pub(super) fn create_event_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            namespace TEXT NOT NULL,
            type TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 100,
            root_event_id TEXT NOT NULL,
            chain_depth INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_events_namespace_type_order
            ON events(namespace, type, priority DESC, created_at ASC, id ASC);

        CREATE TABLE IF NOT EXISTS event_claims (
            event_id TEXT NOT NULL,
            handler_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            claimed_at TEXT NOT NULL,
            lease_until TEXT NOT NULL,
            ack_at TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            available_at TEXT NOT NULL,
            last_error TEXT,
            dead_lettered_at TEXT,
            PRIMARY KEY (event_id, handler_id)
        );
        CREATE INDEX IF NOT EXISTS idx_event_claims_handler_state
            ON event_claims(handler_id, ack_at, dead_lettered_at, lease_until, available_at);
        CREATE INDEX IF NOT EXISTS idx_event_claims_event
            ON event_claims(event_id);

        CREATE TABLE IF NOT EXISTS dead_letters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT NOT NULL,
            handler_id TEXT NOT NULL,
            namespace TEXT NOT NULL,
            failed_at TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            last_error TEXT NOT NULL,
            event_type TEXT NOT NULL,
            event_payload TEXT NOT NULL,
            root_event_id TEXT NOT NULL,
            chain_depth INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_dead_letters_namespace_failed
            ON dead_letters(namespace, failed_at DESC);

        CREATE TABLE IF NOT EXISTS sessions (
            session_id TEXT PRIMARY KEY,
            namespace TEXT NOT NULL,
            started_at TEXT NOT NULL,
            last_heartbeat TEXT NOT NULL,
            metadata TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_heartbeat
            ON sessions(last_heartbeat);
        CREATE INDEX IF NOT EXISTS idx_sessions_namespace
            ON sessions(namespace);
        "#,
    )
    .map_err(|e| OntoError::backend("create_event_tables", e))
}

fn insert_event(conn: &Connection, event: &EventRecord, namespace: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO events \
         (id, namespace, type, payload, created_at, priority, root_event_id, chain_depth) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event.id,
            namespace,
            event.event_type,
            canonical_json(&event.payload),
            to_iso(event.created_at),
            event.priority,
            event.root_event_id,
            event.chain_depth
        ],
    )
    .map_err(|e| OntoError::backend("enqueue", e))?;
    Ok(())
}

fn event_from_row(
    id: String,
    event_type: String,
    payload: String,
    created_at: String,
    priority: i64,
    root_event_id: String,
    chain_depth: u32,
) -> Result<EventRecord> {
    Ok(EventRecord {
        id,
        event_type,
        payload: serde_json::from_str(&payload)?,
        created_at: parse_iso("event_deserialize", &created_at)?,
        priority,
        root_event_id,
        chain_depth,
    })
}

fn claim_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ClaimRecord> {
    let parse = |s: String| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    };
    Ok(ClaimRecord {
        event_id: row.get(0)?,
        handler_id: row.get(1)?,
        session_id: row.get(2)?,
        claimed_at: parse(row.get::<_, String>(3)?),
        lease_until: parse(row.get::<_, String>(4)?),
        ack_at: row.get::<_, Option<String>>(5)?.map(parse),
        attempts: row.get(6)?,
        available_at: parse(row.get::<_, String>(7)?),
        last_error: row.get(8)?,
        dead_lettered_at: row.get::<_, Option<String>>(9)?.map(parse),
    })
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn enqueue(&self, event: &EventRecord, namespace: &str) -> Result<()> {
        let conn = self.lock_conn("enqueue")?;
        insert_event(&conn, event, namespace)
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
        let conn = self.lock_conn("claim")?;
        let now = Utc::now();
        let now_s = to_iso(now);
        let lease_until = now + Duration::milliseconds(lease_ms as i64);
        let lease_until_s = to_iso(lease_until);

        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| OntoError::backend("claim", e))?;
        let result: Result<Vec<ClaimedEvent>> = (|| {
            let placeholders: Vec<&str> = event_types.iter().map(|_| "?").collect();
            let sql = format!(
                "SELECT e.id, e.type, e.payload, e.created_at, e.priority, \
                        e.root_event_id, e.chain_depth \
                 FROM events e \
                 LEFT JOIN event_claims c ON e.id = c.event_id AND c.handler_id = ? \
                 WHERE e.namespace = ? \
                   AND e.type IN ({}) \
                   AND ( \
                     c.event_id IS NULL OR ( \
                       c.ack_at IS NULL \
                       AND c.dead_lettered_at IS NULL \
                       AND c.lease_until <= ? \
                       AND c.available_at <= ? \
                     ) \
                   ) \
                 ORDER BY e.priority DESC, e.created_at ASC, e.id ASC \
                 LIMIT ?",
                placeholders.join(", ")
            );
            let mut bind: Vec<rusqlite::types::Value> = Vec::new();
            bind.push(rusqlite::types::Value::Text(handler_id.to_string()));
            bind.push(rusqlite::types::Value::Text(namespace.to_string()));
            for t in event_types {
                bind.push(rusqlite::types::Value::Text(t.clone()));
            }
            bind.push(rusqlite::types::Value::Text(now_s.clone()));
            bind.push(rusqlite::types::Value::Text(now_s.clone()));
            bind.push(rusqlite::types::Value::Integer(limit as i64));

            let mut stmt = conn.prepare(&sql).map_err(|e| OntoError::backend("claim", e))?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(bind), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, u32>(6)?,
                    ))
                })
                .map_err(|e| OntoError::backend("claim", e))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| OntoError::backend("claim", e))?;

            let mut claimed = Vec::new();
            for (id, event_type, payload, created_at, priority, root_id, depth) in rows {
                conn.execute(
                    "INSERT INTO event_claims \
                     (event_id, handler_id, session_id, claimed_at, lease_until, \
                      attempts, available_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6) \
                     ON CONFLICT(event_id, handler_id) DO UPDATE SET \
                       session_id = excluded.session_id, \
                       claimed_at = excluded.claimed_at, \
                       lease_until = excluded.lease_until \
                     WHERE event_claims.ack_at IS NULL \
                       AND event_claims.dead_lettered_at IS NULL \
                       AND event_claims.lease_until <= excluded.claimed_at \
                       AND event_claims.available_at <= excluded.claimed_at",
                    params![id, handler_id, session_id, now_s, lease_until_s, now_s],
                )
                .map_err(|e| OntoError::backend("claim", e))?;

                let claim_row: Option<(String, String, String)> = conn
                    .query_row(
                        "SELECT session_id, claimed_at, lease_until FROM event_claims \
                         WHERE event_id = ?1 AND handler_id = ?2",
                        params![id, handler_id],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()
                    .map_err(|e| OntoError::backend("claim", e))?;
                // Another session took the row between select and upsert.
                let Some((owner, claimed_at, lease)) = claim_row else { continue };
                if owner != session_id || claimed_at != now_s {
                    continue;
                }

                claimed.push(ClaimedEvent {
                    event: event_from_row(
                        id, event_type, payload, created_at, priority, root_id, depth,
                    )?,
                    lease_until: parse_iso("claim", &lease)?,
                });
            }
            Ok(claimed)
        })();

        match result {
            Ok(claimed) => {
                conn.execute_batch("COMMIT").map_err(|e| OntoError::backend("claim", e))?;
                Ok(claimed)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    async fn ack(&self, handler_id: &str, event_id: &str, _namespace: &str) -> Result<()> {
        let conn = self.lock_conn("ack")?;
        conn.execute(
            "UPDATE event_claims SET ack_at = ?1 WHERE event_id = ?2 AND handler_id = ?3",
            params![now_iso(), event_id, handler_id],
        )
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
        let conn = self.lock_conn("release")?;
        let now = Utc::now();
        let now_s = to_iso(now);

        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| OntoError::backend("release", e))?;
        let result: Result<()> = (|| {
            let row: Option<(u32, String, String, String, u32)> = conn
                .query_row(
                    "SELECT c.attempts, e.type, e.payload, e.root_event_id, e.chain_depth \
                     FROM event_claims c JOIN events e ON e.id = c.event_id \
                     WHERE c.event_id = ?1 AND c.handler_id = ?2 AND e.namespace = ?3",
                    params![event_id, handler_id, namespace],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                        ))
                    },
                )
                .optional()
                .map_err(|e| OntoError::backend("release", e))?;
            let Some((prev_attempts, event_type, payload, root_event_id, chain_depth)) = row
            else {
                return Ok(());
            };

            let attempts = prev_attempts + 1;
            let last_error = error.unwrap_or("handler failure").to_string();

            if attempts >= self.config.event_max_attempts {
                conn.execute(
                    "UPDATE event_claims \
                     SET attempts = ?1, last_error = ?2, dead_lettered_at = ?3, \
                         lease_until = ?4, available_at = ?5 \
                     WHERE event_id = ?6 AND handler_id = ?7",
                    params![attempts, last_error, now_s, now_s, now_s, event_id, handler_id],
                )
                .map_err(|e| OntoError::backend("release", e))?;
                conn.execute(
                    "INSERT INTO dead_letters \
                     (event_id, handler_id, namespace, failed_at, attempts, last_error, \
                      event_type, event_payload, root_event_id, chain_depth) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        event_id,
                        handler_id,
                        namespace,
                        now_s,
                        attempts,
                        last_error,
                        event_type,
                        payload,
                        root_event_id,
                        chain_depth
                    ],
                )
                .map_err(|e| OntoError::backend("release", e))?;

                let mut dead_evt = EventRecord::new(&EventDeadLetter {
                    event_id: event_id.to_string(),
                    handler_id: handler_id.to_string(),
                    attempts,
                    last_error: last_error.clone(),
                })?;
                dead_evt.root_event_id = root_event_id;
                dead_evt.chain_depth = chain_depth + 1;
                insert_event(&conn, &dead_evt, namespace)?;
                debug!(event_id, handler_id, attempts, "event dead-lettered");
            } else {
                let jitter: i64 = rand::thread_rng().gen_range(0..=100);
                let backoff_ms = (self.config.event_backoff_base_ms
                    .saturating_mul(1u64 << attempts.min(32)))
                .min(self.config.event_backoff_max_ms);
                let available_at = now + Duration::milliseconds(backoff_ms as i64 + jitter);
                conn.execute(
                    "UPDATE event_claims \
                     SET attempts = ?1, last_error = ?2, lease_until = ?3, available_at = ?4 \
                     WHERE event_id = ?5 AND handler_id = ?6",
                    params![attempts, last_error, now_s, to_iso(available_at), event_id, handler_id],
                )
                .map_err(|e| OntoError::backend("release", e))?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT").map_err(|e| OntoError::backend("release", e))?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    async fn register_session(
        &self,
        session_id: &str,
        namespace: &str,
        metadata: &BTreeMap<String, Value>,
    ) -> Result<()> {
        let conn = self.lock_conn("register_session")?;
        let now_s = now_iso();
        conn.execute(
            "INSERT INTO sessions (session_id, namespace, started_at, last_heartbeat, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(session_id) DO UPDATE SET \
               namespace = excluded.namespace, \
               last_heartbeat = excluded.last_heartbeat, \
               metadata = excluded.metadata",
            params![session_id, namespace, now_s, now_s, serde_json::to_string(metadata)?],
        )
        .map_err(|e| OntoError::backend("register_session", e))?;
        Ok(())
    }

    async fn heartbeat(&self, session_id: &str, _namespace: &str) -> Result<()> {
        let conn = self.lock_conn("heartbeat")?;
        conn.execute(
            "UPDATE sessions SET last_heartbeat = ?1 WHERE session_id = ?2",
            params![now_iso(), session_id],
        )
        .map_err(|e| OntoError::backend("heartbeat", e))?;
        Ok(())
    }

    async fn list_namespaces(&self, session_ttl_ms: u64) -> Result<Vec<NamespaceInfo>> {
        let conn = self.lock_conn("list_namespaces")?;
        let now = Utc::now();
        let mut namespaces = std::collections::BTreeSet::new();
        for table in ["events", "sessions", "dead_letters"] {
            let mut stmt = conn
                .prepare(&format!("SELECT DISTINCT namespace FROM {table}"))
                .map_err(|e| OntoError::backend("list_namespaces", e))?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| OntoError::backend("list_namespaces", e))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| OntoError::backend("list_namespaces", e))?;
            namespaces.extend(names);
        }

        let mut out = Vec::new();
        for ns in namespaces {
            let pending: usize = conn
                .query_row(
                    "SELECT COUNT(*) FROM events WHERE namespace = ?1",
                    params![ns],
                    |row| row.get(0),
                )
                .map_err(|e| OntoError::backend("list_namespaces", e))?;
            let dead_letters: usize = conn
                .query_row(
                    "SELECT COUNT(*) FROM dead_letters WHERE namespace = ?1",
                    params![ns],
                    |row| row.get(0),
                )
                .map_err(|e| OntoError::backend("list_namespaces", e))?;
            let mut stmt = conn
                .prepare("SELECT last_heartbeat FROM sessions WHERE namespace = ?1")
                .map_err(|e| OntoError::backend("list_namespaces", e))?;
            let heartbeats = stmt
                .query_map(params![ns], |row| row.get::<_, String>(0))
                .map_err(|e| OntoError::backend("list_namespaces", e))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| OntoError::backend("list_namespaces", e))?;
            let sessions = heartbeats
                .iter()
                .filter(|hb| {
                    parse_iso("list_namespaces", hb)
                        .map(|ts| now - ts <= Duration::milliseconds(session_ttl_ms as i64))
                        .unwrap_or(false)
                })
                .count();
            out.push(NamespaceInfo { namespace: ns, sessions, pending_events: pending, dead_letters });
        }
        Ok(out)
    }

    async fn list_sessions(
        &self,
        namespace: &str,
        session_ttl_ms: u64,
    ) -> Result<Vec<SessionListing>> {
        let conn = self.lock_conn("list_sessions")?;
        let now = Utc::now();
        let mut stmt = conn
            .prepare(
                "SELECT session_id, started_at, last_heartbeat, metadata \
                 FROM sessions WHERE namespace = ?1",
            )
            .map_err(|e| OntoError::backend("list_sessions", e))?;
        let rows = stmt
            .query_map(params![namespace], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })
            .map_err(|e| OntoError::backend("list_sessions", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| OntoError::backend("list_sessions", e))?;

        let mut out = Vec::new();
        for (session_id, started_at, last_heartbeat, metadata) in rows {
            let record = SessionRecord {
                session_id,
                namespace: namespace.to_string(),
                started_at: parse_iso("list_sessions", &started_at)?,
                last_heartbeat: parse_iso("list_sessions", &last_heartbeat)?,
                metadata: metadata
                    .map(|m| serde_json::from_str(&m))
                    .transpose()?
                    .unwrap_or_default(),
            };
            let is_dead = record.is_dead(now, session_ttl_ms);
            out.push(SessionListing { record, is_dead });
        }
        out.sort_by(|a, b| b.record.last_heartbeat.cmp(&a.record.last_heartbeat));
        Ok(out)
    }

    async fn list_events(&self, namespace: &str, limit: usize) -> Result<Vec<EventSummary>> {
        let conn = self.lock_conn("list_events")?;
        let now_s = now_iso();
        let mut stmt = conn
            .prepare(
                "SELECT e.id, e.type, e.created_at, e.priority, e.payload, \
                   MAX(CASE WHEN c.dead_lettered_at IS NOT NULL THEN 1 ELSE 0 END) AS dead, \
                   MAX(CASE WHEN c.ack_at IS NOT NULL THEN 1 ELSE 0 END) AS ack, \
                   MAX(CASE WHEN c.ack_at IS NULL AND c.dead_lettered_at IS NULL \
                             AND c.lease_until > ?1 THEN 1 ELSE 0 END) AS claimed, \
                   MAX(c.handler_id) AS any_handler \
                 FROM events e LEFT JOIN event_claims c ON e.id = c.event_id \
                 WHERE e.namespace = ?2 \
                 GROUP BY e.id, e.type, e.created_at, e.priority, e.payload \
                 ORDER BY e.priority DESC, e.created_at ASC, e.id ASC \
                 LIMIT ?3",
            )
            .map_err(|e| OntoError::backend("list_events", e))?;
        let rows = stmt
            .query_map(params![now_s, namespace, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, Option<String>>(8)?,
                ))
            })
            .map_err(|e| OntoError::backend("list_events", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| OntoError::backend("list_events", e))?;

        rows.into_iter()
            .map(|(id, event_type, created_at, priority, payload, dead, ack, claimed, handler)| {
                let status = if dead > 0 {
                    EventStatus::DeadLettered
                } else if ack > 0 {
                    EventStatus::Acked
                } else if claimed > 0 {
                    EventStatus::Claimed
                } else {
                    EventStatus::Pending
                };
                Ok(EventSummary {
                    id,
                    event_type,
                    created_at: parse_iso("list_events", &created_at)?,
                    priority,
                    status,
                    handler,
                    payload: serde_json::from_str(&payload)?,
                })
            })
            .collect()
    }

    async fn list_dead_letters(
        &self,
        namespace: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterSummary>> {
        let conn = self.lock_conn("list_dead_letters")?;
        let mut stmt = conn
            .prepare(
                "SELECT event_id, event_type, handler_id, attempts, last_error, failed_at \
                 FROM dead_letters WHERE namespace = ?1 \
                 ORDER BY failed_at DESC LIMIT ?2",
            )
            .map_err(|e| OntoError::backend("list_dead_letters", e))?;
        let rows = stmt
            .query_map(params![namespace, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(|e| OntoError::backend("list_dead_letters", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| OntoError::backend("list_dead_letters", e))?;
        rows.into_iter()
            .map(|(event_id, event_type, handler_id, attempts, last_error, failed_at)| {
                Ok(DeadLetterSummary {
                    event_id,
                    event_type,
                    handler_id,
                    attempts,
                    last_error,
                    failed_at: parse_iso("list_dead_letters", &failed_at)?,
                })
            })
            .collect()
    }

    async fn cleanup_events(&self, namespace: &str, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock_conn("cleanup_events")?;
        let cutoff = to_iso(before);
        let mut stmt = conn
            .prepare("SELECT id FROM events WHERE namespace = ?1 AND created_at < ?2")
            .map_err(|e| OntoError::backend("cleanup_events", e))?;
        let event_ids = stmt
            .query_map(params![namespace, cutoff], |row| row.get::<_, String>(0))
            .map_err(|e| OntoError::backend("cleanup_events", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| OntoError::backend("cleanup_events", e))?;
        if event_ids.is_empty() {
            return Ok(0);
        }
        let placeholders: Vec<&str> = event_ids.iter().map(|_| "?").collect();
        let in_list = placeholders.join(", ");
        conn.execute(
            &format!("DELETE FROM event_claims WHERE event_id IN ({in_list})"),
            rusqlite::params_from_iter(event_ids.iter()),
        )
        .map_err(|e| OntoError::backend("cleanup_events", e))?;
        conn.execute(
            &format!("DELETE FROM events WHERE id IN ({in_list})"),
            rusqlite::params_from_iter(event_ids.iter()),
        )
        .map_err(|e| OntoError::backend("cleanup_events", e))?;
        Ok(event_ids.len())
    }

    async fn replay_event(&self, namespace: &str, event_id: &str) -> Result<String> {
        let conn = self.lock_conn("replay_event")?;
        let row: Option<(String, String, i64)> = conn
            .query_row(
                "SELECT type, payload, priority FROM events WHERE id = ?1 AND namespace = ?2",
                params![event_id, namespace],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(|e| OntoError::backend("replay_event", e))?;
        let Some((event_type, payload, priority)) = row else {
            return Err(OntoError::backend(
                "replay_event",
                format!("event '{event_id}' not found"),
            ));
        };

        let new_id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO events \
             (id, namespace, type, payload, created_at, priority, root_event_id, chain_depth) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![new_id, namespace, event_type, payload, now_iso(), priority, new_id],
        )
        .map_err(|e| OntoError::backend("replay_event", e))?;
        Ok(new_id)
    }

    async fn inspect_event(
        &self,
        event_id: &str,
        namespace: Option<&str>,
    ) -> Result<Option<EventInspection>> {
        let conn = self.lock_conn("inspect_event")?;
        let row: Option<(String, String, String, String, String, i64, String, u32)> =
            match namespace {
                None => conn.query_row(
                    "SELECT id, namespace, type, payload, created_at, priority, \
                            root_event_id, chain_depth \
                     FROM events WHERE id = ?1",
                    params![event_id],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                        ))
                    },
                ),
                Some(ns) => conn.query_row(
                    "SELECT id, namespace, type, payload, created_at, priority, \
                            root_event_id, chain_depth \
                     FROM events WHERE id = ?1 AND namespace = ?2",
                    params![event_id, ns],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                        ))
                    },
                ),
            }
            .optional()
            .map_err(|e| OntoError::backend("inspect_event", e))?;

        let Some((id, ns, event_type, payload, created_at, priority, root_id, depth)) = row
        else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare(
                "SELECT event_id, handler_id, session_id, claimed_at, lease_until, ack_at, \
                        attempts, available_at, last_error, dead_lettered_at \
                 FROM event_claims WHERE event_id = ?1 ORDER BY handler_id ASC",
            )
            .map_err(|e| OntoError::backend("inspect_event", e))?;
        let claims = stmt
            .query_map(params![event_id], claim_from_row)
            .map_err(|e| OntoError::backend("inspect_event", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| OntoError::backend("inspect_event", e))?;

        Ok(Some(EventInspection {
            event: event_from_row(id, event_type, payload, created_at, priority, root_id, depth)?,
            namespace: ns,
            claims,
        }))
    }
}
