//! Session runtime: intents, atomic commits and the handler loop.
//!
//! A session accumulates typed intents, turns them into one linearly-
//! ordered commit under the write lock, and optionally pairs the commit
//! with exactly one successor event. `run` drives registered handlers
//! against the durable event queue with leases, retries and heartbeats.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use ontograph_core::{
    normalize_instance_key, CronSpec, EntityModel, EventRecord, OntoError, RelationModel, Result,
    Schedule, TypeName,
};
use ontograph_store::{BackendKind, OntoBackend};

use crate::ontology::Ontology;
use crate::query::QueryBuilder;

/// A pending typed value enqueued into the session's next commit.
#[derive(Debug, Clone)]
pub enum Intent {
    Entity {
        type_name: String,
        key: String,
        fields: Map<String, Value>,
    },
    Relation {
        type_name: String,
        left_key: String,
        right_key: String,
        instance_key: String,
        fields: Map<String, Value>,
    },
}

impl Intent {
    fn type_name(&self) -> TypeName {
        match self {
            Intent::Entity { type_name, .. } => TypeName::entity(type_name.clone()),
            Intent::Relation { type_name, .. } => TypeName::relation(type_name.clone()),
        }
    }
}

/// A function subscribed to one event type.
///
/// `handler_id` must be stable across processes; ids participate in claim
/// identity and dispatch ordering.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn handler_id(&self) -> String;

    /// The event type this handler subscribes to.
    fn event_type(&self) -> String;

    /// Dispatch priority; higher runs first, ties break on handler id.
    fn priority(&self) -> i64 {
        100
    }

    async fn handle(&self, ctx: &mut HandlerContext<'_>) -> anyhow::Result<()>;
}

struct HandlerEntry {
    handler: Arc<dyn EventHandler>,
    handler_id: String,
    event_type: String,
}

struct ScheduleState {
    template: EventRecord,
    cron: CronSpec,
    next_fire: DateTime<Utc>,
}

/// Execution context handed to a handler for one claimed event.
pub struct HandlerContext<'a> {
    pub event: EventRecord,
    pub lease_until: DateTime<Utc>,
    session: &'a mut Session,
    buffered: Vec<EventRecord>,
}

impl<'a> HandlerContext<'a> {
    pub fn session(&mut self) -> &mut Session {
        self.session
    }

    pub fn ensure<E: EntityModel>(&mut self, entity: &E) -> Result<()> {
        self.session.ensure(entity)
    }

    pub fn ensure_relation<R: RelationModel>(&mut self, relation: &R) -> Result<()> {
        self.session.ensure_relation(relation)
    }

    /// Commit accumulated intents, optionally pairing the commit with one
    /// successor event in the same atomic unit. Fails with `LeaseExpired`
    /// once the claim's lease window has passed.
    pub async fn commit(&mut self, event: Option<EventRecord>) -> Result<Option<u64>> {
        let parent = self.event.clone();
        self.session
            .commit_internal(event, BTreeMap::new(), Some(&parent), Some(self.lease_until))
            .await
    }

    /// Buffer a non-atomic child event, flushed after the claim is acked.
    pub fn emit(&mut self, event: EventRecord) {
        self.buffered.push(event);
    }

    fn into_buffered(self) -> Vec<EventRecord> {
        self.buffered
    }
}

/// A unit of work against one store and namespace.
pub struct Session {
    ontology: Arc<Ontology>,
    pub namespace: String,
    session_id: String,
    intents: Vec<Intent>,
    stop_requested: bool,
    instance_metadata: BTreeMap<String, Value>,
}

impl Session {
    pub fn new(ontology: Arc<Ontology>, namespace: Option<&str>) -> Self {
        let namespace = namespace
            .map(str::to_string)
            .unwrap_or_else(|| ontology.config().default_namespace.clone());
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "hostname".to_string(),
            Value::String(std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())),
        );
        metadata.insert("pid".to_string(), Value::from(std::process::id()));
        metadata.insert("namespace".to_string(), Value::String(namespace.clone()));
        Session {
            ontology,
            namespace,
            session_id: Uuid::new_v4().to_string(),
            intents: Vec::new(),
            stop_requested: false,
            instance_metadata: metadata,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn ontology(&self) -> &Ontology {
        &self.ontology
    }

    pub fn query(&self) -> QueryBuilder {
        self.ontology.query()
    }

    /// Request a graceful exit at the next loop iteration boundary.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    async fn ensure_schema_validated(&self) -> Result<()> {
        if self.ontology.is_validated() || !self.ontology.has_registered_types() {
            return Ok(());
        }
        self.ontology.validate().await
    }

    /// Queue an entity to be ensured at the next commit.
    pub fn ensure<E: EntityModel>(&mut self, entity: &E) -> Result<()> {
        self.intents.push(Intent::Entity {
            type_name: E::entity_name().to_string(),
            key: entity.key(),
            fields: entity.to_fields()?,
        });
        Ok(())
    }

    /// Queue a relation to be ensured at the next commit. Instance keys
    /// are validated against the declared schema here.
    pub fn ensure_relation<R: RelationModel>(&mut self, relation: &R) -> Result<()> {
        let schema = R::schema()?;
        let ik_value = relation.instance_key();
        let instance_key = normalize_instance_key(&schema, ik_value.as_deref())?;
        self.intents.push(Intent::Relation {
            type_name: R::relation_name().to_string(),
            left_key: relation.left_key(),
            right_key: relation.right_key(),
            instance_key,
            fields: relation.to_fields()?,
        });
        Ok(())
    }

    pub fn ensure_all<'e, E: EntityModel + 'e>(
        &mut self,
        entities: impl IntoIterator<Item = &'e E>,
    ) -> Result<()> {
        for entity in entities {
            self.ensure(entity)?;
        }
        Ok(())
    }

    pub fn pending_intents(&self) -> usize {
        self.intents.len()
    }

    /// Discard all pending intents.
    pub fn rollback(&mut self) {
        self.intents.clear();
    }

    /// Commit pending intents; returns the new commit id, or `None` when
    /// every intent was a no-op.
    pub async fn commit(&mut self) -> Result<Option<u64>> {
        self.commit_internal(None, BTreeMap::new(), None, None).await
    }

    /// Commit pending intents and atomically enqueue one successor event.
    pub async fn commit_with_event(&mut self, event: EventRecord) -> Result<Option<u64>> {
        self.commit_internal(Some(event), BTreeMap::new(), None, None).await
    }

    fn prepare_event(
        &self,
        mut event: EventRecord,
        parent: Option<&EventRecord>,
    ) -> Result<EventRecord> {
        event.created_at = Utc::now();
        match parent {
            None => {
                if event.root_event_id.is_empty() {
                    event.root_event_id = event.id.clone();
                }
                event.chain_depth = 0;
            }
            Some(parent) => {
                let depth = parent.chain_depth + 1;
                if depth > self.ontology.config().max_event_chain_depth {
                    return Err(OntoError::EventLoopLimit {
                        depth,
                        limit: self.ontology.config().max_event_chain_depth,
                    });
                }
                event.root_event_id = if parent.root_event_id.is_empty() {
                    parent.id.clone()
                } else {
                    parent.root_event_id.clone()
                };
                event.chain_depth = depth;
            }
        }
        Ok(event)
    }

    async fn compute_delta(&self, intents: Vec<Intent>) -> Result<Vec<Intent>> {
        let backend = self.ontology.backend();
        let mut changes = Vec::new();
        for intent in intents {
            match &intent {
                Intent::Entity { type_name, key, fields } => {
                    let current = backend.get_latest_entity(type_name, key).await?;
                    if current.map(|row| row.fields != *fields).unwrap_or(true) {
                        changes.push(intent);
                    }
                }
                Intent::Relation { type_name, left_key, right_key, instance_key, fields } => {
                    let current = backend
                        .get_latest_relation(type_name, left_key, right_key, instance_key)
                        .await?;
                    if current.map(|row| row.fields != *fields).unwrap_or(true) {
                        changes.push(intent);
                    }
                }
            }
        }
        Ok(changes)
    }

    pub(crate) async fn commit_internal(
        &mut self,
        event: Option<EventRecord>,
        commit_meta: BTreeMap<String, String>,
        parent_event: Option<&EventRecord>,
        lease_until: Option<DateTime<Utc>>,
    ) -> Result<Option<u64>> {
        self.ensure_schema_validated().await?;

        if let Some(lease_until) = lease_until {
            if Utc::now() > lease_until {
                return Err(OntoError::LeaseExpired);
            }
        }

        if self.intents.is_empty() && event.is_none() {
            return Ok(None);
        }

        let config = self.ontology.config().clone();
        if self.intents.len() > config.max_batch_size {
            let actual = self.intents.len();
            self.intents.clear();
            return Err(OntoError::BatchSizeExceeded { actual, limit: config.max_batch_size });
        }

        let intents = std::mem::take(&mut self.intents);
        let backend = self.ontology.backend();

        if !backend
            .acquire_lock(&self.session_id, config.lock_timeout_ms, config.lease_ttl_ms)
            .await?
        {
            return Err(OntoError::LockContention { timeout_ms: config.lock_timeout_ms });
        }

        let outcome = self
            .commit_under_lock(&backend, intents, event, commit_meta, parent_event)
            .await;

        if let Err(e) = backend.release_lock(&self.session_id).await {
            warn!(error = %e, "failed to release write lock");
        }
        outcome
    }

    async fn commit_under_lock(
        &self,
        backend: &Arc<dyn OntoBackend>,
        intents: Vec<Intent>,
        event: Option<EventRecord>,
        commit_meta: BTreeMap<String, String>,
        parent_event: Option<&EventRecord>,
    ) -> Result<Option<u64>> {
        let changes = self.compute_delta(intents).await?;

        let mut metadata = BTreeMap::new();
        metadata.insert("namespace".to_string(), self.namespace.clone());
        metadata.extend(commit_meta);

        let backend_kind = backend.storage_info().backend;
        let version_ids = self.ontology.schema_version_ids();

        backend.begin_transaction().await?;
        let staged: Result<Option<u64>> = async {
            let mut commit_id = None;
            if !changes.is_empty() {
                let touched: Vec<TypeName> = changes.iter().map(|c| c.type_name()).collect();
                self.ontology.assert_no_schema_drift(&touched).await?;

                let id = backend.create_commit(Some(metadata)).await?;
                for change in &changes {
                    match change {
                        Intent::Entity { type_name, key, fields } => {
                            let svid = version_ids.get(&TypeName::entity(type_name.clone()));
                            backend
                                .insert_entity(type_name, key, fields, id, svid.copied())
                                .await?;
                        }
                        Intent::Relation {
                            type_name,
                            left_key,
                            right_key,
                            instance_key,
                            fields,
                        } => {
                            let svid = version_ids.get(&TypeName::relation(type_name.clone()));
                            backend
                                .insert_relation(
                                    type_name,
                                    left_key,
                                    right_key,
                                    instance_key,
                                    fields,
                                    id,
                                    svid.copied(),
                                )
                                .await?;
                        }
                    }
                }
                commit_id = Some(id);
            }

            // The embedded backend enqueues inside the same transaction;
            // commit-with-event is fully atomic there.
            if let Some(event) = &event {
                if backend_kind == BackendKind::Sqlite {
                    let prepared = self.prepare_event(event.clone(), parent_event)?;
                    backend.enqueue(&prepared, &self.namespace).await?;
                }
            }
            Ok(commit_id)
        }
        .await;

        let commit_id = match staged {
            Ok(commit_id) => {
                backend.commit_transaction().await?;
                commit_id
            }
            Err(e) => {
                let _ = backend.rollback_transaction().await;
                return Err(e);
            }
        };

        // On the object backend the event publishes after the head CAS; a
        // crash between the two loses the event. Known asymmetry.
        if let Some(event) = event {
            if backend_kind != BackendKind::Sqlite {
                let prepared = self.prepare_event(event, parent_event)?;
                backend.enqueue(&prepared, &self.namespace).await?;
            }
        }

        if let Some(id) = commit_id {
            debug!(commit_id = id, namespace = %self.namespace, "commit written");
        }
        Ok(commit_id)
    }

    fn build_handler_entries(
        &self,
        handlers: &[Arc<dyn EventHandler>],
    ) -> Result<Vec<HandlerEntry>> {
        let mut entries = Vec::new();
        let mut seen = std::collections::BTreeSet::new();
        for handler in handlers {
            let handler_id = handler.handler_id();
            if handler_id.is_empty() {
                return Err(OntoError::Handler("handler id must not be empty".to_string()));
            }
            if !seen.insert(handler_id.clone()) {
                return Err(OntoError::Handler(format!("duplicate handler: {handler_id}")));
            }
            entries.push(HandlerEntry {
                handler: Arc::clone(handler),
                event_type: handler.event_type(),
                handler_id,
            });
        }
        entries.sort_by(|a, b| {
            b.handler
                .priority()
                .cmp(&a.handler.priority())
                .then(a.handler_id.cmp(&b.handler_id))
        });
        Ok(entries)
    }

    /// Run the handler loop until `stop()`, `max_iterations`, or forever.
    pub async fn run(
        &mut self,
        handlers: Vec<Arc<dyn EventHandler>>,
        schedules: Vec<Schedule>,
        max_iterations: Option<u64>,
    ) -> Result<()> {
        self.ensure_schema_validated().await?;

        let entries = self.build_handler_entries(&handlers)?;
        let backend = self.ontology.backend();
        let config = self.ontology.config().clone();

        let mut schedule_states = Vec::new();
        for schedule in schedules {
            let cron = CronSpec::parse(&schedule.cron)?;
            let next_fire = cron.next_fire(Utc::now())?;
            schedule_states.push(ScheduleState { template: schedule.template, cron, next_fire });
        }

        backend
            .register_session(&self.session_id, &self.namespace, &self.instance_metadata)
            .await?;

        let heartbeat_interval = Duration::milliseconds(config.session_heartbeat_interval_ms as i64);
        let poll_interval = std::time::Duration::from_millis(config.event_poll_interval_ms);
        let mut next_heartbeat = Utc::now();

        self.stop_requested = false;
        let mut iterations = 0u64;

        while !self.stop_requested {
            if let Some(max) = max_iterations {
                if iterations >= max {
                    break;
                }
            }

            let now = Utc::now();
            if now >= next_heartbeat {
                backend.heartbeat(&self.session_id, &self.namespace).await?;
                next_heartbeat = now + heartbeat_interval;
            }

            for state in &mut schedule_states {
                while now >= state.next_fire {
                    let fresh = state.template.clone_fresh();
                    let prepared = self.prepare_event(fresh, None)?;
                    backend.enqueue(&prepared, &self.namespace).await?;
                    state.next_fire = state.cron.next_fire(state.next_fire)?;
                }
            }

            let mut processed = 0usize;
            for entry in &entries {
                if processed >= config.max_events_per_iteration {
                    break;
                }
                let remaining = config.max_events_per_iteration - processed;
                let claim_limit = config.event_claim_limit.min(remaining);

                let claimed = backend
                    .claim(
                        &self.namespace,
                        &entry.handler_id,
                        &self.session_id,
                        std::slice::from_ref(&entry.event_type),
                        claim_limit,
                        config.event_claim_lease_ms,
                    )
                    .await?;

                for claimed_event in claimed {
                    if processed >= config.max_events_per_iteration {
                        break;
                    }
                    processed += 1;

                    let event_id = claimed_event.event.id.clone();
                    self.intents.clear();

                    let mut ctx = HandlerContext {
                        event: claimed_event.event.clone(),
                        lease_until: claimed_event.lease_until,
                        session: &mut *self,
                        buffered: Vec::new(),
                    };

                    match entry.handler.handle(&mut ctx).await {
                        Err(e) => {
                            drop(ctx);
                            self.intents.clear();
                            backend
                                .release(
                                    &entry.handler_id,
                                    &event_id,
                                    &self.namespace,
                                    Some(&format!("{e:#}")),
                                )
                                .await?;
                            continue;
                        }
                        Ok(()) => {
                            let buffered = ctx.into_buffered();
                            // Ack first, then flush: a flush failure must
                            // not retry the handler, or atomic
                            // commit-with-event side effects would repeat.
                            if let Err(e) =
                                backend.ack(&entry.handler_id, &event_id, &self.namespace).await
                            {
                                warn!(error = %e, event_id, "ack failed; skipping flush");
                                continue;
                            }
                            for out_event in buffered {
                                let prepared =
                                    match self.prepare_event(out_event, Some(&claimed_event.event))
                                    {
                                        Ok(prepared) => prepared,
                                        Err(e) => {
                                            warn!(error = %e, "buffered event dropped");
                                            continue;
                                        }
                                    };
                                if let Err(e) =
                                    backend.enqueue(&prepared, &self.namespace).await
                                {
                                    warn!(error = %e, "buffered event lost after ack");
                                }
                            }
                        }
                    }
                }
            }

            iterations += 1;
            if self.stop_requested {
                break;
            }
            if let Some(max) = max_iterations {
                if iterations >= max {
                    break;
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
        Ok(())
    }
}
