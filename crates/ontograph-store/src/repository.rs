//! Backend contracts: the versioned repository and the durable event store.
//!
//! Both backends (embedded SQLite, object store) implement both traits with
//! equivalent semantics; callers never branch on the variant. Backend-
//! specific behavior (transaction staging, head CAS, post-publish event
//! enqueue) stays behind these contracts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use ontograph_core::{
    ClaimedEvent, DeadLetterSummary, EventInspection, EventRecord, EventSummary, Filter,
    NamespaceInfo, Result, SchemaVersionRecord, SessionRecord, TypeKind, TypeName,
};

/// An atomic, monotonically-numbered unit of state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRecord {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<BTreeMap<String, String>>,
}

/// Append-only entity history row.
#[derive(Debug, Clone)]
pub struct EntityRow {
    pub key: String,
    pub fields: Map<String, Value>,
    pub commit_id: u64,
    pub schema_version_id: Option<u32>,
}

/// Append-only relation history row.
#[derive(Debug, Clone)]
pub struct RelationRow {
    pub left_key: String,
    pub right_key: String,
    pub instance_key: String,
    pub fields: Map<String, Value>,
    pub commit_id: u64,
    pub schema_version_id: Option<u32>,
}

/// Temporal read window. A read specifies at most one form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadWindow {
    /// Maximum-commit row per identity.
    #[default]
    Latest,
    /// Maximum-commit row per identity with `commit_id <= c`.
    AsOf(u64),
    /// Every row, oldest first.
    WithHistory,
    /// Every row with `commit_id > c`, oldest first.
    HistorySince(u64),
}

/// Query shape shared by entity and relation reads.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub filter: Option<Filter>,
    /// Field name (dotted sub-paths allowed) to order by.
    pub order_by: Option<String>,
    pub order_desc: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub window: ReadWindow,
    /// The session's pinned current schema version for the queried type.
    pub schema_version_id: Option<u32>,
}

impl QuerySpec {
    pub fn latest() -> Self {
        QuerySpec::default()
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_window(mut self, window: ReadWindow) -> Self {
        self.window = window;
        self
    }
}

/// Endpoint entity types of a relation, required when a filter or grouping
/// addresses `left.$.F` / `right.$.F`.
#[derive(Debug, Clone, Default)]
pub struct EndpointTypes {
    pub left: Option<String>,
    pub right: Option<String>,
}

impl EndpointTypes {
    pub fn new(left: impl Into<String>, right: impl Into<String>) -> Self {
        EndpointTypes { left: Some(left.into()), right: Some(right.into()) }
    }
}

/// Aggregate functions over the latest view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    /// Average of `length(list_field)`; NULL excluded, `[]` counts as 0.
    AvgLen,
}

/// One aliased aggregation inside a group-by.
#[derive(Debug, Clone)]
pub struct AggSpec {
    pub alias: String,
    pub func: AggFunc,
    /// `None` for COUNT.
    pub field: Option<String>,
}

impl AggSpec {
    pub fn count(alias: impl Into<String>) -> Self {
        AggSpec { alias: alias.into(), func: AggFunc::Count, field: None }
    }

    pub fn new(alias: impl Into<String>, func: AggFunc, field: impl Into<String>) -> Self {
        AggSpec { alias: alias.into(), func, field: Some(field.into()) }
    }
}

/// Comparison over an aggregation alias, applied after grouping.
#[derive(Debug, Clone)]
pub struct Having {
    pub alias: String,
    pub op: ontograph_core::CompareOp,
    pub value: Value,
}

/// Direction of a traversal step relative to the relation's declared
/// endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalSide {
    /// The entity is the relation's left endpoint.
    Left,
    /// The entity is the relation's right endpoint.
    Right,
}

/// Operation inferred for a row inside a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    UpdateVersion,
}

/// One changed identity inside a commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitChange {
    pub kind: TypeKind,
    pub type_name: String,
    pub key: Option<String>,
    pub left_key: Option<String>,
    pub right_key: Option<String>,
    pub instance_key: Option<String>,
    pub operation: ChangeOp,
}

/// Why the last read returned a restricted result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDiagnostics {
    pub reason: DiagnosticReason,
    pub activation_commit_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticReason {
    /// `as_of(c)` requested with `c` before the type's activation commit.
    CommitBeforeActivation,
}

/// Which backend a store runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Sqlite,
    Object,
}

/// Backend snapshot for operator tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageInfo {
    pub backend: BackendKind,
    pub engine_version: String,
    pub location: String,
    /// Current type layouts on v2 engines.
    pub type_layouts: BTreeMap<String, Value>,
}

/// A session listing row with computed liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListing {
    #[serde(flatten)]
    pub record: SessionRecord,
    pub is_dead: bool,
}

/// Versioned repository over entity and relation history.
///
/// Guarantees:
/// - Commits are dense, 1-based and totally ordered per store.
/// - History rows are never rewritten; updates append at a higher commit.
/// - Reads honoring an activation boundary never return rows written under
///   a non-current schema version.
#[async_trait]
pub trait Repository: Send + Sync {
    // --- Commits ---

    async fn create_commit(&self, metadata: Option<BTreeMap<String, String>>) -> Result<u64>;

    async fn get_head_commit_id(&self) -> Result<Option<u64>>;

    async fn get_commit(&self, commit_id: u64) -> Result<Option<CommitRecord>>;

    /// Newest first; `since_commit_id` restricts to ids strictly above it.
    async fn list_commits(
        &self,
        limit: usize,
        since_commit_id: Option<u64>,
    ) -> Result<Vec<CommitRecord>>;

    async fn list_commit_changes(&self, commit_id: u64) -> Result<Vec<CommitChange>>;

    async fn count_commit_operations(&self, commit_id: u64) -> Result<u64>;

    // --- Entities ---

    async fn get_latest_entity(&self, type_name: &str, key: &str) -> Result<Option<EntityRow>>;

    async fn insert_entity(
        &self,
        type_name: &str,
        key: &str,
        fields: &Map<String, Value>,
        commit_id: u64,
        schema_version_id: Option<u32>,
    ) -> Result<()>;

    async fn query_entities(&self, type_name: &str, spec: &QuerySpec) -> Result<Vec<EntityRow>>;

    async fn count_entities(&self, type_name: &str, filter: Option<&Filter>) -> Result<u64>;

    async fn aggregate_entities(
        &self,
        type_name: &str,
        func: AggFunc,
        field: &str,
        filter: Option<&Filter>,
    ) -> Result<Value>;

    async fn group_by_entities(
        &self,
        type_name: &str,
        group_field: &str,
        aggs: &[AggSpec],
        filter: Option<&Filter>,
        having: Option<&Having>,
    ) -> Result<Vec<Map<String, Value>>>;

    // --- Relations ---

    async fn get_latest_relation(
        &self,
        type_name: &str,
        left_key: &str,
        right_key: &str,
        instance_key: &str,
    ) -> Result<Option<RelationRow>>;

    #[allow(clippy::too_many_arguments)]
    async fn insert_relation(
        &self,
        type_name: &str,
        left_key: &str,
        right_key: &str,
        instance_key: &str,
        fields: &Map<String, Value>,
        commit_id: u64,
        schema_version_id: Option<u32>,
    ) -> Result<()>;

    async fn query_relations(
        &self,
        type_name: &str,
        endpoints: &EndpointTypes,
        spec: &QuerySpec,
    ) -> Result<Vec<RelationRow>>;

    async fn count_relations(
        &self,
        type_name: &str,
        endpoints: &EndpointTypes,
        filter: Option<&Filter>,
    ) -> Result<u64>;

    async fn aggregate_relations(
        &self,
        type_name: &str,
        func: AggFunc,
        field: &str,
        filter: Option<&Filter>,
    ) -> Result<Value>;

    #[allow(clippy::too_many_arguments)]
    async fn group_by_relations(
        &self,
        type_name: &str,
        group_field: &str,
        aggs: &[AggSpec],
        endpoints: &EndpointTypes,
        filter: Option<&Filter>,
        having: Option<&Having>,
    ) -> Result<Vec<Map<String, Value>>>;

    /// Latest relations touching an entity on the given side.
    async fn get_relations_for_entity(
        &self,
        relation_type: &str,
        entity_key: &str,
        side: TraversalSide,
    ) -> Result<Vec<RelationRow>>;

    // --- Schema registry & versions ---

    async fn get_schema(&self, type_name: &TypeName) -> Result<Option<Value>>;

    async fn store_schema(&self, type_name: &TypeName, schema: &Value) -> Result<()>;

    async fn list_schemas(&self, kind: TypeKind) -> Result<Vec<(String, Value)>>;

    /// Appends a version whose id is `max_existing + 1`.
    async fn create_schema_version(
        &self,
        type_name: &TypeName,
        schema_json: &str,
        schema_hash: &str,
        runtime_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<u32>;

    async fn get_current_schema_version(
        &self,
        type_name: &TypeName,
    ) -> Result<Option<SchemaVersionRecord>>;

    async fn get_schema_version(
        &self,
        type_name: &TypeName,
        version_id: u32,
    ) -> Result<Option<SchemaVersionRecord>>;

    async fn list_schema_versions(&self, type_name: &TypeName) -> Result<Vec<SchemaVersionRecord>>;

    /// Marks the commit at which a version became the type's layout.
    async fn activate_schema_version(
        &self,
        type_name: &TypeName,
        schema_version_id: u32,
        activation_commit_id: u64,
    ) -> Result<()>;

    /// Applies a schema drop atomically and returns the admin commit id.
    async fn apply_schema_drop(
        &self,
        affected_types: &[TypeName],
        purge_history: bool,
        commit_meta: Option<BTreeMap<String, String>>,
    ) -> Result<u64>;

    // --- Migration iteration ---

    async fn count_latest_entities(&self, type_name: &str) -> Result<u64>;

    async fn count_latest_relations(&self, type_name: &str) -> Result<u64>;

    /// Page of latest entity rows ordered by key, for batched rewrites.
    async fn latest_entities_page(
        &self,
        type_name: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<EntityRow>>;

    async fn latest_relations_page(
        &self,
        type_name: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<RelationRow>>;

    // --- Write lock ---

    /// Try to take the `ontology_write` lock, stealing expired leases.
    async fn acquire_lock(&self, owner_id: &str, timeout_ms: u64, lease_ms: u64) -> Result<bool>;

    /// Slide the lease forward. A failed renewal marks the lease unsafe.
    async fn renew_lock(&self, owner_id: &str, lease_ms: u64) -> Result<bool>;

    async fn release_lock(&self, owner_id: &str) -> Result<()>;

    // --- Transactions ---

    async fn begin_transaction(&self) -> Result<()>;

    async fn commit_transaction(&self) -> Result<()>;

    async fn rollback_transaction(&self) -> Result<()>;

    // --- Diagnostics ---

    fn storage_info(&self) -> StorageInfo;

    fn last_query_diagnostics(&self) -> Option<QueryDiagnostics>;
}

/// Durable per-namespace event queue with claim/ack/release semantics.
///
/// Guarantees:
/// - Claim ordering is `(priority DESC, created_at ASC, event_id ASC)`.
/// - No two live claims exist for the same `(event_id, handler_id)`.
/// - After `event_max_attempts` releases, exactly one dead-letter record
///   and one `EventDeadLetter` successor event exist.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn enqueue(&self, event: &EventRecord, namespace: &str) -> Result<()>;

    async fn claim(
        &self,
        namespace: &str,
        handler_id: &str,
        session_id: &str,
        event_types: &[String],
        limit: usize,
        lease_ms: u64,
    ) -> Result<Vec<ClaimedEvent>>;

    async fn ack(&self, handler_id: &str, event_id: &str, namespace: &str) -> Result<()>;

    async fn release(
        &self,
        handler_id: &str,
        event_id: &str,
        namespace: &str,
        error: Option<&str>,
    ) -> Result<()>;

    async fn register_session(
        &self,
        session_id: &str,
        namespace: &str,
        metadata: &BTreeMap<String, Value>,
    ) -> Result<()>;

    async fn heartbeat(&self, session_id: &str, namespace: &str) -> Result<()>;

    async fn list_namespaces(&self, session_ttl_ms: u64) -> Result<Vec<NamespaceInfo>>;

    async fn list_sessions(
        &self,
        namespace: &str,
        session_ttl_ms: u64,
    ) -> Result<Vec<SessionListing>>;

    async fn list_events(&self, namespace: &str, limit: usize) -> Result<Vec<EventSummary>>;

    async fn list_dead_letters(
        &self,
        namespace: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterSummary>>;

    /// Deletes events and claims older than the cutoff. Dead-letter records
    /// are preserved independently of event retention.
    async fn cleanup_events(&self, namespace: &str, before: DateTime<Utc>) -> Result<usize>;

    /// Re-enqueue a copy under a fresh identity; returns the new event id.
    async fn replay_event(&self, namespace: &str, event_id: &str) -> Result<String>;

    async fn inspect_event(
        &self,
        event_id: &str,
        namespace: Option<&str>,
    ) -> Result<Option<EventInspection>>;
}

/// The full backend surface a session binds to.
pub trait OntoBackend: Repository + EventStore {}

impl<T: Repository + EventStore> OntoBackend for T {}
