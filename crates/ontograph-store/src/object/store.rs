//! Object-store backend.
//!
//! Every commit publishes immutable Parquet row segments plus a manifest
//! that links to its parent; a single `meta/head.json` object is compare-
//! and-swapped on publish. Per-type index objects accelerate file selection
//! and are advisory; the manifest chain stays authoritative. The write
//! lock is a JSON object acquired with `If-None-Match` and renewed with
//! `If-Match`; a failed renewal marks the lease unsafe and later writes
//! fail without publishing.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use ontograph_core::{
    canonical_json, ContentHash, Filter, OntoError, OntologyConfig, PathRoot, Result,
    SchemaVersionRecord, TypeKind, TypeName,
};

use super::client::{ObjectClient, ObjectError, PutCondition};
use super::segment;
use crate::repository::{
    AggFunc, AggSpec, BackendKind, ChangeOp, CommitChange, CommitRecord, DiagnosticReason,
    EndpointTypes, EntityRow, Having, QueryDiagnostics, QuerySpec, ReadWindow, RelationRow,
    Repository, StorageInfo, TraversalSide,
};
use crate::sqlite::{now_iso, parse_iso, to_iso};

const ENGINE_VERSION: &str = "v2";
const REINIT_CONFIRM: &str = "reinitialize";

#[derive(Debug, Clone, Default)]
pub(crate) struct StagedCommit {
    pub commit_id: u64,
    pub metadata: BTreeMap<String, String>,
    pub entities: BTreeMap<String, Vec<(String, Map<String, Value>, Option<u32>)>>,
    pub relations: BTreeMap<String, Vec<(String, String, String, Map<String, Value>, Option<u32>)>>,
}

#[derive(Debug, Default)]
pub(crate) struct TxState {
    pub staged: Option<StagedCommit>,
    pub registry_puts: Vec<(TypeName, Value)>,
    pub registry_deletes: Vec<TypeName>,
    pub versions: Vec<(TypeName, SchemaVersionRecord)>,
    pub dropped_sets: Vec<(TypeName, Value)>,
    pub dropped_clears: Vec<TypeName>,
    pub activations: Vec<(TypeName, u32, u64)>,
}

#[derive(Debug, Default)]
pub(crate) struct ObjState {
    pub lock_owner_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub lease_ttl_ms: u64,
    pub lease_unsafe: bool,
    pub tx: Option<TxState>,
}

/// Object-store backed repository and event store.
pub struct ObjectStore {
    pub(crate) client: Arc<dyn ObjectClient>,
    location: String,
    prefix: String,
    pub(crate) config: OntologyConfig,
    runtime_id: String,
    pub(crate) state: tokio::sync::Mutex<ObjState>,
    diagnostics: std::sync::Mutex<Option<QueryDiagnostics>>,
}

impl ObjectStore {
    pub fn new(
        client: Arc<dyn ObjectClient>,
        bucket: &str,
        prefix: &str,
        config: OntologyConfig,
    ) -> Self {
        let location = if prefix.is_empty() {
            format!("s3://{bucket}")
        } else {
            format!("s3://{bucket}/{prefix}")
        };
        let key_prefix = if prefix.is_empty() { String::new() } else { format!("{prefix}/") };
        let runtime_id = config
            .runtime_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        ObjectStore {
            client,
            location,
            prefix: key_prefix,
            config,
            runtime_id,
            state: tokio::sync::Mutex::new(ObjState::default()),
            diagnostics: std::sync::Mutex::new(None),
        }
    }

    pub(crate) fn k(&self, rel: &str) -> String {
        format!("{}{rel}", self.prefix)
    }

    fn head_key(&self) -> String {
        self.k("meta/head.json")
    }

    fn lock_key(&self) -> String {
        self.k("meta/locks/ontology_write.json")
    }

    fn registry_key(&self) -> String {
        self.k("meta/schema/registry.json")
    }

    fn types_key(&self) -> String {
        self.k("meta/schema/types.json")
    }

    fn dropped_key(&self) -> String {
        self.k("meta/schema/dropped.json")
    }

    fn engine_key(&self) -> String {
        self.k("meta/engine.json")
    }

    fn catalog_key(&self) -> String {
        self.k("meta/type_layout_catalog.json")
    }

    fn versions_key(&self, tn: &TypeName) -> String {
        self.k(&format!("meta/schema/versions/{}/{}.json", tn.kind.as_str(), tn.name))
    }

    fn index_key(&self, kind: TypeKind, type_name: &str) -> String {
        let segment = match kind {
            TypeKind::Entity => "entities",
            TypeKind::Relation => "relations",
        };
        self.k(&format!("meta/indices/{segment}/{type_name}.json"))
    }

    // --- JSON object helpers ---

    pub(crate) async fn get_json(&self, key: &str) -> Result<Option<(Value, String)>> {
        match self.client.get(key).await {
            Ok(Some((bytes, etag))) => {
                let value = serde_json::from_slice(&bytes)?;
                Ok(Some((value, etag)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(OntoError::backend("get_object", e)),
        }
    }

    pub(crate) async fn put_json(
        &self,
        key: &str,
        value: &Value,
        condition: PutCondition,
    ) -> std::result::Result<String, ObjectError> {
        self.client
            .put(key, canonical_json(value).into_bytes(), condition)
            .await
    }

    pub(crate) async fn put_json_unchecked(&self, key: &str, value: &Value) -> Result<String> {
        self.put_json(key, value, PutCondition::None)
            .await
            .map_err(|e| OntoError::backend("put_object", e))
    }

    async fn read_head(&self) -> Result<(Value, String)> {
        self.get_json(&self.head_key()).await?.ok_or_else(|| {
            OntoError::UninitializedStorage(format!(
                "no head object at {}; run initialize first",
                self.location
            ))
        })
    }

    async fn head_commit_id(&self) -> Result<u64> {
        let (head, _) = self.read_head().await?;
        Ok(head.get("commit_id").and_then(Value::as_u64).unwrap_or(0))
    }

    /// One-time store initialization; a second call requires the
    /// confirmation token `"reinitialize"`.
    pub async fn initialize(&self, confirm: Option<&str>) -> Result<()> {
        if self.get_json(&self.head_key()).await?.is_some() && confirm != Some(REINIT_CONFIRM) {
            return Err(OntoError::backend(
                "initialize",
                "store already initialized; pass the confirmation token to re-initialize",
            ));
        }
        let now = now_iso();
        self.put_json_unchecked(
            &self.head_key(),
            &json!({
                "commit_id": 0,
                "manifest_path": Value::Null,
                "updated_at": now,
                "runtime_id": self.runtime_id,
            }),
        )
        .await?;
        self.put_json_unchecked(
            &self.engine_key(),
            &json!({ "backend": "s3", "engine_version": ENGINE_VERSION, "created_at": now }),
        )
        .await?;
        self.put_json_unchecked(
            &self.registry_key(),
            &json!({ "entity": {}, "relation": {}, "updated_at": now }),
        )
        .await?;
        self.put_json_unchecked(
            &self.types_key(),
            &json!({ "entities": [], "relations": [], "updated_at": now }),
        )
        .await?;
        debug!(location = %self.location, "object store initialized");
        Ok(())
    }

    fn set_diagnostics(&self, diag: Option<QueryDiagnostics>) {
        if let Ok(mut slot) = self.diagnostics.lock() {
            *slot = diag;
        }
    }

    // --- Dropped / layout metadata ---

    async fn read_dropped_map(&self) -> Result<Value> {
        Ok(self
            .get_json(&self.dropped_key())
            .await?
            .map(|(v, _)| v)
            .unwrap_or_else(|| json!({ "entity": {}, "relation": {} })))
    }

    async fn is_dropped(&self, kind: TypeKind, name: &str) -> Result<bool> {
        {
            let state = self.state.lock().await;
            if let Some(tx) = &state.tx {
                let tn = TypeName { kind, name: name.to_string() };
                if tx.dropped_clears.contains(&tn) {
                    return Ok(false);
                }
                if tx.dropped_sets.iter().any(|(t, _)| *t == tn) {
                    return Ok(true);
                }
            }
        }
        let dropped = self.read_dropped_map().await?;
        Ok(dropped
            .get(kind.as_str())
            .and_then(|m| m.get(name))
            .is_some())
    }

    async fn read_catalog(&self) -> Result<Vec<Value>> {
        Ok(self
            .get_json(&self.catalog_key())
            .await?
            .and_then(|(v, _)| v.as_array().cloned())
            .unwrap_or_default())
    }

    async fn current_layout(&self, kind: TypeKind, name: &str) -> Result<Option<(u32, u64)>> {
        {
            let state = self.state.lock().await;
            if let Some(tx) = &state.tx {
                if let Some((_, svid, commit)) = tx
                    .activations
                    .iter()
                    .rev()
                    .find(|(tn, _, _)| tn.kind == kind && tn.name == name)
                {
                    return Ok(Some((*svid, *commit)));
                }
            }
        }
        let catalog = self.read_catalog().await?;
        Ok(catalog.iter().find_map(|entry| {
            let is_current = entry.get("is_current").and_then(Value::as_bool).unwrap_or(false);
            if !is_current {
                return None;
            }
            if entry.get("type_kind").and_then(Value::as_str) != Some(kind.as_str())
                || entry.get("type_name").and_then(Value::as_str) != Some(name)
            {
                return None;
            }
            let svid = entry.get("schema_version_id").and_then(Value::as_u64)? as u32;
            let commit = entry.get("activation_commit_id").and_then(Value::as_u64)?;
            Some((svid, commit))
        }))
    }

    async fn write_activation(&self, tn: &TypeName, svid: u32, commit_id: u64) -> Result<()> {
        let mut catalog = self.read_catalog().await?;
        for entry in catalog.iter_mut() {
            if entry.get("type_kind").and_then(Value::as_str) == Some(tn.kind.as_str())
                && entry.get("type_name").and_then(Value::as_str) == Some(tn.name.as_str())
            {
                entry["is_current"] = json!(false);
            }
        }
        catalog.retain(|entry| {
            !(entry.get("type_kind").and_then(Value::as_str) == Some(tn.kind.as_str())
                && entry.get("type_name").and_then(Value::as_str) == Some(tn.name.as_str())
                && entry.get("schema_version_id").and_then(Value::as_u64) == Some(svid as u64))
        });
        catalog.push(json!({
            "type_kind": tn.kind.as_str(),
            "type_name": tn.name,
            "schema_version_id": svid,
            "activation_commit_id": commit_id,
            "is_current": true,
        }));
        self.put_json_unchecked(&self.catalog_key(), &Value::Array(catalog)).await?;
        Ok(())
    }

    // --- Schema versions ---

    async fn read_versions(&self, tn: &TypeName) -> Result<Vec<SchemaVersionRecord>> {
        let doc = self.get_json(&self.versions_key(tn)).await?;
        let Some((doc, _)) = doc else { return Ok(Vec::new()) };
        let versions = doc.get("versions").and_then(Value::as_array).cloned().unwrap_or_default();
        versions
            .into_iter()
            .map(|v| Ok(serde_json::from_value(v)?))
            .collect()
    }

    async fn write_versions(&self, tn: &TypeName, versions: &[SchemaVersionRecord]) -> Result<()> {
        let doc = json!({ "versions": versions });
        self.put_json_unchecked(&self.versions_key(tn), &doc).await?;
        Ok(())
    }

    /// Persisted versions plus any staged in the active transaction.
    async fn effective_versions(&self, tn: &TypeName) -> Result<Vec<SchemaVersionRecord>> {
        let mut versions = self.read_versions(tn).await?;
        let state = self.state.lock().await;
        if let Some(tx) = &state.tx {
            versions.extend(
                tx.versions
                    .iter()
                    .filter(|(t, _)| t == tn)
                    .map(|(_, record)| record.clone()),
            );
        }
        Ok(versions)
    }

    // --- Manifest chain and segments ---

    async fn resolve_type_files(
        &self,
        kind: TypeKind,
        type_name: &str,
    ) -> Result<Vec<(String, u64)>> {
        let (head, _) = self.read_head().await?;
        let head_commit = head.get("commit_id").and_then(Value::as_u64).unwrap_or(0);
        if head_commit == 0 {
            return Ok(Vec::new());
        }

        // Advisory index: trusted only when it covers the full head.
        if let Some((index, _)) = self.get_json(&self.index_key(kind, type_name)).await? {
            let max_indexed = index.get("max_indexed_commit").and_then(Value::as_u64).unwrap_or(0);
            if max_indexed == head_commit {
                let mut files = Vec::new();
                for entry in index.get("entries").and_then(Value::as_array).into_iter().flatten() {
                    let (Some(path), Some(commit)) = (
                        entry.get("path").and_then(Value::as_str),
                        entry.get("max_commit_id").and_then(Value::as_u64),
                    ) else {
                        continue;
                    };
                    files.push((path.to_string(), commit));
                }
                return Ok(files);
            }
        }

        // Manifest chain is the authoritative source.
        let mut files = Vec::new();
        let mut next = head
            .get("manifest_path")
            .and_then(Value::as_str)
            .map(str::to_string);
        while let Some(path) = next {
            let Some((manifest, _)) = self.get_json(&self.k(&path)).await? else {
                return Err(OntoError::backend(
                    "resolve_type_files",
                    format!("missing manifest object '{path}'"),
                ));
            };
            let commit_id = manifest.get("commit_id").and_then(Value::as_u64).unwrap_or(0);
            for file in manifest.get("files").and_then(Value::as_array).into_iter().flatten() {
                if file.get("kind").and_then(Value::as_str) == Some(kind.as_str())
                    && file.get("type_name").and_then(Value::as_str) == Some(type_name)
                {
                    if let Some(path) = file.get("path").and_then(Value::as_str) {
                        files.push((path.to_string(), commit_id));
                    }
                }
            }
            next = manifest
                .get("parent_manifest_path")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        files.reverse();
        Ok(files)
    }

    async fn load_entity_rows(&self, type_name: &str) -> Result<Vec<EntityRow>> {
        let files = self.resolve_type_files(TypeKind::Entity, type_name).await?;
        let mut rows = Vec::new();
        for (path, _) in files {
            let found = self
                .client
                .get(&self.k(&path))
                .await
                .map_err(|e| OntoError::backend("load_entity_rows", e))?;
            let Some((bytes, _)) = found else {
                return Err(OntoError::backend(
                    "load_entity_rows",
                    format!("missing segment object '{path}'"),
                ));
            };
            rows.extend(segment::decode_entity_segment(bytes)?);
        }
        Ok(rows)
    }

    async fn load_relation_rows(&self, type_name: &str) -> Result<Vec<RelationRow>> {
        let files = self.resolve_type_files(TypeKind::Relation, type_name).await?;
        let mut rows = Vec::new();
        for (path, _) in files {
            let found = self
                .client
                .get(&self.k(&path))
                .await
                .map_err(|e| OntoError::backend("load_relation_rows", e))?;
            let Some((bytes, _)) = found else {
                return Err(OntoError::backend(
                    "load_relation_rows",
                    format!("missing segment object '{path}'"),
                ));
            };
            rows.extend(segment::decode_relation_segment(bytes)?);
        }
        Ok(rows)
    }

    // --- In-memory temporal window processing ---

    fn entity_window(
        mut rows: Vec<EntityRow>,
        window: ReadWindow,
        schema_version_id: Option<u32>,
    ) -> Vec<EntityRow> {
        let apply_sv = schema_version_id.is_some() && !matches!(window, ReadWindow::Latest);
        if apply_sv {
            rows.retain(|r| r.schema_version_id == schema_version_id);
        }
        match window {
            ReadWindow::WithHistory => {
                rows.sort_by(|a, b| a.commit_id.cmp(&b.commit_id));
                rows
            }
            ReadWindow::HistorySince(since) => {
                rows.retain(|r| r.commit_id > since);
                rows.sort_by(|a, b| a.commit_id.cmp(&b.commit_id));
                rows
            }
            ReadWindow::AsOf(as_of) => {
                rows.retain(|r| r.commit_id <= as_of);
                latest_per_entity(rows)
            }
            ReadWindow::Latest => latest_per_entity(rows),
        }
    }

    fn relation_window(
        mut rows: Vec<RelationRow>,
        window: ReadWindow,
        schema_version_id: Option<u32>,
    ) -> Vec<RelationRow> {
        let apply_sv = schema_version_id.is_some() && !matches!(window, ReadWindow::Latest);
        if apply_sv {
            rows.retain(|r| r.schema_version_id == schema_version_id);
        }
        match window {
            ReadWindow::WithHistory => {
                rows.sort_by(|a, b| a.commit_id.cmp(&b.commit_id));
                rows
            }
            ReadWindow::HistorySince(since) => {
                rows.retain(|r| r.commit_id > since);
                rows.sort_by(|a, b| a.commit_id.cmp(&b.commit_id));
                rows
            }
            ReadWindow::AsOf(as_of) => {
                rows.retain(|r| r.commit_id <= as_of);
                latest_per_relation(rows)
            }
            ReadWindow::Latest => latest_per_relation(rows),
        }
    }

    async fn boundary_window(
        &self,
        active: Option<(u32, u64)>,
        spec: &QuerySpec,
    ) -> Result<Option<(ReadWindow, Option<u32>)>> {
        let Some((current_svid, activation)) = active else {
            return Ok(Some((spec.window, spec.schema_version_id)));
        };
        match spec.window {
            ReadWindow::AsOf(c) => {
                if c < activation {
                    self.set_diagnostics(Some(QueryDiagnostics {
                        reason: DiagnosticReason::CommitBeforeActivation,
                        activation_commit_id: activation,
                    }));
                    return Ok(None);
                }
                Ok(Some((ReadWindow::AsOf(c), Some(current_svid))))
            }
            ReadWindow::WithHistory => Ok(Some((
                ReadWindow::HistorySince(activation.saturating_sub(1)),
                Some(current_svid),
            ))),
            ReadWindow::HistorySince(since) => Ok(Some((
                ReadWindow::HistorySince(since.max(activation.saturating_sub(1))),
                Some(current_svid),
            ))),
            ReadWindow::Latest => {
                let head = self.head_commit_id().await?;
                if head >= activation {
                    Ok(Some((ReadWindow::AsOf(head), Some(current_svid))))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Latest endpoint payloads for relation filtering/hydration, keyed by
    /// entity key, within the outer read's upper bound.
    async fn endpoint_map(
        &self,
        entity_type: &str,
        window: ReadWindow,
    ) -> Result<BTreeMap<String, Map<String, Value>>> {
        let rows = self.load_entity_rows(entity_type).await?;
        let upper = match window {
            ReadWindow::AsOf(c) => ReadWindow::AsOf(c),
            _ => ReadWindow::Latest,
        };
        Ok(Self::entity_window(rows, upper, None)
            .into_iter()
            .map(|r| (r.key, r.fields))
            .collect())
    }

    fn order_and_page<T>(
        mut rows: Vec<T>,
        fields_of: impl Fn(&T) -> &Map<String, Value>,
        spec: &QuerySpec,
    ) -> Result<Vec<T>> {
        if let Some(order_by) = &spec.order_by {
            let segments: Vec<String> =
                order_by.trim_start_matches("$.").split('.').map(str::to_string).collect();
            rows.sort_by(|a, b| {
                let va = ontograph_core::filter::resolve_path(fields_of(a), &segments);
                let vb = ontograph_core::filter::resolve_path(fields_of(b), &segments);
                compare_for_order(va, vb)
            });
            if spec.order_desc {
                rows.reverse();
            }
        }
        let offset = spec.offset.unwrap_or(0) as usize;
        let rows: Vec<T> = rows.into_iter().skip(offset).collect();
        Ok(match spec.limit {
            Some(limit) => rows.into_iter().take(limit as usize).collect(),
            None => rows,
        })
    }

    // --- Lock lease bookkeeping ---

    async fn ensure_lease_safe(&self, op: &str) -> Result<()> {
        let state = self.state.lock().await;
        if state.lease_unsafe {
            return Err(OntoError::LeaseExpired);
        }
        if state.lock_owner_id.is_none() {
            return Err(OntoError::backend(op, "write lock must be acquired before publishing"));
        }
        if let Some(expires) = state.lease_expires_at {
            // A write this close to expiry cannot finish safely; the
            // keepalive should have renewed by now.
            let margin = Duration::milliseconds((state.lease_ttl_ms / 3).max(1) as i64);
            if Utc::now() + margin >= expires {
                return Err(OntoError::LeaseExpired);
            }
        }
        Ok(())
    }

    // --- Publish ---

    async fn publish_staged(&self, staged: StagedCommit) -> Result<()> {
        self.ensure_lease_safe("commit_transaction").await?;

        let (head, head_etag) = self.read_head().await?;
        let current_head = head.get("commit_id").and_then(Value::as_u64).unwrap_or(0);
        if current_head != staged.commit_id.saturating_sub(1) {
            return Err(OntoError::HeadMismatch);
        }

        let nonce = Uuid::new_v4().simple().to_string();
        let base = format!("commits/{}-{}", staged.commit_id, &nonce[..8]);
        let mut files: Vec<Value> = Vec::new();

        for (type_name, rows) in &staged.entities {
            if rows.is_empty() {
                continue;
            }
            let svid = rows[0].2;
            let rel_path = match svid {
                Some(svid) => format!("{base}/entities/{type_name}/v{svid}.parquet"),
                None => format!("{base}/entities/{type_name}.parquet"),
            };
            let body = segment::encode_entity_segment(staged.commit_id, type_name, rows)?;
            let sha = ContentHash::of_bytes(&body);
            self.client
                .put(&self.k(&rel_path), body, PutCondition::None)
                .await
                .map_err(|e| OntoError::backend("publish_segment", e))?;
            files.push(json!({
                "kind": "entity",
                "type_name": type_name,
                "path": rel_path,
                "row_count": rows.len(),
                "schema_version_id": svid,
                "content_sha256": sha.as_str(),
            }));
        }

        for (type_name, rows) in &staged.relations {
            if rows.is_empty() {
                continue;
            }
            let svid = rows[0].4;
            let rel_path = match svid {
                Some(svid) => format!("{base}/relations/{type_name}/v{svid}.parquet"),
                None => format!("{base}/relations/{type_name}.parquet"),
            };
            let body = segment::encode_relation_segment(staged.commit_id, type_name, rows)?;
            let sha = ContentHash::of_bytes(&body);
            self.client
                .put(&self.k(&rel_path), body, PutCondition::None)
                .await
                .map_err(|e| OntoError::backend("publish_segment", e))?;
            files.push(json!({
                "kind": "relation",
                "type_name": type_name,
                "path": rel_path,
                "row_count": rows.len(),
                "schema_version_id": svid,
                "content_sha256": sha.as_str(),
            }));
        }

        let manifest_path = format!("{base}/manifest.json");
        let manifest = json!({
            "commit_id": staged.commit_id,
            "parent_commit_id": if current_head > 0 { json!(current_head) } else { Value::Null },
            "parent_manifest_path": head.get("manifest_path").cloned().unwrap_or(Value::Null),
            "created_at": now_iso(),
            "runtime_id": self.runtime_id,
            "metadata": staged.metadata,
            "files": files,
        });
        self.put_json_unchecked(&self.k(&manifest_path), &manifest).await?;

        self.ensure_lease_safe("commit_transaction").await?;

        let next_head = json!({
            "commit_id": staged.commit_id,
            "manifest_path": manifest_path,
            "updated_at": now_iso(),
            "runtime_id": self.runtime_id,
        });
        match self.put_json(&self.head_key(), &next_head, PutCondition::IfMatch(head_etag)).await {
            Ok(_) => {}
            Err(ObjectError::PreconditionFailed) => return Err(OntoError::HeadMismatch),
            Err(e) => return Err(OntoError::backend("head_cas", e)),
        }
        debug!(commit_id = staged.commit_id, "commit published");

        // Post-CAS index update is best effort.
        if let Err(e) = self
            .update_indices(current_head, staged.commit_id, manifest["files"].as_array())
            .await
        {
            warn!(error = %e, "index update skipped");
        }
        Ok(())
    }

    async fn update_indices(
        &self,
        previous_head: u64,
        commit_id: u64,
        files: Option<&Vec<Value>>,
    ) -> Result<()> {
        let Some(files) = files else { return Ok(()) };
        for file in files {
            let (Some(kind_str), Some(type_name), Some(path)) = (
                file.get("kind").and_then(Value::as_str),
                file.get("type_name").and_then(Value::as_str),
                file.get("path").and_then(Value::as_str),
            ) else {
                continue;
            };
            let kind = if kind_str == "entity" { TypeKind::Entity } else { TypeKind::Relation };
            let key = self.index_key(kind, type_name);
            let existing = self.get_json(&key).await?;
            // Only extend an index that covered the previous head, or start
            // one at the first commit. A partial rewrite would be trusted as
            // complete; anything stale stays stale and the manifest chain
            // remains authoritative.
            let mut doc = match existing {
                Some((doc, _))
                    if doc.get("max_indexed_commit").and_then(Value::as_u64)
                        == Some(previous_head) =>
                {
                    doc
                }
                None if previous_head == 0 => {
                    json!({ "type_name": type_name, "entries": [] })
                }
                _ => continue,
            };
            let entries = doc
                .get_mut("entries")
                .and_then(Value::as_array_mut)
                .ok_or_else(|| OntoError::backend("update_indices", "malformed index doc"))?;
            entries.push(json!({
                "min_commit_id": commit_id,
                "max_commit_id": commit_id,
                "path": path,
            }));
            doc["max_indexed_commit"] = json!(commit_id);
            self.put_json_unchecked(&key, &doc).await?;
        }
        Ok(())
    }

    async fn flush_schema_changes(&self, tx: &TxState) -> Result<()> {
        if !tx.registry_puts.is_empty() || !tx.registry_deletes.is_empty() {
            let mut registry = self
                .get_json(&self.registry_key())
                .await?
                .map(|(v, _)| v)
                .unwrap_or_else(|| json!({ "entity": {}, "relation": {} }));
            for (tn, schema) in &tx.registry_puts {
                registry[tn.kind.as_str()][&tn.name] = schema.clone();
            }
            for tn in &tx.registry_deletes {
                if let Some(map) = registry[tn.kind.as_str()].as_object_mut() {
                    map.remove(&tn.name);
                }
            }
            registry["updated_at"] = json!(now_iso());
            self.put_json_unchecked(&self.registry_key(), &registry).await?;
        }

        let mut touched: Vec<&TypeName> = tx.versions.iter().map(|(tn, _)| tn).collect();
        touched.dedup();
        for tn in touched {
            let mut versions = self.read_versions(tn).await?;
            versions.extend(
                tx.versions.iter().filter(|(t, _)| t == tn).map(|(_, record)| record.clone()),
            );
            versions.sort_by_key(|v| v.schema_version_id);
            versions.dedup_by_key(|v| v.schema_version_id);
            self.write_versions(tn, &versions).await?;
        }
        for tn in &tx.registry_deletes {
            // Drops remove the version lineage entirely.
            if tx.dropped_sets.iter().any(|(t, _)| t == tn) {
                self.client
                    .delete(&self.versions_key(tn))
                    .await
                    .map_err(|e| OntoError::backend("flush_schema_changes", e))?;
            }
        }

        if !tx.dropped_sets.is_empty() || !tx.dropped_clears.is_empty() {
            let mut dropped = self.read_dropped_map().await?;
            for (tn, record) in &tx.dropped_sets {
                dropped[tn.kind.as_str()][&tn.name] = record.clone();
            }
            for tn in &tx.dropped_clears {
                if let Some(map) = dropped[tn.kind.as_str()].as_object_mut() {
                    map.remove(&tn.name);
                }
            }
            self.put_json_unchecked(&self.dropped_key(), &dropped).await?;
        }

        // Dropped types lose their current layout.
        if !tx.dropped_sets.is_empty() {
            let mut catalog = self.read_catalog().await?;
            for entry in catalog.iter_mut() {
                let matches_dropped = tx.dropped_sets.iter().any(|(tn, _)| {
                    entry.get("type_kind").and_then(Value::as_str) == Some(tn.kind.as_str())
                        && entry.get("type_name").and_then(Value::as_str)
                            == Some(tn.name.as_str())
                });
                if matches_dropped {
                    entry["is_current"] = json!(false);
                }
            }
            self.put_json_unchecked(&self.catalog_key(), &Value::Array(catalog)).await?;
        }

        for (tn, svid, commit_id) in &tx.activations {
            self.write_activation(tn, *svid, *commit_id).await?;
        }
        Ok(())
    }
}

fn latest_per_entity(rows: Vec<EntityRow>) -> Vec<EntityRow> {
    let mut latest: BTreeMap<String, EntityRow> = BTreeMap::new();
    for row in rows {
        match latest.get(&row.key) {
            Some(existing) if existing.commit_id >= row.commit_id => {}
            _ => {
                latest.insert(row.key.clone(), row);
            }
        }
    }
    latest.into_values().collect()
}

fn latest_per_relation(rows: Vec<RelationRow>) -> Vec<RelationRow> {
    let mut latest: BTreeMap<(String, String, String), RelationRow> = BTreeMap::new();
    for row in rows {
        let key = (row.left_key.clone(), row.right_key.clone(), row.instance_key.clone());
        match latest.get(&key) {
            Some(existing) if existing.commit_id >= row.commit_id => {}
            _ => {
                latest.insert(key, row);
            }
        }
    }
    latest.into_values().collect()
}

fn compare_for_order(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a, b) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Number(x), Value::Number(y)) => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            _ => Ordering::Equal,
        },
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(*b as u8 as f64),
        _ => None,
    }
}

fn aggregate_values(func: AggFunc, values: &[&Value]) -> Value {
    match func {
        AggFunc::Count => json!(values.iter().filter(|v| !v.is_null()).count()),
        AggFunc::Sum => {
            let nums: Vec<f64> = values.iter().filter_map(|v| numeric(v)).collect();
            if nums.is_empty() {
                Value::Null
            } else {
                json!(nums.iter().sum::<f64>())
            }
        }
        AggFunc::Avg => {
            let nums: Vec<f64> = values.iter().filter_map(|v| numeric(v)).collect();
            if nums.is_empty() {
                Value::Null
            } else {
                json!(nums.iter().sum::<f64>() / nums.len() as f64)
            }
        }
        AggFunc::Min => values
            .iter()
            .filter(|v| !v.is_null())
            .min_by(|a, b| compare_for_order(Some(**a), Some(**b)))
            .map(|v| (*v).clone())
            .unwrap_or(Value::Null),
        AggFunc::Max => values
            .iter()
            .filter(|v| !v.is_null())
            .max_by(|a, b| compare_for_order(Some(**a), Some(**b)))
            .map(|v| (*v).clone())
            .unwrap_or(Value::Null),
        AggFunc::AvgLen => {
            let lens: Vec<f64> = values
                .iter()
                .filter_map(|v| v.as_array().map(|a| a.len() as f64))
                .collect();
            if lens.is_empty() {
                Value::Null
            } else {
                json!(lens.iter().sum::<f64>() / lens.len() as f64)
            }
        }
    }
}

fn having_passes(having: &Having, row: &Map<String, Value>) -> bool {
    ontograph_core::filter::compare_values(row.get(&having.alias), having.op, Some(&having.value))
}

#[async_trait]
impl Repository for ObjectStore {
    async fn create_commit(&self, metadata: Option<BTreeMap<String, String>>) -> Result<u64> {
        {
            let state = self.state.lock().await;
            if state.lock_owner_id.is_none() {
                return Err(OntoError::backend(
                    "create_commit",
                    "write lock must be acquired before commit",
                ));
            }
            if let Some(staged) = state.tx.as_ref().and_then(|tx| tx.staged.as_ref()) {
                return Err(OntoError::backend(
                    "create_commit",
                    format!("commit {} is already staged", staged.commit_id),
                ));
            }
        }
        let head = self.head_commit_id().await?;
        let commit_id = head + 1;

        let mut state = self.state.lock().await;
        let tx = state.tx.get_or_insert_with(TxState::default);
        tx.staged = Some(StagedCommit {
            commit_id,
            metadata: metadata.unwrap_or_default(),
            ..StagedCommit::default()
        });
        Ok(commit_id)
    }

    async fn get_head_commit_id(&self) -> Result<Option<u64>> {
        let head = self.head_commit_id().await?;
        Ok(if head == 0 { None } else { Some(head) })
    }

    async fn get_commit(&self, commit_id: u64) -> Result<Option<CommitRecord>> {
        let (head, _) = self.read_head().await?;
        let mut next = head
            .get("manifest_path")
            .and_then(Value::as_str)
            .map(str::to_string);
        while let Some(path) = next {
            let Some((manifest, _)) = self.get_json(&self.k(&path)).await? else { break };
            let id = manifest.get("commit_id").and_then(Value::as_u64).unwrap_or(0);
            if id == commit_id {
                let created_at = manifest
                    .get("created_at")
                    .and_then(Value::as_str)
                    .map(|s| parse_iso("get_commit", s))
                    .transpose()?
                    .unwrap_or_else(Utc::now);
                let metadata: Option<BTreeMap<String, String>> = manifest
                    .get("metadata")
                    .and_then(Value::as_object)
                    .map(|m| {
                        m.iter()
                            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                            .collect()
                    });
                return Ok(Some(CommitRecord { id, created_at, metadata }));
            }
            if id < commit_id {
                break;
            }
            next = manifest
                .get("parent_manifest_path")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        Ok(None)
    }

    async fn list_commits(
        &self,
        limit: usize,
        since_commit_id: Option<u64>,
    ) -> Result<Vec<CommitRecord>> {
        let (head, _) = self.read_head().await?;
        let mut out = Vec::new();
        let mut next = head
            .get("manifest_path")
            .and_then(Value::as_str)
            .map(str::to_string);
        while let Some(path) = next {
            if out.len() >= limit {
                break;
            }
            let Some((manifest, _)) = self.get_json(&self.k(&path)).await? else { break };
            let id = manifest.get("commit_id").and_then(Value::as_u64).unwrap_or(0);
            if let Some(since) = since_commit_id {
                if id <= since {
                    break;
                }
            }
            let created_at = manifest
                .get("created_at")
                .and_then(Value::as_str)
                .map(|s| parse_iso("list_commits", s))
                .transpose()?
                .unwrap_or_else(Utc::now);
            let metadata: Option<BTreeMap<String, String>> = manifest
                .get("metadata")
                .and_then(Value::as_object)
                .map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                });
            out.push(CommitRecord { id, created_at, metadata });
            next = manifest
                .get("parent_manifest_path")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        Ok(out)
    }

    async fn list_commit_changes(&self, commit_id: u64) -> Result<Vec<CommitChange>> {
        // Changes in one commit need its segment rows plus knowledge of
        // earlier rows for the same identity.
        let (head, _) = self.read_head().await?;
        let mut manifests = Vec::new();
        let mut next = head
            .get("manifest_path")
            .and_then(Value::as_str)
            .map(str::to_string);
        while let Some(path) = next {
            let Some((manifest, _)) = self.get_json(&self.k(&path)).await? else { break };
            next = manifest
                .get("parent_manifest_path")
                .and_then(Value::as_str)
                .map(str::to_string);
            manifests.push(manifest);
        }
        let Some(target) = manifests
            .iter()
            .find(|m| m.get("commit_id").and_then(Value::as_u64) == Some(commit_id))
        else {
            return Ok(Vec::new());
        };

        let mut changes = Vec::new();
        for file in target.get("files").and_then(Value::as_array).into_iter().flatten() {
            let kind = file.get("kind").and_then(Value::as_str).unwrap_or_default();
            let type_name = file.get("type_name").and_then(Value::as_str).unwrap_or_default();
            if kind == "entity" {
                let rows = self.load_entity_rows(type_name).await?;
                for row in rows.iter().filter(|r| r.commit_id == commit_id) {
                    let prev = rows
                        .iter()
                        .any(|r| r.key == row.key && r.commit_id < commit_id);
                    changes.push(CommitChange {
                        kind: TypeKind::Entity,
                        type_name: type_name.to_string(),
                        key: Some(row.key.clone()),
                        left_key: None,
                        right_key: None,
                        instance_key: None,
                        operation: if prev { ChangeOp::UpdateVersion } else { ChangeOp::Insert },
                    });
                }
            } else {
                let rows = self.load_relation_rows(type_name).await?;
                for row in rows.iter().filter(|r| r.commit_id == commit_id) {
                    let prev = rows.iter().any(|r| {
                        r.left_key == row.left_key
                            && r.right_key == row.right_key
                            && r.instance_key == row.instance_key
                            && r.commit_id < commit_id
                    });
                    changes.push(CommitChange {
                        kind: TypeKind::Relation,
                        type_name: type_name.to_string(),
                        key: None,
                        left_key: Some(row.left_key.clone()),
                        right_key: Some(row.right_key.clone()),
                        instance_key: Some(row.instance_key.clone()),
                        operation: if prev { ChangeOp::UpdateVersion } else { ChangeOp::Insert },
                    });
                }
            }
        }
        Ok(changes)
    }

    async fn count_commit_operations(&self, commit_id: u64) -> Result<u64> {
        let (head, _) = self.read_head().await?;
        let mut next = head
            .get("manifest_path")
            .and_then(Value::as_str)
            .map(str::to_string);
        while let Some(path) = next {
            let Some((manifest, _)) = self.get_json(&self.k(&path)).await? else { break };
            if manifest.get("commit_id").and_then(Value::as_u64) == Some(commit_id) {
                let total: u64 = manifest
                    .get("files")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(|f| f.get("row_count").and_then(Value::as_u64))
                    .sum();
                return Ok(total);
            }
            next = manifest
                .get("parent_manifest_path")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        Ok(0)
    }

    async fn get_latest_entity(&self, type_name: &str, key: &str) -> Result<Option<EntityRow>> {
        if self.is_dropped(TypeKind::Entity, type_name).await? {
            return Ok(None);
        }
        let rows = self.load_entity_rows(type_name).await?;
        Ok(rows
            .into_iter()
            .filter(|r| r.key == key)
            .max_by_key(|r| r.commit_id))
    }

    async fn insert_entity(
        &self,
        type_name: &str,
        key: &str,
        fields: &Map<String, Value>,
        commit_id: u64,
        schema_version_id: Option<u32>,
    ) -> Result<()> {
        let tn = TypeName::entity(type_name);
        let versions = self.effective_versions(&tn).await?;
        let mut svid = schema_version_id;
        if let Some(current) = versions.iter().map(|v| v.schema_version_id).max() {
            let svid_value = svid.unwrap_or(current);
            if svid_value != current {
                return Err(OntoError::backend(
                    "insert_entity",
                    format!(
                        "schema_version_id mismatch for entity '{type_name}': \
                         expected {current}, got {svid_value}"
                    ),
                ));
            }
            svid = Some(current);
            if self.current_layout(TypeKind::Entity, type_name).await?.map(|(v, _)| v)
                != Some(current)
            {
                let mut state = self.state.lock().await;
                if let Some(tx) = &mut state.tx {
                    tx.activations.push((tn.clone(), current, commit_id));
                } else {
                    drop(state);
                    self.write_activation(&tn, current, commit_id).await?;
                }
            }
        }

        let mut state = self.state.lock().await;
        let Some(tx) = &mut state.tx else {
            return Err(OntoError::backend(
                "insert_entity",
                "inserts require an active transaction on the object backend",
            ));
        };
        let Some(staged) = &mut tx.staged else {
            return Err(OntoError::backend("insert_entity", "no staged commit"));
        };
        if staged.commit_id != commit_id {
            return Err(OntoError::backend(
                "insert_entity",
                format!("commit id {commit_id} does not match staged {}", staged.commit_id),
            ));
        }
        staged
            .entities
            .entry(type_name.to_string())
            .or_default()
            .push((key.to_string(), fields.clone(), svid));
        Ok(())
    }

    async fn query_entities(&self, type_name: &str, spec: &QuerySpec) -> Result<Vec<EntityRow>> {
        self.set_diagnostics(None);
        if self.is_dropped(TypeKind::Entity, type_name).await? {
            return Ok(Vec::new());
        }
        let active = self.current_layout(TypeKind::Entity, type_name).await?;
        let Some((window, svid)) = self.boundary_window(active, spec).await? else {
            return Ok(Vec::new());
        };
        let rows = self.load_entity_rows(type_name).await?;
        let mut rows = Self::entity_window(rows, window, svid);
        if let Some(filter) = &spec.filter {
            rows.retain(|r| filter.matches(&r.fields));
        }
        Self::order_and_page(rows, |r| &r.fields, spec)
    }

    async fn count_entities(&self, type_name: &str, filter: Option<&Filter>) -> Result<u64> {
        if self.is_dropped(TypeKind::Entity, type_name).await? {
            return Ok(0);
        }
        let rows = self.load_entity_rows(type_name).await?;
        let rows = Self::entity_window(rows, ReadWindow::Latest, None);
        Ok(rows
            .iter()
            .filter(|r| filter.map(|f| f.matches(&r.fields)).unwrap_or(true))
            .count() as u64)
    }

    async fn aggregate_entities(
        &self,
        type_name: &str,
        func: AggFunc,
        field: &str,
        filter: Option<&Filter>,
    ) -> Result<Value> {
        if self.is_dropped(TypeKind::Entity, type_name).await? {
            return Ok(Value::Null);
        }
        let segments: Vec<String> = field.split('.').map(str::to_string).collect();
        let rows = self.load_entity_rows(type_name).await?;
        let rows = Self::entity_window(rows, ReadWindow::Latest, None);
        let values: Vec<&Value> = rows
            .iter()
            .filter(|r| filter.map(|f| f.matches(&r.fields)).unwrap_or(true))
            .filter_map(|r| ontograph_core::filter::resolve_path(&r.fields, &segments))
            .collect();
        Ok(aggregate_values(func, &values))
    }

    async fn group_by_entities(
        &self,
        type_name: &str,
        group_field: &str,
        aggs: &[AggSpec],
        filter: Option<&Filter>,
        having: Option<&Having>,
    ) -> Result<Vec<Map<String, Value>>> {
        if self.is_dropped(TypeKind::Entity, type_name).await? {
            return Ok(Vec::new());
        }
        let group_segments: Vec<String> = group_field.split('.').map(str::to_string).collect();
        let rows = self.load_entity_rows(type_name).await?;
        let rows = Self::entity_window(rows, ReadWindow::Latest, None);
        let rows: Vec<&EntityRow> = rows
            .iter()
            .filter(|r| filter.map(|f| f.matches(&r.fields)).unwrap_or(true))
            .collect();

        let mut groups: BTreeMap<String, (Value, Vec<&EntityRow>)> = BTreeMap::new();
        for row in rows {
            let key_value = ontograph_core::filter::resolve_path(&row.fields, &group_segments)
                .cloned()
                .unwrap_or(Value::Null);
            groups
                .entry(canonical_json(&key_value))
                .or_insert_with(|| (key_value, Vec::new()))
                .1
                .push(row);
        }

        let group_key = group_field.split('.').next_back().unwrap_or(group_field).to_string();
        let mut out = Vec::new();
        for (_, (key_value, members)) in groups {
            let mut record = Map::new();
            record.insert(group_key.clone(), key_value);
            for agg in aggs {
                let value = match (&agg.func, &agg.field) {
                    (AggFunc::Count, _) => json!(members.len()),
                    (func, Some(field)) => {
                        let segments: Vec<String> =
                            field.split('.').map(str::to_string).collect();
                        let values: Vec<&Value> = members
                            .iter()
                            .filter_map(|r| {
                                ontograph_core::filter::resolve_path(&r.fields, &segments)
                            })
                            .collect();
                        aggregate_values(*func, &values)
                    }
                    (func, None) => {
                        return Err(OntoError::Filter(format!(
                            "aggregation {func:?} requires a field"
                        )))
                    }
                };
                record.insert(agg.alias.clone(), value);
            }
            if having.map(|h| having_passes(h, &record)).unwrap_or(true) {
                out.push(record);
            }
        }
        Ok(out)
    }

    async fn get_latest_relation(
        &self,
        type_name: &str,
        left_key: &str,
        right_key: &str,
        instance_key: &str,
    ) -> Result<Option<RelationRow>> {
        if self.is_dropped(TypeKind::Relation, type_name).await? {
            return Ok(None);
        }
        let rows = self.load_relation_rows(type_name).await?;
        Ok(rows
            .into_iter()
            .filter(|r| {
                r.left_key == left_key && r.right_key == right_key && r.instance_key == instance_key
            })
            .max_by_key(|r| r.commit_id))
    }

    async fn insert_relation(
        &self,
        type_name: &str,
        left_key: &str,
        right_key: &str,
        instance_key: &str,
        fields: &Map<String, Value>,
        commit_id: u64,
        schema_version_id: Option<u32>,
    ) -> Result<()> {
        let tn = TypeName::relation(type_name);
        let versions = self.effective_versions(&tn).await?;
        let mut svid = schema_version_id;
        if let Some(current) = versions.iter().map(|v| v.schema_version_id).max() {
            let svid_value = svid.unwrap_or(current);
            if svid_value != current {
                return Err(OntoError::backend(
                    "insert_relation",
                    format!(
                        "schema_version_id mismatch for relation '{type_name}': \
                         expected {current}, got {svid_value}"
                    ),
                ));
            }
            svid = Some(current);
            if self
                .current_layout(TypeKind::Relation, type_name)
                .await?
                .map(|(v, _)| v)
                != Some(current)
            {
                let mut state = self.state.lock().await;
                if let Some(tx) = &mut state.tx {
                    tx.activations.push((tn.clone(), current, commit_id));
                } else {
                    drop(state);
                    self.write_activation(&tn, current, commit_id).await?;
                }
            }
        }

        let mut state = self.state.lock().await;
        let Some(tx) = &mut state.tx else {
            return Err(OntoError::backend(
                "insert_relation",
                "inserts require an active transaction on the object backend",
            ));
        };
        let Some(staged) = &mut tx.staged else {
            return Err(OntoError::backend("insert_relation", "no staged commit"));
        };
        if staged.commit_id != commit_id {
            return Err(OntoError::backend(
                "insert_relation",
                format!("commit id {commit_id} does not match staged {}", staged.commit_id),
            ));
        }
        staged.relations.entry(type_name.to_string()).or_default().push((
            left_key.to_string(),
            right_key.to_string(),
            instance_key.to_string(),
            fields.clone(),
            svid,
        ));
        Ok(())
    }

    async fn query_relations(
        &self,
        type_name: &str,
        endpoints: &EndpointTypes,
        spec: &QuerySpec,
    ) -> Result<Vec<RelationRow>> {
        self.set_diagnostics(None);
        if self.is_dropped(TypeKind::Relation, type_name).await? {
            return Ok(Vec::new());
        }
        let needs_left = spec
            .filter
            .as_ref()
            .map(|f| f.references(PathRoot::Left))
            .unwrap_or(false);
        let needs_right = spec
            .filter
            .as_ref()
            .map(|f| f.references(PathRoot::Right))
            .unwrap_or(false);
        if needs_left && endpoints.left.is_none() {
            return Err(OntoError::Filter(
                "left endpoint type is required for left.$ filters".to_string(),
            ));
        }
        if needs_right && endpoints.right.is_none() {
            return Err(OntoError::Filter(
                "right endpoint type is required for right.$ filters".to_string(),
            ));
        }

        let active = self.current_layout(TypeKind::Relation, type_name).await?;
        let Some((window, svid)) = self.boundary_window(active, spec).await? else {
            return Ok(Vec::new());
        };
        let rows = self.load_relation_rows(type_name).await?;
        let mut rows = Self::relation_window(rows, window, svid);

        if let Some(filter) = &spec.filter {
            let left_map = match (&endpoints.left, needs_left) {
                (Some(left_type), true) => Some(self.endpoint_map(left_type, window).await?),
                _ => None,
            };
            let right_map = match (&endpoints.right, needs_right) {
                (Some(right_type), true) => Some(self.endpoint_map(right_type, window).await?),
                _ => None,
            };
            rows.retain(|r| {
                filter.matches_with_endpoints(
                    &r.fields,
                    left_map.as_ref().and_then(|m| m.get(&r.left_key)),
                    right_map.as_ref().and_then(|m| m.get(&r.right_key)),
                )
            });
        }
        Self::order_and_page(rows, |r| &r.fields, spec)
    }

    async fn count_relations(
        &self,
        type_name: &str,
        _endpoints: &EndpointTypes,
        filter: Option<&Filter>,
    ) -> Result<u64> {
        if self.is_dropped(TypeKind::Relation, type_name).await? {
            return Ok(0);
        }
        let rows = self.load_relation_rows(type_name).await?;
        let rows = Self::relation_window(rows, ReadWindow::Latest, None);
        let direct = filter.and_then(|f| f.extract(PathRoot::Direct));
        Ok(rows
            .iter()
            .filter(|r| direct.as_ref().map(|f| f.matches(&r.fields)).unwrap_or(true))
            .count() as u64)
    }

    async fn aggregate_relations(
        &self,
        type_name: &str,
        func: AggFunc,
        field: &str,
        filter: Option<&Filter>,
    ) -> Result<Value> {
        if self.is_dropped(TypeKind::Relation, type_name).await? {
            return Ok(Value::Null);
        }
        let segments: Vec<String> = field.split('.').map(str::to_string).collect();
        let rows = self.load_relation_rows(type_name).await?;
        let rows = Self::relation_window(rows, ReadWindow::Latest, None);
        let direct = filter.and_then(|f| f.extract(PathRoot::Direct));
        let values: Vec<&Value> = rows
            .iter()
            .filter(|r| direct.as_ref().map(|f| f.matches(&r.fields)).unwrap_or(true))
            .filter_map(|r| ontograph_core::filter::resolve_path(&r.fields, &segments))
            .collect();
        Ok(aggregate_values(func, &values))
    }

    async fn group_by_relations(
        &self,
        type_name: &str,
        group_field: &str,
        aggs: &[AggSpec],
        endpoints: &EndpointTypes,
        filter: Option<&Filter>,
        having: Option<&Having>,
    ) -> Result<Vec<Map<String, Value>>> {
        if self.is_dropped(TypeKind::Relation, type_name).await? {
            return Ok(Vec::new());
        }
        let rows = self.load_relation_rows(type_name).await?;
        let rows = Self::relation_window(rows, ReadWindow::Latest, None);
        let direct = filter.and_then(|f| f.extract(PathRoot::Direct));
        let rows: Vec<&RelationRow> = rows
            .iter()
            .filter(|r| direct.as_ref().map(|f| f.matches(&r.fields)).unwrap_or(true))
            .collect();

        // Grouping on an endpoint field resolves through that endpoint's
        // latest payloads.
        enum GroupSource {
            Direct(Vec<String>),
            Left(Vec<String>),
            Right(Vec<String>),
        }
        let source = if let Some(rest) = group_field.strip_prefix("left.$.") {
            GroupSource::Left(rest.split('.').map(str::to_string).collect())
        } else if let Some(rest) = group_field.strip_prefix("right.$.") {
            GroupSource::Right(rest.split('.').map(str::to_string).collect())
        } else {
            GroupSource::Direct(group_field.split('.').map(str::to_string).collect())
        };
        let left_map = match (&source, &endpoints.left) {
            (GroupSource::Left(_), Some(left_type)) => {
                Some(self.endpoint_map(left_type, ReadWindow::Latest).await?)
            }
            (GroupSource::Left(_), None) => {
                return Err(OntoError::Filter(
                    "left endpoint type is required to group on left.$".to_string(),
                ))
            }
            _ => None,
        };
        let right_map = match (&source, &endpoints.right) {
            (GroupSource::Right(_), Some(right_type)) => {
                Some(self.endpoint_map(right_type, ReadWindow::Latest).await?)
            }
            (GroupSource::Right(_), None) => {
                return Err(OntoError::Filter(
                    "right endpoint type is required to group on right.$".to_string(),
                ))
            }
            _ => None,
        };

        let mut groups: BTreeMap<String, (Value, Vec<&RelationRow>)> = BTreeMap::new();
        for row in rows {
            let key_value = match &source {
                GroupSource::Direct(segments) => {
                    ontograph_core::filter::resolve_path(&row.fields, segments)
                        .cloned()
                        .unwrap_or(Value::Null)
                }
                GroupSource::Left(segments) => left_map
                    .as_ref()
                    .and_then(|m| m.get(&row.left_key))
                    .and_then(|fields| ontograph_core::filter::resolve_path(fields, segments))
                    .cloned()
                    .unwrap_or(Value::Null),
                GroupSource::Right(segments) => right_map
                    .as_ref()
                    .and_then(|m| m.get(&row.right_key))
                    .and_then(|fields| ontograph_core::filter::resolve_path(fields, segments))
                    .cloned()
                    .unwrap_or(Value::Null),
            };
            groups
                .entry(canonical_json(&key_value))
                .or_insert_with(|| (key_value, Vec::new()))
                .1
                .push(row);
        }

        let result_key = group_field
            .trim_start_matches("left.$.")
            .trim_start_matches("right.$.")
            .split('.')
            .next_back()
            .unwrap_or(group_field)
            .to_string();
        let mut out = Vec::new();
        for (_, (key_value, members)) in groups {
            let mut record = Map::new();
            record.insert(result_key.clone(), key_value);
            for agg in aggs {
                let value = match (&agg.func, &agg.field) {
                    (AggFunc::Count, _) => json!(members.len()),
                    (func, Some(field)) => {
                        let segments: Vec<String> =
                            field.split('.').map(str::to_string).collect();
                        let values: Vec<&Value> = members
                            .iter()
                            .filter_map(|r| {
                                ontograph_core::filter::resolve_path(&r.fields, &segments)
                            })
                            .collect();
                        aggregate_values(*func, &values)
                    }
                    (func, None) => {
                        return Err(OntoError::Filter(format!(
                            "aggregation {func:?} requires a field"
                        )))
                    }
                };
                record.insert(agg.alias.clone(), value);
            }
            if having.map(|h| having_passes(h, &record)).unwrap_or(true) {
                out.push(record);
            }
        }
        Ok(out)
    }

    async fn get_relations_for_entity(
        &self,
        relation_type: &str,
        entity_key: &str,
        side: TraversalSide,
    ) -> Result<Vec<RelationRow>> {
        if self.is_dropped(TypeKind::Relation, relation_type).await? {
            return Ok(Vec::new());
        }
        let rows = self.load_relation_rows(relation_type).await?;
        let rows = Self::relation_window(rows, ReadWindow::Latest, None);
        Ok(rows
            .into_iter()
            .filter(|r| match side {
                TraversalSide::Left => r.left_key == entity_key,
                TraversalSide::Right => r.right_key == entity_key,
            })
            .collect())
    }

    async fn get_schema(&self, type_name: &TypeName) -> Result<Option<Value>> {
        let registry = self
            .get_json(&self.registry_key())
            .await?
            .map(|(v, _)| v)
            .unwrap_or_else(|| json!({ "entity": {}, "relation": {} }));
        Ok(registry
            .get(type_name.kind.as_str())
            .and_then(|m| m.get(&type_name.name))
            .cloned())
    }

    async fn store_schema(&self, type_name: &TypeName, schema: &Value) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(tx) = &mut state.tx {
            tx.registry_puts.push((type_name.clone(), schema.clone()));
            return Ok(());
        }
        drop(state);
        let mut registry = self
            .get_json(&self.registry_key())
            .await?
            .map(|(v, _)| v)
            .unwrap_or_else(|| json!({ "entity": {}, "relation": {} }));
        registry[type_name.kind.as_str()][&type_name.name] = schema.clone();
        registry["updated_at"] = json!(now_iso());
        self.put_json_unchecked(&self.registry_key(), &registry).await?;
        Ok(())
    }

    async fn list_schemas(&self, kind: TypeKind) -> Result<Vec<(String, Value)>> {
        let registry = self
            .get_json(&self.registry_key())
            .await?
            .map(|(v, _)| v)
            .unwrap_or_else(|| json!({ "entity": {}, "relation": {} }));
        Ok(registry
            .get(kind.as_str())
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn create_schema_version(
        &self,
        type_name: &TypeName,
        schema_json: &str,
        schema_hash: &str,
        runtime_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<u32> {
        let versions = self.effective_versions(type_name).await?;
        let next_id = versions.iter().map(|v| v.schema_version_id).max().unwrap_or(0) + 1;
        let record = SchemaVersionRecord {
            schema_version_id: next_id,
            schema_json: schema_json.to_string(),
            schema_hash: schema_hash.to_string(),
            created_at: Utc::now(),
            runtime_id: runtime_id.map(str::to_string),
            reason: reason.map(str::to_string),
        };

        let mut state = self.state.lock().await;
        if let Some(tx) = &mut state.tx {
            tx.versions.push((type_name.clone(), record));
            tx.dropped_clears.push(type_name.clone());
            return Ok(next_id);
        }
        drop(state);

        let mut persisted = self.read_versions(type_name).await?;
        persisted.push(record);
        self.write_versions(type_name, &persisted).await?;
        let mut dropped = self.read_dropped_map().await?;
        if let Some(map) = dropped[type_name.kind.as_str()].as_object_mut() {
            if map.remove(&type_name.name).is_some() {
                self.put_json_unchecked(&self.dropped_key(), &dropped).await?;
            }
        }
        Ok(next_id)
    }

    async fn get_current_schema_version(
        &self,
        type_name: &TypeName,
    ) -> Result<Option<SchemaVersionRecord>> {
        if self.is_dropped(type_name.kind, &type_name.name).await? {
            return Ok(None);
        }
        let versions = self.effective_versions(type_name).await?;
        Ok(versions.into_iter().max_by_key(|v| v.schema_version_id))
    }

    async fn get_schema_version(
        &self,
        type_name: &TypeName,
        version_id: u32,
    ) -> Result<Option<SchemaVersionRecord>> {
        let versions = self.effective_versions(type_name).await?;
        Ok(versions.into_iter().find(|v| v.schema_version_id == version_id))
    }

    async fn list_schema_versions(&self, type_name: &TypeName) -> Result<Vec<SchemaVersionRecord>> {
        let mut versions = self.effective_versions(type_name).await?;
        versions.sort_by_key(|v| v.schema_version_id);
        Ok(versions)
    }

    async fn activate_schema_version(
        &self,
        type_name: &TypeName,
        schema_version_id: u32,
        activation_commit_id: u64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(tx) = &mut state.tx {
            tx.activations.push((type_name.clone(), schema_version_id, activation_commit_id));
            return Ok(());
        }
        drop(state);
        self.write_activation(type_name, schema_version_id, activation_commit_id).await
    }

    async fn apply_schema_drop(
        &self,
        affected_types: &[TypeName],
        purge_history: bool,
        commit_meta: Option<BTreeMap<String, String>>,
    ) -> Result<u64> {
        self.begin_transaction().await?;
        let result: Result<u64> = async {
            let commit_id = self.create_commit(commit_meta).await?;
            let mut state = self.state.lock().await;
            let Some(tx) = &mut state.tx else {
                return Err(OntoError::backend("apply_schema_drop", "transaction vanished"));
            };
            for tn in affected_types {
                tx.registry_deletes.push(tn.clone());
                tx.dropped_sets.push((
                    tn.clone(),
                    json!({
                        "commit_id": commit_id,
                        "purged": purge_history,
                        "dropped_at": now_iso(),
                    }),
                ));
            }
            Ok(commit_id)
        }
        .await;

        match result {
            Ok(commit_id) => {
                self.commit_transaction().await?;
                Ok(commit_id)
            }
            Err(e) => {
                self.rollback_transaction().await?;
                Err(e)
            }
        }
    }

    async fn count_latest_entities(&self, type_name: &str) -> Result<u64> {
        let rows = self.load_entity_rows(type_name).await?;
        Ok(latest_per_entity(rows).len() as u64)
    }

    async fn count_latest_relations(&self, type_name: &str) -> Result<u64> {
        let rows = self.load_relation_rows(type_name).await?;
        Ok(latest_per_relation(rows).len() as u64)
    }

    async fn latest_entities_page(
        &self,
        type_name: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<EntityRow>> {
        let rows = self.load_entity_rows(type_name).await?;
        let mut rows = latest_per_entity(rows);
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(rows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn latest_relations_page(
        &self,
        type_name: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<RelationRow>> {
        let rows = self.load_relation_rows(type_name).await?;
        let mut rows = latest_per_relation(rows);
        rows.sort_by(|a, b| {
            (&a.left_key, &a.right_key, &a.instance_key)
                .cmp(&(&b.left_key, &b.right_key, &b.instance_key))
        });
        Ok(rows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn acquire_lock(&self, owner_id: &str, timeout_ms: u64, lease_ms: u64) -> Result<bool> {
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
        loop {
            let now = Utc::now();
            let expires = now + Duration::milliseconds(lease_ms as i64);
            let payload = json!({
                "owner_id": owner_id,
                "acquired_at": to_iso(now),
                "expires_at": to_iso(expires),
                "lease_ttl_ms": lease_ms,
            });

            match self.put_json(&self.lock_key(), &payload, PutCondition::IfNoneMatch).await {
                Ok(_) => {
                    let mut state = self.state.lock().await;
                    state.lock_owner_id = Some(owner_id.to_string());
                    state.lease_expires_at = Some(expires);
                    state.lease_ttl_ms = lease_ms;
                    state.lease_unsafe = false;
                    debug!(owner_id, "write lock acquired");
                    return Ok(true);
                }
                Err(ObjectError::PreconditionFailed) => {
                    // Existing lock: inspect and attempt takeover if expired.
                    if let Some((lock_obj, etag)) = self.get_json(&self.lock_key()).await? {
                        let expires_at = lock_obj
                            .get("expires_at")
                            .and_then(Value::as_str)
                            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|| Utc::now() - Duration::seconds(1));
                        if Utc::now() >= expires_at {
                            match self
                                .put_json(&self.lock_key(), &payload, PutCondition::IfMatch(etag))
                                .await
                            {
                                Ok(_) => {
                                    let mut state = self.state.lock().await;
                                    state.lock_owner_id = Some(owner_id.to_string());
                                    state.lease_expires_at = Some(expires);
                                    state.lease_ttl_ms = lease_ms;
                                    state.lease_unsafe = false;
                                    debug!(owner_id, "expired write lock taken over");
                                    return Ok(true);
                                }
                                Err(ObjectError::PreconditionFailed) => {}
                                Err(e) => return Err(OntoError::backend("acquire_lock", e)),
                            }
                        }
                    }
                    if std::time::Instant::now() >= deadline {
                        return Ok(false);
                    }
                    let jitter = rand::Rng::gen_range(&mut rand::thread_rng(), 0..20u64);
                    tokio::time::sleep(std::time::Duration::from_millis(10 + jitter)).await;
                }
                Err(e) => return Err(OntoError::backend("acquire_lock", e)),
            }
        }
    }

    async fn renew_lock(&self, owner_id: &str, lease_ms: u64) -> Result<bool> {
        {
            let state = self.state.lock().await;
            if state.lock_owner_id.as_deref() != Some(owner_id) {
                return Ok(false);
            }
        }
        let Some((mut lock_obj, etag)) = self.get_json(&self.lock_key()).await? else {
            self.state.lock().await.lease_unsafe = true;
            return Ok(false);
        };
        if lock_obj.get("owner_id").and_then(Value::as_str) != Some(owner_id) {
            self.state.lock().await.lease_unsafe = true;
            return Ok(false);
        }
        let expires = Utc::now() + Duration::milliseconds(lease_ms as i64);
        lock_obj["expires_at"] = json!(to_iso(expires));
        lock_obj["lease_ttl_ms"] = json!(lease_ms);
        match self.put_json(&self.lock_key(), &lock_obj, PutCondition::IfMatch(etag)).await {
            Ok(_) => {
                let mut state = self.state.lock().await;
                state.lease_expires_at = Some(expires);
                state.lease_ttl_ms = lease_ms;
                state.lease_unsafe = false;
                Ok(true)
            }
            Err(_) => {
                self.state.lock().await.lease_unsafe = true;
                Ok(false)
            }
        }
    }

    async fn release_lock(&self, owner_id: &str) -> Result<()> {
        if let Some((lock_obj, _)) = self.get_json(&self.lock_key()).await? {
            if lock_obj.get("owner_id").and_then(Value::as_str) == Some(owner_id) {
                let _ = self.client.delete(&self.lock_key()).await;
            }
        }
        let mut state = self.state.lock().await;
        if state.lock_owner_id.as_deref() == Some(owner_id) {
            state.lock_owner_id = None;
            state.lease_expires_at = None;
            state.lease_unsafe = false;
        }
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.tx.is_none() {
            state.tx = Some(TxState::default());
        }
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        let tx = {
            let mut state = self.state.lock().await;
            state.tx.take()
        };
        let Some(mut tx) = tx else { return Ok(()) };
        let staged = tx.staged.take();
        if let Some(staged) = staged {
            if let Err(e) = self.publish_staged(staged).await {
                // Nothing published; drop the staged schema changes too.
                return Err(e);
            }
        }
        self.flush_schema_changes(&tx).await
    }

    async fn rollback_transaction(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.tx = None;
        Ok(())
    }

    fn storage_info(&self) -> StorageInfo {
        StorageInfo {
            backend: BackendKind::Object,
            engine_version: ENGINE_VERSION.to_string(),
            location: self.location.clone(),
            type_layouts: BTreeMap::new(),
        }
    }

    fn last_query_diagnostics(&self) -> Option<QueryDiagnostics> {
        self.diagnostics.lock().ok().and_then(|slot| slot.clone())
    }
}
