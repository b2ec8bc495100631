//! Two-phase schema migration: deterministic preview, atomic apply.
//!
//! The preview token fingerprints both the plan and the head commit so any
//! intervening change invalidates it. Apply runs under the write lock with
//! a keepalive task renewing the lease at one-third of its interval, and
//! rewrites latest rows in fixed-size batches through chained upgraders.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use ontograph_core::{
    canonical_json, diff_schemas, normalize_instance_key, ContentHash, OntoError, Result,
    TypeKind, TypeName, TypeSchemaDiff,
};

use crate::ontology::Ontology;

const MIGRATION_LOCK_TIMEOUT_MS: u64 = 10_000;
const MIGRATION_LEASE_MS: u64 = 60_000;
const REWRITE_BATCH_SIZE: u64 = 1_000;

/// Upgrades a field payload from one schema version to the next.
pub type Upgrader =
    Arc<dyn Fn(Map<String, Value>) -> anyhow::Result<Map<String, Value>> + Send + Sync>;

/// Upgraders keyed by `(type_name, from_version)`.
pub type UpgraderMap = BTreeMap<(String, u32), Upgrader>;

/// Dry-run result of a migration plan.
#[derive(Debug, Clone, Default)]
pub struct MigrationPreview {
    pub has_changes: bool,
    pub token: String,
    pub diffs: Vec<TypeSchemaDiff>,
    pub estimated_rows: BTreeMap<String, u64>,
    pub types_schema_only: Vec<String>,
    pub types_requiring_upgraders: Vec<String>,
    pub missing_upgraders: Vec<String>,
}

/// Outcome of an applied migration.
#[derive(Debug, Clone, Default)]
pub struct MigrationResult {
    pub success: bool,
    pub types_migrated: Vec<String>,
    pub rows_migrated: BTreeMap<String, u64>,
    pub new_schema_versions: BTreeMap<String, u32>,
    pub duration: std::time::Duration,
}

fn compute_plan_hash(diffs: &[TypeSchemaDiff]) -> Result<String> {
    let mut sorted: Vec<&TypeSchemaDiff> = diffs.iter().collect();
    sorted.sort_by(|a, b| (a.type_kind, &a.type_name).cmp(&(b.type_kind, &b.type_name)));
    let plan = serde_json::to_value(&sorted)?;
    Ok(ContentHash::of_json(&plan).as_str().to_string())
}

fn compute_token(plan_hash: &str, head_commit_id: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plan_hash.as_bytes());
    hasher.update(b":");
    hasher.update(head_commit_id.to_string().as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn verify_token(token: &str, plan_hash: &str, head_commit_id: u64) -> bool {
    compute_token(plan_hash, head_commit_id) == token
}

/// Compose upgraders from `from` (exclusive target) in ascending order.
fn chain_upgraders(
    upgraders: &UpgraderMap,
    type_name: &str,
    from: u32,
    to: u32,
) -> Result<Vec<Upgrader>> {
    let mut chain = Vec::new();
    for version in from..to {
        let Some(step) = upgraders.get(&(type_name.to_string(), version)) else {
            return Err(OntoError::MissingUpgraders(BTreeMap::from([(
                type_name.to_string(),
                vec![version],
            )])));
        };
        chain.push(Arc::clone(step));
    }
    Ok(chain)
}

fn run_chain(chain: &[Upgrader], fields: Map<String, Value>) -> anyhow::Result<Map<String, Value>> {
    let mut current = fields;
    for step in chain {
        current = step(current)?;
    }
    Ok(current)
}

/// Renews the write lock lease while a long apply is running.
struct LeaseKeepAlive {
    handle: tokio::task::JoinHandle<()>,
    unsafe_flag: Arc<std::sync::atomic::AtomicBool>,
}

impl LeaseKeepAlive {
    fn start(backend: Arc<dyn ontograph_store::OntoBackend>, owner_id: String) -> Self {
        let unsafe_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&unsafe_flag);
        let handle = tokio::spawn(async move {
            let interval = std::time::Duration::from_millis((MIGRATION_LEASE_MS / 3).max(100));
            loop {
                tokio::time::sleep(interval).await;
                match backend.renew_lock(&owner_id, MIGRATION_LEASE_MS).await {
                    Ok(true) => {}
                    _ => {
                        warn!(owner_id, "lock lease renewal failed; marking lease unsafe");
                        flag.store(true, std::sync::atomic::Ordering::SeqCst);
                        return;
                    }
                }
            }
        });
        LeaseKeepAlive { handle, unsafe_flag }
    }

    fn is_unsafe(&self) -> bool {
        self.unsafe_flag.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn stop(self) -> bool {
        let went_unsafe = self.is_unsafe();
        self.handle.abort();
        went_unsafe
    }
}

impl Ontology {
    async fn compute_migration_plan(
        &self,
    ) -> Result<(Vec<TypeSchemaDiff>, BTreeMap<String, u64>, Vec<String>, Vec<String>)> {
        let mut diffs = Vec::new();
        let mut estimated_rows = BTreeMap::new();
        let mut schema_only = Vec::new();
        let mut needs_upgrader = Vec::new();

        for tn in self.registered_type_names() {
            let code_schema = self
                .code_schema_json(&tn)
                .ok_or_else(|| OntoError::Model(format!("unregistered type {tn}")))?;
            let code_hash = ContentHash::of_json(&code_schema);

            let Some(stored) = self.backend.get_current_schema_version(&tn).await? else {
                continue;
            };
            if stored.schema_hash == code_hash.as_str() {
                continue;
            }

            let stored_schema: Value = serde_json::from_str(&stored.schema_json)?;
            diffs.push(diff_schemas(
                tn.kind,
                &tn.name,
                stored.schema_version_id,
                &stored_schema,
                &code_schema,
            ));

            let row_count = match tn.kind {
                TypeKind::Entity => self.backend.count_latest_entities(&tn.name).await?,
                TypeKind::Relation => self.backend.count_latest_relations(&tn.name).await?,
            };
            estimated_rows.insert(tn.name.clone(), row_count);
            if row_count == 0 {
                schema_only.push(tn.name.clone());
            } else {
                needs_upgrader.push(tn.name.clone());
            }
        }

        Ok((diffs, estimated_rows, schema_only, needs_upgrader))
    }

    /// Compute the migration plan without applying anything.
    pub async fn migrate_preview(
        &self,
        upgraders: Option<&UpgraderMap>,
    ) -> Result<MigrationPreview> {
        let (diffs, estimated_rows, schema_only, needs_upgrader) =
            self.compute_migration_plan().await?;

        if diffs.is_empty() {
            return Ok(MigrationPreview::default());
        }

        let plan_hash = compute_plan_hash(&diffs)?;
        let head = self.backend.get_head_commit_id().await?.unwrap_or(0);
        let token = compute_token(&plan_hash, head);

        let missing: Vec<String> = match upgraders {
            None => needs_upgrader.clone(),
            Some(map) => needs_upgrader
                .iter()
                .filter(|name| match diffs.iter().find(|d| &d.type_name == *name) {
                    Some(diff) => {
                        let from = diff.stored_version;
                        (from..from + 1).any(|v| !map.contains_key(&((*name).clone(), v)))
                    }
                    None => true,
                })
                .cloned()
                .collect(),
        };

        Ok(MigrationPreview {
            has_changes: true,
            token,
            diffs,
            estimated_rows,
            types_schema_only: schema_only,
            types_requiring_upgraders: needs_upgrader,
            missing_upgraders: missing,
        })
    }

    /// Apply the migration plan under the write lock.
    ///
    /// Pass the token from a preview, or `force = true` to skip token
    /// verification (the plan is still recomputed under the lock).
    pub async fn migrate_apply(
        &self,
        token: Option<&str>,
        force: bool,
        upgraders: &UpgraderMap,
    ) -> Result<MigrationResult> {
        if !force && token.is_none() {
            return Err(OntoError::MigrationToken(
                "either a preview token or force is required for apply".to_string(),
            ));
        }
        if force && token.is_some() {
            return Err(OntoError::MigrationToken(
                "cannot pass both a token and force".to_string(),
            ));
        }

        let owner_id = format!("migration-{}-{}", self.runtime_id, Uuid::new_v4());
        if !self
            .backend
            .acquire_lock(&owner_id, MIGRATION_LOCK_TIMEOUT_MS, MIGRATION_LEASE_MS)
            .await?
        {
            return Err(OntoError::LockContention { timeout_ms: MIGRATION_LOCK_TIMEOUT_MS });
        }

        let keep_alive = LeaseKeepAlive::start(self.backend(), owner_id.clone());
        let started = std::time::Instant::now();

        let outcome = self
            .migrate_apply_locked(token, force, upgraders, &keep_alive, started)
            .await;

        keep_alive.stop();
        let _ = self.backend.release_lock(&owner_id).await;
        outcome
    }

    async fn migrate_apply_locked(
        &self,
        token: Option<&str>,
        force: bool,
        upgraders: &UpgraderMap,
        keep_alive: &LeaseKeepAlive,
        started: std::time::Instant,
    ) -> Result<MigrationResult> {
        // Recompute the plan under the lock; the preview may be stale.
        let (diffs, estimated_rows, schema_only, needs_upgrader) =
            self.compute_migration_plan().await?;

        if diffs.is_empty() {
            return Ok(MigrationResult {
                success: true,
                duration: started.elapsed(),
                ..MigrationResult::default()
            });
        }

        if !force {
            let Some(token) = token else {
                return Err(OntoError::MigrationToken(
                    "a preview token is required for apply".to_string(),
                ));
            };
            let plan_hash = compute_plan_hash(&diffs)?;
            let head = self.backend.get_head_commit_id().await?.unwrap_or(0);
            if !verify_token(token, &plan_hash, head) {
                return Err(OntoError::MigrationToken(
                    "migration token is stale; schema or data changed since preview".to_string(),
                ));
            }
        }

        // Upgrader coverage for types with data.
        let mut missing: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for name in &needs_upgrader {
            let Some(diff) = diffs.iter().find(|d| &d.type_name == name) else { continue };
            let from = diff.stored_version;
            let gaps: Vec<u32> = (from..from + 1)
                .filter(|v| !upgraders.contains_key(&(name.clone(), *v)))
                .collect();
            if !gaps.is_empty() {
                missing.insert(name.clone(), gaps);
            }
        }
        if !missing.is_empty() {
            return Err(OntoError::MissingUpgraders(missing));
        }

        self.backend.begin_transaction().await?;
        let applied: Result<MigrationResult> = self
            .apply_in_transaction(&diffs, &estimated_rows, &schema_only, upgraders, keep_alive)
            .await;
        match applied {
            Ok(mut result) => {
                self.backend.commit_transaction().await?;
                self.invalidate();
                result.duration = started.elapsed();
                info!(types = result.types_migrated.len(), "migration applied");
                Ok(result)
            }
            Err(e) => {
                let _ = self.backend.rollback_transaction().await;
                Err(e)
            }
        }
    }

    async fn apply_in_transaction(
        &self,
        diffs: &[TypeSchemaDiff],
        estimated_rows: &BTreeMap<String, u64>,
        schema_only: &[String],
        upgraders: &UpgraderMap,
        keep_alive: &LeaseKeepAlive,
    ) -> Result<MigrationResult> {
        let migrated_meta: Vec<Value> = diffs
            .iter()
            .map(|d| {
                serde_json::json!({
                    "type_kind": d.type_kind.as_str(),
                    "type_name": d.type_name,
                    "from_schema_version_id": d.stored_version,
                    "to_schema_version_id": d.stored_version + 1,
                    "rows_rewritten": estimated_rows.get(&d.type_name).copied().unwrap_or(0),
                })
            })
            .collect();
        let commit_meta = BTreeMap::from([
            ("kind".to_string(), "migration".to_string()),
            (
                "migrated_types".to_string(),
                canonical_json(&Value::Array(migrated_meta)),
            ),
        ]);
        let migration_commit_id = self.backend.create_commit(Some(commit_meta)).await?;

        let mut types_migrated = Vec::new();
        let mut rows_migrated = BTreeMap::new();
        let mut new_versions = BTreeMap::new();

        for diff in diffs {
            if keep_alive.is_unsafe() {
                return Err(OntoError::LeaseExpired);
            }

            let tn = TypeName { kind: diff.type_kind, name: diff.type_name.clone() };
            let code_schema = self
                .code_schema_json(&tn)
                .ok_or_else(|| OntoError::Model(format!("unregistered type {tn}")))?;
            let code_json = canonical_json(&code_schema);
            let code_hash = ContentHash::of_json(&code_schema);
            let vid = self
                .backend
                .create_schema_version(
                    &tn,
                    &code_json,
                    code_hash.as_str(),
                    Some(&self.runtime_id),
                    Some("migration"),
                )
                .await?;

            let row_count = if schema_only.contains(&tn.name) {
                0
            } else {
                let chain = chain_upgraders(upgraders, &tn.name, diff.stored_version, diff.stored_version + 1)?;
                match tn.kind {
                    TypeKind::Entity => {
                        self.rewrite_entities(&tn.name, &chain, migration_commit_id, vid, keep_alive)
                            .await?
                    }
                    TypeKind::Relation => {
                        self.rewrite_relations(&tn.name, &chain, migration_commit_id, vid, keep_alive)
                            .await?
                    }
                }
            };

            self.backend
                .activate_schema_version(&tn, vid, migration_commit_id)
                .await?;
            self.backend.store_schema(&tn, &code_schema).await?;

            new_versions.insert(tn.name.clone(), vid);
            rows_migrated.insert(tn.name.clone(), row_count);
            types_migrated.push(tn.name);
        }

        Ok(MigrationResult {
            success: true,
            types_migrated,
            rows_migrated,
            new_schema_versions: new_versions,
            duration: std::time::Duration::ZERO,
        })
    }

    async fn rewrite_entities(
        &self,
        type_name: &str,
        chain: &[Upgrader],
        migration_commit_id: u64,
        vid: u32,
        keep_alive: &LeaseKeepAlive,
    ) -> Result<u64> {
        let schema = self
            .entities
            .get(type_name)
            .ok_or_else(|| OntoError::Model(format!("unregistered entity '{type_name}'")))?;
        let mut row_count = 0u64;
        let mut offset = 0u64;
        loop {
            if keep_alive.is_unsafe() {
                return Err(OntoError::LeaseExpired);
            }
            let batch = self
                .backend
                .latest_entities_page(type_name, offset, REWRITE_BATCH_SIZE)
                .await?;
            if batch.is_empty() {
                break;
            }
            let batch_len = batch.len() as u64;
            for row in batch {
                let new_fields = run_chain(chain, row.fields.clone())
                    .map_err(|e| OntoError::Migration {
                        type_name: type_name.to_string(),
                        key: row.key.clone(),
                        message: e.to_string(),
                        old_fields: Value::Object(row.fields.clone()),
                    })
                    .and_then(|fields| {
                        schema.validate_fields(&fields).map_err(|e| OntoError::Migration {
                            type_name: type_name.to_string(),
                            key: row.key.clone(),
                            message: e.to_string(),
                            old_fields: Value::Object(row.fields.clone()),
                        })?;
                        Ok(fields)
                    })?;
                self.backend
                    .insert_entity(type_name, &row.key, &new_fields, migration_commit_id, Some(vid))
                    .await?;
                row_count += 1;
            }
            if batch_len < REWRITE_BATCH_SIZE {
                break;
            }
            offset += REWRITE_BATCH_SIZE;
        }
        Ok(row_count)
    }

    async fn rewrite_relations(
        &self,
        type_name: &str,
        chain: &[Upgrader],
        migration_commit_id: u64,
        vid: u32,
        keep_alive: &LeaseKeepAlive,
    ) -> Result<u64> {
        let schema = self
            .relations
            .get(type_name)
            .ok_or_else(|| OntoError::Model(format!("unregistered relation '{type_name}'")))?;
        let mut row_count = 0u64;
        let mut offset = 0u64;
        loop {
            if keep_alive.is_unsafe() {
                return Err(OntoError::LeaseExpired);
            }
            let batch = self
                .backend
                .latest_relations_page(type_name, offset, REWRITE_BATCH_SIZE)
                .await?;
            if batch.is_empty() {
                break;
            }
            let batch_len = batch.len() as u64;
            for row in batch {
                let identity = format!("{}:{}", row.left_key, row.right_key);
                let new_fields = run_chain(chain, row.fields.clone())
                    .map_err(|e| OntoError::Migration {
                        type_name: type_name.to_string(),
                        key: identity.clone(),
                        message: e.to_string(),
                        old_fields: Value::Object(row.fields.clone()),
                    })
                    .and_then(|fields| {
                        schema.validate_fields(&fields).map_err(|e| OntoError::Migration {
                            type_name: type_name.to_string(),
                            key: identity.clone(),
                            message: e.to_string(),
                            old_fields: Value::Object(row.fields.clone()),
                        })?;
                        let ik = if row.instance_key.is_empty() {
                            None
                        } else {
                            Some(row.instance_key.as_str())
                        };
                        normalize_instance_key(schema, ik).map_err(|e| OntoError::Migration {
                            type_name: type_name.to_string(),
                            key: identity.clone(),
                            message: e.to_string(),
                            old_fields: Value::Object(row.fields.clone()),
                        })?;
                        Ok(fields)
                    })?;
                self.backend
                    .insert_relation(
                        type_name,
                        &row.left_key,
                        &row.right_key,
                        &row.instance_key,
                        &new_fields,
                        migration_commit_id,
                        Some(vid),
                    )
                    .await?;
                row_count += 1;
            }
            if batch_len < REWRITE_BATCH_SIZE {
                break;
            }
            offset += REWRITE_BATCH_SIZE;
        }
        Ok(row_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_changes_with_head() {
        let t1 = compute_token("abc", 1);
        let t2 = compute_token("abc", 2);
        assert_ne!(t1, t2);
        assert!(verify_token(&t1, "abc", 1));
        assert!(!verify_token(&t1, "abc", 2));
    }

    #[test]
    fn token_changes_with_plan() {
        assert_ne!(compute_token("abc", 1), compute_token("abd", 1));
    }

    #[test]
    fn plan_hash_is_order_independent() {
        let d1 = TypeSchemaDiff {
            type_kind: TypeKind::Entity,
            type_name: "A".into(),
            stored_version: 1,
            added_fields: vec!["x".into()],
            removed_fields: vec![],
            changed_fields: BTreeMap::new(),
        };
        let d2 = TypeSchemaDiff {
            type_kind: TypeKind::Entity,
            type_name: "B".into(),
            stored_version: 1,
            added_fields: vec![],
            removed_fields: vec!["y".into()],
            changed_fields: BTreeMap::new(),
        };
        let h1 = compute_plan_hash(&[d1.clone(), d2.clone()]).unwrap();
        let h2 = compute_plan_hash(&[d2, d1]).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn chaining_requires_every_step() {
        let mut upgraders: UpgraderMap = BTreeMap::new();
        upgraders.insert(
            ("T".to_string(), 1),
            Arc::new(|f: Map<String, Value>| Ok(f)) as Upgrader,
        );
        assert!(chain_upgraders(&upgraders, "T", 1, 2).is_ok());
        assert!(chain_upgraders(&upgraders, "T", 1, 3).is_err());
    }

    #[test]
    fn chain_composes_in_order() {
        let mut upgraders: UpgraderMap = BTreeMap::new();
        upgraders.insert(
            ("T".to_string(), 1),
            Arc::new(|mut f: Map<String, Value>| {
                f.insert("step".into(), serde_json::json!("one"));
                Ok(f)
            }) as Upgrader,
        );
        upgraders.insert(
            ("T".to_string(), 2),
            Arc::new(|mut f: Map<String, Value>| {
                f.insert("step".into(), serde_json::json!("two"));
                Ok(f)
            }) as Upgrader,
        );
        let chain = chain_upgraders(&upgraders, "T", 1, 3).unwrap();
        let out = run_chain(&chain, Map::new()).unwrap();
        assert_eq!(out["step"], "two");
    }
}
