//! Ontology runtime: type registry and schema validation.
//!
//! Types register their build-time schema descriptors here; `validate`
//! reconciles them against the store's version lineage, auto-creating
//! version 1 for new types and refusing to proceed on drift.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use ontograph_core::{
    diff_schemas, is_legacy_type_spec_upgrade, EntityModel, EntitySchema, OntoError,
    OntologyConfig, RelationModel, RelationSchema, Result, TypeKind, TypeName, TypeSchemaDiff,
};
use ontograph_store::{BackendKind, OntoBackend};

use crate::query::QueryBuilder;

#[derive(Debug, Default)]
pub(crate) struct ValidationState {
    pub validated: bool,
    pub version_ids: BTreeMap<TypeName, u32>,
}

/// The runtime's registry of governed types bound to one backend.
pub struct Ontology {
    pub(crate) config: OntologyConfig,
    pub(crate) backend: Arc<dyn OntoBackend>,
    pub(crate) runtime_id: String,
    pub(crate) entities: BTreeMap<String, EntitySchema>,
    pub(crate) relations: BTreeMap<String, RelationSchema>,
    pub(crate) validation: Mutex<ValidationState>,
}

/// Builder collecting registered types before binding the runtime.
pub struct OntologyBuilder {
    config: OntologyConfig,
    backend: Arc<dyn OntoBackend>,
    entities: BTreeMap<String, EntitySchema>,
    relations: BTreeMap<String, RelationSchema>,
}

impl OntologyBuilder {
    pub fn new(backend: Arc<dyn OntoBackend>, config: OntologyConfig) -> Self {
        OntologyBuilder {
            config,
            backend,
            entities: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    pub fn register_entity<E: EntityModel>(mut self) -> Result<Self> {
        let schema = E::schema()?;
        self.entities.insert(E::entity_name().to_string(), schema);
        Ok(self)
    }

    pub fn register_relation<R: RelationModel>(mut self) -> Result<Self> {
        let schema = R::schema()?;
        self.relations.insert(R::relation_name().to_string(), schema);
        Ok(self)
    }

    pub fn build(self) -> Ontology {
        let runtime_id = self
            .config
            .runtime_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ontology {
            config: self.config,
            backend: self.backend,
            runtime_id,
            entities: self.entities,
            relations: self.relations,
            validation: Mutex::new(ValidationState::default()),
        }
    }
}

impl Ontology {
    pub fn backend(&self) -> Arc<dyn OntoBackend> {
        Arc::clone(&self.backend)
    }

    pub fn config(&self) -> &OntologyConfig {
        &self.config
    }

    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    pub fn has_registered_types(&self) -> bool {
        !self.entities.is_empty() || !self.relations.is_empty()
    }

    pub(crate) fn is_validated(&self) -> bool {
        self.validation.lock().map(|v| v.validated).unwrap_or(false)
    }

    /// The validated schema-version snapshot, by governed type name.
    pub fn schema_version_ids(&self) -> BTreeMap<TypeName, u32> {
        self.validation
            .lock()
            .map(|v| v.version_ids.clone())
            .unwrap_or_default()
    }

    pub(crate) fn invalidate(&self) {
        if let Ok(mut state) = self.validation.lock() {
            state.validated = false;
            state.version_ids.clear();
        }
    }

    /// Query entry point carrying the validated version snapshot.
    pub fn query(&self) -> QueryBuilder {
        QueryBuilder::new(self.backend(), self.schema_version_ids())
    }

    pub(crate) fn code_schema_json(&self, tn: &TypeName) -> Option<Value> {
        match tn.kind {
            TypeKind::Entity => self.entities.get(&tn.name).map(|s| s.to_json()),
            TypeKind::Relation => self.relations.get(&tn.name).map(|s| s.to_json()),
        }
    }

    pub(crate) fn registered_type_names(&self) -> Vec<TypeName> {
        let mut names: Vec<TypeName> = self
            .entities
            .keys()
            .map(|n| TypeName::entity(n.clone()))
            .collect();
        names.extend(self.relations.keys().map(|n| TypeName::relation(n.clone())));
        names
    }

    /// Validate code-defined schemas against the latest stored versions.
    ///
    /// New types get version 1 (`reason = "initial"`); stores whose only
    /// divergence is missing `type_spec` entries are upgraded in place
    /// (`reason = "type_spec_upgrade"`); anything else is drift and fails
    /// with `SchemaOutdated`.
    pub async fn validate(&self) -> Result<()> {
        // Concurrent runtimes race on version creation through the object
        // backend; serialize through the write lock there.
        let lock_owner = if self.backend.storage_info().backend == BackendKind::Object {
            let owner = format!("schema-validate-{}", self.runtime_id);
            if !self
                .backend
                .acquire_lock(&owner, self.config.lock_timeout_ms, self.config.lease_ttl_ms)
                .await?
            {
                return Err(OntoError::LockContention {
                    timeout_ms: self.config.lock_timeout_ms,
                });
            }
            Some(owner)
        } else {
            None
        };

        let outcome = self.validate_inner().await;

        if let Some(owner) = lock_owner {
            let _ = self.backend.release_lock(&owner).await;
        }
        outcome
    }

    async fn validate_inner(&self) -> Result<()> {
        let mut diffs: Vec<TypeSchemaDiff> = Vec::new();
        let mut version_ids: BTreeMap<TypeName, u32> = BTreeMap::new();

        for tn in self.registered_type_names() {
            let code_schema = self
                .code_schema_json(&tn)
                .ok_or_else(|| OntoError::Model(format!("unregistered type {tn}")))?;
            if let Some(vid) = self.validate_type(&tn, &code_schema, &mut diffs).await? {
                version_ids.insert(tn, vid);
            }
        }

        let mut state = self
            .validation
            .lock()
            .map_err(|_| OntoError::backend("validate", "validation state poisoned"))?;
        if !diffs.is_empty() {
            state.validated = false;
            state.version_ids.clear();
            drop(state);
            return Err(OntoError::SchemaOutdated(diffs));
        }
        state.version_ids = version_ids;
        state.validated = true;
        debug!(types = state.version_ids.len(), "schema validated");
        Ok(())
    }

    async fn validate_type(
        &self,
        tn: &TypeName,
        code_schema: &Value,
        diffs: &mut Vec<TypeSchemaDiff>,
    ) -> Result<Option<u32>> {
        let code_json = ontograph_core::canonical_json(code_schema);
        let code_hash = ontograph_core::ContentHash::of_json(code_schema);

        let stored = self.backend.get_current_schema_version(tn).await?;
        match stored {
            None => {
                let vid = self
                    .backend
                    .create_schema_version(
                        tn,
                        &code_json,
                        code_hash.as_str(),
                        Some(&self.runtime_id),
                        Some("initial"),
                    )
                    .await?;
                self.backend.store_schema(tn, code_schema).await?;
                info!(%tn, version = vid, "registered initial schema version");
                Ok(Some(vid))
            }
            Some(stored) if stored.schema_hash == code_hash.as_str() => {
                Ok(Some(stored.schema_version_id))
            }
            Some(stored) => {
                let stored_schema: Value = serde_json::from_str(&stored.schema_json)?;
                if is_legacy_type_spec_upgrade(&stored_schema, code_schema) {
                    let vid = self
                        .backend
                        .create_schema_version(
                            tn,
                            &code_json,
                            code_hash.as_str(),
                            Some(&self.runtime_id),
                            Some("type_spec_upgrade"),
                        )
                        .await?;
                    self.backend.store_schema(tn, code_schema).await?;
                    info!(%tn, version = vid, "auto-upgraded legacy schema without type specs");
                    return Ok(Some(vid));
                }

                diffs.push(diff_schemas(
                    tn.kind,
                    &tn.name,
                    stored.schema_version_id,
                    &stored_schema,
                    code_schema,
                ));
                Ok(None)
            }
        }
    }

    /// Abort a write when any touched type's current version drifted from
    /// the validated snapshot.
    pub(crate) async fn assert_no_schema_drift(&self, touched: &[TypeName]) -> Result<()> {
        let snapshot = {
            let state = self
                .validation
                .lock()
                .map_err(|_| OntoError::backend("commit", "validation state poisoned"))?;
            if !state.validated {
                return Ok(());
            }
            state.version_ids.clone()
        };

        let mut unique: Vec<&TypeName> = touched.iter().collect();
        unique.sort();
        unique.dedup();

        let mut diffs = Vec::new();
        for tn in unique {
            let Some(expected) = snapshot.get(tn) else { continue };
            let code_schema = self
                .code_schema_json(tn)
                .ok_or_else(|| OntoError::Model(format!("unregistered type {tn}")))?;

            match self.backend.get_current_schema_version(tn).await? {
                None => {
                    diffs.push(diff_schemas(
                        tn.kind,
                        &tn.name,
                        0,
                        &serde_json::json!({ "fields": {} }),
                        &code_schema,
                    ));
                }
                Some(stored) if stored.schema_version_id == *expected => {}
                Some(stored) => {
                    let stored_schema: Value = serde_json::from_str(&stored.schema_json)?;
                    diffs.push(diff_schemas(
                        tn.kind,
                        &tn.name,
                        stored.schema_version_id,
                        &stored_schema,
                        &code_schema,
                    ));
                }
            }
        }

        if !diffs.is_empty() {
            self.invalidate();
            return Err(OntoError::SchemaOutdated(diffs));
        }
        Ok(())
    }
}
