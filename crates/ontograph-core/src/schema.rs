//! Schema descriptors, version records and drift diffs.
//!
//! Schemas are declared in code (see [`crate::model`]), serialized to a
//! canonical JSON form and content-addressed. The stored form is the unit
//! of governance: version records are append-only per `(kind, name)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::canonical::{canonical_json, ContentHash};
use crate::error::{OntoError, Result};
use crate::type_spec::{synthesize_type_spec_from_legacy, TypeSpec};

/// Kind half of a governed type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeKind {
    Entity,
    Relation,
}

impl TypeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeKind::Entity => "entity",
            TypeKind::Relation => "relation",
        }
    }
}

impl std::fmt::Display for TypeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `(kind, name)` pair identifying a governed schema.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TypeName {
    pub kind: TypeKind,
    pub name: String,
}

impl TypeName {
    pub fn entity(name: impl Into<String>) -> Self {
        TypeName { kind: TypeKind::Entity, name: name.into() }
    }

    pub fn relation(name: impl Into<String>) -> Self {
        TypeName { kind: TypeKind::Relation, name: name.into() }
    }
}

impl std::fmt::Display for TypeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Declared field: display type string, algebraic spec and flags.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub type_name: String,
    pub type_spec: TypeSpec,
    pub primary_key: bool,
    pub index: bool,
}

impl FieldSpec {
    pub fn new(type_name: impl Into<String>, type_spec: TypeSpec) -> Self {
        FieldSpec {
            type_name: type_name.into(),
            type_spec,
            primary_key: false,
            index: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.index = true;
        self
    }
}

/// Canonical schema of an entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySchema {
    pub name: String,
    pub fields: BTreeMap<String, FieldSpec>,
    primary_key_field: String,
}

impl EntitySchema {
    pub fn builder(name: impl Into<String>) -> EntitySchemaBuilder {
        EntitySchemaBuilder { name: name.into(), fields: BTreeMap::new() }
    }

    pub fn primary_key_field(&self) -> &str {
        &self.primary_key_field
    }

    /// Canonical JSON form used for storage and hashing.
    pub fn to_json(&self) -> Value {
        let mut fields = Map::new();
        for (name, f) in &self.fields {
            fields.insert(
                name.clone(),
                json!({
                    "primary_key": f.primary_key,
                    "index": f.index,
                    "type": f.type_name,
                    "type_spec": serde_json::to_value(&f.type_spec).expect("type spec serializes"),
                }),
            );
        }
        json!({ "entity_name": self.name, "fields": fields })
    }

    pub fn canonical_json(&self) -> String {
        canonical_json(&self.to_json())
    }

    pub fn hash(&self) -> ContentHash {
        ContentHash::of_json(&self.to_json())
    }

    /// Validate a field payload against the declared specs.
    ///
    /// Declared non-optional fields must be present; extra keys pass
    /// through untouched.
    pub fn validate_fields(&self, fields: &Map<String, Value>) -> Result<()> {
        validate_against(&self.name, &self.fields, fields)
    }
}

pub struct EntitySchemaBuilder {
    name: String,
    fields: BTreeMap<String, FieldSpec>,
}

impl EntitySchemaBuilder {
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    pub fn build(self) -> Result<EntitySchema> {
        let pks: Vec<&String> = self
            .fields
            .iter()
            .filter(|(_, f)| f.primary_key)
            .map(|(n, _)| n)
            .collect();
        match pks.as_slice() {
            [pk] => Ok(EntitySchema {
                primary_key_field: (*pk).clone(),
                name: self.name,
                fields: self.fields,
            }),
            [] => Err(OntoError::Model(format!(
                "entity '{}' must declare exactly one primary key field",
                self.name
            ))),
            many => Err(OntoError::Model(format!(
                "entity '{}' has multiple primary keys: {:?}",
                self.name, many
            ))),
        }
    }
}

/// Canonical schema of a relation type.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationSchema {
    pub name: String,
    pub left_type: String,
    pub right_type: String,
    pub instance_key_field: Option<String>,
    pub fields: BTreeMap<String, FieldSpec>,
}

impl RelationSchema {
    pub fn builder(
        name: impl Into<String>,
        left_type: impl Into<String>,
        right_type: impl Into<String>,
    ) -> RelationSchemaBuilder {
        RelationSchemaBuilder {
            name: name.into(),
            left_type: left_type.into(),
            right_type: right_type.into(),
            instance_key_field: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn to_json(&self) -> Value {
        let mut fields = Map::new();
        for (name, f) in &self.fields {
            fields.insert(
                name.clone(),
                json!({
                    "index": f.index,
                    "type": f.type_name,
                    "type_spec": serde_json::to_value(&f.type_spec).expect("type spec serializes"),
                }),
            );
        }
        json!({
            "relation_name": self.name,
            "left_type": self.left_type,
            "right_type": self.right_type,
            "instance_key_field": self.instance_key_field,
            "fields": fields,
        })
    }

    pub fn canonical_json(&self) -> String {
        canonical_json(&self.to_json())
    }

    pub fn hash(&self) -> ContentHash {
        ContentHash::of_json(&self.to_json())
    }

    /// Validate a data-field payload (instance key excluded) against the
    /// declared specs.
    pub fn validate_fields(&self, fields: &Map<String, Value>) -> Result<()> {
        validate_against(&self.name, &self.fields, fields)
    }
}

pub struct RelationSchemaBuilder {
    name: String,
    left_type: String,
    right_type: String,
    instance_key_field: Option<String>,
    fields: BTreeMap<String, FieldSpec>,
}

impl RelationSchemaBuilder {
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    /// Declare the instance-key field. It is part of the identity, not the
    /// data payload, and must be a string field without a default.
    pub fn instance_key(mut self, field_name: impl Into<String>) -> Self {
        self.instance_key_field = Some(field_name.into());
        self
    }

    pub fn build(self) -> Result<RelationSchema> {
        if let Some((pk, _)) = self.fields.iter().find(|(_, f)| f.primary_key) {
            return Err(OntoError::Model(format!(
                "relation '{}' cannot mark field '{}' as primary key",
                self.name, pk
            )));
        }
        if let Some(ik) = &self.instance_key_field {
            if self.fields.contains_key(ik) {
                return Err(OntoError::Model(format!(
                    "relation '{}': instance key field '{}' must not also be a data field",
                    self.name, ik
                )));
            }
        }
        Ok(RelationSchema {
            name: self.name,
            left_type: self.left_type,
            right_type: self.right_type,
            instance_key_field: self.instance_key_field,
            fields: self.fields,
        })
    }
}

fn validate_against(
    type_name: &str,
    specs: &BTreeMap<String, FieldSpec>,
    fields: &Map<String, Value>,
) -> Result<()> {
    for (name, spec) in specs {
        match fields.get(name) {
            Some(value) => {
                if !spec.type_spec.accepts(value) {
                    return Err(OntoError::Model(format!(
                        "{type_name}.{name}: value {value} does not match declared type {}",
                        spec.type_name
                    )));
                }
            }
            None => {
                if !matches!(spec.type_spec, TypeSpec::Optional { .. }) {
                    return Err(OntoError::Model(format!(
                        "{type_name}.{name}: required field missing"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// One stored schema version for a type. Append-only, never modified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaVersionRecord {
    pub schema_version_id: u32,
    pub schema_json: String,
    pub schema_hash: String,
    pub created_at: DateTime<Utc>,
    pub runtime_id: Option<String>,
    pub reason: Option<String>,
}

/// Marks the commit at which a schema version became a type's layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub type_kind: TypeKind,
    pub type_name: String,
    pub schema_version_id: u32,
    pub activation_commit_id: u64,
    pub is_current: bool,
}

/// Field-level drift between a stored schema and the code schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeSchemaDiff {
    pub type_kind: TypeKind,
    pub type_name: String,
    pub stored_version: u32,
    pub added_fields: Vec<String>,
    pub removed_fields: Vec<String>,
    /// Field name -> { "stored": fragment, "code": fragment }. The synthetic
    /// key `__instance_key_field__` reports instance-key changes.
    pub changed_fields: BTreeMap<String, Value>,
}

/// Compare a stored schema JSON against the code schema JSON.
pub fn diff_schemas(
    type_kind: TypeKind,
    type_name: &str,
    stored_version: u32,
    stored_schema: &Value,
    code_schema: &Value,
) -> TypeSchemaDiff {
    let empty = Map::new();
    let stored_fields = stored_schema
        .get("fields")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let code_fields = code_schema
        .get("fields")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let stored_names: std::collections::BTreeSet<&String> = stored_fields.keys().collect();
    let code_names: std::collections::BTreeSet<&String> = code_fields.keys().collect();

    let added = code_names.difference(&stored_names).map(|s| (*s).clone()).collect();
    let removed = stored_names.difference(&code_names).map(|s| (*s).clone()).collect();

    let mut changed = BTreeMap::new();
    for name in stored_names.intersection(&code_names) {
        let sf = &stored_fields[*name];
        let cf = &code_fields[*name];
        if sf != cf {
            changed.insert((*name).clone(), json!({ "stored": sf, "code": cf }));
        }
    }

    let stored_ik = stored_schema.get("instance_key_field").cloned().unwrap_or(Value::Null);
    let code_ik = code_schema.get("instance_key_field").cloned().unwrap_or(Value::Null);
    if stored_ik != code_ik {
        changed.insert(
            "__instance_key_field__".to_string(),
            json!({ "stored": stored_ik, "code": code_ik }),
        );
    }

    TypeSchemaDiff {
        type_kind,
        type_name: type_name.to_string(),
        stored_version,
        added_fields: added,
        removed_fields: removed,
        changed_fields: changed,
    }
}

/// Check whether a stored schema differs from the code schema only by
/// missing `type_spec` entries that can be synthesized from legacy type
/// strings. When true, the registry may auto-append a new version without
/// running upgraders.
pub fn is_legacy_type_spec_upgrade(stored_schema: &Value, code_schema: &Value) -> bool {
    let (Some(stored_fields), Some(code_fields)) = (
        stored_schema.get("fields").and_then(Value::as_object),
        code_schema.get("fields").and_then(Value::as_object),
    ) else {
        return false;
    };

    let stored_names: std::collections::BTreeSet<&String> = stored_fields.keys().collect();
    let code_names: std::collections::BTreeSet<&String> = code_fields.keys().collect();
    if stored_names != code_names {
        return false;
    }

    let non_field_keys_match = |a: &Value, b: &Value| -> bool {
        let (Some(a), Some(b)) = (a.as_object(), b.as_object()) else { return false };
        for (k, v) in a {
            if k != "fields" && b.get(k) != Some(v) {
                return false;
            }
        }
        b.keys().all(|k| k == "fields" || a.contains_key(k))
    };
    if !non_field_keys_match(stored_schema, code_schema) {
        return false;
    }

    for name in stored_names {
        let sf = &stored_fields[name];
        let cf = &code_fields[name];
        if sf == cf {
            continue;
        }

        let strip = |v: &Value| -> Value {
            let mut m = v.as_object().cloned().unwrap_or_default();
            m.remove("type_spec");
            Value::Object(m)
        };
        if strip(sf) != strip(cf) {
            return false;
        }
        if sf.get("type_spec").is_some() {
            // Stored already carries a (different) spec: real drift.
            return false;
        }

        let Some(type_str) = sf.get("type").and_then(Value::as_str) else { return false };
        let Some(synthesized) = synthesize_type_spec_from_legacy(type_str) else { return false };
        let synthesized_json = serde_json::to_value(&synthesized).expect("type spec serializes");
        if Some(&synthesized_json) != cf.get("type_spec") {
            return false;
        }
    }

    true
}
