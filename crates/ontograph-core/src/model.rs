//! Typed model traits.
//!
//! The runtime never reflects over user types. Each entity or relation
//! declares a content-addressed schema descriptor and converts itself to
//! and from canonical field payloads; everything else flows through those
//! payloads.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{OntoError, Result};
use crate::schema::{EntitySchema, RelationSchema};

/// A typed entity with a declared schema and a single primary key.
pub trait EntityModel: Sized + Send + Sync {
    /// Governed type name (unit of schema governance).
    fn entity_name() -> &'static str;

    /// Build the canonical schema descriptor for this type.
    fn schema() -> Result<EntitySchema>;

    /// Primary key value of this instance.
    fn key(&self) -> String;

    /// Full field payload, including the primary key field.
    ///
    /// Typically implemented as `to_field_map(self)`.
    fn to_fields(&self) -> Result<Map<String, Value>>;

    /// Reconstruct an instance from a stored field payload.
    ///
    /// Typically implemented as `from_field_map(fields)`.
    fn from_fields(fields: &Map<String, Value>) -> Result<Self>;
}

/// A typed relation between two entity types.
///
/// `to_fields` covers the data fields only; identity components
/// (`left_key`, `right_key`, instance key) travel separately.
pub trait RelationModel: Sized + Send + Sync {
    type Left: EntityModel;
    type Right: EntityModel;

    fn relation_name() -> &'static str;

    fn schema() -> Result<RelationSchema>;

    fn left_key(&self) -> String;

    fn right_key(&self) -> String;

    /// Instance key value, when the type declares an instance-key field.
    fn instance_key(&self) -> Option<String> {
        None
    }

    fn to_fields(&self) -> Result<Map<String, Value>>;

    /// Reconstruct from a stored row.
    fn from_row(
        left_key: &str,
        right_key: &str,
        instance_key: &str,
        fields: &Map<String, Value>,
    ) -> Result<Self>;
}

/// Serialize a value into a JSON object payload.
pub fn to_field_map<T: Serialize + ?Sized>(value: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(OntoError::Model(format!(
            "field payload must be a JSON object, got {other}"
        ))),
    }
}

/// Deserialize a value from a JSON object payload.
pub fn from_field_map<T: DeserializeOwned>(fields: &Map<String, Value>) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(fields.clone()))?)
}

/// Validate and normalize an instance key against a relation schema.
///
/// Types with a declared instance-key field reject missing, empty or
/// whitespace-only values; types without one always use `""`.
pub fn normalize_instance_key(schema: &RelationSchema, value: Option<&str>) -> Result<String> {
    match (&schema.instance_key_field, value) {
        (Some(field), Some(ik)) => {
            if ik.trim().is_empty() {
                return Err(OntoError::Model(format!(
                    "relation '{}': '{}' must not be empty or whitespace-only",
                    schema.name, field
                )));
            }
            Ok(ik.to_string())
        }
        (Some(field), None) => Err(OntoError::Model(format!(
            "relation '{}' requires '{}' (instance key field)",
            schema.name, field
        ))),
        (None, Some(ik)) if !ik.is_empty() => Err(OntoError::Model(format!(
            "relation '{}' does not declare an instance key field",
            schema.name
        ))),
        (None, _) => Ok(String::new()),
    }
}

/// Metadata attached to query-hydrated instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub commit_id: u64,
    pub type_name: String,
    pub key: Option<String>,
    pub left_key: Option<String>,
    pub right_key: Option<String>,
    pub instance_key: Option<String>,
}

impl Meta {
    pub fn entity(commit_id: u64, type_name: impl Into<String>, key: impl Into<String>) -> Self {
        Meta {
            commit_id,
            type_name: type_name.into(),
            key: Some(key.into()),
            left_key: None,
            right_key: None,
            instance_key: None,
        }
    }

    pub fn relation(
        commit_id: u64,
        type_name: impl Into<String>,
        left_key: impl Into<String>,
        right_key: impl Into<String>,
        instance_key: Option<String>,
    ) -> Self {
        Meta {
            commit_id,
            type_name: type_name.into(),
            key: None,
            left_key: Some(left_key.into()),
            right_key: Some(right_key.into()),
            instance_key,
        }
    }
}

/// A hydrated value plus its storage metadata.
#[derive(Debug, Clone)]
pub struct Hydrated<T> {
    pub value: T,
    meta: Meta,
}

impl<T> Hydrated<T> {
    pub fn new(value: T, meta: Meta) -> Self {
        Hydrated { value, meta }
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

impl<T> std::ops::Deref for Hydrated<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RelationSchema;

    fn schema_with_ik() -> RelationSchema {
        RelationSchema::builder("Purchased", "Customer", "Product")
            .instance_key("order_id")
            .build()
            .unwrap()
    }

    fn schema_without_ik() -> RelationSchema {
        RelationSchema::builder("Follows", "User", "User").build().unwrap()
    }

    #[test]
    fn instance_key_required_when_declared() {
        let schema = schema_with_ik();
        assert!(normalize_instance_key(&schema, None).is_err());
        assert!(normalize_instance_key(&schema, Some("")).is_err());
        assert!(normalize_instance_key(&schema, Some("   ")).is_err());
        assert_eq!(normalize_instance_key(&schema, Some("ord-1")).unwrap(), "ord-1");
    }

    #[test]
    fn instance_key_empty_when_undeclared() {
        let schema = schema_without_ik();
        assert_eq!(normalize_instance_key(&schema, None).unwrap(), "");
        assert_eq!(normalize_instance_key(&schema, Some("")).unwrap(), "");
        assert!(normalize_instance_key(&schema, Some("x")).is_err());
    }
}
