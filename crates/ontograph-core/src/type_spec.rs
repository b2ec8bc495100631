//! Closed algebraic description of field types.
//!
//! Every declared field carries a `TypeSpec` so that any valid value can be
//! round-tripped through canonical JSON and validated without reflection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Scalar leaf types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    String,
    Integer,
    Float,
    Boolean,
}

/// Algebraic field type: scalars, optional, list-of, string-keyed mapping,
/// and nested record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TypeSpec {
    Scalar { scalar: ScalarType },
    Optional { inner: Box<TypeSpec> },
    List { item: Box<TypeSpec> },
    Map { value: Box<TypeSpec> },
    Record { fields: BTreeMap<String, TypeSpec> },
}

impl TypeSpec {
    pub fn string() -> Self {
        TypeSpec::Scalar { scalar: ScalarType::String }
    }

    pub fn integer() -> Self {
        TypeSpec::Scalar { scalar: ScalarType::Integer }
    }

    pub fn float() -> Self {
        TypeSpec::Scalar { scalar: ScalarType::Float }
    }

    pub fn boolean() -> Self {
        TypeSpec::Scalar { scalar: ScalarType::Boolean }
    }

    pub fn optional(inner: TypeSpec) -> Self {
        TypeSpec::Optional { inner: Box::new(inner) }
    }

    pub fn list(item: TypeSpec) -> Self {
        TypeSpec::List { item: Box::new(item) }
    }

    pub fn map(value: TypeSpec) -> Self {
        TypeSpec::Map { value: Box::new(value) }
    }

    pub fn record(fields: impl IntoIterator<Item = (&'static str, TypeSpec)>) -> Self {
        TypeSpec::Record {
            fields: fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        }
    }

    /// Check a JSON value against this spec.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            TypeSpec::Scalar { scalar } => match scalar {
                ScalarType::String => value.is_string(),
                ScalarType::Integer => value.is_i64() || value.is_u64(),
                // Integers are acceptable floats; JSON does not distinguish.
                ScalarType::Float => value.is_number(),
                ScalarType::Boolean => value.is_boolean(),
            },
            TypeSpec::Optional { inner } => value.is_null() || inner.accepts(value),
            TypeSpec::List { item } => match value {
                Value::Array(items) => items.iter().all(|v| item.accepts(v)),
                _ => false,
            },
            TypeSpec::Map { value: val_spec } => match value {
                Value::Object(map) => map.values().all(|v| val_spec.accepts(v)),
                _ => false,
            },
            TypeSpec::Record { fields } => match value {
                Value::Object(map) => fields.iter().all(|(name, spec)| {
                    map.get(name).map(|v| spec.accepts(v)).unwrap_or_else(|| {
                        matches!(spec, TypeSpec::Optional { .. })
                    })
                }),
                _ => false,
            },
        }
    }
}

/// Synthesize a `TypeSpec` from a legacy type string stored by runtimes
/// that predate explicit specs.
///
/// Recognizes scalar names, `T | None` optionals and `list[T]` /
/// `dict[str, T]` containers. Returns `None` when the string is not
/// recognized, in which case the drift is real.
pub fn synthesize_type_spec_from_legacy(type_str: &str) -> Option<TypeSpec> {
    let s = type_str.trim();

    if let Some(rest) = s.strip_suffix("| None") {
        return synthesize_type_spec_from_legacy(rest.trim_end())
            .map(TypeSpec::optional);
    }
    if let Some(rest) = s.strip_prefix("Optional[").and_then(|r| r.strip_suffix(']')) {
        return synthesize_type_spec_from_legacy(rest).map(TypeSpec::optional);
    }
    if let Some(rest) = s.strip_prefix("list[").and_then(|r| r.strip_suffix(']')) {
        return synthesize_type_spec_from_legacy(rest).map(TypeSpec::list);
    }
    if let Some(rest) = s.strip_prefix("dict[").and_then(|r| r.strip_suffix(']')) {
        let value_part = rest.split_once(',')?.1.trim();
        return synthesize_type_spec_from_legacy(value_part).map(TypeSpec::map);
    }

    match s {
        "str" | "<class 'str'>" | "string" => Some(TypeSpec::string()),
        "int" | "<class 'int'>" | "integer" => Some(TypeSpec::integer()),
        "float" | "<class 'float'>" => Some(TypeSpec::float()),
        "bool" | "<class 'bool'>" | "boolean" => Some(TypeSpec::boolean()),
        _ => None,
    }
}
