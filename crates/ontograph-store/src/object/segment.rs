//! Parquet encoding of commit row segments.
//!
//! Each segment file carries the identity and bookkeeping columns
//! (`commit_id`, type, keys, `schema_version_id`, `fields_json`) plus one
//! column per field observed in the payloads so an analytical engine can
//! push predicates down without parsing JSON. `fields_json` stays the
//! authoritative payload; field columns are a projection of it.

use arrow_array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
    UInt32Array, UInt64Array,
};
use arrow_schema::{DataType, Field, Schema};
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

use ontograph_core::{canonical_json, OntoError, Result};

use crate::repository::{EntityRow, RelationRow};

const ENTITY_BASE_COLUMNS: &[&str] =
    &["commit_id", "entity_type", "entity_key", "schema_version_id", "fields_json"];
const RELATION_BASE_COLUMNS: &[&str] = &[
    "commit_id",
    "relation_type",
    "left_key",
    "right_key",
    "instance_key",
    "schema_version_id",
    "fields_json",
];

/// Column type inferred for one payload field across a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldColumn {
    Int,
    Float,
    Bool,
    Text,
    /// Mixed or nested values; stored as canonical JSON text.
    Json,
}

fn infer_field_column<'a>(values: impl Iterator<Item = Option<&'a Value>>) -> FieldColumn {
    let mut kind: Option<FieldColumn> = None;
    for value in values.flatten() {
        if value.is_null() {
            continue;
        }
        let this = if value.is_i64() || value.is_u64() {
            FieldColumn::Int
        } else if value.is_number() {
            FieldColumn::Float
        } else if value.is_boolean() {
            FieldColumn::Bool
        } else if value.is_string() {
            FieldColumn::Text
        } else {
            FieldColumn::Json
        };
        kind = Some(match (kind, this) {
            (None, k) => k,
            (Some(k), t) if k == t => k,
            // Ints widen to floats; anything else degrades to JSON text.
            (Some(FieldColumn::Int), FieldColumn::Float)
            | (Some(FieldColumn::Float), FieldColumn::Int) => FieldColumn::Float,
            _ => FieldColumn::Json,
        });
    }
    kind.unwrap_or(FieldColumn::Json)
}

fn field_array<'a>(
    kind: FieldColumn,
    values: impl Iterator<Item = Option<&'a Value>>,
) -> ArrayRef {
    match kind {
        FieldColumn::Int => Arc::new(Int64Array::from(
            values
                .map(|v| v.filter(|v| !v.is_null()).and_then(Value::as_i64))
                .collect::<Vec<_>>(),
        )),
        FieldColumn::Float => Arc::new(Float64Array::from(
            values
                .map(|v| v.filter(|v| !v.is_null()).and_then(Value::as_f64))
                .collect::<Vec<_>>(),
        )),
        FieldColumn::Bool => Arc::new(BooleanArray::from(
            values
                .map(|v| v.filter(|v| !v.is_null()).and_then(Value::as_bool))
                .collect::<Vec<_>>(),
        )),
        FieldColumn::Text => Arc::new(StringArray::from(
            values
                .map(|v| {
                    v.filter(|v| !v.is_null())
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .collect::<Vec<_>>(),
        )),
        FieldColumn::Json => Arc::new(StringArray::from(
            values
                .map(|v| v.filter(|v| !v.is_null()).map(canonical_json))
                .collect::<Vec<_>>(),
        )),
    }
}

fn field_data_type(kind: FieldColumn) -> DataType {
    match kind {
        FieldColumn::Int => DataType::Int64,
        FieldColumn::Float => DataType::Float64,
        FieldColumn::Bool => DataType::Boolean,
        FieldColumn::Text | FieldColumn::Json => DataType::Utf8,
    }
}

/// Append one pushdown column per observed payload field. Field names that
/// collide with the base columns stay available through `fields_json`.
fn push_field_columns(
    fields: &mut Vec<Field>,
    arrays: &mut Vec<ArrayRef>,
    base_columns: &[&str],
    payloads: &[&Map<String, Value>],
) {
    let names: BTreeSet<&String> = payloads.iter().flat_map(|m| m.keys()).collect();
    for name in names {
        if base_columns.contains(&name.as_str()) {
            continue;
        }
        let kind = infer_field_column(payloads.iter().map(|m| m.get(name)));
        fields.push(Field::new(name, field_data_type(kind), true));
        arrays.push(field_array(kind, payloads.iter().map(|m| m.get(name))));
    }
}

fn write_batch(batch: RecordBatch) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), None)
        .map_err(|e| OntoError::backend("segment_encode", e))?;
    writer
        .write(&batch)
        .map_err(|e| OntoError::backend("segment_encode", e))?;
    writer
        .close()
        .map_err(|e| OntoError::backend("segment_encode", e))?;
    Ok(buf)
}

pub(super) fn encode_entity_segment(
    commit_id: u64,
    type_name: &str,
    rows: &[(String, Map<String, Value>, Option<u32>)],
) -> Result<Vec<u8>> {
    let payloads: Vec<&Map<String, Value>> = rows.iter().map(|(_, fields, _)| fields).collect();

    let mut fields = vec![
        Field::new("commit_id", DataType::UInt64, false),
        Field::new("entity_type", DataType::Utf8, false),
        Field::new("entity_key", DataType::Utf8, false),
        Field::new("schema_version_id", DataType::UInt32, true),
        Field::new("fields_json", DataType::Utf8, false),
    ];
    let mut arrays: Vec<ArrayRef> = vec![
        Arc::new(UInt64Array::from(vec![commit_id; rows.len()])),
        Arc::new(StringArray::from(vec![type_name; rows.len()])),
        Arc::new(StringArray::from(
            rows.iter().map(|(key, _, _)| key.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(UInt32Array::from(
            rows.iter().map(|(_, _, svid)| *svid).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter()
                .map(|(_, fields, _)| canonical_json(&Value::Object(fields.clone())))
                .collect::<Vec<_>>(),
        )),
    ];
    push_field_columns(&mut fields, &mut arrays, ENTITY_BASE_COLUMNS, &payloads);

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .map_err(|e| OntoError::backend("segment_encode", e))?;
    write_batch(batch)
}

pub(super) fn encode_relation_segment(
    commit_id: u64,
    type_name: &str,
    rows: &[(String, String, String, Map<String, Value>, Option<u32>)],
) -> Result<Vec<u8>> {
    let payloads: Vec<&Map<String, Value>> =
        rows.iter().map(|(_, _, _, fields, _)| fields).collect();

    let mut fields = vec![
        Field::new("commit_id", DataType::UInt64, false),
        Field::new("relation_type", DataType::Utf8, false),
        Field::new("left_key", DataType::Utf8, false),
        Field::new("right_key", DataType::Utf8, false),
        Field::new("instance_key", DataType::Utf8, false),
        Field::new("schema_version_id", DataType::UInt32, true),
        Field::new("fields_json", DataType::Utf8, false),
    ];
    let mut arrays: Vec<ArrayRef> = vec![
        Arc::new(UInt64Array::from(vec![commit_id; rows.len()])),
        Arc::new(StringArray::from(vec![type_name; rows.len()])),
        Arc::new(StringArray::from(
            rows.iter().map(|(lk, _, _, _, _)| lk.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|(_, rk, _, _, _)| rk.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter().map(|(_, _, ik, _, _)| ik.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(UInt32Array::from(
            rows.iter().map(|(_, _, _, _, svid)| *svid).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            rows.iter()
                .map(|(_, _, _, fields, _)| canonical_json(&Value::Object(fields.clone())))
                .collect::<Vec<_>>(),
        )),
    ];
    push_field_columns(&mut fields, &mut arrays, RELATION_BASE_COLUMNS, &payloads);

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .map_err(|e| OntoError::backend("segment_encode", e))?;
    write_batch(batch)
}

fn read_batches(bytes: Vec<u8>) -> Result<Vec<RecordBatch>> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))
        .map_err(|e| OntoError::backend("segment_decode", e))?
        .build()
        .map_err(|e| OntoError::backend("segment_decode", e))?;
    reader
        .into_iter()
        .map(|batch| batch.map_err(|e| OntoError::backend("segment_decode", e)))
        .collect()
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| {
            OntoError::backend("segment_decode", format!("missing string column '{name}'"))
        })
}

fn commit_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a UInt64Array> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_any().downcast_ref::<UInt64Array>())
        .ok_or_else(|| {
            OntoError::backend("segment_decode", format!("missing commit column '{name}'"))
        })
}

fn version_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a UInt32Array> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_any().downcast_ref::<UInt32Array>())
        .ok_or_else(|| {
            OntoError::backend("segment_decode", format!("missing version column '{name}'"))
        })
}

fn parse_payload(fields_json: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(fields_json)? {
        Value::Object(map) => Ok(map),
        other => Err(OntoError::backend(
            "segment_decode",
            format!("fields_json must hold a JSON object, got {other}"),
        )),
    }
}

pub(super) fn decode_entity_segment(bytes: Vec<u8>) -> Result<Vec<EntityRow>> {
    let mut rows = Vec::new();
    for batch in read_batches(bytes)? {
        let commit_ids = commit_column(&batch, "commit_id")?;
        let keys = string_column(&batch, "entity_key")?;
        let versions = version_column(&batch, "schema_version_id")?;
        let payloads = string_column(&batch, "fields_json")?;
        for i in 0..batch.num_rows() {
            rows.push(EntityRow {
                key: keys.value(i).to_string(),
                fields: parse_payload(payloads.value(i))?,
                commit_id: commit_ids.value(i),
                schema_version_id: versions.is_valid(i).then(|| versions.value(i)),
            });
        }
    }
    Ok(rows)
}

pub(super) fn decode_relation_segment(bytes: Vec<u8>) -> Result<Vec<RelationRow>> {
    let mut rows = Vec::new();
    for batch in read_batches(bytes)? {
        let commit_ids = commit_column(&batch, "commit_id")?;
        let left_keys = string_column(&batch, "left_key")?;
        let right_keys = string_column(&batch, "right_key")?;
        let instance_keys = string_column(&batch, "instance_key")?;
        let versions = version_column(&batch, "schema_version_id")?;
        let payloads = string_column(&batch, "fields_json")?;
        for i in 0..batch.num_rows() {
            rows.push(RelationRow {
                left_key: left_keys.value(i).to_string(),
                right_key: right_keys.value(i).to_string(),
                instance_key: instance_keys.value(i).to_string(),
                fields: parse_payload(payloads.value(i))?,
                commit_id: commit_ids.value(i),
                schema_version_id: versions.is_valid(i).then(|| versions.value(i)),
            });
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn entity_segment_round_trips() {
        let rows = vec![
            (
                "c1".to_string(),
                payload(json!({"id": "c1", "age": 30, "tags": ["a"]})),
                Some(1),
            ),
            ("c2".to_string(), payload(json!({"id": "c2", "age": 31, "tags": []})), Some(1)),
        ];
        let bytes = encode_entity_segment(7, "Customer", &rows).unwrap();
        let decoded = decode_entity_segment(bytes).unwrap();

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].key, "c1");
        assert_eq!(decoded[0].commit_id, 7);
        assert_eq!(decoded[0].schema_version_id, Some(1));
        assert_eq!(decoded[0].fields["age"], 30);
        assert_eq!(decoded[1].fields["tags"], json!([]));
    }

    #[test]
    fn relation_segment_round_trips() {
        let rows = vec![(
            "c1".to_string(),
            "p1".to_string(),
            "ord-1".to_string(),
            payload(json!({"qty": 2})),
            None,
        )];
        let bytes = encode_relation_segment(3, "Purchased", &rows).unwrap();
        let decoded = decode_relation_segment(bytes).unwrap();

        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].instance_key, "ord-1");
        assert_eq!(decoded[0].schema_version_id, None);
        assert_eq!(decoded[0].fields["qty"], 2);
    }

    #[test]
    fn payload_fields_become_pushdown_columns() {
        let rows = vec![(
            "c1".to_string(),
            payload(json!({"id": "c1", "age": 30, "score": 1.5, "active": true,
                           "profile": {"city": "Berlin"}})),
            Some(1),
        )];
        let bytes = encode_entity_segment(1, "Customer", &rows).unwrap();
        let batches = read_batches(bytes).unwrap();
        let schema = batches[0].schema();

        let data_type = |name: &str| schema.field_with_name(name).unwrap().data_type().clone();
        assert_eq!(data_type("id"), DataType::Utf8);
        assert_eq!(data_type("age"), DataType::Int64);
        assert_eq!(data_type("score"), DataType::Float64);
        assert_eq!(data_type("active"), DataType::Boolean);
        // Nested records land as canonical JSON text.
        assert_eq!(data_type("profile"), DataType::Utf8);
        let profile = string_column(&batches[0], "profile").unwrap();
        assert_eq!(profile.value(0), r#"{"city":"Berlin"}"#);
    }

    #[test]
    fn mixed_scalar_fields_degrade_to_json_text() {
        let rows = vec![
            ("a".to_string(), payload(json!({"id": "a", "v": 1})), None),
            ("b".to_string(), payload(json!({"id": "b", "v": "two"})), None),
        ];
        let bytes = encode_entity_segment(1, "T", &rows).unwrap();
        let batches = read_batches(bytes).unwrap();
        assert_eq!(
            batches[0].schema().field_with_name("v").unwrap().data_type(),
            &DataType::Utf8
        );
    }

    #[test]
    fn int_and_float_values_widen_to_float() {
        let rows = vec![
            ("a".to_string(), payload(json!({"id": "a", "v": 1})), None),
            ("b".to_string(), payload(json!({"id": "b", "v": 1.5})), None),
        ];
        let bytes = encode_entity_segment(1, "T", &rows).unwrap();
        let batches = read_batches(bytes).unwrap();
        assert_eq!(
            batches[0].schema().field_with_name("v").unwrap().data_type(),
            &DataType::Float64
        );
    }

    #[test]
    fn null_and_missing_values_are_column_nulls() {
        let rows = vec![
            ("a".to_string(), payload(json!({"id": "a", "email": "a@x"})), None),
            ("b".to_string(), payload(json!({"id": "b", "email": null})), None),
            ("c".to_string(), payload(json!({"id": "c"})), None),
        ];
        let bytes = encode_entity_segment(1, "T", &rows).unwrap();
        let batches = read_batches(bytes).unwrap();
        let email = string_column(&batches[0], "email").unwrap();
        assert!(email.is_valid(0));
        assert!(email.is_null(1));
        assert!(email.is_null(2));
    }
}
