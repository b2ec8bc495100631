//! Lowering of filter trees to SQLite WHERE fragments.
//!
//! Direct paths extract from the row's `fields_json`; endpoint paths
//! extract from the aliased entity-history rows (`le`/`re`) inside their
//! existence subqueries. Every identifier that reaches SQL text is
//! re-validated here; values always travel as bound parameters.

use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use ontograph_core::filter::{CompareOp, FieldPath, Filter, PathRoot};
use ontograph_core::{OntoError, Result};

/// Convert a JSON literal into a bindable SQLite value.
///
/// Booleans bind as integers to match `json_extract` results; arrays and
/// objects bind as their JSON text.
pub fn bind_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                SqlValue::Null
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn valid_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validate a dotted field path before it is interpolated into SQL text.
pub fn checked_json_path(dotted: &str) -> Result<String> {
    if dotted.is_empty() {
        return Err(OntoError::Filter("path must not be empty".to_string()));
    }
    for segment in dotted.split('.') {
        if !valid_identifier(segment) {
            return Err(OntoError::Filter(format!("invalid path segment '{segment}'")));
        }
    }
    Ok(format!("$.{dotted}"))
}

fn json_column(path: &FieldPath, table_alias: &str) -> Result<String> {
    let json_path = checked_json_path(&path.dotted())?;
    let column = match path.root {
        PathRoot::Left => "le.fields_json".to_string(),
        PathRoot::Right => "re.fields_json".to_string(),
        PathRoot::Direct => {
            if table_alias.is_empty() {
                "fields_json".to_string()
            } else {
                format!("{table_alias}.fields_json")
            }
        }
    };
    Ok(format!("json_extract({column}, '{json_path}')"))
}

fn sql_op(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "=",
        CompareOp::Ne => "!=",
        CompareOp::Gt => ">",
        CompareOp::Ge => ">=",
        CompareOp::Lt => "<",
        CompareOp::Le => "<=",
        // LIKE/IN/NULL checks have their own shapes.
        CompareOp::Like | CompareOp::In | CompareOp::IsNull | CompareOp::IsNotNull => {
            unreachable!("handled before sql_op")
        }
    }
}

fn compile_condition(
    column: &str,
    op: CompareOp,
    value: Option<&Value>,
    params: &mut Vec<SqlValue>,
) -> Result<String> {
    match op {
        CompareOp::IsNull => Ok(format!("{column} IS NULL")),
        CompareOp::IsNotNull => Ok(format!("{column} IS NOT NULL")),
        CompareOp::In => {
            let Some(Value::Array(items)) = value else {
                return Err(OntoError::Filter("IN requires a list value".to_string()));
            };
            let placeholders: Vec<&str> = items.iter().map(|_| "?").collect();
            params.extend(items.iter().map(bind_value));
            Ok(format!("{column} IN ({})", placeholders.join(", ")))
        }
        CompareOp::Like => {
            let Some(v) = value else {
                return Err(OntoError::Filter("LIKE requires a pattern".to_string()));
            };
            params.push(bind_value(v));
            Ok(format!("{column} LIKE ?"))
        }
        _ => {
            let Some(v) = value else {
                return Err(OntoError::Filter(format!("{op:?} requires a value")));
            };
            params.push(bind_value(v));
            Ok(format!("{column} {} ?", sql_op(op)))
        }
    }
}

/// Compile a filter tree into a WHERE fragment, pushing bound parameters.
pub fn compile_filter(
    filter: &Filter,
    table_alias: &str,
    params: &mut Vec<SqlValue>,
) -> Result<String> {
    match filter {
        Filter::Compare { path, op, value } => {
            let column = json_column(path, table_alias)?;
            compile_condition(&column, *op, value.as_ref(), params)
        }
        Filter::Exists { list_path, item_path, op, value } => {
            if list_path.root != PathRoot::Direct {
                return Err(OntoError::Filter(
                    "existential predicates are not supported on endpoint paths".to_string(),
                ));
            }
            let list_column = json_column(list_path, table_alias)?;
            let item_json_path = checked_json_path(item_path)?;
            let item_column = format!("json_extract(je.value, '{item_json_path}')");
            let condition = compile_condition(&item_column, *op, value.as_ref(), params)?;
            Ok(format!(
                "EXISTS (SELECT 1 FROM json_each({list_column}) AS je WHERE {condition})"
            ))
        }
        Filter::Not(child) => {
            let inner = compile_filter(child, table_alias, params)?;
            Ok(format!("NOT ({inner})"))
        }
        Filter::And(children) | Filter::Or(children) => {
            if children.is_empty() {
                return Err(OntoError::Filter("empty logical expression".to_string()));
            }
            let joiner = if matches!(filter, Filter::And(_)) { " AND " } else { " OR " };
            let parts: Vec<String> = children
                .iter()
                .map(|c| compile_filter(c, table_alias, params))
                .collect::<Result<_>>()?;
            Ok(format!("({})", parts.join(joiner)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ontograph_core::filter::{field, left_field};
    use serde_json::json;

    #[test]
    fn compiles_direct_comparison() {
        let mut params = Vec::new();
        let sql = compile_filter(&field("age").gt(30), "eh", &mut params).unwrap();
        assert_eq!(sql, "json_extract(eh.fields_json, '$.age') > ?");
        assert_eq!(params, vec![SqlValue::Integer(30)]);
    }

    #[test]
    fn compiles_in_with_placeholders() {
        let mut params = Vec::new();
        let sql = compile_filter(
            &field("tier").in_values([json!("Gold"), json!("Silver")]),
            "eh",
            &mut params,
        )
        .unwrap();
        assert_eq!(sql, "json_extract(eh.fields_json, '$.tier') IN (?, ?)");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn compiles_null_checks_without_params() {
        let mut params = Vec::new();
        let sql = compile_filter(&field("email").is_null(), "eh", &mut params).unwrap();
        assert_eq!(sql, "json_extract(eh.fields_json, '$.email') IS NULL");
        assert!(params.is_empty());
    }

    #[test]
    fn compiles_endpoint_paths_to_aliases() {
        let mut params = Vec::new();
        let sql = compile_filter(&left_field("tier").eq("Gold"), "rh", &mut params).unwrap();
        assert_eq!(sql, "json_extract(le.fields_json, '$.tier') = ?");
    }

    #[test]
    fn compiles_existential_to_json_each() {
        let mut params = Vec::new();
        let f = field("events").any_path("kind").unwrap().eq("click");
        let sql = compile_filter(&f, "eh", &mut params).unwrap();
        assert_eq!(
            sql,
            "EXISTS (SELECT 1 FROM json_each(json_extract(eh.fields_json, '$.events')) \
             AS je WHERE json_extract(je.value, '$.kind') = ?)"
        );
    }

    #[test]
    fn compiles_logical_nesting() {
        let mut params = Vec::new();
        let f = field("a").eq(1).and(field("b").eq(2).or(field("c").eq(3)).not());
        let sql = compile_filter(&f, "eh", &mut params).unwrap();
        assert!(sql.starts_with('('));
        assert!(sql.contains("NOT ("));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn rejects_hostile_segments() {
        let mut params = Vec::new();
        let f = field("x'); DROP TABLE commits; --").eq(1);
        assert!(compile_filter(&f, "eh", &mut params).is_err());
    }

    #[test]
    fn booleans_bind_as_integers() {
        assert_eq!(bind_value(&json!(true)), SqlValue::Integer(1));
        assert_eq!(bind_value(&json!(2.5)), SqlValue::Real(2.5));
        assert_eq!(bind_value(&json!({"a": 1})), SqlValue::Text("{\"a\":1}".into()));
    }
}
