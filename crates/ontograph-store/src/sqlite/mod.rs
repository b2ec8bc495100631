//! Embedded SQLite backend.
//!
//! Two append-only history tables plus schema governance, lock and event
//! tables in a single database file. Temporal queries select the maximum
//! commit per identity through a grouped self-join; payload predicates go
//! through `json_extract`. The write lock is a single-row table with lease
//! expiry takeover; transactions are SQLite-native.

mod events;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use ontograph_core::{
    Filter, OntoError, OntologyConfig, PathRoot, Result, SchemaVersionRecord, TypeKind, TypeName,
};

use crate::repository::{
    AggFunc, AggSpec, BackendKind, ChangeOp, CommitChange, CommitRecord, DiagnosticReason,
    EndpointTypes, EntityRow, Having, QueryDiagnostics, QuerySpec, ReadWindow, RelationRow,
    Repository, StorageInfo, TraversalSide,
};
use crate::sql::{bind_value, checked_json_path, compile_filter};

const LOCK_NAME: &str = "ontology_write";
const ENGINE_VERSION: &str = "v2";

pub(crate) fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn to_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_iso(op: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| OntoError::backend(op, format!("bad timestamp '{value}': {e}")))
}

/// SQLite-backed repository and event store.
pub struct SqliteStore {
    path: String,
    conn: Arc<Mutex<Connection>>,
    pub(crate) config: OntologyConfig,
    diagnostics: Mutex<Option<QueryDiagnostics>>,
}

impl SqliteStore {
    /// Open (creating if needed) a store at the given path; `:memory:` is
    /// permitted.
    pub fn open(path: &str, config: OntologyConfig) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(|e| OntoError::backend("open", e))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| OntoError::backend("open", e))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| OntoError::backend("open", e))?;

        let store = SqliteStore {
            path: path.to_string(),
            conn: Arc::new(Mutex::new(conn)),
            config,
            diagnostics: Mutex::new(None),
        };
        store.create_tables()?;
        debug!(path, "sqlite store opened");
        Ok(store)
    }

    pub(crate) fn lock_conn(&self, op: &str) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| OntoError::backend(op, "connection mutex poisoned"))
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.lock_conn("create_tables")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS commits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                metadata_json TEXT
            );

            CREATE TABLE IF NOT EXISTS entity_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type TEXT NOT NULL,
                entity_key TEXT NOT NULL,
                fields_json TEXT NOT NULL,
                commit_id INTEGER NOT NULL,
                schema_version_id INTEGER,
                FOREIGN KEY (commit_id) REFERENCES commits(id)
            );
            CREATE INDEX IF NOT EXISTS idx_entity_history_lookup
                ON entity_history(entity_type, entity_key, commit_id DESC);

            CREATE TABLE IF NOT EXISTS relation_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                relation_type TEXT NOT NULL,
                left_key TEXT NOT NULL,
                right_key TEXT NOT NULL,
                instance_key TEXT NOT NULL DEFAULT '',
                fields_json TEXT NOT NULL,
                commit_id INTEGER NOT NULL,
                schema_version_id INTEGER,
                FOREIGN KEY (commit_id) REFERENCES commits(id)
            );
            CREATE INDEX IF NOT EXISTS idx_relation_history_lookup
                ON relation_history(relation_type, left_key, right_key,
                                    instance_key, commit_id DESC);

            CREATE TABLE IF NOT EXISTS schema_registry (
                type_kind TEXT NOT NULL,
                type_name TEXT NOT NULL,
                schema_json TEXT NOT NULL,
                PRIMARY KEY (type_kind, type_name)
            );

            CREATE TABLE IF NOT EXISTS schema_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type_kind TEXT NOT NULL,
                type_name TEXT NOT NULL,
                schema_version_id INTEGER NOT NULL,
                schema_json TEXT NOT NULL,
                schema_hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                runtime_id TEXT,
                reason TEXT,
                UNIQUE(type_kind, type_name, schema_version_id)
            );

            CREATE TABLE IF NOT EXISTS locks (
                lock_name TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS storage_meta (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS type_layout_catalog (
                type_kind             TEXT NOT NULL,
                type_name             TEXT NOT NULL,
                schema_version_id     INTEGER NOT NULL,
                table_name            TEXT NOT NULL,
                activation_commit_id  INTEGER NOT NULL,
                is_current            INTEGER NOT NULL DEFAULT 0,
                created_at            TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (type_kind, type_name, schema_version_id)
            );

            CREATE TABLE IF NOT EXISTS dropped_types (
                type_kind TEXT NOT NULL,
                type_name TEXT NOT NULL,
                commit_id INTEGER NOT NULL,
                purged INTEGER NOT NULL,
                dropped_at TEXT NOT NULL,
                PRIMARY KEY (type_kind, type_name)
            );
            "#,
        )
        .map_err(|e| OntoError::backend("create_tables", e))?;

        conn.execute(
            "INSERT OR REPLACE INTO storage_meta (key, value) VALUES ('engine_version', ?1)",
            params![ENGINE_VERSION],
        )
        .map_err(|e| OntoError::backend("create_tables", e))?;
        conn.execute(
            "INSERT OR REPLACE INTO storage_meta (key, value) VALUES ('backend', 'sqlite')",
            [],
        )
        .map_err(|e| OntoError::backend("create_tables", e))?;

        events::create_event_tables(&conn)?;
        Ok(())
    }

    fn set_diagnostics(&self, diag: Option<QueryDiagnostics>) {
        if let Ok(mut slot) = self.diagnostics.lock() {
            *slot = diag;
        }
    }

    fn is_dropped(conn: &Connection, kind: TypeKind, name: &str) -> Result<bool> {
        let hit: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM dropped_types WHERE type_kind = ?1 AND type_name = ?2",
                params![kind.as_str(), name],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| OntoError::backend("is_dropped", e))?;
        Ok(hit.is_some())
    }

    fn current_layout(conn: &Connection, kind: TypeKind, name: &str) -> Result<Option<(u32, u64)>> {
        conn.query_row(
            "SELECT schema_version_id, activation_commit_id FROM type_layout_catalog \
             WHERE type_kind = ?1 AND type_name = ?2 AND is_current = 1 LIMIT 1",
            params![kind.as_str(), name],
            |row| Ok((row.get::<_, u32>(0)?, row.get::<_, u64>(1)?)),
        )
        .optional()
        .map_err(|e| OntoError::backend("current_layout", e))
    }

    fn head_commit(conn: &Connection) -> Result<Option<u64>> {
        conn.query_row("SELECT MAX(id) FROM commits", [], |row| {
            row.get::<_, Option<u64>>(0)
        })
        .map_err(|e| OntoError::backend("get_head_commit_id", e))
    }

    fn current_schema_version_row(
        conn: &Connection,
        type_name: &TypeName,
    ) -> Result<Option<SchemaVersionRecord>> {
        conn.query_row(
            "SELECT schema_version_id, schema_json, schema_hash, created_at, runtime_id, reason \
             FROM schema_versions WHERE type_kind = ?1 AND type_name = ?2 \
             ORDER BY schema_version_id DESC LIMIT 1",
            params![type_name.kind.as_str(), type_name.name],
            version_row,
        )
        .optional()
        .map_err(|e| OntoError::backend("get_current_schema_version", e))
    }

    /// Resolve the effective window and version pin for a read under the
    /// activation boundary. `None` means the read returns empty.
    fn boundary_window(
        &self,
        conn: &Connection,
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
                let head = Self::head_commit(conn)?;
                match head {
                    Some(head) if head >= activation => {
                        Ok(Some((ReadWindow::AsOf(head), Some(current_svid))))
                    }
                    _ => Ok(None),
                }
            }
        }
    }

    fn append_order_limit(
        sql: &mut String,
        params: &mut Vec<SqlValue>,
        alias: &str,
        spec_order_by: Option<&str>,
        order_desc: bool,
        window: ReadWindow,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<()> {
        if let Some(order_by) = spec_order_by {
            let json_path = checked_json_path(order_by.trim_start_matches("$."))?;
            let direction = if order_desc { "DESC" } else { "ASC" };
            sql.push_str(&format!(
                " ORDER BY json_extract({alias}.fields_json, '{json_path}') {direction}"
            ));
        } else if matches!(window, ReadWindow::WithHistory | ReadWindow::HistorySince(_)) {
            sql.push_str(&format!(" ORDER BY {alias}.commit_id ASC"));
        }
        if let Some(limit) = limit {
            sql.push_str(" LIMIT ?");
            params.push(SqlValue::Integer(limit as i64));
        }
        if let Some(offset) = offset {
            sql.push_str(" OFFSET ?");
            params.push(SqlValue::Integer(offset as i64));
        }
        Ok(())
    }

    fn query_entities_raw(
        &self,
        conn: &Connection,
        type_name: &str,
        spec: &QuerySpec,
        window: ReadWindow,
        schema_version_id: Option<u32>,
    ) -> Result<Vec<EntityRow>> {
        let mut params: Vec<SqlValue> = Vec::new();
        let apply_sv =
            schema_version_id.is_some() && !matches!(window, ReadWindow::Latest);

        let mut sql = match window {
            ReadWindow::WithHistory | ReadWindow::HistorySince(_) => {
                let mut s = String::from(
                    "SELECT eh.entity_key, eh.fields_json, eh.commit_id, eh.schema_version_id \
                     FROM entity_history eh WHERE eh.entity_type = ?",
                );
                params.push(SqlValue::Text(type_name.to_string()));
                if let ReadWindow::HistorySince(since) = window {
                    s.push_str(" AND eh.commit_id > ?");
                    params.push(SqlValue::Integer(since as i64));
                }
                if apply_sv {
                    s.push_str(" AND eh.schema_version_id = ?");
                    params.push(SqlValue::Integer(schema_version_id.unwrap_or(0) as i64));
                }
                s
            }
            ReadWindow::AsOf(as_of) => {
                let sv_sub = if apply_sv { " AND schema_version_id = ?" } else { "" };
                let sv_outer = if apply_sv { " AND eh.schema_version_id = ?" } else { "" };
                let s = format!(
                    "SELECT eh.entity_key, eh.fields_json, eh.commit_id, eh.schema_version_id \
                     FROM entity_history eh INNER JOIN ( \
                       SELECT entity_key, MAX(commit_id) as max_cid FROM entity_history \
                       WHERE entity_type = ? AND commit_id <= ?{sv_sub} GROUP BY entity_key \
                     ) latest ON eh.entity_key = latest.entity_key \
                       AND eh.commit_id = latest.max_cid \
                     WHERE eh.entity_type = ?{sv_outer}"
                );
                params.push(SqlValue::Text(type_name.to_string()));
                params.push(SqlValue::Integer(as_of as i64));
                if apply_sv {
                    params.push(SqlValue::Integer(schema_version_id.unwrap_or(0) as i64));
                }
                params.push(SqlValue::Text(type_name.to_string()));
                if apply_sv {
                    params.push(SqlValue::Integer(schema_version_id.unwrap_or(0) as i64));
                }
                s
            }
            ReadWindow::Latest => {
                let s = String::from(
                    "SELECT eh.entity_key, eh.fields_json, eh.commit_id, eh.schema_version_id \
                     FROM entity_history eh INNER JOIN ( \
                       SELECT entity_key, MAX(commit_id) as max_cid FROM entity_history \
                       WHERE entity_type = ? GROUP BY entity_key \
                     ) latest ON eh.entity_key = latest.entity_key \
                       AND eh.commit_id = latest.max_cid \
                     WHERE eh.entity_type = ?",
                );
                params.push(SqlValue::Text(type_name.to_string()));
                params.push(SqlValue::Text(type_name.to_string()));
                s
            }
        };

        if let Some(filter) = &spec.filter {
            let where_sql = compile_filter(filter, "eh", &mut params)?;
            sql.push_str(&format!(" AND {where_sql}"));
        }

        Self::append_order_limit(
            &mut sql,
            &mut params,
            "eh",
            spec.order_by.as_deref(),
            spec.order_desc,
            window,
            spec.limit,
            spec.offset,
        )?;

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| OntoError::backend("query_entities", e))?;
        let rows = stmt
            .query_map(params_from_iter(params), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u64>(2)?,
                    row.get::<_, Option<u32>>(3)?,
                ))
            })
            .map_err(|e| OntoError::backend("query_entities", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| OntoError::backend("query_entities", e))?;

        rows.into_iter()
            .map(|(key, fields_json, commit_id, svid)| {
                Ok(EntityRow {
                    key,
                    fields: parse_fields(&fields_json)?,
                    commit_id,
                    schema_version_id: svid,
                })
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn query_relations_raw(
        &self,
        conn: &Connection,
        type_name: &str,
        endpoints: &EndpointTypes,
        spec: &QuerySpec,
        window: ReadWindow,
        schema_version_id: Option<u32>,
    ) -> Result<Vec<RelationRow>> {
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

        let mut params: Vec<SqlValue> = Vec::new();
        let apply_sv =
            schema_version_id.is_some() && !matches!(window, ReadWindow::Latest);

        let mut sql = match window {
            ReadWindow::WithHistory | ReadWindow::HistorySince(_) => {
                let mut s = String::from(
                    "SELECT rh.left_key, rh.right_key, rh.instance_key, rh.fields_json, \
                            rh.commit_id, rh.schema_version_id \
                     FROM relation_history rh WHERE rh.relation_type = ?",
                );
                params.push(SqlValue::Text(type_name.to_string()));
                if let ReadWindow::HistorySince(since) = window {
                    s.push_str(" AND rh.commit_id > ?");
                    params.push(SqlValue::Integer(since as i64));
                }
                if apply_sv {
                    s.push_str(" AND rh.schema_version_id = ?");
                    params.push(SqlValue::Integer(schema_version_id.unwrap_or(0) as i64));
                }
                s
            }
            ReadWindow::AsOf(as_of) => {
                let sv_sub = if apply_sv { " AND schema_version_id = ?" } else { "" };
                let sv_outer = if apply_sv { " AND rh.schema_version_id = ?" } else { "" };
                let s = format!(
                    "SELECT rh.left_key, rh.right_key, rh.instance_key, rh.fields_json, \
                            rh.commit_id, rh.schema_version_id \
                     FROM relation_history rh INNER JOIN ( \
                       SELECT left_key, right_key, instance_key, MAX(commit_id) as max_cid \
                       FROM relation_history \
                       WHERE relation_type = ? AND commit_id <= ?{sv_sub} \
                       GROUP BY left_key, right_key, instance_key \
                     ) latest ON rh.left_key = latest.left_key \
                       AND rh.right_key = latest.right_key \
                       AND rh.instance_key = latest.instance_key \
                       AND rh.commit_id = latest.max_cid \
                     WHERE rh.relation_type = ?{sv_outer}"
                );
                params.push(SqlValue::Text(type_name.to_string()));
                params.push(SqlValue::Integer(as_of as i64));
                if apply_sv {
                    params.push(SqlValue::Integer(schema_version_id.unwrap_or(0) as i64));
                }
                params.push(SqlValue::Text(type_name.to_string()));
                if apply_sv {
                    params.push(SqlValue::Integer(schema_version_id.unwrap_or(0) as i64));
                }
                s
            }
            ReadWindow::Latest => {
                let s = String::from(
                    "SELECT rh.left_key, rh.right_key, rh.instance_key, rh.fields_json, \
                            rh.commit_id, rh.schema_version_id \
                     FROM relation_history rh INNER JOIN ( \
                       SELECT left_key, right_key, instance_key, MAX(commit_id) as max_cid \
                       FROM relation_history WHERE relation_type = ? \
                       GROUP BY left_key, right_key, instance_key \
                     ) latest ON rh.left_key = latest.left_key \
                       AND rh.right_key = latest.right_key \
                       AND rh.instance_key = latest.instance_key \
                       AND rh.commit_id = latest.max_cid \
                     WHERE rh.relation_type = ?",
                );
                params.push(SqlValue::Text(type_name.to_string()));
                params.push(SqlValue::Text(type_name.to_string()));
                s
            }
        };

        // Endpoint predicates attach as existence subqueries honoring the
        // same temporal window as the outer read.
        if needs_left {
            let left_type = endpoints.left.as_deref().unwrap_or_default();
            Self::append_endpoint_subquery(
                &mut sql,
                &mut params,
                spec,
                window,
                left_type,
                "le",
                "rh.left_key",
                PathRoot::Left,
            )?;
        }
        if needs_right {
            let right_type = endpoints.right.as_deref().unwrap_or_default();
            Self::append_endpoint_subquery(
                &mut sql,
                &mut params,
                spec,
                window,
                right_type,
                "re",
                "rh.right_key",
                PathRoot::Right,
            )?;
        }

        if let Some(filter) = &spec.filter {
            if let Some(direct) = filter.extract(PathRoot::Direct) {
                let where_sql = compile_filter(&direct, "rh", &mut params)?;
                sql.push_str(&format!(" AND {where_sql}"));
            }
        }

        Self::append_order_limit(
            &mut sql,
            &mut params,
            "rh",
            spec.order_by.as_deref(),
            spec.order_desc,
            window,
            spec.limit,
            spec.offset,
        )?;

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| OntoError::backend("query_relations", e))?;
        let rows = stmt
            .query_map(params_from_iter(params), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, u64>(4)?,
                    row.get::<_, Option<u32>>(5)?,
                ))
            })
            .map_err(|e| OntoError::backend("query_relations", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| OntoError::backend("query_relations", e))?;

        rows.into_iter()
            .map(|(left_key, right_key, instance_key, fields_json, commit_id, svid)| {
                Ok(RelationRow {
                    left_key,
                    right_key,
                    instance_key,
                    fields: parse_fields(&fields_json)?,
                    commit_id,
                    schema_version_id: svid,
                })
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn append_endpoint_subquery(
        sql: &mut String,
        params: &mut Vec<SqlValue>,
        spec: &QuerySpec,
        window: ReadWindow,
        entity_type: &str,
        alias: &str,
        key_column: &str,
        root: PathRoot,
    ) -> Result<()> {
        sql.push_str(&format!(" AND EXISTS ( SELECT 1 FROM entity_history {alias}"));
        match window {
            ReadWindow::WithHistory | ReadWindow::HistorySince(_) => {
                sql.push_str(&format!(
                    " WHERE {alias}.entity_type = ? AND {alias}.entity_key = {key_column}"
                ));
                params.push(SqlValue::Text(entity_type.to_string()));
                if let ReadWindow::HistorySince(since) = window {
                    sql.push_str(&format!(" AND {alias}.commit_id > ?"));
                    params.push(SqlValue::Integer(since as i64));
                }
            }
            ReadWindow::AsOf(as_of) => {
                sql.push_str(&format!(
                    " INNER JOIN ( \
                       SELECT entity_key, MAX(commit_id) as max_cid FROM entity_history \
                       WHERE entity_type = ? AND commit_id <= ? GROUP BY entity_key \
                     ) {alias}_latest ON {alias}.entity_key = {alias}_latest.entity_key \
                       AND {alias}.commit_id = {alias}_latest.max_cid \
                     WHERE {alias}.entity_type = ? AND {alias}.entity_key = {key_column}"
                ));
                params.push(SqlValue::Text(entity_type.to_string()));
                params.push(SqlValue::Integer(as_of as i64));
                params.push(SqlValue::Text(entity_type.to_string()));
            }
            ReadWindow::Latest => {
                sql.push_str(&format!(
                    " INNER JOIN ( \
                       SELECT entity_key, MAX(commit_id) as max_cid FROM entity_history \
                       WHERE entity_type = ? GROUP BY entity_key \
                     ) {alias}_latest ON {alias}.entity_key = {alias}_latest.entity_key \
                       AND {alias}.commit_id = {alias}_latest.max_cid \
                     WHERE {alias}.entity_type = ? AND {alias}.entity_key = {key_column}"
                ));
                params.push(SqlValue::Text(entity_type.to_string()));
                params.push(SqlValue::Text(entity_type.to_string()));
            }
        }
        if let Some(filter) = &spec.filter {
            if let Some(endpoint_filter) = filter.extract(root) {
                let where_sql = compile_filter(&endpoint_filter, "rh", params)?;
                sql.push_str(&format!(" AND {where_sql}"));
            }
        }
        sql.push(')');
        Ok(())
    }

    fn agg_expression(func: AggFunc, alias: &str, field: &str) -> Result<String> {
        let json_path = checked_json_path(field)?;
        let json_col = format!("json_extract({alias}.fields_json, '{json_path}')");
        Ok(match func {
            AggFunc::AvgLen => format!("AVG(json_array_length({json_col}))"),
            AggFunc::Sum => format!("SUM(CAST({json_col} AS REAL))"),
            AggFunc::Avg => format!("AVG(CAST({json_col} AS REAL))"),
            AggFunc::Min => format!("MIN({json_col})"),
            AggFunc::Max => format!("MAX({json_col})"),
            AggFunc::Count => format!("COUNT({json_col})"),
        })
    }

    fn having_fragment(having: &Having, params: &mut Vec<SqlValue>) -> Result<String> {
        use ontograph_core::CompareOp;
        if !having.alias.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(OntoError::Filter(format!("invalid HAVING alias '{}'", having.alias)));
        }
        let op = match having.op {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            other => {
                return Err(OntoError::Filter(format!(
                    "unsupported HAVING operator {other:?}"
                )))
            }
        };
        params.push(bind_value(&having.value));
        Ok(format!("[{}] {} ?", having.alias, op))
    }

    fn sql_value_to_json(value: rusqlite::types::Value) -> Value {
        match value {
            rusqlite::types::Value::Null => Value::Null,
            rusqlite::types::Value::Integer(i) => Value::from(i),
            rusqlite::types::Value::Real(f) => {
                serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
            }
            rusqlite::types::Value::Text(s) => Value::String(s),
            rusqlite::types::Value::Blob(_) => Value::Null,
        }
    }
}

pub(crate) fn parse_fields(fields_json: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(fields_json)? {
        Value::Object(map) => Ok(map),
        other => Err(OntoError::Serialization(format!(
            "history row payload must be a JSON object, got {other}"
        ))),
    }
}

fn version_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SchemaVersionRecord> {
    let created_at: String = row.get(3)?;
    Ok(SchemaVersionRecord {
        schema_version_id: row.get(0)?,
        schema_json: row.get(1)?,
        schema_hash: row.get(2)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        runtime_id: row.get(4)?,
        reason: row.get(5)?,
    })
}

#[async_trait]
impl Repository for SqliteStore {
    async fn create_commit(&self, metadata: Option<BTreeMap<String, String>>) -> Result<u64> {
        let conn = self.lock_conn("create_commit")?;
        let meta_json = match &metadata {
            Some(map) if !map.is_empty() => Some(serde_json::to_string(map)?),
            _ => None,
        };
        conn.execute(
            "INSERT INTO commits (created_at, metadata_json) VALUES (?1, ?2)",
            params![now_iso(), meta_json],
        )
        .map_err(|e| OntoError::backend("create_commit", e))?;
        Ok(conn.last_insert_rowid() as u64)
    }

    async fn get_head_commit_id(&self) -> Result<Option<u64>> {
        let conn = self.lock_conn("get_head_commit_id")?;
        Self::head_commit(&conn)
    }

    async fn get_commit(&self, commit_id: u64) -> Result<Option<CommitRecord>> {
        let conn = self.lock_conn("get_commit")?;
        let row = conn
            .query_row(
                "SELECT id, created_at, metadata_json FROM commits WHERE id = ?1",
                params![commit_id],
                |row| {
                    Ok((
                        row.get::<_, u64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| OntoError::backend("get_commit", e))?;
        row.map(|(id, created_at, meta)| {
            Ok(CommitRecord {
                id,
                created_at: parse_iso("get_commit", &created_at)?,
                metadata: meta.map(|m| serde_json::from_str(&m)).transpose()?,
            })
        })
        .transpose()
    }

    async fn list_commits(
        &self,
        limit: usize,
        since_commit_id: Option<u64>,
    ) -> Result<Vec<CommitRecord>> {
        let conn = self.lock_conn("list_commits")?;
        let (sql, params): (&str, Vec<SqlValue>) = match since_commit_id {
            Some(since) => (
                "SELECT id, created_at, metadata_json FROM commits \
                 WHERE id > ? ORDER BY id DESC LIMIT ?",
                vec![SqlValue::Integer(since as i64), SqlValue::Integer(limit as i64)],
            ),
            None => (
                "SELECT id, created_at, metadata_json FROM commits ORDER BY id DESC LIMIT ?",
                vec![SqlValue::Integer(limit as i64)],
            ),
        };
        let mut stmt = conn.prepare(sql).map_err(|e| OntoError::backend("list_commits", e))?;
        let rows = stmt
            .query_map(params_from_iter(params), |row| {
                Ok((
                    row.get::<_, u64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .map_err(|e| OntoError::backend("list_commits", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| OntoError::backend("list_commits", e))?;
        rows.into_iter()
            .map(|(id, created_at, meta)| {
                Ok(CommitRecord {
                    id,
                    created_at: parse_iso("list_commits", &created_at)?,
                    metadata: meta.map(|m| serde_json::from_str(&m)).transpose()?,
                })
            })
            .collect()
    }

    async fn list_commit_changes(&self, commit_id: u64) -> Result<Vec<CommitChange>> {
        let conn = self.lock_conn("list_commit_changes")?;
        let mut changes = Vec::new();

        let mut stmt = conn
            .prepare("SELECT entity_type, entity_key FROM entity_history WHERE commit_id = ?1")
            .map_err(|e| OntoError::backend("list_commit_changes", e))?;
        let entity_rows = stmt
            .query_map(params![commit_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| OntoError::backend("list_commit_changes", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| OntoError::backend("list_commit_changes", e))?;
        for (etype, ekey) in entity_rows {
            let prev: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM entity_history \
                     WHERE entity_type = ?1 AND entity_key = ?2 AND commit_id < ?3 LIMIT 1",
                    params![etype, ekey, commit_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| OntoError::backend("list_commit_changes", e))?;
            changes.push(CommitChange {
                kind: TypeKind::Entity,
                type_name: etype,
                key: Some(ekey),
                left_key: None,
                right_key: None,
                instance_key: None,
                operation: if prev.is_some() { ChangeOp::UpdateVersion } else { ChangeOp::Insert },
            });
        }

        let mut stmt = conn
            .prepare(
                "SELECT relation_type, left_key, right_key, instance_key \
                 FROM relation_history WHERE commit_id = ?1",
            )
            .map_err(|e| OntoError::backend("list_commit_changes", e))?;
        let relation_rows = stmt
            .query_map(params![commit_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|e| OntoError::backend("list_commit_changes", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| OntoError::backend("list_commit_changes", e))?;
        for (rtype, lkey, rkey, ikey) in relation_rows {
            let prev: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM relation_history \
                     WHERE relation_type = ?1 AND left_key = ?2 AND right_key = ?3 \
                       AND instance_key = ?4 AND commit_id < ?5 LIMIT 1",
                    params![rtype, lkey, rkey, ikey, commit_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| OntoError::backend("list_commit_changes", e))?;
            changes.push(CommitChange {
                kind: TypeKind::Relation,
                type_name: rtype,
                key: None,
                left_key: Some(lkey),
                right_key: Some(rkey),
                instance_key: Some(ikey),
                operation: if prev.is_some() { ChangeOp::UpdateVersion } else { ChangeOp::Insert },
            });
        }

        Ok(changes)
    }

    async fn count_commit_operations(&self, commit_id: u64) -> Result<u64> {
        let conn = self.lock_conn("count_commit_operations")?;
        let entities: u64 = conn
            .query_row(
                "SELECT COUNT(*) FROM entity_history WHERE commit_id = ?1",
                params![commit_id],
                |row| row.get(0),
            )
            .map_err(|e| OntoError::backend("count_commit_operations", e))?;
        let relations: u64 = conn
            .query_row(
                "SELECT COUNT(*) FROM relation_history WHERE commit_id = ?1",
                params![commit_id],
                |row| row.get(0),
            )
            .map_err(|e| OntoError::backend("count_commit_operations", e))?;
        Ok(entities + relations)
    }

    async fn get_latest_entity(&self, type_name: &str, key: &str) -> Result<Option<EntityRow>> {
        let conn = self.lock_conn("get_latest_entity")?;
        if Self::is_dropped(&conn, TypeKind::Entity, type_name)? {
            return Ok(None);
        }
        let row = conn
            .query_row(
                "SELECT fields_json, commit_id, schema_version_id FROM entity_history \
                 WHERE entity_type = ?1 AND entity_key = ?2 \
                 ORDER BY commit_id DESC LIMIT 1",
                params![type_name, key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u64>(1)?,
                        row.get::<_, Option<u32>>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| OntoError::backend("get_latest_entity", e))?;
        row.map(|(fields_json, commit_id, svid)| {
            Ok(EntityRow {
                key: key.to_string(),
                fields: parse_fields(&fields_json)?,
                commit_id,
                schema_version_id: svid,
            })
        })
        .transpose()
    }

    async fn insert_entity(
        &self,
        type_name: &str,
        key: &str,
        fields: &Map<String, Value>,
        commit_id: u64,
        schema_version_id: Option<u32>,
    ) -> Result<()> {
        let conn = self.lock_conn("insert_entity")?;
        let tn = TypeName::entity(type_name);
        let mut svid = schema_version_id;
        if let Some(current) = Self::current_schema_version_row(&conn, &tn)? {
            let expected = current.schema_version_id;
            let svid_value = svid.unwrap_or(expected);
            if svid_value != expected {
                return Err(OntoError::backend(
                    "insert_entity",
                    format!(
                        "schema_version_id mismatch for entity '{type_name}': \
                         expected {expected}, got {svid_value}"
                    ),
                ));
            }
            svid = Some(expected);
            let layout = Self::current_layout(&conn, TypeKind::Entity, type_name)?;
            if layout.map(|(v, _)| v) != Some(expected) {
                activate_layout(&conn, TypeKind::Entity, type_name, expected, commit_id)?;
            }
        }
        conn.execute(
            "INSERT INTO entity_history \
             (entity_type, entity_key, fields_json, commit_id, schema_version_id) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                type_name,
                key,
                serde_json::to_string(&Value::Object(fields.clone()))?,
                commit_id,
                svid
            ],
        )
        .map_err(|e| OntoError::backend("insert_entity", e))?;
        Ok(())
    }

    async fn query_entities(&self, type_name: &str, spec: &QuerySpec) -> Result<Vec<EntityRow>> {
        self.set_diagnostics(None);
        let conn = self.lock_conn("query_entities")?;
        if Self::is_dropped(&conn, TypeKind::Entity, type_name)? {
            return Ok(Vec::new());
        }
        let active = Self::current_layout(&conn, TypeKind::Entity, type_name)?;
        match self.boundary_window(&conn, active, spec)? {
            Some((window, svid)) => self.query_entities_raw(&conn, type_name, spec, window, svid),
            None => Ok(Vec::new()),
        }
    }

    async fn count_entities(&self, type_name: &str, filter: Option<&Filter>) -> Result<u64> {
        let conn = self.lock_conn("count_entities")?;
        if Self::is_dropped(&conn, TypeKind::Entity, type_name)? {
            return Ok(0);
        }
        let mut params: Vec<SqlValue> = vec![
            SqlValue::Text(type_name.to_string()),
            SqlValue::Text(type_name.to_string()),
        ];
        let mut sql = String::from(
            "SELECT COUNT(*) FROM entity_history eh INNER JOIN ( \
               SELECT entity_key, MAX(commit_id) as max_cid FROM entity_history \
               WHERE entity_type = ? GROUP BY entity_key \
             ) latest ON eh.entity_key = latest.entity_key AND eh.commit_id = latest.max_cid \
             WHERE eh.entity_type = ?",
        );
        if let Some(filter) = filter {
            let where_sql = compile_filter(filter, "eh", &mut params)?;
            sql.push_str(&format!(" AND {where_sql}"));
        }
        conn.query_row(&sql, params_from_iter(params), |row| row.get(0))
            .map_err(|e| OntoError::backend("count_entities", e))
    }

    async fn aggregate_entities(
        &self,
        type_name: &str,
        func: AggFunc,
        field: &str,
        filter: Option<&Filter>,
    ) -> Result<Value> {
        let conn = self.lock_conn("aggregate_entities")?;
        if Self::is_dropped(&conn, TypeKind::Entity, type_name)? {
            return Ok(Value::Null);
        }
        let agg_expr = Self::agg_expression(func, "eh", field)?;
        let mut params: Vec<SqlValue> = vec![
            SqlValue::Text(type_name.to_string()),
            SqlValue::Text(type_name.to_string()),
        ];
        let mut sql = format!(
            "SELECT {agg_expr} FROM entity_history eh INNER JOIN ( \
               SELECT entity_key, MAX(commit_id) as max_cid FROM entity_history \
               WHERE entity_type = ? GROUP BY entity_key \
             ) latest ON eh.entity_key = latest.entity_key AND eh.commit_id = latest.max_cid \
             WHERE eh.entity_type = ?"
        );
        if let Some(filter) = filter {
            let where_sql = compile_filter(filter, "eh", &mut params)?;
            sql.push_str(&format!(" AND {where_sql}"));
        }
        let value: rusqlite::types::Value = conn
            .query_row(&sql, params_from_iter(params), |row| row.get(0))
            .map_err(|e| OntoError::backend("aggregate_entities", e))?;
        Ok(Self::sql_value_to_json(value))
    }

    async fn group_by_entities(
        &self,
        type_name: &str,
        group_field: &str,
        aggs: &[AggSpec],
        filter: Option<&Filter>,
        having: Option<&Having>,
    ) -> Result<Vec<Map<String, Value>>> {
        let conn = self.lock_conn("group_by_entities")?;
        if Self::is_dropped(&conn, TypeKind::Entity, type_name)? {
            return Ok(Vec::new());
        }
        let group_json_path = checked_json_path(group_field)?;
        let group_col = format!("json_extract(eh.fields_json, '{group_json_path}')");

        let mut select_parts = vec![format!("{group_col} as group_key")];
        for agg in aggs {
            if !agg.alias.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(OntoError::Filter(format!("invalid aggregation alias '{}'", agg.alias)));
            }
            let expr = match (&agg.func, &agg.field) {
                (AggFunc::Count, _) => "COUNT(*)".to_string(),
                (func, Some(field)) => Self::agg_expression(*func, "eh", field)?,
                (func, None) => {
                    return Err(OntoError::Filter(format!(
                        "aggregation {func:?} requires a field"
                    )))
                }
            };
            select_parts.push(format!("{expr} as [{}]", agg.alias));
        }

        let mut params: Vec<SqlValue> = vec![
            SqlValue::Text(type_name.to_string()),
            SqlValue::Text(type_name.to_string()),
        ];
        let mut sql = format!(
            "SELECT {} FROM entity_history eh INNER JOIN ( \
               SELECT entity_key, MAX(commit_id) as max_cid FROM entity_history \
               WHERE entity_type = ? GROUP BY entity_key \
             ) latest ON eh.entity_key = latest.entity_key AND eh.commit_id = latest.max_cid \
             WHERE eh.entity_type = ?",
            select_parts.join(", ")
        );
        if let Some(filter) = filter {
            let where_sql = compile_filter(filter, "eh", &mut params)?;
            sql.push_str(&format!(" AND {where_sql}"));
        }
        sql.push_str(&format!(" GROUP BY {group_col}"));
        if let Some(having) = having {
            let fragment = Self::having_fragment(having, &mut params)?;
            sql.push_str(&format!(" HAVING {fragment}"));
        }

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| OntoError::backend("group_by_entities", e))?;
        let alias_names: Vec<String> = aggs.iter().map(|a| a.alias.clone()).collect();
        let group_key = group_field.split('.').next_back().unwrap_or(group_field).to_string();
        let rows = stmt
            .query_map(params_from_iter(params), move |row| {
                let mut out = Map::new();
                out.insert(
                    group_key.clone(),
                    Self::sql_value_to_json(row.get::<_, rusqlite::types::Value>(0)?),
                );
                for (i, alias) in alias_names.iter().enumerate() {
                    out.insert(
                        alias.clone(),
                        Self::sql_value_to_json(row.get::<_, rusqlite::types::Value>(i + 1)?),
                    );
                }
                Ok(out)
            })
            .map_err(|e| OntoError::backend("group_by_entities", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| OntoError::backend("group_by_entities", e))?;
        Ok(rows)
    }

    async fn get_latest_relation(
        &self,
        type_name: &str,
        left_key: &str,
        right_key: &str,
        instance_key: &str,
    ) -> Result<Option<RelationRow>> {
        let conn = self.lock_conn("get_latest_relation")?;
        if Self::is_dropped(&conn, TypeKind::Relation, type_name)? {
            return Ok(None);
        }
        let row = conn
            .query_row(
                "SELECT fields_json, commit_id, schema_version_id FROM relation_history \
                 WHERE relation_type = ?1 AND left_key = ?2 AND right_key = ?3 \
                   AND instance_key = ?4 \
                 ORDER BY commit_id DESC LIMIT 1",
                params![type_name, left_key, right_key, instance_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u64>(1)?,
                        row.get::<_, Option<u32>>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| OntoError::backend("get_latest_relation", e))?;
        row.map(|(fields_json, commit_id, svid)| {
            Ok(RelationRow {
                left_key: left_key.to_string(),
                right_key: right_key.to_string(),
                instance_key: instance_key.to_string(),
                fields: parse_fields(&fields_json)?,
                commit_id,
                schema_version_id: svid,
            })
        })
        .transpose()
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
        let conn = self.lock_conn("insert_relation")?;
        let tn = TypeName::relation(type_name);
        let mut svid = schema_version_id;
        if let Some(current) = Self::current_schema_version_row(&conn, &tn)? {
            let expected = current.schema_version_id;
            let svid_value = svid.unwrap_or(expected);
            if svid_value != expected {
                return Err(OntoError::backend(
                    "insert_relation",
                    format!(
                        "schema_version_id mismatch for relation '{type_name}': \
                         expected {expected}, got {svid_value}"
                    ),
                ));
            }
            svid = Some(expected);
            let layout = Self::current_layout(&conn, TypeKind::Relation, type_name)?;
            if layout.map(|(v, _)| v) != Some(expected) {
                activate_layout(&conn, TypeKind::Relation, type_name, expected, commit_id)?;
            }
        }
        conn.execute(
            "INSERT INTO relation_history \
             (relation_type, left_key, right_key, instance_key, fields_json, \
              commit_id, schema_version_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                type_name,
                left_key,
                right_key,
                instance_key,
                serde_json::to_string(&Value::Object(fields.clone()))?,
                commit_id,
                svid
            ],
        )
        .map_err(|e| OntoError::backend("insert_relation", e))?;
        Ok(())
    }

    async fn query_relations(
        &self,
        type_name: &str,
        endpoints: &EndpointTypes,
        spec: &QuerySpec,
    ) -> Result<Vec<RelationRow>> {
        self.set_diagnostics(None);
        let conn = self.lock_conn("query_relations")?;
        if Self::is_dropped(&conn, TypeKind::Relation, type_name)? {
            return Ok(Vec::new());
        }
        let active = Self::current_layout(&conn, TypeKind::Relation, type_name)?;
        match self.boundary_window(&conn, active, spec)? {
            Some((window, svid)) => {
                self.query_relations_raw(&conn, type_name, endpoints, spec, window, svid)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn count_relations(
        &self,
        type_name: &str,
        _endpoints: &EndpointTypes,
        filter: Option<&Filter>,
    ) -> Result<u64> {
        let conn = self.lock_conn("count_relations")?;
        if Self::is_dropped(&conn, TypeKind::Relation, type_name)? {
            return Ok(0);
        }
        let mut params: Vec<SqlValue> = vec![
            SqlValue::Text(type_name.to_string()),
            SqlValue::Text(type_name.to_string()),
        ];
        let mut sql = String::from(
            "SELECT COUNT(*) FROM relation_history rh INNER JOIN ( \
               SELECT left_key, right_key, instance_key, MAX(commit_id) as max_cid \
               FROM relation_history WHERE relation_type = ? \
               GROUP BY left_key, right_key, instance_key \
             ) latest ON rh.left_key = latest.left_key AND rh.right_key = latest.right_key \
               AND rh.instance_key = latest.instance_key AND rh.commit_id = latest.max_cid \
             WHERE rh.relation_type = ?",
        );
        if let Some(filter) = filter {
            if let Some(direct) = filter.extract(PathRoot::Direct) {
                let where_sql = compile_filter(&direct, "rh", &mut params)?;
                sql.push_str(&format!(" AND {where_sql}"));
            }
        }
        conn.query_row(&sql, params_from_iter(params), |row| row.get(0))
            .map_err(|e| OntoError::backend("count_relations", e))
    }

    async fn aggregate_relations(
        &self,
        type_name: &str,
        func: AggFunc,
        field: &str,
        filter: Option<&Filter>,
    ) -> Result<Value> {
        let conn = self.lock_conn("aggregate_relations")?;
        if Self::is_dropped(&conn, TypeKind::Relation, type_name)? {
            return Ok(Value::Null);
        }
        let agg_expr = Self::agg_expression(func, "rh", field)?;
        let mut params: Vec<SqlValue> = vec![
            SqlValue::Text(type_name.to_string()),
            SqlValue::Text(type_name.to_string()),
        ];
        let mut sql = format!(
            "SELECT {agg_expr} FROM relation_history rh INNER JOIN ( \
               SELECT left_key, right_key, instance_key, MAX(commit_id) as max_cid \
               FROM relation_history WHERE relation_type = ? \
               GROUP BY left_key, right_key, instance_key \
             ) latest ON rh.left_key = latest.left_key AND rh.right_key = latest.right_key \
               AND rh.instance_key = latest.instance_key AND rh.commit_id = latest.max_cid \
             WHERE rh.relation_type = ?"
        );
        if let Some(filter) = filter {
            if let Some(direct) = filter.extract(PathRoot::Direct) {
                let where_sql = compile_filter(&direct, "rh", &mut params)?;
                sql.push_str(&format!(" AND {where_sql}"));
            }
        }
        let value: rusqlite::types::Value = conn
            .query_row(&sql, params_from_iter(params), |row| row.get(0))
            .map_err(|e| OntoError::backend("aggregate_relations", e))?;
        Ok(Self::sql_value_to_json(value))
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
        let conn = self.lock_conn("group_by_relations")?;
        if Self::is_dropped(&conn, TypeKind::Relation, type_name)? {
            return Ok(Vec::new());
        }

        // Grouping on an endpoint field joins that endpoint's latest rows.
        let (group_col, endpoint_join, result_key, join_type): (String, Option<String>, String, Option<&String>) =
            if let Some(rest) = group_field.strip_prefix("left.$.") {
                let json_path = checked_json_path(rest)?;
                let Some(left_type) = endpoints.left.as_ref() else {
                    return Err(OntoError::Filter(
                        "left endpoint type is required to group on left.$".to_string(),
                    ));
                };
                (
                    format!("json_extract(le.fields_json, '{json_path}')"),
                    Some(
                        "INNER JOIN entity_history le ON le.entity_key = rh.left_key \
                           AND le.entity_type = ? \
                         INNER JOIN ( \
                           SELECT entity_key, MAX(commit_id) as max_cid FROM entity_history \
                           WHERE entity_type = ? GROUP BY entity_key \
                         ) le_latest ON le.entity_key = le_latest.entity_key \
                           AND le.commit_id = le_latest.max_cid "
                            .to_string(),
                    ),
                    rest.to_string(),
                    Some(left_type),
                )
            } else if let Some(rest) = group_field.strip_prefix("right.$.") {
                let json_path = checked_json_path(rest)?;
                let Some(right_type) = endpoints.right.as_ref() else {
                    return Err(OntoError::Filter(
                        "right endpoint type is required to group on right.$".to_string(),
                    ));
                };
                (
                    format!("json_extract(re.fields_json, '{json_path}')"),
                    Some(
                        "INNER JOIN entity_history re ON re.entity_key = rh.right_key \
                           AND re.entity_type = ? \
                         INNER JOIN ( \
                           SELECT entity_key, MAX(commit_id) as max_cid FROM entity_history \
                           WHERE entity_type = ? GROUP BY entity_key \
                         ) re_latest ON re.entity_key = re_latest.entity_key \
                           AND re.commit_id = re_latest.max_cid "
                            .to_string(),
                    ),
                    rest.to_string(),
                    Some(right_type),
                )
            } else {
                let json_path = checked_json_path(group_field)?;
                (
                    format!("json_extract(rh.fields_json, '{json_path}')"),
                    None,
                    group_field.to_string(),
                    None,
                )
            };

        let mut select_parts = vec![format!("{group_col} as group_key")];
        for agg in aggs {
            if !agg.alias.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(OntoError::Filter(format!("invalid aggregation alias '{}'", agg.alias)));
            }
            let expr = match (&agg.func, &agg.field) {
                (AggFunc::Count, _) => "COUNT(*)".to_string(),
                (func, Some(field)) => Self::agg_expression(*func, "rh", field)?,
                (func, None) => {
                    return Err(OntoError::Filter(format!(
                        "aggregation {func:?} requires a field"
                    )))
                }
            };
            select_parts.push(format!("{expr} as [{}]", agg.alias));
        }

        let mut params: Vec<SqlValue> = vec![SqlValue::Text(type_name.to_string())];
        let mut sql = format!(
            "SELECT {} FROM relation_history rh INNER JOIN ( \
               SELECT left_key, right_key, instance_key, MAX(commit_id) as max_cid \
               FROM relation_history WHERE relation_type = ? \
               GROUP BY left_key, right_key, instance_key \
             ) latest ON rh.left_key = latest.left_key AND rh.right_key = latest.right_key \
               AND rh.instance_key = latest.instance_key AND rh.commit_id = latest.max_cid ",
            select_parts.join(", ")
        );
        if let (Some(join), Some(join_entity_type)) = (endpoint_join, join_type) {
            sql.push_str(&join);
            params.push(SqlValue::Text(join_entity_type.clone()));
            params.push(SqlValue::Text(join_entity_type.clone()));
        }
        sql.push_str("WHERE rh.relation_type = ?");
        params.push(SqlValue::Text(type_name.to_string()));

        if let Some(filter) = filter {
            if let Some(direct) = filter.extract(PathRoot::Direct) {
                let where_sql = compile_filter(&direct, "rh", &mut params)?;
                sql.push_str(&format!(" AND {where_sql}"));
            }
        }
        sql.push_str(&format!(" GROUP BY {group_col}"));
        if let Some(having) = having {
            let fragment = Self::having_fragment(having, &mut params)?;
            sql.push_str(&format!(" HAVING {fragment}"));
        }

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| OntoError::backend("group_by_relations", e))?;
        let alias_names: Vec<String> = aggs.iter().map(|a| a.alias.clone()).collect();
        let group_key = result_key.split('.').next_back().unwrap_or(&result_key).to_string();
        let rows = stmt
            .query_map(params_from_iter(params), move |row| {
                let mut out = Map::new();
                out.insert(
                    group_key.clone(),
                    Self::sql_value_to_json(row.get::<_, rusqlite::types::Value>(0)?),
                );
                for (i, alias) in alias_names.iter().enumerate() {
                    out.insert(
                        alias.clone(),
                        Self::sql_value_to_json(row.get::<_, rusqlite::types::Value>(i + 1)?),
                    );
                }
                Ok(out)
            })
            .map_err(|e| OntoError::backend("group_by_relations", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| OntoError::backend("group_by_relations", e))?;
        Ok(rows)
    }

    async fn get_relations_for_entity(
        &self,
        relation_type: &str,
        entity_key: &str,
        side: TraversalSide,
    ) -> Result<Vec<RelationRow>> {
        let conn = self.lock_conn("get_relations_for_entity")?;
        if Self::is_dropped(&conn, TypeKind::Relation, relation_type)? {
            return Ok(Vec::new());
        }
        let key_col = match side {
            TraversalSide::Left => "left_key",
            TraversalSide::Right => "right_key",
        };
        let sql = format!(
            "SELECT rh.left_key, rh.right_key, rh.instance_key, rh.fields_json, \
                    rh.commit_id, rh.schema_version_id \
             FROM relation_history rh INNER JOIN ( \
               SELECT left_key, right_key, instance_key, MAX(commit_id) as max_cid \
               FROM relation_history WHERE relation_type = ?1 \
               GROUP BY left_key, right_key, instance_key \
             ) latest ON rh.left_key = latest.left_key AND rh.right_key = latest.right_key \
               AND rh.instance_key = latest.instance_key AND rh.commit_id = latest.max_cid \
             WHERE rh.relation_type = ?2 AND rh.{key_col} = ?3"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| OntoError::backend("get_relations_for_entity", e))?;
        let rows = stmt
            .query_map(params![relation_type, relation_type, entity_key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, u64>(4)?,
                    row.get::<_, Option<u32>>(5)?,
                ))
            })
            .map_err(|e| OntoError::backend("get_relations_for_entity", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| OntoError::backend("get_relations_for_entity", e))?;
        rows.into_iter()
            .map(|(left_key, right_key, instance_key, fields_json, commit_id, svid)| {
                Ok(RelationRow {
                    left_key,
                    right_key,
                    instance_key,
                    fields: parse_fields(&fields_json)?,
                    commit_id,
                    schema_version_id: svid,
                })
            })
            .collect()
    }

    async fn get_schema(&self, type_name: &TypeName) -> Result<Option<Value>> {
        let conn = self.lock_conn("get_schema")?;
        let row: Option<String> = conn
            .query_row(
                "SELECT schema_json FROM schema_registry WHERE type_kind = ?1 AND type_name = ?2",
                params![type_name.kind.as_str(), type_name.name],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| OntoError::backend("get_schema", e))?;
        row.map(|json| Ok(serde_json::from_str(&json)?)).transpose()
    }

    async fn store_schema(&self, type_name: &TypeName, schema: &Value) -> Result<()> {
        let conn = self.lock_conn("store_schema")?;
        conn.execute(
            "INSERT OR REPLACE INTO schema_registry (type_kind, type_name, schema_json) \
             VALUES (?1, ?2, ?3)",
            params![
                type_name.kind.as_str(),
                type_name.name,
                ontograph_core::canonical_json(schema)
            ],
        )
        .map_err(|e| OntoError::backend("store_schema", e))?;
        Ok(())
    }

    async fn list_schemas(&self, kind: TypeKind) -> Result<Vec<(String, Value)>> {
        let conn = self.lock_conn("list_schemas")?;
        let mut stmt = conn
            .prepare("SELECT type_name, schema_json FROM schema_registry WHERE type_kind = ?1")
            .map_err(|e| OntoError::backend("list_schemas", e))?;
        let rows = stmt
            .query_map(params![kind.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| OntoError::backend("list_schemas", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| OntoError::backend("list_schemas", e))?;
        rows.into_iter()
            .map(|(name, json)| Ok((name, serde_json::from_str(&json)?)))
            .collect()
    }

    async fn create_schema_version(
        &self,
        type_name: &TypeName,
        schema_json: &str,
        schema_hash: &str,
        runtime_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<u32> {
        let conn = self.lock_conn("create_schema_version")?;
        let max_existing: Option<u32> = conn
            .query_row(
                "SELECT MAX(schema_version_id) FROM schema_versions \
                 WHERE type_kind = ?1 AND type_name = ?2",
                params![type_name.kind.as_str(), type_name.name],
                |row| row.get(0),
            )
            .map_err(|e| OntoError::backend("create_schema_version", e))?;
        let next_id = max_existing.unwrap_or(0) + 1;
        conn.execute(
            "INSERT INTO schema_versions \
             (type_kind, type_name, schema_version_id, schema_json, schema_hash, \
              created_at, runtime_id, reason) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                type_name.kind.as_str(),
                type_name.name,
                next_id,
                schema_json,
                schema_hash,
                now_iso(),
                runtime_id,
                reason
            ],
        )
        .map_err(|e| OntoError::backend("create_schema_version", e))?;
        // Re-creating a previously dropped type starts a fresh lineage.
        conn.execute(
            "DELETE FROM dropped_types WHERE type_kind = ?1 AND type_name = ?2",
            params![type_name.kind.as_str(), type_name.name],
        )
        .map_err(|e| OntoError::backend("create_schema_version", e))?;
        Ok(next_id)
    }

    async fn get_current_schema_version(
        &self,
        type_name: &TypeName,
    ) -> Result<Option<SchemaVersionRecord>> {
        let conn = self.lock_conn("get_current_schema_version")?;
        if Self::is_dropped(&conn, type_name.kind, &type_name.name)? {
            return Ok(None);
        }
        Self::current_schema_version_row(&conn, type_name)
    }

    async fn get_schema_version(
        &self,
        type_name: &TypeName,
        version_id: u32,
    ) -> Result<Option<SchemaVersionRecord>> {
        let conn = self.lock_conn("get_schema_version")?;
        conn.query_row(
            "SELECT schema_version_id, schema_json, schema_hash, created_at, runtime_id, reason \
             FROM schema_versions \
             WHERE type_kind = ?1 AND type_name = ?2 AND schema_version_id = ?3",
            params![type_name.kind.as_str(), type_name.name, version_id],
            version_row,
        )
        .optional()
        .map_err(|e| OntoError::backend("get_schema_version", e))
    }

    async fn list_schema_versions(&self, type_name: &TypeName) -> Result<Vec<SchemaVersionRecord>> {
        let conn = self.lock_conn("list_schema_versions")?;
        let mut stmt = conn
            .prepare(
                "SELECT schema_version_id, schema_json, schema_hash, created_at, \
                        runtime_id, reason \
                 FROM schema_versions WHERE type_kind = ?1 AND type_name = ?2 \
                 ORDER BY schema_version_id ASC",
            )
            .map_err(|e| OntoError::backend("list_schema_versions", e))?;
        let rows = stmt
            .query_map(params![type_name.kind.as_str(), type_name.name], version_row)
            .map_err(|e| OntoError::backend("list_schema_versions", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| OntoError::backend("list_schema_versions", e))?;
        Ok(rows)
    }

    async fn activate_schema_version(
        &self,
        type_name: &TypeName,
        schema_version_id: u32,
        activation_commit_id: u64,
    ) -> Result<()> {
        let conn = self.lock_conn("activate_schema_version")?;
        activate_layout(
            &conn,
            type_name.kind,
            &type_name.name,
            schema_version_id,
            activation_commit_id,
        )
    }

    async fn apply_schema_drop(
        &self,
        affected_types: &[TypeName],
        purge_history: bool,
        commit_meta: Option<BTreeMap<String, String>>,
    ) -> Result<u64> {
        let conn = self.lock_conn("apply_schema_drop")?;
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| OntoError::backend("apply_schema_drop", e))?;
        let result: Result<u64> = (|| {
            let meta_json = match &commit_meta {
                Some(map) if !map.is_empty() => Some(serde_json::to_string(map)?),
                _ => None,
            };
            conn.execute(
                "INSERT INTO commits (created_at, metadata_json) VALUES (?1, ?2)",
                params![now_iso(), meta_json],
            )
            .map_err(|e| OntoError::backend("apply_schema_drop", e))?;
            let commit_id = conn.last_insert_rowid() as u64;

            for tn in affected_types {
                conn.execute(
                    "DELETE FROM schema_registry WHERE type_kind = ?1 AND type_name = ?2",
                    params![tn.kind.as_str(), tn.name],
                )
                .map_err(|e| OntoError::backend("apply_schema_drop", e))?;
                conn.execute(
                    "DELETE FROM schema_versions WHERE type_kind = ?1 AND type_name = ?2",
                    params![tn.kind.as_str(), tn.name],
                )
                .map_err(|e| OntoError::backend("apply_schema_drop", e))?;
                conn.execute(
                    "UPDATE type_layout_catalog SET is_current = 0 \
                     WHERE type_kind = ?1 AND type_name = ?2",
                    params![tn.kind.as_str(), tn.name],
                )
                .map_err(|e| OntoError::backend("apply_schema_drop", e))?;
                conn.execute(
                    "INSERT OR REPLACE INTO dropped_types \
                     (type_kind, type_name, commit_id, purged, dropped_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![tn.kind.as_str(), tn.name, commit_id, purge_history as i64, now_iso()],
                )
                .map_err(|e| OntoError::backend("apply_schema_drop", e))?;

                if purge_history {
                    match tn.kind {
                        TypeKind::Entity => {
                            conn.execute(
                                "DELETE FROM entity_history WHERE entity_type = ?1",
                                params![tn.name],
                            )
                            .map_err(|e| OntoError::backend("apply_schema_drop", e))?;
                        }
                        TypeKind::Relation => {
                            conn.execute(
                                "DELETE FROM relation_history WHERE relation_type = ?1",
                                params![tn.name],
                            )
                            .map_err(|e| OntoError::backend("apply_schema_drop", e))?;
                        }
                    }
                }
            }
            Ok(commit_id)
        })();

        match result {
            Ok(commit_id) => {
                conn.execute_batch("COMMIT")
                    .map_err(|e| OntoError::backend("apply_schema_drop", e))?;
                Ok(commit_id)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    async fn count_latest_entities(&self, type_name: &str) -> Result<u64> {
        let conn = self.lock_conn("count_latest_entities")?;
        conn.query_row(
            "SELECT COUNT(DISTINCT entity_key) FROM entity_history WHERE entity_type = ?1",
            params![type_name],
            |row| row.get(0),
        )
        .map_err(|e| OntoError::backend("count_latest_entities", e))
    }

    async fn count_latest_relations(&self, type_name: &str) -> Result<u64> {
        let conn = self.lock_conn("count_latest_relations")?;
        conn.query_row(
            "SELECT COUNT(*) FROM ( \
               SELECT DISTINCT left_key, right_key, instance_key \
               FROM relation_history WHERE relation_type = ?1 \
             )",
            params![type_name],
            |row| row.get(0),
        )
        .map_err(|e| OntoError::backend("count_latest_relations", e))
    }

    async fn latest_entities_page(
        &self,
        type_name: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<EntityRow>> {
        let conn = self.lock_conn("latest_entities_page")?;
        let mut stmt = conn
            .prepare(
                "SELECT eh.entity_key, eh.fields_json, eh.commit_id, eh.schema_version_id \
                 FROM entity_history eh INNER JOIN ( \
                   SELECT entity_key, MAX(commit_id) as max_cid FROM entity_history \
                   WHERE entity_type = ?1 GROUP BY entity_key \
                 ) latest ON eh.entity_key = latest.entity_key \
                   AND eh.commit_id = latest.max_cid \
                 WHERE eh.entity_type = ?2 \
                 ORDER BY eh.entity_key LIMIT ?3 OFFSET ?4",
            )
            .map_err(|e| OntoError::backend("latest_entities_page", e))?;
        let rows = stmt
            .query_map(params![type_name, type_name, limit, offset], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u64>(2)?,
                    row.get::<_, Option<u32>>(3)?,
                ))
            })
            .map_err(|e| OntoError::backend("latest_entities_page", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| OntoError::backend("latest_entities_page", e))?;
        rows.into_iter()
            .map(|(key, fields_json, commit_id, svid)| {
                Ok(EntityRow {
                    key,
                    fields: parse_fields(&fields_json)?,
                    commit_id,
                    schema_version_id: svid,
                })
            })
            .collect()
    }

    async fn latest_relations_page(
        &self,
        type_name: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<RelationRow>> {
        let conn = self.lock_conn("latest_relations_page")?;
        let mut stmt = conn
            .prepare(
                "SELECT rh.left_key, rh.right_key, rh.instance_key, rh.fields_json, \
                        rh.commit_id, rh.schema_version_id \
                 FROM relation_history rh INNER JOIN ( \
                   SELECT left_key, right_key, instance_key, MAX(commit_id) as max_cid \
                   FROM relation_history WHERE relation_type = ?1 \
                   GROUP BY left_key, right_key, instance_key \
                 ) latest ON rh.left_key = latest.left_key \
                   AND rh.right_key = latest.right_key \
                   AND rh.instance_key = latest.instance_key \
                   AND rh.commit_id = latest.max_cid \
                 WHERE rh.relation_type = ?2 \
                 ORDER BY rh.left_key, rh.right_key, rh.instance_key \
                 LIMIT ?3 OFFSET ?4",
            )
            .map_err(|e| OntoError::backend("latest_relations_page", e))?;
        let rows = stmt
            .query_map(params![type_name, type_name, limit, offset], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, u64>(4)?,
                    row.get::<_, Option<u32>>(5)?,
                ))
            })
            .map_err(|e| OntoError::backend("latest_relations_page", e))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| OntoError::backend("latest_relations_page", e))?;
        rows.into_iter()
            .map(|(left_key, right_key, instance_key, fields_json, commit_id, svid)| {
                Ok(RelationRow {
                    left_key,
                    right_key,
                    instance_key,
                    fields: parse_fields(&fields_json)?,
                    commit_id,
                    schema_version_id: svid,
                })
            })
            .collect()
    }

    async fn acquire_lock(&self, owner_id: &str, timeout_ms: u64, lease_ms: u64) -> Result<bool> {
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
        loop {
            {
                let conn = self.lock_conn("acquire_lock")?;
                let now = Utc::now();
                conn.execute(
                    "DELETE FROM locks WHERE lock_name = ?1 AND expires_at < ?2",
                    params![LOCK_NAME, to_iso(now)],
                )
                .map_err(|e| OntoError::backend("acquire_lock", e))?;

                let expires = now + chrono::Duration::milliseconds(lease_ms as i64);
                let inserted = conn.execute(
                    "INSERT INTO locks (lock_name, owner_id, acquired_at, expires_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![LOCK_NAME, owner_id, to_iso(now), to_iso(expires)],
                );
                match inserted {
                    Ok(_) => {
                        debug!(owner_id, "write lock acquired");
                        return Ok(true);
                    }
                    Err(rusqlite::Error::SqliteFailure(err, _))
                        if err.code == rusqlite::ErrorCode::ConstraintViolation => {}
                    Err(e) => return Err(OntoError::backend("acquire_lock", e)),
                }
            }
            if std::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    async fn renew_lock(&self, owner_id: &str, lease_ms: u64) -> Result<bool> {
        let conn = self.lock_conn("renew_lock")?;
        let expires = Utc::now() + chrono::Duration::milliseconds(lease_ms as i64);
        let updated = conn
            .execute(
                "UPDATE locks SET expires_at = ?1 WHERE lock_name = ?2 AND owner_id = ?3",
                params![to_iso(expires), LOCK_NAME, owner_id],
            )
            .map_err(|e| OntoError::backend("renew_lock", e))?;
        Ok(updated > 0)
    }

    async fn release_lock(&self, owner_id: &str) -> Result<()> {
        let conn = self.lock_conn("release_lock")?;
        conn.execute(
            "DELETE FROM locks WHERE lock_name = ?1 AND owner_id = ?2",
            params![LOCK_NAME, owner_id],
        )
        .map_err(|e| OntoError::backend("release_lock", e))?;
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<()> {
        let conn = self.lock_conn("begin_transaction")?;
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| OntoError::backend("begin_transaction", e))
    }

    async fn commit_transaction(&self) -> Result<()> {
        let conn = self.lock_conn("commit_transaction")?;
        conn.execute_batch("COMMIT")
            .map_err(|e| OntoError::backend("commit_transaction", e))
    }

    async fn rollback_transaction(&self) -> Result<()> {
        let conn = self.lock_conn("rollback_transaction")?;
        conn.execute_batch("ROLLBACK")
            .map_err(|e| OntoError::backend("rollback_transaction", e))
    }

    fn storage_info(&self) -> StorageInfo {
        let mut type_layouts = BTreeMap::new();
        if let Ok(conn) = self.conn.lock() {
            let stmt = conn.prepare(
                "SELECT type_kind, type_name, schema_version_id, activation_commit_id \
                 FROM type_layout_catalog WHERE is_current = 1",
            );
            if let Ok(mut stmt) = stmt {
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, u64>(3)?,
                    ))
                });
                if let Ok(rows) = rows {
                    for row in rows.flatten() {
                        let (kind, name, svid, activation) = row;
                        type_layouts.insert(
                            name,
                            serde_json::json!({
                                "type_kind": kind,
                                "current_schema_version_id": svid,
                                "activation_commit_id": activation,
                            }),
                        );
                    }
                }
            }
        }
        StorageInfo {
            backend: BackendKind::Sqlite,
            engine_version: ENGINE_VERSION.to_string(),
            location: self.path.clone(),
            type_layouts,
        }
    }

    fn last_query_diagnostics(&self) -> Option<QueryDiagnostics> {
        self.diagnostics.lock().ok().and_then(|slot| slot.clone())
    }
}

fn activate_layout(
    conn: &Connection,
    kind: TypeKind,
    name: &str,
    schema_version_id: u32,
    activation_commit_id: u64,
) -> Result<()> {
    conn.execute(
        "UPDATE type_layout_catalog SET is_current = 0 WHERE type_kind = ?1 AND type_name = ?2",
        params![kind.as_str(), name],
    )
    .map_err(|e| OntoError::backend("activate_schema_version", e))?;
    let table_name = format!("{}_{}_v{}", kind.as_str(), name, schema_version_id);
    conn.execute(
        "INSERT INTO type_layout_catalog \
         (type_kind, type_name, schema_version_id, table_name, activation_commit_id, is_current) \
         VALUES (?1, ?2, ?3, ?4, ?5, 1) \
         ON CONFLICT(type_kind, type_name, schema_version_id) DO UPDATE SET \
           table_name = excluded.table_name, \
           activation_commit_id = excluded.activation_commit_id, \
           is_current = 1",
        params![kind.as_str(), name, schema_version_id, table_name, activation_commit_id],
    )
    .map_err(|e| OntoError::backend("activate_schema_version", e))?;
    Ok(())
}
