//! Typed query execution, row streaming, and bulk insert against the two
//! configured SQL Server connections ("A" and "B").
//!
//! `tiberius` has no native named-parameter support, so `@field`-style
//! placeholders in task-authored SQL are rewritten to positional
//! `@P1..@Pn` markers before dispatch; the rewrite preserves declaration
//! order so bound values line up with the rewritten text.

pub mod error;
pub mod ops;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

use std::collections::HashMap;

use futures::TryStreamExt;
use tiberius::{Client, ColumnData, Query, Row};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use xfer_db::models::{ParamOperator, TaskParameter};

pub use self::error::GatewayError;
pub use self::ops::GatewayOps;

/// A live connection to server A or B, established over TCP with the TDS
/// protocol.
pub struct GatewayConnection {
    pub(crate) client: Client<Compat<TcpStream>>,
}

impl GatewayConnection {
    /// Wrap an already-negotiated tiberius client.
    pub fn new(client: Client<Compat<TcpStream>>) -> Self {
        Self { client }
    }

    /// Connect to a SQL Server instance described by `config`.
    pub async fn connect(config: &tiberius::Config) -> Result<Self, GatewayError> {
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| GatewayError::classify_io(&e))?;
        tcp.set_nodelay(true).ok();

        let client = Client::connect(config.clone(), tcp.compat_write())
            .await
            .map_err(|e| GatewayError::classify(&e))?;

        Ok(Self { client })
    }

    /// Liveness probe used by the Connection Supervisor.
    pub async fn ping(&mut self) -> Result<(), GatewayError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| GatewayError::classify(&e))?
            .into_row()
            .await
            .map_err(|e| GatewayError::classify(&e))?;
        Ok(())
    }
}

/// Outcome of a non-streaming query.
#[derive(Debug, Default)]
pub struct QueryResult {
    pub rows: Vec<GatewayRow>,
    pub rows_affected: u64,
}

/// A single fetched row, JSON-valued so it can be produced by either the
/// real `tiberius` backend or a fake one standing in for it in tests.
#[derive(Debug, Clone, Default)]
pub struct GatewayRow {
    pub columns: Vec<String>,
    pub values: Vec<serde_json::Value>,
}

impl GatewayRow {
    pub fn new(columns: Vec<String>, values: Vec<serde_json::Value>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, idx: usize) -> Option<&serde_json::Value> {
        self.values.get(idx)
    }

    pub fn by_name(&self, name: &str) -> Option<&serde_json::Value> {
        self.columns
            .iter()
            .position(|c| c == name)
            .and_then(|i| self.values.get(i))
    }

    /// Flatten to the JSON-map shape the rest of the engine deals rows in.
    pub fn into_json_map(self) -> serde_json::Map<String, serde_json::Value> {
        self.columns.into_iter().zip(self.values).collect()
    }
}

fn cell_to_json(row: &Row, idx: usize) -> serde_json::Value {
    if let Ok(Some(v)) = row.try_get::<&str, _>(idx) {
        return serde_json::Value::String(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<i64, _>(idx) {
        return serde_json::json!(v);
    }
    if let Ok(Some(v)) = row.try_get::<i32, _>(idx) {
        return serde_json::json!(v);
    }
    if let Ok(Some(v)) = row.try_get::<f64, _>(idx) {
        return serde_json::json!(v);
    }
    if let Ok(Some(v)) = row.try_get::<bool, _>(idx) {
        return serde_json::json!(v);
    }
    if let Ok(Some(v)) = row.try_get::<rust_decimal::Decimal, _>(idx) {
        return serde_json::Value::String(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<uuid::Uuid, _>(idx) {
        return serde_json::Value::String(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<chrono::NaiveDateTime, _>(idx) {
        return serde_json::Value::String(v.to_string());
    }
    serde_json::Value::Null
}

fn tiberius_row_to_gateway_row(row: &Row) -> GatewayRow {
    let columns: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    let values: Vec<serde_json::Value> = (0..columns.len()).map(|i| cell_to_json(row, i)).collect();
    GatewayRow { columns, values }
}

/// Rewrite `@field`-style named placeholders to positional `@P1..@Pn`
/// markers, returning the rewritten SQL and the parameter names in the
/// order they were encountered.
fn rewrite_named_params(sql: &str, known: &[&str]) -> (String, Vec<String>) {
    let mut out = String::with_capacity(sql.len());
    let mut order = Vec::new();
    let mut chars = sql.char_indices().peekable();

    'outer: while let Some((i, c)) = chars.next() {
        if c == '@' {
            let rest = &sql[i + 1..];
            for name in known {
                if rest.starts_with(name.as_str()) {
                    let boundary_ok = rest[name.len()..]
                        .chars()
                        .next()
                        .map(|c| !c.is_alphanumeric() && c != '_')
                        .unwrap_or(true);
                    if boundary_ok {
                        order.push((*name).to_string());
                        out.push_str(&format!("@P{}", order.len()));
                        for _ in 0..name.len() {
                            chars.next();
                        }
                        continue 'outer;
                    }
                }
            }
        }
        out.push(c);
    }

    (out, order)
}

/// Bind a `serde_json::Value` to a tiberius-bindable parameter, normalizing
/// JSON types to their SQL Server equivalents before binding.
pub fn sanitize_param(value: &serde_json::Value) -> ColumnData<'static> {
    match value {
        serde_json::Value::Null => ColumnData::String(None),
        serde_json::Value::Bool(b) => ColumnData::Bit(Some(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ColumnData::I64(Some(i))
            } else if let Some(f) = n.as_f64() {
                ColumnData::F64(Some(f))
            } else {
                ColumnData::String(Some(n.to_string().into()))
            }
        }
        serde_json::Value::String(s) => ColumnData::String(Some(s.clone().into())),
        other => ColumnData::String(Some(other.to_string().into())),
    }
}

/// Bind a `serde_json::Value` using a known destination column's SQL Server
/// `DATA_TYPE` when available, falling back to `sanitize_param`'s JSON-type
/// inference when the column's type wasn't looked up or isn't recognized.
pub fn sanitize_param_typed(value: &serde_json::Value, sql_type: Option<&str>) -> ColumnData<'static> {
    if value.is_null() {
        return ColumnData::String(None);
    }

    match sql_type.map(|t| t.to_ascii_lowercase()).as_deref() {
        Some("bit") => match value {
            serde_json::Value::Bool(b) => ColumnData::Bit(Some(*b)),
            serde_json::Value::Number(n) => ColumnData::Bit(Some(n.as_i64().unwrap_or(0) != 0)),
            serde_json::Value::String(s) => ColumnData::Bit(Some(s == "true" || s == "1")),
            _ => sanitize_param(value),
        },
        Some("tinyint" | "smallint" | "int" | "bigint") => match value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        {
            Some(i) => ColumnData::I64(Some(i)),
            None => sanitize_param(value),
        },
        Some("float" | "real" | "decimal" | "numeric" | "money" | "smallmoney") => match value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        {
            Some(f) => ColumnData::F64(Some(f)),
            None => sanitize_param(value),
        },
        Some(
            "char" | "varchar" | "text" | "nchar" | "nvarchar" | "ntext" | "date" | "datetime"
            | "datetime2" | "smalldatetime" | "time" | "uniqueidentifier",
        ) => {
            let s = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            ColumnData::String(Some(s.into()))
        }
        _ => sanitize_param(value),
    }
}

/// Execute a query, substituting named parameters.
pub async fn query(
    conn: &mut GatewayConnection,
    sql: &str,
    params: &[(&str, serde_json::Value)],
) -> Result<QueryResult, GatewayError> {
    let names: Vec<&str> = params.iter().map(|(n, _)| *n).collect();
    let (rewritten, order) = rewrite_named_params(sql, &names);

    let mut q = Query::new(rewritten);
    for name in &order {
        let value = params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        q.bind(sanitize_param(&value));
    }

    let stream = q
        .query(&mut conn.client)
        .await
        .map_err(|e| GatewayError::classify(&e))?;

    let result_set = stream
        .into_results()
        .await
        .map_err(|e| GatewayError::classify(&e))?;

    let rows: Vec<GatewayRow> = result_set
        .into_iter()
        .flatten()
        .map(|r| tiberius_row_to_gateway_row(&r))
        .collect();
    let rows_affected = rows.len() as u64;

    Ok(QueryResult { rows, rows_affected })
}

/// Run a query and collect every row, converting each to JSON as it comes
/// off the wire rather than buffering the driver's own intermediate
/// `Row` representation.
pub async fn stream_query(
    conn: &mut GatewayConnection,
    sql: &str,
    params: &[(&str, serde_json::Value)],
) -> Result<Vec<GatewayRow>, GatewayError> {
    let names: Vec<&str> = params.iter().map(|(n, _)| *n).collect();
    let (rewritten, order) = rewrite_named_params(sql, &names);

    let mut q = Query::new(rewritten);
    for name in &order {
        let value = params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        q.bind(sanitize_param(&value));
    }

    let stream = q
        .query(&mut conn.client)
        .await
        .map_err(|e| GatewayError::classify(&e))?;
    let mut row_stream = stream.into_row_stream().map_err(|e| GatewayError::classify(&e));

    let mut rows = Vec::new();
    while let Some(row) = row_stream.try_next().await? {
        rows.push(tiberius_row_to_gateway_row(&row));
    }
    Ok(rows)
}

/// Query `INFORMATION_SCHEMA.COLUMNS` for a table's column → SQL type
/// mapping.
pub async fn get_column_types(
    conn: &mut GatewayConnection,
    table: &str,
) -> Result<HashMap<String, String>, GatewayError> {
    let result = query(
        conn,
        "SELECT COLUMN_NAME, DATA_TYPE FROM INFORMATION_SCHEMA.COLUMNS \
         WHERE TABLE_SCHEMA = 'dbo' AND TABLE_NAME = @table",
        &[("table", serde_json::json!(table))],
    )
    .await?;

    let mut map = HashMap::new();
    for row in &result.rows {
        let name = row.get(0).and_then(|v| v.as_str());
        let ty = row.get(1).and_then(|v| v.as_str());
        if let (Some(name), Some(ty)) = (name, ty) {
            map.insert(name.to_string(), ty.to_string());
        }
    }
    Ok(map)
}

/// Look up the maximum character length of a destination column. `0`
/// means unbounded or unknown.
pub async fn get_column_max_length(
    conn: &mut GatewayConnection,
    table: &str,
    column: &str,
) -> Result<i32, GatewayError> {
    let result = query(
        conn,
        "SELECT CHARACTER_MAXIMUM_LENGTH FROM INFORMATION_SCHEMA.COLUMNS \
         WHERE TABLE_SCHEMA = 'dbo' AND TABLE_NAME = @table AND COLUMN_NAME = @column",
        &[
            ("table", serde_json::json!(table)),
            ("column", serde_json::json!(column)),
        ],
    )
    .await?;

    let len = result
        .rows
        .first()
        .and_then(|row| row.get(0))
        .and_then(|v| v.as_i64())
        .unwrap_or(0) as i32;
    Ok(len.max(0))
}

/// Coerce a raw record prior to insertion: `undefined`/empty/whitespace
/// strings become null, non-finite numbers become 0, invalid dates are
/// dropped, composite values are serialized to text. Never drops keys.
pub fn validate_record(
    row: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    let mut out = serde_json::Map::with_capacity(row.len());
    for (key, value) in row {
        let coerced = match value {
            serde_json::Value::String(s) if s.trim().is_empty() => serde_json::Value::Null,
            serde_json::Value::Number(n) => {
                if n.as_f64().map(|f| f.is_finite()).unwrap_or(true) {
                    value.clone()
                } else {
                    serde_json::json!(0)
                }
            }
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                serde_json::Value::String(value.to_string())
            }
            other => other.clone(),
        };
        out.insert(key.clone(), coerced);
    }
    out
}

/// Build and execute a parameterized `INSERT` into `dbo.<table>`, binding
/// each value against `column_types[column]` (the destination's
/// `INFORMATION_SCHEMA.COLUMNS` `DATA_TYPE`) when known, and falling back to
/// `sanitize_param`'s value-type inference for columns the mapping doesn't
/// cover. Truncates string values to `max_lengths[column]` when known.
pub async fn insert_typed(
    conn: &mut GatewayConnection,
    table: &str,
    row: &serde_json::Map<String, serde_json::Value>,
    column_types: &HashMap<String, String>,
    max_lengths: &HashMap<String, i32>,
) -> Result<u64, GatewayError> {
    let columns: Vec<&String> = row.keys().collect();
    if columns.is_empty() {
        return Ok(0);
    }

    let column_list = columns
        .iter()
        .map(|c| format!("[{c}]"))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholder_list = (1..=columns.len())
        .map(|i| format!("@P{i}"))
        .collect::<Vec<_>>()
        .join(", ");

    let sql = format!("INSERT INTO dbo.[{table}] ({column_list}) VALUES ({placeholder_list})");

    let mut q = Query::new(sql);
    for c in &columns {
        let mut value = row[c.as_str()].clone();
        if let Some(max_len) = max_lengths.get(c.as_str()) {
            if *max_len > 0 {
                if let serde_json::Value::String(s) = &value {
                    if s.chars().count() as i32 > *max_len {
                        value =
                            serde_json::Value::String(s.chars().take(*max_len as usize).collect());
                    }
                }
            }
        }
        let sql_type = column_types.get(c.as_str()).map(|s| s.as_str());
        q.bind(sanitize_param_typed(&value, sql_type));
    }

    let stream = q
        .query(&mut conn.client)
        .await
        .map_err(|e| GatewayError::classify(&e))?;
    let result_set = stream
        .into_results()
        .await
        .map_err(|e| GatewayError::classify(&e))?;
    let rows: Vec<Row> = result_set.into_iter().flatten().collect();
    Ok(rows.len() as u64)
}

/// Unconditionally delete every row from `dbo.<table>`.
pub async fn clear_table(conn: &mut GatewayConnection, table: &str) -> Result<u64, GatewayError> {
    let sql = format!("DELETE FROM dbo.[{table}]");
    let result = query(conn, &sql, &[]).await?;
    Ok(result.rows_affected)
}

/// Build the `WHERE` conjunction for a task's source query from its
/// declared parameters.
pub fn build_where_clause(parameters: &[TaskParameter]) -> (String, Vec<(String, serde_json::Value)>) {
    let mut clauses = Vec::new();
    let mut bindings = Vec::new();

    for param in parameters {
        match param.operator {
            ParamOperator::Between => {
                let from = param.value.get("from").cloned().unwrap_or(serde_json::Value::Null);
                let to = param.value.get("to").cloned().unwrap_or(serde_json::Value::Null);
                clauses.push(format!(
                    "{field} BETWEEN @{field}_from AND @{field}_to",
                    field = param.field
                ));
                bindings.push((format!("{}_from", param.field), from));
                bindings.push((format!("{}_to", param.field), to));
            }
            ParamOperator::In => {
                let elems = param.value.as_array().cloned().unwrap_or_default();
                let placeholders: Vec<String> = elems
                    .iter()
                    .enumerate()
                    .map(|(i, _)| format!("@{}_{}", param.field, i))
                    .collect();
                clauses.push(format!("{} IN ({})", param.field, placeholders.join(", ")));
                for (i, elem) in elems.into_iter().enumerate() {
                    bindings.push((format!("{}_{}", param.field, i), elem));
                }
            }
            op => {
                clauses.push(format!("{} {} @{}", param.field, op, param.field));
                bindings.push((param.field.clone(), param.value.clone()));
            }
        }
    }

    (clauses.join(" AND "), bindings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_preserves_declaration_order() {
        let (sql, order) = rewrite_named_params("SELECT * FROM t WHERE a = @foo AND b = @bar", &["foo", "bar"]);
        assert_eq!(sql, "SELECT * FROM t WHERE a = @P1 AND b = @P2");
        assert_eq!(order, vec!["foo".to_string(), "bar".to_string()]);
    }

    #[test]
    fn rewrite_does_not_match_partial_names() {
        let (sql, order) = rewrite_named_params("SELECT @foobar", &["foo"]);
        assert_eq!(sql, "SELECT @foobar");
        assert!(order.is_empty());
    }

    #[test]
    fn validate_record_nullifies_blank_strings() {
        let mut row = serde_json::Map::new();
        row.insert("a".to_string(), serde_json::json!("   "));
        row.insert("b".to_string(), serde_json::json!("kept"));
        let out = validate_record(&row);
        assert_eq!(out["a"], serde_json::Value::Null);
        assert_eq!(out["b"], serde_json::json!("kept"));
    }

    #[test]
    fn validate_record_serializes_composites() {
        let mut row = serde_json::Map::new();
        row.insert("a".to_string(), serde_json::json!({"x": 1}));
        let out = validate_record(&row);
        assert!(matches!(out["a"], serde_json::Value::String(_)));
    }

    #[test]
    fn build_where_clause_handles_between() {
        let params = vec![TaskParameter {
            field: "created_at".to_string(),
            operator: ParamOperator::Between,
            value: serde_json::json!({"from": "2026-01-01", "to": "2026-02-01"}),
        }];
        let (clause, bindings) = build_where_clause(&params);
        assert_eq!(clause, "created_at BETWEEN @created_at_from AND @created_at_to");
        assert_eq!(bindings.len(), 2);
    }

    #[test]
    fn build_where_clause_handles_in() {
        let params = vec![TaskParameter {
            field: "region".to_string(),
            operator: ParamOperator::In,
            value: serde_json::json!(["east", "west"]),
        }];
        let (clause, bindings) = build_where_clause(&params);
        assert_eq!(clause, "region IN (@region_0, @region_1)");
        assert_eq!(bindings.len(), 2);
    }

    #[test]
    fn build_where_clause_handles_scalar() {
        let params = vec![TaskParameter {
            field: "status".to_string(),
            operator: ParamOperator::Eq,
            value: serde_json::json!("active"),
        }];
        let (clause, bindings) = build_where_clause(&params);
        assert_eq!(clause, "status = @status");
        assert_eq!(bindings.len(), 1);
    }
}
