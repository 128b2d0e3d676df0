//! In-memory stand-in for a server connection, driving [`GatewayOps`]
//! against a table store instead of a live `tiberius::Client`. Built for
//! end-to-end engine tests, not as a SQL engine: it recognizes only the
//! fixed query shapes `TransferEngine` actually issues (`SELECT COUNT(*)`,
//! `SELECT DISTINCT <keys>`, a plain `SELECT ... FROM dbo.[table]`
//! extraction, `INFORMATION_SCHEMA.COLUMNS` lookups) and otherwise treats a
//! query as a no-op. Anything outside that set (arbitrary `postUpdateQuery`
//! text, joins, subqueries) is not simulated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{GatewayError, GatewayRow};
use crate::gateway::ops::GatewayOps;

#[derive(Default, Clone)]
pub struct FakeTable {
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    pub column_types: HashMap<String, String>,
    pub max_lengths: HashMap<String, i32>,
    /// Columns whose combined value must be unique across `rows`, mirroring
    /// a destination unique index/constraint.
    pub unique_keys: Vec<String>,
}

impl FakeTable {
    fn violates_unique(&self, row: &serde_json::Map<String, serde_json::Value>) -> bool {
        if self.unique_keys.is_empty() {
            return false;
        }
        self.rows.iter().any(|existing| {
            self.unique_keys
                .iter()
                .all(|k| existing.get(k) == row.get(k))
        })
    }
}

/// Shared backing store. Clone `FakeGatewayConnection` cheaply from the
/// same `Arc` to simulate two independent connections to one server, or
/// build two for A and B.
#[derive(Default)]
pub struct FakeBackend {
    pub tables: Mutex<HashMap<String, FakeTable>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed_table(&self, name: &str, table: FakeTable) {
        self.tables.lock().unwrap().insert(name.to_string(), table);
    }

    pub fn table(&self, name: &str) -> Option<FakeTable> {
        self.tables.lock().unwrap().get(name).cloned()
    }
}

/// One simulated connection. Each call consumes at most one queued
/// failure, so a test can script "fail once, then recover".
pub struct FakeGatewayConnection {
    backend: Arc<FakeBackend>,
    pub queued_ping_error: Option<GatewayError>,
    pub queued_insert_error: Option<GatewayError>,
}

impl FakeGatewayConnection {
    pub fn new(backend: Arc<FakeBackend>) -> Self {
        Self {
            backend,
            queued_ping_error: None,
            queued_insert_error: None,
        }
    }

    fn table_name_from(sql: &str) -> Option<String> {
        let marker = "dbo.[";
        let start = sql.find(marker)? + marker.len();
        let end = sql[start..].find(']')? + start;
        Some(sql[start..end].to_string())
    }
}

#[async_trait]
impl GatewayOps for FakeGatewayConnection {
    async fn ping(&mut self) -> Result<(), GatewayError> {
        if let Some(err) = self.queued_ping_error.take() {
            return Err(err);
        }
        Ok(())
    }

    async fn query_rows(
        &mut self,
        sql: &str,
        _params: &[(&str, serde_json::Value)],
    ) -> Result<Vec<GatewayRow>, GatewayError> {
        let upper = sql.to_ascii_uppercase();
        let Some(table) = Self::table_name_from(sql) else {
            return Ok(Vec::new());
        };
        let tables = self.backend.tables.lock().unwrap();
        let Some(entry) = tables.get(&table) else {
            return Err(GatewayError::MissingTable(table));
        };

        if upper.starts_with("SELECT COUNT(*)") {
            return Ok(vec![GatewayRow::new(
                vec!["count".to_string()],
                vec![serde_json::json!(entry.rows.len() as i64)],
            )]);
        }

        if upper.starts_with("SELECT DISTINCT") {
            let cols_part = &sql["SELECT DISTINCT".len()..];
            let from_idx = cols_part.to_ascii_uppercase().find("FROM").unwrap_or(cols_part.len());
            let cols: Vec<String> = cols_part[..from_idx]
                .split(',')
                .map(|c| c.trim().trim_matches(|ch| ch == '[' || ch == ']').to_string())
                .filter(|c| !c.is_empty())
                .collect();
            let mut seen = std::collections::HashSet::new();
            let mut out = Vec::new();
            for row in &entry.rows {
                let values: Vec<serde_json::Value> =
                    cols.iter().map(|c| row.get(c).cloned().unwrap_or(serde_json::Value::Null)).collect();
                let key = values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("|");
                if seen.insert(key) {
                    out.push(GatewayRow::new(cols.clone(), values));
                }
            }
            return Ok(out);
        }

        // Plain extraction select: return every row as-is, ignoring any WHERE.
        Ok(entry
            .rows
            .iter()
            .map(|row| {
                let columns: Vec<String> = row.keys().cloned().collect();
                let values: Vec<serde_json::Value> = columns.iter().map(|c| row[c].clone()).collect();
                GatewayRow::new(columns, values)
            })
            .collect())
    }

    async fn stream_rows(
        &mut self,
        sql: &str,
        params: &[(&str, serde_json::Value)],
    ) -> Result<Vec<GatewayRow>, GatewayError> {
        self.query_rows(sql, params).await
    }

    async fn get_column_types(&mut self, table: &str) -> Result<HashMap<String, String>, GatewayError> {
        Ok(self.backend.table(table).map(|t| t.column_types).unwrap_or_default())
    }

    async fn get_column_max_length(&mut self, table: &str, column: &str) -> Result<i32, GatewayError> {
        Ok(self
            .backend
            .table(table)
            .and_then(|t| t.max_lengths.get(column).copied())
            .unwrap_or(0))
    }

    async fn insert_typed(
        &mut self,
        table: &str,
        row: &serde_json::Map<String, serde_json::Value>,
        _column_types: &HashMap<String, String>,
        max_lengths: &HashMap<String, i32>,
    ) -> Result<u64, GatewayError> {
        if let Some(err) = self.queued_insert_error.take() {
            return Err(err);
        }
        let mut row = row.clone();
        for (column, value) in row.iter_mut() {
            let Some(max_len) = max_lengths.get(column).filter(|l| **l > 0) else {
                continue;
            };
            if let serde_json::Value::String(s) = value {
                if s.chars().count() as i32 > *max_len {
                    *value = serde_json::Value::String(s.chars().take(*max_len as usize).collect());
                }
            }
        }

        let mut tables = self.backend.tables.lock().unwrap();
        let Some(entry) = tables.get_mut(table) else {
            return Err(GatewayError::MissingTable(table.to_string()));
        };
        if entry.violates_unique(&row) {
            return Err(GatewayError::Duplicate(format!("unique violation on {table}")));
        }
        entry.rows.push(row);
        Ok(1)
    }

    async fn clear_table(&mut self, table: &str) -> Result<u64, GatewayError> {
        let mut tables = self.backend.tables.lock().unwrap();
        let Some(entry) = tables.get_mut(table) else {
            return Err(GatewayError::MissingTable(table.to_string()));
        };
        let n = entry.rows.len() as u64;
        entry.rows.clear();
        Ok(n)
    }
}
