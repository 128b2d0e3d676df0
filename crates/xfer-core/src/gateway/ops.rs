//! Trait seam over the query/insert operations the engine needs from a
//! server connection, so tests can stand in a fake backend for the two
//! real SQL Server connections without dialing out.
//!
//! `GatewayConnection` implements this by delegating to the free functions
//! in the parent module; production code is unaffected either way since
//! `TransferEngine`/`ConnectionSupervisor` keep calling those functions
//! directly. The trait exists for the layer that only needs query/insert
//! semantics, not pool management, and wants to run against `fake`.

use std::collections::HashMap;

use async_trait::async_trait;

use super::{
    clear_table, get_column_max_length, get_column_types, insert_typed, query, stream_query,
    GatewayConnection, GatewayError, GatewayRow,
};

#[async_trait]
pub trait GatewayOps: Send {
    async fn ping(&mut self) -> Result<(), GatewayError>;

    async fn query_rows(
        &mut self,
        sql: &str,
        params: &[(&str, serde_json::Value)],
    ) -> Result<Vec<GatewayRow>, GatewayError>;

    /// Same as `query_rows`, kept distinct because the real backend streams
    /// rows off the wire as they arrive rather than waiting for the full
    /// result set, which matters for a large source extraction.
    async fn stream_rows(
        &mut self,
        sql: &str,
        params: &[(&str, serde_json::Value)],
    ) -> Result<Vec<GatewayRow>, GatewayError>;

    async fn get_column_types(&mut self, table: &str) -> Result<HashMap<String, String>, GatewayError>;

    async fn get_column_max_length(&mut self, table: &str, column: &str) -> Result<i32, GatewayError>;

    async fn insert_typed(
        &mut self,
        table: &str,
        row: &serde_json::Map<String, serde_json::Value>,
        column_types: &HashMap<String, String>,
        max_lengths: &HashMap<String, i32>,
    ) -> Result<u64, GatewayError>;

    async fn clear_table(&mut self, table: &str) -> Result<u64, GatewayError>;
}

#[async_trait]
impl GatewayOps for GatewayConnection {
    async fn ping(&mut self) -> Result<(), GatewayError> {
        GatewayConnection::ping(self).await
    }

    async fn query_rows(
        &mut self,
        sql: &str,
        params: &[(&str, serde_json::Value)],
    ) -> Result<Vec<GatewayRow>, GatewayError> {
        Ok(query(self, sql, params).await?.rows)
    }

    async fn stream_rows(
        &mut self,
        sql: &str,
        params: &[(&str, serde_json::Value)],
    ) -> Result<Vec<GatewayRow>, GatewayError> {
        stream_query(self, sql, params).await
    }

    async fn get_column_types(&mut self, table: &str) -> Result<HashMap<String, String>, GatewayError> {
        get_column_types(self, table).await
    }

    async fn get_column_max_length(&mut self, table: &str, column: &str) -> Result<i32, GatewayError> {
        get_column_max_length(self, table, column).await
    }

    async fn insert_typed(
        &mut self,
        table: &str,
        row: &serde_json::Map<String, serde_json::Value>,
        column_types: &HashMap<String, String>,
        max_lengths: &HashMap<String, i32>,
    ) -> Result<u64, GatewayError> {
        insert_typed(self, table, row, column_types, max_lengths).await
    }

    async fn clear_table(&mut self, table: &str) -> Result<u64, GatewayError> {
        clear_table(self, table).await
    }
}
