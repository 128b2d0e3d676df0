use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Direction a task moves recordsets between server A and server B.
///
/// `standard` is a parse-time synonym of `up`; `FromStr` normalizes it so
/// downstream code only ever matches `Up`/`Down`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransferType {
    Up,
    Down,
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Up => "up",
            Self::Down => "down",
        };
        f.write_str(s)
    }
}

impl FromStr for TransferType {
    type Err = TransferTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" | "standard" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            other => Err(TransferTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TransferType`] string.
#[derive(Debug, Clone)]
pub struct TransferTypeParseError(pub String);

impl fmt::Display for TransferTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid transfer type: {:?}", self.0)
    }
}

impl std::error::Error for TransferTypeParseError {}

// ---------------------------------------------------------------------------

/// Status of a single execution of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = ExecutionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(ExecutionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExecutionStatus`] string.
#[derive(Debug, Clone)]
pub struct ExecutionStatusParseError(pub String);

impl fmt::Display for ExecutionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid execution status: {:?}", self.0)
    }
}

impl std::error::Error for ExecutionStatusParseError {}

// ---------------------------------------------------------------------------

/// Comparison operator applied to a task parameter when building the
/// source-side `WHERE` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamOperator {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Ne,
    In,
    Between,
}

impl fmt::Display for ParamOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Ne => "<>",
            Self::In => "IN",
            Self::Between => "BETWEEN",
        };
        f.write_str(s)
    }
}

impl FromStr for ParamOperator {
    type Err = ParamOperatorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "=" => Ok(Self::Eq),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            "<>" => Ok(Self::Ne),
            "IN" | "in" => Ok(Self::In),
            "BETWEEN" | "between" => Ok(Self::Between),
            other => Err(ParamOperatorParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ParamOperator`] string.
#[derive(Debug, Clone)]
pub struct ParamOperatorParseError(pub String);

impl fmt::Display for ParamOperatorParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid param operator: {:?}", self.0)
    }
}

impl std::error::Error for ParamOperatorParseError {}

// ---------------------------------------------------------------------------
// Value types embedded as JSON columns
// ---------------------------------------------------------------------------

/// A single filter applied against the source query: `field <op> value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskParameter {
    pub field: String,
    pub operator: ParamOperator,
    pub value: serde_json::Value,
}

/// Rules used to validate a fetched record before it is written to the
/// destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationRules {
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub existence_key: Vec<String>,
}

/// Column mapping consulted when running the optional post-update query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostUpdateMapping {
    #[serde(default)]
    pub table_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A scheduled transfer task -- the persisted definition of what to move
/// and how.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskDefinition {
    pub id: Uuid,
    pub name: String,
    pub active: bool,
    pub query: String,
    pub parameters: Json<Vec<TaskParameter>>,
    pub validation_rules: Json<ValidationRules>,
    pub clear_before_insert: bool,
    pub post_update_query: Option<String>,
    pub post_update_mapping: Json<PostUpdateMapping>,
    pub transfer_type: TransferType,
    pub linked_group: Option<String>,
    pub linked_tasks: Json<Vec<Uuid>>,
    pub linked_execution_order: i32,
    pub last_group_execution_id: Option<Uuid>,
    pub last_group_execution: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single run of a [`TaskDefinition`], recording progress and outcome.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskExecution {
    pub id: Uuid,
    pub task_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub progress: i32,
    pub rows: i64,
    pub inserted: i64,
    pub duplicates: i64,
    pub errors: i64,
    pub initial_count: i64,
    pub final_count: i64,
    pub affected_keys: Json<Vec<String>>,
    pub message: Option<String>,
    pub error_detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_type_display_roundtrip() {
        let variants = [TransferType::Up, TransferType::Down];
        for v in &variants {
            let s = v.to_string();
            let parsed: TransferType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn transfer_type_standard_normalizes_to_up() {
        let parsed: TransferType = "standard".parse().expect("should parse");
        assert_eq!(parsed, TransferType::Up);
    }

    #[test]
    fn transfer_type_invalid() {
        let result = "sideways".parse::<TransferType>();
        assert!(result.is_err());
    }

    #[test]
    fn execution_status_display_roundtrip() {
        let variants = [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Cancelled,
            ExecutionStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: ExecutionStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn execution_status_invalid() {
        let result = "limbo".parse::<ExecutionStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn param_operator_display_roundtrip() {
        let variants = [
            ParamOperator::Eq,
            ParamOperator::Lt,
            ParamOperator::Le,
            ParamOperator::Gt,
            ParamOperator::Ge,
            ParamOperator::Ne,
            ParamOperator::In,
            ParamOperator::Between,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: ParamOperator = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn param_operator_in_is_case_insensitive() {
        assert_eq!("in".parse::<ParamOperator>().unwrap(), ParamOperator::In);
        assert_eq!("IN".parse::<ParamOperator>().unwrap(), ParamOperator::In);
    }

    #[test]
    fn param_operator_invalid() {
        let result = "LIKE".parse::<ParamOperator>();
        assert!(result.is_err());
    }
}
