//! Durable storage for task definitions and execution history.
//!
//! `xfer-db` is the Postgres-backed implementation of the task
//! repository contract consumed by `xfer-core`. It owns connection
//! pooling, migrations, and the query functions the rest of the
//! workspace builds on.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
