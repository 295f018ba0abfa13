//! Output Validation Tests
//!
//! This module validates that all Tutela output conforms to the defined JSON
//! shapes. It ensures:
//! - Success envelopes match the expected schema
//! - Error envelopes match the expected schema
//! - Operation payloads (versions, transactions, statement outcomes)
//!   serialize with stable field names agents can rely on
//! - Metadata is consistent across commands

#![cfg(feature = "sqlite")]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tutela::engine::sqlite::SqliteStore;
use tutela::{
    ErrorEnvelope, MemorySink, Metadata, SafetyConfig, SuccessEnvelope, Tutela, TutelaError,
};

// ============================================================================
// Test Helpers
// ============================================================================

fn temp_db(tag: &str) -> PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = std::env::temp_dir().join(format!("tutela_out_{tag}_{id}.db"));
    let _ = std::fs::remove_file(&path);
    path
}

fn open_engine(tag: &str) -> (Tutela, PathBuf) {
    let path = temp_db(tag);
    let store = Arc::new(SqliteStore::open(&path).expect("open store"));
    let engine = Tutela::with_store(store, SafetyConfig::default(), Arc::new(MemorySink::new()));
    (engine, path)
}

fn cleanup(path: &Path) {
    let _ = std::fs::remove_file(path);
}

// ============================================================================
// Envelope Structure Tests
// ============================================================================

#[test]
fn test_success_envelope_structure() {
    let data = serde_json::json!({"value": 1});
    let envelope: SuccessEnvelope<serde_json::Value> =
        SuccessEnvelope::new("deploy_sp", data, Metadata::new(42));

    let json_value: serde_json::Value =
        serde_json::from_str(&serde_json::to_string(&envelope).expect("serialize"))
            .expect("parse");

    assert_eq!(json_value["ok"], true);
    assert_eq!(json_value["command"], "deploy_sp");
    assert!(json_value["data"].is_object());
    assert_eq!(json_value["meta"]["execution_ms"], 42);
    // Optional fields are omitted, not null
    assert!(json_value["meta"].get("rows_affected").is_none());
    assert!(json_value["meta"].get("audit_degraded").is_none());
}

#[test]
fn test_error_envelope_structure() {
    let err = TutelaError::validation_failed("denied_keyword:DROP", "DROP is not permitted");
    let envelope = ErrorEnvelope::from_error("execute_query_write", &err);

    let json_value: serde_json::Value =
        serde_json::from_str(&serde_json::to_string(&envelope).expect("serialize"))
            .expect("parse");

    assert_eq!(json_value["ok"], false);
    assert_eq!(json_value["command"], "execute_query_write");
    assert_eq!(json_value["error"]["code"], "VALIDATION_FAILED");
    assert!(json_value["error"]["message"]
        .as_str()
        .expect("message is a string")
        .contains("DROP"));
}

#[test]
fn test_metadata_degraded_flag_shape() {
    let meta = Metadata::with_rows(7, 3).degraded(true);
    let json_value: serde_json::Value =
        serde_json::from_str(&serde_json::to_string(&meta).expect("serialize")).expect("parse");

    assert_eq!(json_value["execution_ms"], 7);
    assert_eq!(json_value["rows_affected"], 3);
    assert_eq!(json_value["audit_degraded"], true);
}

// ============================================================================
// Payload Shape Tests
// ============================================================================

#[tokio::test]
async fn test_version_payload_shape() {
    let (engine, path) = open_engine("version_shape");

    engine
        .create_sp_draft("dbo", "Probe", "CREATE PROCEDURE Probe AS SELECT 1", "agent")
        .expect("draft");
    engine.test_sp_draft("dbo", "Probe", None, "agent").expect("test");
    engine.deploy_sp("dbo", "Probe", "agent").expect("deploy");

    let versions = engine.list_sp_versions("dbo", "Probe").expect("list");
    let json_value = serde_json::to_value(&versions).expect("serialize");
    let row = &json_value[0];

    assert_eq!(row["schema"], "dbo");
    assert_eq!(row["name"], "Probe");
    assert_eq!(row["version"], 1);
    assert_eq!(row["is_active"], true);
    assert_eq!(row["deployed_by"], "agent");
    assert_eq!(row["definition"], "CREATE PROCEDURE Probe AS SELECT 1");

    // Hash is hex-encoded SHA-256; timestamp is RFC 3339
    let sha = row["definition_sha256"].as_str().expect("sha string");
    assert_eq!(sha.len(), 64);
    assert!(sha.chars().all(|c| c.is_ascii_hexdigit()));
    let deployed_at = row["deployed_at"].as_str().expect("timestamp string");
    assert!(deployed_at.contains('T'), "RFC 3339 timestamp, got {deployed_at}");

    cleanup(&path);
}

#[tokio::test]
async fn test_transaction_record_shape() {
    let (engine, path) = open_engine("txn_shape");

    let record = engine.begin_transaction("s1", None).expect("begin");
    let json_value = serde_json::to_value(&record).expect("serialize");

    assert!(json_value["id"].is_string());
    assert_eq!(json_value["session"], "s1");
    assert_eq!(json_value["isolation"], "immediate");
    assert_eq!(json_value["state"], "active");
    assert_eq!(json_value["rows_affected_total"], 0);
    assert!(json_value["timeout_ms"].is_number());
    assert!(json_value["started_at"].is_string());

    // Terminal state carries its reason
    let rolled = engine.rollback_transaction(&record.id.to_string()).expect("rollback");
    let json_value = serde_json::to_value(&rolled).expect("serialize");
    assert_eq!(json_value["state"], "rolled_back");
    assert_eq!(json_value["reason"], "requested");

    cleanup(&path);
}

#[tokio::test]
async fn test_statement_outcome_shape() {
    let (engine, path) = open_engine("outcome_shape");

    let record = engine.begin_transaction("s1", None).expect("begin");
    // The catalog tables are queryable like any other table
    let outcome = engine
        .execute_query_write("SELECT COUNT(*) AS n FROM sp_versions", None, "s1")
        .expect("select");

    let json_value = serde_json::to_value(&outcome).expect("serialize");
    assert_eq!(json_value["columns"], serde_json::json!(["n"]));
    assert_eq!(json_value["rows"], serde_json::json!([[0]]));
    // rows_affected omitted for result-set statements
    assert!(json_value.get("rows_affected").is_none());

    engine.rollback_transaction(&record.id.to_string()).expect("rollback");
    cleanup(&path);
}

#[tokio::test]
async fn test_draft_payload_shape() {
    let (engine, path) = open_engine("draft_shape");

    let draft = engine
        .create_sp_draft("dbo", "Probe", "CREATE PROCEDURE Probe AS SELECT 1", "agent")
        .expect("draft");
    let json_value = serde_json::to_value(&draft).expect("serialize");

    assert_eq!(json_value["schema"], "dbo");
    assert_eq!(json_value["name"], "Probe");
    assert_eq!(json_value["tested"], false);
    assert!(json_value["created_at"].is_string());
    // No active version yet: source_version omitted entirely
    assert!(json_value.get("source_version").is_none());

    cleanup(&path);
}

// ============================================================================
// Error Code Stability Tests
// ============================================================================

#[tokio::test]
async fn test_error_codes_are_stable_across_surface() {
    let (engine, path) = open_engine("codes");

    let cases: Vec<(&str, TutelaError)> = vec![
        (
            "VALIDATION_FAILED",
            engine
                .execute_query_write("DELETE FROM sp_versions", None, "nobody")
                .expect_err("policy requires a transaction"),
        ),
        (
            "DRAFT_NOT_TESTED",
            engine.deploy_sp("dbo", "Ghost", "agent").expect_err("no draft"),
        ),
        (
            "NOT_FOUND",
            engine.read_object("/database/stored_procedures/dbo/Ghost.sql").expect_err("none"),
        ),
        (
            "INVALID_INPUT",
            engine.commit_transaction("not-a-uuid").expect_err("bad id"),
        ),
    ];

    for (expected, err) in cases {
        assert_eq!(err.error_code(), expected);
        // Every error renders into an envelope with the same stable code
        let envelope = ErrorEnvelope::from_error("probe", &err);
        assert_eq!(envelope.error.code, expected);
    }

    cleanup(&path);
}
