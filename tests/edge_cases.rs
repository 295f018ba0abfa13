//! Edge Case Testing
//!
//! This module tests edge cases and boundary conditions to ensure the
//! safety gate handles unusual inputs gracefully. Tests include:
//! - Denylisted keywords inside literals and comments
//! - Injection-shaped statements
//! - Unicode definitions and parameters
//! - Malformed identifiers, paths, and parameters
//! - Boundary behavior of the lifecycle preconditions
//!
//! These tests ensure robustness and help prevent unexpected failures in
//! production scenarios.

#![cfg(feature = "sqlite")]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tutela::engine::sqlite::SqliteStore;
use tutela::{MemorySink, SafetyConfig, Tutela};

// ============================================================================
// Test Helpers
// ============================================================================

fn temp_db(tag: &str) -> PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = std::env::temp_dir().join(format!("tutela_edge_{tag}_{id}.db"));
    let _ = std::fs::remove_file(&path);
    path
}

fn open_engine(tag: &str) -> (Tutela, PathBuf) {
    let path = temp_db(tag);
    let store = Arc::new(SqliteStore::open(&path).expect("open store"));
    {
        use rusqlite::Connection;
        let conn = Connection::open(&path).expect("open for seeding");
        conn.execute("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)", [])
            .expect("create notes");
        conn.execute("INSERT INTO notes (body) VALUES ('first')", []).expect("insert");
    }
    let engine = Tutela::with_store(store, SafetyConfig::default(), Arc::new(MemorySink::new()));
    (engine, path)
}

fn cleanup(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Begin a transaction for the session and return its id as a string
fn begin(engine: &Tutela, session: &str) -> String {
    engine.begin_transaction(session, None).expect("begin").id.to_string()
}

// ============================================================================
// Validator Edge Cases (through the public surface)
// ============================================================================

#[tokio::test]
async fn test_denylisted_keyword_inside_literal_executes() {
    let (engine, path) = open_engine("literal");

    let txn = begin(&engine, "s1");
    let outcome = engine
        .execute_query_write(
            "UPDATE notes SET body = 'please DROP me a line' WHERE id = 1",
            None,
            "s1",
        )
        .expect("literal DROP is data, not a statement");
    assert_eq!(outcome.rows_affected, Some(1));
    engine.commit_transaction(&txn).expect("commit");

    cleanup(&path);
}

#[tokio::test]
async fn test_denylisted_keyword_outside_literal_blocked() {
    let (engine, path) = open_engine("denylist");

    let txn = begin(&engine, "s1");
    for sql in [
        "DROP TABLE notes",
        "TRUNCATE TABLE notes",
        "drop table notes",
        "/* hide */ DROP TABLE notes",
    ] {
        let err = engine.execute_query_write(sql, None, "s1").unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_FAILED", "{sql}");
    }
    engine.rollback_transaction(&txn).expect("rollback");

    cleanup(&path);
}

#[tokio::test]
async fn test_multi_statement_and_injection_shapes_blocked() {
    let (engine, path) = open_engine("injection");

    let txn = begin(&engine, "s1");
    for sql in [
        "UPDATE notes SET body = 'x'; DELETE FROM notes",
        "UPDATE notes SET body = 'prefix' + @name WHERE id = 1",
        "DELETE FROM notes WHERE body = 'a' || @x",
        "EXEC('DELETE FROM notes')",
    ] {
        let err = engine.execute_query_write(sql, None, "s1").unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_FAILED", "{sql}");
    }

    // Nothing executed: the table still holds exactly the seeded row
    let out = engine
        .execute_query_write("SELECT COUNT(*) FROM notes", None, "s1")
        .expect("count");
    assert_eq!(out.rows[0][0], serde_json::json!(1));
    engine.rollback_transaction(&txn).expect("rollback");

    cleanup(&path);
}

#[tokio::test]
async fn test_empty_and_comment_only_statements_blocked() {
    let (engine, path) = open_engine("empty");

    let txn = begin(&engine, "s1");
    for sql in ["", "   ", "-- nothing\n", "/* nothing */"] {
        let err = engine.execute_query_write(sql, None, "s1").unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_FAILED", "{sql:?}");
    }
    engine.rollback_transaction(&txn).expect("rollback");

    cleanup(&path);
}

#[tokio::test]
async fn test_raw_transaction_control_blocked() {
    let (engine, path) = open_engine("txn_control");

    let txn = begin(&engine, "s1");
    for sql in ["BEGIN", "COMMIT", "ROLLBACK"] {
        let err = engine.execute_query_write(sql, None, "s1").unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_FAILED", "{sql}");
        assert!(err.message().contains("transaction_control"));
    }
    engine.rollback_transaction(&txn).expect("rollback");

    cleanup(&path);
}

// ============================================================================
// Parameter Edge Cases
// ============================================================================

#[tokio::test]
async fn test_unknown_named_parameter() {
    let (engine, path) = open_engine("unknown_param");

    let txn = begin(&engine, "s1");
    let err = engine
        .execute_query_write(
            "UPDATE notes SET body = @Body WHERE id = @Id",
            Some(&serde_json::json!({"Body": "x", "WrongName": 1})),
            "s1",
        )
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_INPUT");
    engine.rollback_transaction(&txn).expect("rollback");

    cleanup(&path);
}

#[tokio::test]
async fn test_scalar_params_rejected() {
    let (engine, path) = open_engine("scalar_params");

    let txn = begin(&engine, "s1");
    let err = engine
        .execute_query_write(
            "UPDATE notes SET body = @Body WHERE id = 1",
            Some(&serde_json::json!("just a string")),
            "s1",
        )
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_INPUT");
    engine.rollback_transaction(&txn).expect("rollback");

    cleanup(&path);
}

#[tokio::test]
async fn test_null_parameter_binds() {
    let (engine, path) = open_engine("null_bool");

    let txn = begin(&engine, "s1");
    let outcome = engine
        .execute_query_write(
            "INSERT INTO notes (body) VALUES (@Body)",
            Some(&serde_json::json!({"Body": null})),
            "s1",
        )
        .expect("null binds");
    assert_eq!(outcome.rows_affected, Some(1));

    let out = engine
        .execute_query_write(
            "SELECT COUNT(*) FROM notes WHERE body IS NULL",
            None,
            "s1",
        )
        .expect("count");
    assert_eq!(out.rows[0][0], serde_json::json!(1));
    engine.rollback_transaction(&txn).expect("rollback");

    cleanup(&path);
}

// ============================================================================
// Unicode Edge Cases
// ============================================================================

#[tokio::test]
async fn test_unicode_definition_round_trip() {
    let (engine, path) = open_engine("unicode");

    let definition = "CREATE PROCEDURE Greet @Name TEXT AS \
         SELECT '你好, ' || @Name AS greeting";
    // The concatenation heuristic only fires on literal-adjacent operators;
    // this one is literal-adjacent and must be rewritten with parameters
    let err = engine.create_sp_draft("dbo", "Greet", definition, "agent").unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_FAILED");

    let definition = "CREATE PROCEDURE Greet @Name TEXT AS \
         SELECT body FROM notes WHERE body = @Name -- καλημέρα";
    engine.create_sp_draft("dbo", "Greet", definition, "agent").expect("draft");
    engine
        .test_sp_draft("dbo", "Greet", Some(&serde_json::json!({"Name": "日本語"})), "agent")
        .expect("test");
    engine.deploy_sp("dbo", "Greet", "agent").expect("deploy");

    let live = engine.read_object("/database/stored_procedures/dbo/Greet.sql").expect("read");
    assert_eq!(live, definition);

    cleanup(&path);
}

#[tokio::test]
async fn test_unicode_parameter_values() {
    let (engine, path) = open_engine("unicode_params");

    let txn = begin(&engine, "s1");
    engine
        .execute_query_write(
            "INSERT INTO notes (body) VALUES (@Body)",
            Some(&serde_json::json!({"Body": "emoji ⚙️ and 中文"})),
            "s1",
        )
        .expect("insert");

    let out = engine
        .execute_query_write(
            "SELECT body FROM notes WHERE body = @Body",
            Some(&serde_json::json!({"Body": "emoji ⚙️ and 中文"})),
            "s1",
        )
        .expect("select");
    assert_eq!(out.rows[0][0], serde_json::json!("emoji ⚙️ and 中文"));
    engine.rollback_transaction(&txn).expect("rollback");

    cleanup(&path);
}

// ============================================================================
// Identifier & Path Edge Cases
// ============================================================================

#[tokio::test]
async fn test_malformed_identifiers_rejected() {
    let (engine, path) = open_engine("identifiers");

    for (schema, name) in [
        ("", "Proc"),
        ("dbo", ""),
        ("dbo.evil", "Proc"),
        ("dbo", "Get Orders"),
        ("dbo", "Get;Orders"),
        ("1dbo", "Proc"),
    ] {
        let err = engine
            .create_sp_draft(schema, name, "CREATE PROCEDURE P AS SELECT 1", "agent")
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT", "{schema}.{name}");
    }

    cleanup(&path);
}

#[tokio::test]
async fn test_draft_definition_shape_rules() {
    let (engine, path) = open_engine("definition_shape");

    // Not procedure DDL at all
    let err = engine
        .create_sp_draft("dbo", "Sneaky", "CREATE TABLE sneaky (id INTEGER)", "agent")
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_FAILED");

    // Denylisted keyword inside the body
    let err = engine
        .create_sp_draft("dbo", "Nuke", "CREATE PROCEDURE Nuke AS DROP TABLE notes", "agent")
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_FAILED");

    // A trailing semicolon on the body is fine end to end
    engine
        .create_sp_draft(
            "dbo",
            "Sweep",
            "CREATE PROCEDURE Sweep AS DELETE FROM notes WHERE body = 'swept';",
            "agent",
        )
        .expect("trailing semicolon is legal");
    let outcome = engine.test_sp_draft("dbo", "Sweep", None, "agent").expect("test");
    assert_eq!(outcome.rows_affected, Some(0));

    cleanup(&path);
}

#[tokio::test]
async fn test_testing_missing_draft_is_not_found() {
    let (engine, path) = open_engine("missing_draft");

    let err = engine.test_sp_draft("dbo", "Ghost", None, "agent").unwrap_err();
    assert_eq!(err.error_code(), "NOT_FOUND");

    cleanup(&path);
}

#[tokio::test]
async fn test_long_parameter_values_bind() {
    let (engine, path) = open_engine("long_statement");

    let txn = begin(&engine, "s1");
    let long_body = "x".repeat(5_000);
    let outcome = engine
        .execute_query_write(
            "INSERT INTO notes (body) VALUES (@Body)",
            Some(&serde_json::json!({ "Body": long_body })),
            "s1",
        )
        .expect("long values are parameters, not statement text");
    assert_eq!(outcome.rows_affected, Some(1));
    engine.rollback_transaction(&txn).expect("rollback");

    cleanup(&path);
}
