//! Stored-Procedure Version Store
//!
//! Durable history of stored-procedure definitions, keyed by
//! (schema, name, version). The history is an explicit ordered log: version
//! numbers are assigned `max + 1` inside the deploying transaction and are
//! never reused or renumbered; `is_active` is the only mutable column on a
//! historical row, and a partial unique index enforces at most one active
//! row per procedure.
//!
//! Three catalog tables carry the whole pipeline:
//! - `sp_drafts` - the isolated draft schema (one draft per procedure)
//! - `sp_versions` - the append-only history with the active marker
//! - `procedures` - the live production definition
//!
//! Reads go straight through the owning transaction; every mutation is
//! routed through the [`SafeWriteExecutor`] so it passes the same validation
//! and audit gate as ad-hoc SQL.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::engine::{SqlParams, SqlValue};
use crate::error::{Result, TutelaError};
use crate::safewrite::{AuditScope, SafeWriteExecutor};
use crate::txn::TransactionManager;

/// DDL for the version-control catalog, executed when the store is opened
pub const CATALOG_DDL: &str = "
CREATE TABLE IF NOT EXISTS sp_versions (
    schema_name       TEXT NOT NULL,
    proc_name         TEXT NOT NULL,
    version           INTEGER NOT NULL,
    definition        TEXT NOT NULL,
    definition_sha256 TEXT NOT NULL,
    deployed_at       TEXT NOT NULL,
    deployed_by       TEXT NOT NULL,
    is_active         INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (schema_name, proc_name, version)
);
CREATE UNIQUE INDEX IF NOT EXISTS sp_versions_one_active
    ON sp_versions (schema_name, proc_name) WHERE is_active = 1;
CREATE TABLE IF NOT EXISTS sp_drafts (
    schema_name    TEXT NOT NULL,
    proc_name      TEXT NOT NULL,
    definition     TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    source_version INTEGER,
    tested         INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (schema_name, proc_name)
);
CREATE TABLE IF NOT EXISTS procedures (
    schema_name TEXT NOT NULL,
    proc_name   TEXT NOT NULL,
    definition  TEXT NOT NULL,
    PRIMARY KEY (schema_name, proc_name)
);
";

/// One row of the append-only version history
#[derive(Debug, Clone, Serialize)]
pub struct SpVersion {
    /// Schema the procedure belongs to
    pub schema: String,
    /// Procedure name
    pub name: String,
    /// Monotonic version number (per procedure)
    pub version: i64,
    /// Full definition text
    pub definition: String,
    /// SHA-256 of the definition text, hex-encoded
    pub definition_sha256: String,
    /// When this version was deployed
    pub deployed_at: DateTime<Utc>,
    /// Who deployed it
    pub deployed_by: String,
    /// Whether this version is the live one
    pub is_active: bool,
}

/// A candidate definition living in the isolated draft schema
#[derive(Debug, Clone, Serialize)]
pub struct SpDraft {
    /// Target schema
    pub schema: String,
    /// Procedure name
    pub name: String,
    /// Full definition text
    pub definition: String,
    /// When the draft was created
    pub created_at: DateTime<Utc>,
    /// Active version at draft-creation time, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_version: Option<i64>,
    /// Whether the draft has passed a test run
    pub tested: bool,
}

/// Hex-encoded SHA-256 of a definition text
#[must_use]
pub fn definition_hash(definition: &str) -> String {
    hex::encode(Sha256::digest(definition.as_bytes()))
}

fn key_params(schema: &str, name: &str) -> SqlParams {
    SqlParams::Named(vec![
        ("schema".to_string(), SqlValue::Text(schema.to_string())),
        ("name".to_string(), SqlValue::Text(name.to_string())),
    ])
}

/// Fetch the draft for (schema, name), if one exists
pub fn draft(
    manager: &TransactionManager,
    txn: Uuid,
    schema: &str,
    name: &str,
) -> Result<Option<SpDraft>> {
    let out = manager.execute_in(
        txn,
        "SELECT definition, created_at, source_version, tested
         FROM sp_drafts WHERE schema_name = @schema AND proc_name = @name",
        &key_params(schema, name),
    )?;

    let Some(row) = out.rows.first() else {
        return Ok(None);
    };

    Ok(Some(SpDraft {
        schema: schema.to_string(),
        name: name.to_string(),
        definition: row_text(row, 0)?,
        created_at: row_timestamp(row, 1)?,
        source_version: row_opt_integer(row, 2)?,
        tested: row_integer(row, 3)? != 0,
    }))
}

/// Insert a fresh draft
pub fn insert_draft(
    executor: &SafeWriteExecutor,
    txn: Uuid,
    new_draft: &SpDraft,
    scope: AuditScope<'_>,
) -> Result<()> {
    let params = SqlParams::Named(vec![
        ("schema".to_string(), SqlValue::Text(new_draft.schema.clone())),
        ("name".to_string(), SqlValue::Text(new_draft.name.clone())),
        ("definition".to_string(), SqlValue::Text(new_draft.definition.clone())),
        ("created_at".to_string(), SqlValue::Text(new_draft.created_at.to_rfc3339())),
        (
            "source_version".to_string(),
            new_draft.source_version.map_or(SqlValue::Null, SqlValue::Integer),
        ),
    ]);
    executor.execute_in_transaction(
        txn,
        "INSERT INTO sp_drafts (schema_name, proc_name, definition, created_at, source_version, tested)
         VALUES (@schema, @name, @definition, @created_at, @source_version, 0)",
        &params,
        scope,
    )?;
    Ok(())
}

/// Mark the draft as having passed a test run
pub fn mark_draft_tested(
    executor: &SafeWriteExecutor,
    txn: Uuid,
    schema: &str,
    name: &str,
    scope: AuditScope<'_>,
) -> Result<()> {
    executor.execute_in_transaction(
        txn,
        "UPDATE sp_drafts SET tested = 1 WHERE schema_name = @schema AND proc_name = @name",
        &key_params(schema, name),
        scope,
    )?;
    Ok(())
}

/// Delete the draft (deploy consumed it, or an explicit discard)
pub fn delete_draft(
    executor: &SafeWriteExecutor,
    txn: Uuid,
    schema: &str,
    name: &str,
    scope: AuditScope<'_>,
) -> Result<()> {
    executor.execute_in_transaction(
        txn,
        "DELETE FROM sp_drafts WHERE schema_name = @schema AND proc_name = @name",
        &key_params(schema, name),
        scope,
    )?;
    Ok(())
}

const VERSION_COLUMNS: &str = "version, definition, definition_sha256, deployed_at, deployed_by, is_active";

/// The currently active version, if any
pub fn active_version(
    manager: &TransactionManager,
    txn: Uuid,
    schema: &str,
    name: &str,
) -> Result<Option<SpVersion>> {
    let out = manager.execute_in(
        txn,
        &format!(
            "SELECT {VERSION_COLUMNS} FROM sp_versions
             WHERE schema_name = @schema AND proc_name = @name AND is_active = 1
             LIMIT 1"
        ),
        &key_params(schema, name),
    )?;
    out.rows.first().map(|row| row_to_version(schema, name, row)).transpose()
}

/// A specific version by number
pub fn get_version(
    manager: &TransactionManager,
    txn: Uuid,
    schema: &str,
    name: &str,
    version: i64,
) -> Result<Option<SpVersion>> {
    let params = SqlParams::Named(vec![
        ("schema".to_string(), SqlValue::Text(schema.to_string())),
        ("name".to_string(), SqlValue::Text(name.to_string())),
        ("version".to_string(), SqlValue::Integer(version)),
    ]);
    let out = manager.execute_in(
        txn,
        &format!(
            "SELECT {VERSION_COLUMNS} FROM sp_versions
             WHERE schema_name = @schema AND proc_name = @name AND version = @version"
        ),
        &params,
    )?;
    out.rows.first().map(|row| row_to_version(schema, name, row)).transpose()
}

/// Highest version number recorded so far (0 when none)
pub fn max_version(
    manager: &TransactionManager,
    txn: Uuid,
    schema: &str,
    name: &str,
) -> Result<i64> {
    let out = manager.execute_in(
        txn,
        "SELECT COALESCE(MAX(version), 0) FROM sp_versions
         WHERE schema_name = @schema AND proc_name = @name",
        &key_params(schema, name),
    )?;
    let row = out
        .rows
        .first()
        .ok_or_else(|| TutelaError::store_error("aggregate query returned no row"))?;
    row_integer(row, 0)
}

/// Greatest version number strictly below the given one, if any
pub fn previous_version(
    manager: &TransactionManager,
    txn: Uuid,
    schema: &str,
    name: &str,
    below: i64,
) -> Result<Option<i64>> {
    let params = SqlParams::Named(vec![
        ("schema".to_string(), SqlValue::Text(schema.to_string())),
        ("name".to_string(), SqlValue::Text(name.to_string())),
        ("below".to_string(), SqlValue::Integer(below)),
    ]);
    let out = manager.execute_in(
        txn,
        "SELECT MAX(version) FROM sp_versions
         WHERE schema_name = @schema AND proc_name = @name AND version < @below",
        &params,
    )?;
    let row = out
        .rows
        .first()
        .ok_or_else(|| TutelaError::store_error("aggregate query returned no row"))?;
    row_opt_integer(row, 0)
}

/// Full history, ordered by version number ascending
pub fn list_versions(
    manager: &TransactionManager,
    txn: Uuid,
    schema: &str,
    name: &str,
) -> Result<Vec<SpVersion>> {
    let out = manager.execute_in(
        txn,
        &format!(
            "SELECT {VERSION_COLUMNS} FROM sp_versions
             WHERE schema_name = @schema AND proc_name = @name
             ORDER BY version ASC"
        ),
        &key_params(schema, name),
    )?;
    out.rows.iter().map(|row| row_to_version(schema, name, row)).collect()
}

/// Append a new version row
pub fn insert_version(
    executor: &SafeWriteExecutor,
    txn: Uuid,
    version: &SpVersion,
    scope: AuditScope<'_>,
) -> Result<()> {
    let params = SqlParams::Named(vec![
        ("schema".to_string(), SqlValue::Text(version.schema.clone())),
        ("name".to_string(), SqlValue::Text(version.name.clone())),
        ("version".to_string(), SqlValue::Integer(version.version)),
        ("definition".to_string(), SqlValue::Text(version.definition.clone())),
        ("sha".to_string(), SqlValue::Text(version.definition_sha256.clone())),
        ("deployed_at".to_string(), SqlValue::Text(version.deployed_at.to_rfc3339())),
        ("deployed_by".to_string(), SqlValue::Text(version.deployed_by.clone())),
        ("active".to_string(), SqlValue::Integer(i64::from(version.is_active))),
    ]);
    executor.execute_in_transaction(
        txn,
        "INSERT INTO sp_versions
         (schema_name, proc_name, version, definition, definition_sha256, deployed_at, deployed_by, is_active)
         VALUES (@schema, @name, @version, @definition, @sha, @deployed_at, @deployed_by, @active)",
        &params,
        scope,
    )?;
    Ok(())
}

/// Flip the active marker on one historical row
pub fn set_active(
    executor: &SafeWriteExecutor,
    txn: Uuid,
    schema: &str,
    name: &str,
    version: i64,
    active: bool,
    scope: AuditScope<'_>,
) -> Result<()> {
    let params = SqlParams::Named(vec![
        ("schema".to_string(), SqlValue::Text(schema.to_string())),
        ("name".to_string(), SqlValue::Text(name.to_string())),
        ("version".to_string(), SqlValue::Integer(version)),
        ("active".to_string(), SqlValue::Integer(i64::from(active))),
    ]);
    executor.execute_in_transaction(
        txn,
        "UPDATE sp_versions SET is_active = @active
         WHERE schema_name = @schema AND proc_name = @name AND version = @version",
        &params,
        scope,
    )?;
    Ok(())
}

/// Write the live production definition (the `CREATE OR ALTER PROCEDURE`
/// step, rendered as an upsert into the production catalog)
pub fn upsert_procedure(
    executor: &SafeWriteExecutor,
    txn: Uuid,
    schema: &str,
    name: &str,
    definition: &str,
    scope: AuditScope<'_>,
) -> Result<()> {
    let params = SqlParams::Named(vec![
        ("schema".to_string(), SqlValue::Text(schema.to_string())),
        ("name".to_string(), SqlValue::Text(name.to_string())),
        ("definition".to_string(), SqlValue::Text(definition.to_string())),
    ]);
    executor.execute_in_transaction(
        txn,
        "INSERT INTO procedures (schema_name, proc_name, definition)
         VALUES (@schema, @name, @definition)
         ON CONFLICT (schema_name, proc_name) DO UPDATE SET definition = excluded.definition",
        &params,
        scope,
    )?;
    Ok(())
}

/// The live production definition, if the procedure is deployed
pub fn live_definition(
    manager: &TransactionManager,
    txn: Uuid,
    schema: &str,
    name: &str,
) -> Result<Option<String>> {
    let out = manager.execute_in(
        txn,
        "SELECT definition FROM procedures WHERE schema_name = @schema AND proc_name = @name",
        &key_params(schema, name),
    )?;
    out.rows.first().map(|row| row_text(row, 0)).transpose()
}

// Row parsing helpers: the store hands back JSON values in column order

fn row_text(row: &[serde_json::Value], idx: usize) -> Result<String> {
    row.get(idx)
        .and_then(|v| v.as_str())
        .map(ToString::to_string)
        .ok_or_else(|| corrupt_row(idx, "text"))
}

fn row_integer(row: &[serde_json::Value], idx: usize) -> Result<i64> {
    row.get(idx).and_then(serde_json::Value::as_i64).ok_or_else(|| corrupt_row(idx, "integer"))
}

fn row_opt_integer(row: &[serde_json::Value], idx: usize) -> Result<Option<i64>> {
    match row.get(idx) {
        None => Err(corrupt_row(idx, "integer")),
        Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or_else(|| corrupt_row(idx, "integer")),
    }
}

fn row_timestamp(row: &[serde_json::Value], idx: usize) -> Result<DateTime<Utc>> {
    let text = row_text(row, idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TutelaError::store_error(format!("catalog timestamp is invalid: {e}")))
}

fn corrupt_row(idx: usize, expected: &str) -> TutelaError {
    TutelaError::store_error(format!("catalog row corrupt: column {idx} is not {expected}"))
}

fn row_to_version(schema: &str, name: &str, row: &[serde_json::Value]) -> Result<SpVersion> {
    Ok(SpVersion {
        schema: schema.to_string(),
        name: name.to_string(),
        version: row_integer(row, 0)?,
        definition: row_text(row, 1)?,
        definition_sha256: row_text(row, 2)?,
        deployed_at: row_timestamp(row, 3)?,
        deployed_by: row_text(row, 4)?,
        is_active: row_integer(row, 5)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_hash_is_stable_hex_sha256() {
        let hash = definition_hash("CREATE PROCEDURE P AS SELECT 1");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        // Same text, same hash; different text, different hash
        assert_eq!(hash, definition_hash("CREATE PROCEDURE P AS SELECT 1"));
        assert_ne!(hash, definition_hash("CREATE PROCEDURE P AS SELECT 2"));
    }

    #[test]
    fn test_catalog_enforces_single_active_version() {
        assert!(CATALOG_DDL.contains("UNIQUE INDEX"));
        assert!(CATALOG_DDL.contains("WHERE is_active = 1"));
    }

    #[test]
    fn test_row_parsing_helpers() {
        let row = vec![
            serde_json::json!(3),
            serde_json::json!("text"),
            serde_json::json!(null),
        ];
        assert_eq!(row_integer(&row, 0).unwrap(), 3);
        assert_eq!(row_text(&row, 1).unwrap(), "text");
        assert_eq!(row_opt_integer(&row, 2).unwrap(), None);
        assert!(row_text(&row, 0).is_err());
        assert!(row_integer(&row, 9).is_err());
    }
}
