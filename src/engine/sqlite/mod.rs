//! `SQLite` Store Driver
//!
//! This module implements the [`MutationStore`] boundary over `rusqlite`.
//!
//! # Implementation Notes
//! - One `Connection` per transaction, opened at `begin` and owned by the
//!   transaction until commit/rollback (independent logical connections)
//! - Named parameters accept bare names and are matched against the
//!   statement's `@name`/`:name`/`$name` placeholders
//! - BLOB data is Base64-encoded for JSON safety
//! - Busy/locked and constraint failures are classified so the lifecycle
//!   engine can recognize write conflicts
//! - The version-control catalog is bootstrapped on `open`

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, Row, ToSql};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::{
    IsolationLevel, MutationStore, SqlParams, SqlValue, StatementOutcome, StoreTransaction,
};
use crate::error::{Result, TutelaError};
use crate::version;

/// Default wait for the store's write lock before reporting Busy
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 2_000;

/// `SQLite`-backed mutation store
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStore {
    /// Open the store, creating the database file and the version-control
    /// catalog if they do not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        };

        let conn = store.open_connection()?;
        conn.execute_batch(version::CATALOG_DDL)
            .map_err(|e| map_sqlite_error(&e))?;

        Ok(store)
    }

    /// Override how long `begin` waits for the store's write lock
    #[must_use]
    pub const fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    fn open_connection(&self) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(&self.path, flags).map_err(|e| {
            TutelaError::store_error(format!("failed to open SQLite database: {e}"))
        })?;
        conn.busy_timeout(self.busy_timeout).map_err(|e| map_sqlite_error(&e))?;
        Ok(conn)
    }
}

impl MutationStore for SqliteStore {
    fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn StoreTransaction>> {
        let conn = self.open_connection()?;

        let begin_sql = match isolation {
            IsolationLevel::Deferred => "BEGIN DEFERRED",
            IsolationLevel::Immediate => "BEGIN IMMEDIATE",
            IsolationLevel::Exclusive => "BEGIN EXCLUSIVE",
        };
        conn.execute_batch(begin_sql).map_err(|e| map_sqlite_error(&e))?;

        Ok(Box::new(SqliteTransaction { conn, finished: false }))
    }
}

/// One open transaction, owning its connection
struct SqliteTransaction {
    conn: Connection,
    finished: bool,
}

impl StoreTransaction for SqliteTransaction {
    fn execute(&mut self, sql: &str, params: &SqlParams) -> Result<StatementOutcome> {
        if self.finished {
            return Err(TutelaError::store_error("transaction is already finished"));
        }
        run_statement(&self.conn, sql, params)
    }

    fn commit(&mut self) -> Result<()> {
        if self.finished {
            return Err(TutelaError::store_error("transaction is already finished"));
        }
        self.conn.execute_batch("COMMIT").map_err(|e| map_sqlite_error(&e))?;
        self.finished = true;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        // Best-effort: mark finished either way so Drop does not retry
        let result = self.conn.execute_batch("ROLLBACK").map_err(|e| map_sqlite_error(&e));
        self.finished = true;
        result
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

/// Execute one statement and shape its result
fn run_statement(conn: &Connection, sql: &str, params: &SqlParams) -> Result<StatementOutcome> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| TutelaError::store_error(format!("failed to prepare statement: {e}")))?;

    let column_names: Vec<String> = stmt.column_names().iter().map(|s| (*s).to_string()).collect();

    if column_names.is_empty() {
        // Non-SELECT statement: rows affected, no result set
        let affected = match params {
            SqlParams::None => stmt.execute([]),
            SqlParams::Positional(values) => {
                stmt.execute(rusqlite::params_from_iter(values.iter().map(to_rusqlite_value)))
            }
            SqlParams::Named(pairs) => {
                let resolved = resolve_named_params(&stmt, pairs)?;
                let refs: Vec<(&str, &dyn ToSql)> =
                    resolved.iter().map(|(n, v)| (n.as_str(), v as &dyn ToSql)).collect();
                stmt.execute(refs.as_slice())
            }
        }
        .map_err(|e| map_sqlite_error(&e))?;

        return Ok(StatementOutcome {
            columns: Vec::new(),
            rows: Vec::new(),
            rows_affected: Some(affected as u64),
        });
    }

    // Result-set statement
    let mut rows = match params {
        SqlParams::None => stmt.query([]),
        SqlParams::Positional(values) => {
            stmt.query(rusqlite::params_from_iter(values.iter().map(to_rusqlite_value)))
        }
        SqlParams::Named(pairs) => {
            let resolved = resolve_named_params(&stmt, pairs)?;
            let refs: Vec<(&str, &dyn ToSql)> =
                resolved.iter().map(|(n, v)| (n.as_str(), v as &dyn ToSql)).collect();
            stmt.query(refs.as_slice())
        }
    }
    .map_err(|e| map_sqlite_error(&e))?;

    let mut out_rows = Vec::new();
    loop {
        let row = rows
            .next()
            .map_err(|e| TutelaError::store_error(format!("failed to fetch row: {e}")))?;
        let Some(row) = row else { break };
        out_rows.push(row_to_json(&column_names, row)?);
    }

    Ok(StatementOutcome { columns: column_names, rows: out_rows, rows_affected: None })
}

/// Match bare parameter names against the statement's placeholders,
/// trying `@name`, `:name`, then `$name` (a pre-prefixed name is used as-is)
fn resolve_named_params(
    stmt: &rusqlite::Statement<'_>,
    pairs: &[(String, SqlValue)],
) -> Result<Vec<(String, rusqlite::types::Value)>> {
    let mut resolved = Vec::with_capacity(pairs.len());

    for (name, value) in pairs {
        let candidates: Vec<String> = if name.starts_with(['@', ':', '$']) {
            vec![name.clone()]
        } else {
            vec![format!("@{name}"), format!(":{name}"), format!("${name}")]
        };

        let mut placeholder = None;
        for candidate in candidates {
            let found = stmt
                .parameter_index(&candidate)
                .map_err(|e| map_sqlite_error(&e))?
                .is_some();
            if found {
                placeholder = Some(candidate);
                break;
            }
        }

        let placeholder = placeholder.ok_or_else(|| {
            TutelaError::invalid_input(format!("statement has no parameter named '{name}'"))
        })?;
        resolved.push((placeholder, to_rusqlite_value(value)));
    }

    Ok(resolved)
}

fn to_rusqlite_value(value: &SqlValue) -> rusqlite::types::Value {
    match value {
        SqlValue::Null => rusqlite::types::Value::Null,
        SqlValue::Integer(i) => rusqlite::types::Value::Integer(*i),
        SqlValue::Real(f) => rusqlite::types::Value::Real(*f),
        SqlValue::Text(s) => rusqlite::types::Value::Text(s.clone()),
        SqlValue::Blob(b) => rusqlite::types::Value::Blob(b.clone()),
    }
}

/// Convert a `SQLite` row to JSON values in column order
fn row_to_json(column_names: &[String], row: &Row<'_>) -> Result<Vec<serde_json::Value>> {
    let mut values = Vec::with_capacity(column_names.len());

    for idx in 0..column_names.len() {
        let value_ref = row
            .get_ref(idx)
            .map_err(|e| TutelaError::store_error(format!("failed to read column {idx}: {e}")))?;
        values.push(value_ref_to_json(value_ref, idx)?);
    }

    Ok(values)
}

fn value_ref_to_json(value_ref: ValueRef<'_>, idx: usize) -> Result<serde_json::Value> {
    Ok(match value_ref {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::Number(i.into()),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map_or(serde_json::Value::Null, serde_json::Value::Number), // NaN/Infinity as null
        ValueRef::Text(s) => {
            let text = std::str::from_utf8(s).map_err(|e| {
                TutelaError::store_error(format!("column {idx} is not valid UTF-8: {e}"))
            })?;
            serde_json::Value::String(text.to_string())
        }
        ValueRef::Blob(b) => {
            use base64::Engine;
            let encoded = base64::engine::general_purpose::STANDARD.encode(b);
            serde_json::Value::String(encoded)
        }
    })
}

/// Classify `rusqlite` errors so callers can recognize write conflicts
fn map_sqlite_error(e: &rusqlite::Error) -> TutelaError {
    if let rusqlite::Error::SqliteFailure(inner, _) = e {
        match inner.code {
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                return TutelaError::store_busy(e.to_string());
            }
            rusqlite::ErrorCode::ConstraintViolation => {
                return TutelaError::store_constraint(e.to_string());
            }
            _ => {}
        }
    }
    TutelaError::store_error(e.to_string())
}
