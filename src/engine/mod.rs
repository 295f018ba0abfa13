//! Store Boundary Traits and Core Types
//!
//! This module defines the abstraction the engine requires from the
//! underlying relational store: begin a transaction context, execute a
//! parameterized statement inside it, commit or roll it back.
//!
//! # Connection Ownership
//! Every transaction owns its own logical connection for its whole lifetime.
//! The engine never shares one open transaction across concurrent callers;
//! cross-process serialization is the store's job (row-level locking), never
//! an in-process lock.
//!
//! # Parameterization
//! All values reach the store through [`SqlParams`], never through string
//! interpolation. This is the real injection defense; the validator's text
//! heuristics are defense-in-depth on top of it.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TutelaError};

// Store driver implementations
#[cfg(feature = "sqlite")]
pub mod sqlite;

/// Transaction isolation, in the store's native vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// Take locks lazily on first read/write
    Deferred,
    /// Acquire the write lock up front
    #[default]
    Immediate,
    /// Exclude readers as well as writers
    Exclusive,
}

impl IsolationLevel {
    /// Get the isolation level name as a string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Deferred => "deferred",
            Self::Immediate => "immediate",
            Self::Exclusive => "exclusive",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single SQL value crossing the store boundary
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL
    Null,
    /// 64-bit integer
    Integer(i64),
    /// 64-bit float
    Real(f64),
    /// UTF-8 text
    Text(String),
    /// Raw bytes (Base64-encoded in JSON)
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Convert a JSON value into a SQL value
    ///
    /// Booleans become 0/1 integers; arrays and objects are rejected -
    /// callers pass them as separate parameters, not as encoded payloads.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Null => Ok(Self::Null),
            serde_json::Value::Bool(b) => Ok(Self::Integer(i64::from(*b))),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Integer(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Self::Real(f))
                } else {
                    Err(TutelaError::invalid_input(format!("unrepresentable number: {n}")))
                }
            }
            serde_json::Value::String(s) => Ok(Self::Text(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => Err(
                TutelaError::invalid_input("array and object parameters are not supported"),
            ),
        }
    }

    /// Convert to a JSON value (BLOBs are Base64-encoded for JSON safety)
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Integer(i) => serde_json::Value::Number((*i).into()),
            Self::Real(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Blob(b) => {
                use base64::Engine;
                let encoded = base64::engine::general_purpose::STANDARD.encode(b);
                serde_json::Value::String(encoded)
            }
        }
    }
}

/// Parameters for one statement
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SqlParams {
    /// No parameters
    #[default]
    None,
    /// Positional parameters (`?1`, `?2`, ...)
    Positional(Vec<SqlValue>),
    /// Named parameters; bare names are matched against `@`/`:`/`$` prefixes
    Named(Vec<(String, SqlValue)>),
}

impl SqlParams {
    /// Build parameters from a JSON value: an array binds positionally, an
    /// object binds by name, null/absent means no parameters.
    pub fn from_json(value: Option<&serde_json::Value>) -> Result<Self> {
        match value {
            None | Some(serde_json::Value::Null) => Ok(Self::None),
            Some(serde_json::Value::Array(items)) => {
                let values =
                    items.iter().map(SqlValue::from_json).collect::<Result<Vec<_>>>()?;
                Ok(Self::Positional(values))
            }
            Some(serde_json::Value::Object(map)) => {
                let pairs = map
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), SqlValue::from_json(v)?)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::Named(pairs))
            }
            Some(other) => Err(TutelaError::invalid_input(format!(
                "parameters must be an array or object, got: {other}"
            ))),
        }
    }

    /// Whether there are no parameters
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::Positional(v) => v.is_empty(),
            Self::Named(v) => v.is_empty(),
        }
    }
}

/// Result of executing one statement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementOutcome {
    /// Column names in the result set (empty for non-SELECT statements)
    pub columns: Vec<String>,

    /// Result rows; each row is a vector of JSON values in column order
    pub rows: Vec<Vec<serde_json::Value>>,

    /// Number of rows affected (None for result-set statements)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
}

/// An open transaction context on the store
///
/// Dropped transactions roll back; the engine still calls `rollback`
/// explicitly so the outcome is observable.
pub trait StoreTransaction: Send {
    /// Execute a parameterized statement inside this transaction
    fn execute(&mut self, sql: &str, params: &SqlParams) -> Result<StatementOutcome>;

    /// Commit the transaction
    fn commit(&mut self) -> Result<()>;

    /// Roll the transaction back
    fn rollback(&mut self) -> Result<()>;
}

/// Capability to open transaction contexts on the store
///
/// Each `begin` hands out an independent logical connection; the caller owns
/// it exclusively until commit/rollback.
pub trait MutationStore: Send + Sync {
    /// Begin a transaction at the given isolation level
    fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn StoreTransaction>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_serialization() {
        assert_eq!(serde_json::to_string(&IsolationLevel::Deferred).unwrap(), r#""deferred""#);
        assert_eq!(serde_json::to_string(&IsolationLevel::Immediate).unwrap(), r#""immediate""#);
        assert_eq!(serde_json::to_string(&IsolationLevel::Exclusive).unwrap(), r#""exclusive""#);
        assert_eq!(IsolationLevel::default(), IsolationLevel::Immediate);
    }

    #[test]
    fn test_sql_value_from_json() {
        assert_eq!(SqlValue::from_json(&serde_json::json!(null)).unwrap(), SqlValue::Null);
        assert_eq!(SqlValue::from_json(&serde_json::json!(true)).unwrap(), SqlValue::Integer(1));
        assert_eq!(SqlValue::from_json(&serde_json::json!(42)).unwrap(), SqlValue::Integer(42));
        assert_eq!(SqlValue::from_json(&serde_json::json!(1.5)).unwrap(), SqlValue::Real(1.5));
        assert_eq!(
            SqlValue::from_json(&serde_json::json!("x")).unwrap(),
            SqlValue::Text("x".to_string())
        );
        assert!(SqlValue::from_json(&serde_json::json!([1, 2])).is_err());
        assert!(SqlValue::from_json(&serde_json::json!({"a": 1})).is_err());
    }

    #[test]
    fn test_sql_value_to_json_blob_is_base64() {
        let value = SqlValue::Blob(vec![1, 2, 3]);
        let json = value.to_json();
        assert!(json.is_string());
        // 0x010203 in standard Base64
        assert_eq!(json, serde_json::json!("AQID"));
    }

    #[test]
    fn test_sql_params_from_json() {
        assert_eq!(SqlParams::from_json(None).unwrap(), SqlParams::None);
        assert_eq!(
            SqlParams::from_json(Some(&serde_json::json!(null))).unwrap(),
            SqlParams::None
        );

        let positional = SqlParams::from_json(Some(&serde_json::json!([1, "a"]))).unwrap();
        assert_eq!(
            positional,
            SqlParams::Positional(vec![SqlValue::Integer(1), SqlValue::Text("a".to_string())])
        );

        let named =
            SqlParams::from_json(Some(&serde_json::json!({"CustomerId": 123}))).unwrap();
        assert_eq!(
            named,
            SqlParams::Named(vec![("CustomerId".to_string(), SqlValue::Integer(123))])
        );

        assert!(SqlParams::from_json(Some(&serde_json::json!("scalar"))).is_err());
    }

    #[test]
    fn test_sql_params_is_empty() {
        assert!(SqlParams::None.is_empty());
        assert!(SqlParams::Positional(vec![]).is_empty());
        assert!(!SqlParams::Positional(vec![SqlValue::Null]).is_empty());
        assert!(!SqlParams::Named(vec![("a".to_string(), SqlValue::Null)]).is_empty());
    }
}
