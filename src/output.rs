//! JSON Output Envelope Types
//!
//! This module defines the structured JSON output format for all Tutela operations.
//! All operations return either a SuccessEnvelope or an ErrorEnvelope.
//!
//! # Output Contract
//! - Success: `{"ok": true, "command": "...", "data": {...}, "meta": {...}}`
//! - Error: `{"ok": false, "command": "...", "error": {"code": "...", "message": "..."}}`
//!
//! Output is stable, versioned, and suitable for programmatic parsing by agents.

use serde::{Deserialize, Serialize};

use crate::error::TutelaError;

/// Success envelope for operation results
///
/// Generic over the data type to support different operation return values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessEnvelope<T> {
    /// Always true for success envelopes
    pub ok: bool,

    /// Command that was executed (deploy_sp, execute_query_write, ...)
    pub command: String,

    /// Operation-specific data
    pub data: T,

    /// Execution metadata
    pub meta: Metadata,
}

impl<T> SuccessEnvelope<T> {
    /// Create a new success envelope
    pub fn new(command: impl Into<String>, data: T, meta: Metadata) -> Self {
        Self { ok: true, command: command.into(), data, meta }
    }
}

/// Error envelope for operation failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Always false for error envelopes
    pub ok: bool,

    /// Command that was attempted
    pub command: String,

    /// Error information
    pub error: ErrorInfo,
}

impl ErrorEnvelope {
    /// Create a new error envelope
    pub fn new(command: impl Into<String>, error: ErrorInfo) -> Self {
        Self { ok: false, command: command.into(), error }
    }

    /// Create error envelope from a `TutelaError`
    pub fn from_error(command: impl Into<String>, err: &TutelaError) -> Self {
        Self::new(
            command,
            ErrorInfo { code: err.error_code().to_string(), message: err.message() },
        )
    }
}

/// Error information structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code (e.g., "VALIDATION_FAILED", "TXN_ROW_CAP_EXCEEDED")
    pub code: String,

    /// Human-readable error message (agent-appropriate, no sensitive data)
    pub message: String,
}

impl ErrorInfo {
    /// Create a new error info
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }
}

/// Execution metadata included in all success responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Execution time in milliseconds
    pub execution_ms: u64,

    /// Number of rows affected (for mutating statements, None otherwise)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,

    /// True once an audit-sink emission has failed; the operation itself
    /// still succeeded, but the audit trail is incomplete
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub audit_degraded: bool,
}

impl Metadata {
    /// Create new metadata with just execution time
    #[must_use]
    pub const fn new(execution_ms: u64) -> Self {
        Self { execution_ms, rows_affected: None, audit_degraded: false }
    }

    /// Create new metadata with execution time and affected-row count
    #[must_use]
    pub const fn with_rows(execution_ms: u64, rows_affected: u64) -> Self {
        Self { execution_ms, rows_affected: Some(rows_affected), audit_degraded: false }
    }

    /// Mark the audit trail as degraded
    #[must_use]
    pub const fn degraded(mut self, degraded: bool) -> Self {
        self.audit_degraded = degraded;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope_serialization() {
        let envelope = SuccessEnvelope::new(
            "execute_query_write",
            serde_json::json!({"result": "test"}),
            Metadata::with_rows(42, 10),
        );

        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""ok":true"#));
        assert!(json.contains(r#""command":"execute_query_write"#));
        assert!(json.contains(r#""execution_ms":42"#));
        assert!(json.contains(r#""rows_affected":10"#));
    }

    #[test]
    fn test_error_envelope_serialization() {
        let envelope = ErrorEnvelope::new(
            "deploy_sp",
            ErrorInfo::new("DRAFT_NOT_TESTED", "no tested draft for dbo.GetCustomerOrders"),
        );

        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""ok":false"#));
        assert!(json.contains(r#""command":"deploy_sp"#));
        assert!(json.contains(r#""code":"DRAFT_NOT_TESTED"#));
        assert!(json.contains("GetCustomerOrders"));
    }

    #[test]
    fn test_error_envelope_from_tutela_error() {
        let err = TutelaError::validation_failed("multi_statement", "batches are not permitted");
        let envelope = ErrorEnvelope::from_error("execute_query_write", &err);

        assert!(!envelope.ok);
        assert_eq!(envelope.command, "execute_query_write");
        assert_eq!(envelope.error.code, "VALIDATION_FAILED");
        assert!(envelope.error.message.contains("multi_statement"));
    }

    #[test]
    fn test_metadata_without_rows() {
        let meta = Metadata::new(100);
        let json = serde_json::to_string(&meta).unwrap();

        assert!(json.contains(r#""execution_ms":100"#));
        // rows_affected should be omitted when None
        assert!(!json.contains("rows_affected"));
        // audit_degraded should be omitted when false
        assert!(!json.contains("audit_degraded"));
    }

    #[test]
    fn test_metadata_degraded_flag_serialized_when_set() {
        let meta = Metadata::new(5).degraded(true);
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains(r#""audit_degraded":true"#));
    }
}
