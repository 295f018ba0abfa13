//! Audit Events and Sinks
//!
//! Every mutating operation emits an audit event, success or failure. The
//! core treats the sink as an external collaborator: emission is
//! fire-and-forget, and a sink failure must never block or fail the
//! operation that produced the event. The executor latches a degraded-mode
//! flag instead, which surfaces in response metadata.
//!
//! Events serialize as one JSON object per line, keeping stdout machine-only
//! (the default sink writes to stderr).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Result, TutelaError};

/// Outcome recorded on an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The operation completed
    Success,
    /// The operation failed (validation block, precondition, store error)
    Failed,
}

/// One append-only audit record
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// When the event was recorded
    pub timestamp: DateTime<Utc>,
    /// Who performed the operation (session or actor name)
    pub actor: String,
    /// Operation name (create_sp_draft, execute_query_write, ...)
    pub operation: String,
    /// What was operated on (virtual path or statement summary)
    pub target: String,
    /// Success or failure
    pub outcome: AuditOutcome,
    /// Extra context (rows affected, failure reason)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEvent {
    /// Create a success event
    pub fn success(
        actor: impl Into<String>,
        operation: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            actor: actor.into(),
            operation: operation.into(),
            target: target.into(),
            outcome: AuditOutcome::Success,
            detail: None,
        }
    }

    /// Create a failure event with the failure reason as detail
    pub fn failed(
        actor: impl Into<String>,
        operation: impl Into<String>,
        target: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            actor: actor.into(),
            operation: operation.into(),
            target: target.into(),
            outcome: AuditOutcome::Failed,
            detail: Some(detail.into()),
        }
    }

    /// Attach detail to the event
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Destination for audit events
///
/// `emit` failures are reported upward as a degraded-mode signal, never as
/// an operation failure.
pub trait AuditSink: Send + Sync {
    /// Persist one event
    fn emit(&self, event: &AuditEvent) -> Result<()>;
}

/// Append-only JSON-lines file sink
pub struct JsonLinesSink {
    file: Mutex<File>,
}

impl JsonLinesSink {
    /// Open (or create) the audit log for appending
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .map_err(|e| {
                TutelaError::config_error(format!("could not open audit log: {e}"))
            })?;
        Ok(Self { file: Mutex::new(file) })
    }
}

impl AuditSink for JsonLinesSink {
    fn emit(&self, event: &AuditEvent) -> Result<()> {
        let line = serde_json::to_string(event)
            .map_err(|e| TutelaError::store_error(format!("could not serialize event: {e}")))?;
        let mut file = self.file.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        writeln!(file, "{line}")
            .map_err(|e| TutelaError::store_error(format!("could not append event: {e}")))?;
        Ok(())
    }
}

/// Stderr sink: keeps stdout machine-only while still recording events
pub struct StderrSink;

impl AuditSink for StderrSink {
    fn emit(&self, event: &AuditEvent) -> Result<()> {
        let line = serde_json::to_string(event)
            .map_err(|e| TutelaError::store_error(format!("could not serialize event: {e}")))?;
        eprintln!("{line}");
        Ok(())
    }
}

/// In-memory sink for tests and embedding
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    /// Create an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event emitted so far
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }
}

impl AuditSink for MemorySink {
    fn emit(&self, event: &AuditEvent) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}
