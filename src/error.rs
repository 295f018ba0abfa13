//! Error Handling Infrastructure
//!
//! This module defines all error types used throughout Tutela.
//! All errors are structured and map to specific error codes for JSON output.
//!
//! # Error Categories
//! - `ValidationFailed`: Statement blocked by the SQL validator, nothing executed
//! - `Transaction`: Transaction-lifecycle violations (already active, invalid state,
//!   timed out, row cap exceeded)
//! - `Lifecycle`: Stored-procedure state-machine precondition violations
//! - `Store`: Opaque failure surfaced by the underlying store
//! - `InvalidInput`: Malformed input or missing required parameters
//! - `NotFound`: A referenced object does not exist
//! - `Config`: Configuration file errors

use thiserror::Error;

/// Classification of store-level failures.
///
/// Callers treat store errors as opaque; the lifecycle engine uses the kind
/// to map write-lock and unique-constraint failures during deploy onto
/// `ConcurrentDeployConflict`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Another writer holds the store's write lock
    Busy,
    /// A uniqueness or integrity constraint was violated
    Constraint,
    /// Any other store failure
    Other,
}

/// Transaction-lifecycle violations
#[derive(Error, Debug)]
pub enum TransactionError {
    /// The session already owns an Active transaction
    #[error("session '{session}' already owns an active transaction")]
    AlreadyActive { session: String },

    /// Commit/rollback/execute against a transaction that is not Active
    #[error("transaction is not active: {detail}")]
    InvalidState { detail: String },

    /// The idle-timeout watchdog rolled the transaction back
    #[error("transaction exceeded its {timeout_ms} ms timeout and was rolled back")]
    TimedOut { timeout_ms: u64 },

    /// The cumulative row-affected total exceeded the configured cap
    #[error("transaction touched {attempted} rows, exceeding the cap of {limit}; all effects were rolled back")]
    RowCapExceeded { limit: u64, attempted: u64 },
}

/// Stored-procedure state-machine precondition violations
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// An undiscarded draft for the same name is already present
    #[error("a draft for {schema}.{name} already exists; deploy or discard it first")]
    DraftAlreadyExists { schema: String, name: String },

    /// Deploy requires a draft in Tested state
    #[error("no tested draft for {schema}.{name}; create and test a draft before deploying")]
    DraftNotTested { schema: String, name: String },

    /// Rollback target version does not exist
    #[error("version {version} of {schema}.{name} does not exist")]
    VersionNotFound { schema: String, name: String, version: i64 },

    /// A concurrent deploy won the store's row-level write; retry
    #[error("concurrent deploy detected for {schema}.{name}; retry the operation")]
    ConcurrentDeployConflict { schema: String, name: String },
}

/// Main error type for Tutela operations
#[derive(Error, Debug)]
pub enum TutelaError {
    /// Statement blocked by the SQL validator; no execution was attempted
    #[error("validation failed ({rule}): {reason}")]
    ValidationFailed { rule: String, reason: String },

    /// Transaction-lifecycle violation
    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// Stored-procedure lifecycle violation
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Opaque store failure
    #[error("store error: {detail}")]
    Store { kind: StoreErrorKind, detail: String },

    /// Invalid input or missing required parameters
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Referenced object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Configuration error (file not found, invalid JSON, etc.)
    #[error("configuration error: {0}")]
    Config(String),
}

impl TutelaError {
    /// Convert error to error code string for JSON output
    ///
    /// Error codes are stable and suitable for programmatic handling by agents.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::ValidationFailed { .. } => "VALIDATION_FAILED",
            Self::Transaction(e) => match e {
                TransactionError::AlreadyActive { .. } => "TXN_ALREADY_ACTIVE",
                TransactionError::InvalidState { .. } => "TXN_INVALID_STATE",
                TransactionError::TimedOut { .. } => "TXN_TIMED_OUT",
                TransactionError::RowCapExceeded { .. } => "TXN_ROW_CAP_EXCEEDED",
            },
            Self::Lifecycle(e) => match e {
                LifecycleError::DraftAlreadyExists { .. } => "DRAFT_ALREADY_EXISTS",
                LifecycleError::DraftNotTested { .. } => "DRAFT_NOT_TESTED",
                LifecycleError::VersionNotFound { .. } => "VERSION_NOT_FOUND",
                LifecycleError::ConcurrentDeployConflict { .. } => "CONCURRENT_DEPLOY_CONFLICT",
            },
            Self::Store { .. } => "STORE_ERROR",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Get human-readable error message (agent-appropriate, no sensitive data)
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Create a validation failure with the rule that fired
    pub fn validation_failed(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidationFailed { rule: rule.into(), reason: reason.into() }
    }

    /// Create an opaque store error
    pub fn store_error(detail: impl Into<String>) -> Self {
        Self::Store { kind: StoreErrorKind::Other, detail: detail.into() }
    }

    /// Create a store error carrying a busy/locked classification
    pub fn store_busy(detail: impl Into<String>) -> Self {
        Self::Store { kind: StoreErrorKind::Busy, detail: detail.into() }
    }

    /// Create a store error carrying a constraint-violation classification
    pub fn store_constraint(detail: impl Into<String>) -> Self {
        Self::Store { kind: StoreErrorKind::Constraint, detail: detail.into() }
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether this is a store busy/constraint failure, the signals the
    /// lifecycle engine maps onto `ConcurrentDeployConflict`.
    #[must_use]
    pub const fn is_write_conflict(&self) -> bool {
        matches!(
            self,
            Self::Store { kind: StoreErrorKind::Busy | StoreErrorKind::Constraint, .. }
        )
    }
}

/// Result type alias for Tutela operations
pub type Result<T> = std::result::Result<T, TutelaError>;
