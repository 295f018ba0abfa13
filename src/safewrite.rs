//! Safe Write Execution
//!
//! The SafeWriteExecutor is the single gate every mutation passes through:
//! validate → resolve the transaction → execute → report the row count to
//! the cap check → emit an audit event. This holds for ad-hoc SQL
//! (`execute_query_write`) and for every statement the lifecycle engine
//! issues - the lifecycle never executes SQL directly.
//!
//! A blocked statement never touches the store; a cap violation is executed
//! and then undone. Both are visible to the caller, distinguishing "nothing
//! happened" from "was attempted and rolled back".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::config::SafetyConfig;
use crate::engine::{IsolationLevel, SqlParams, StatementOutcome};
use crate::error::{Result, TutelaError};
use crate::txn::TransactionManager;
use crate::validator::{self, ValidationContext, Verdict};

/// Audit labels a caller attaches to a statement
#[derive(Debug, Clone, Copy)]
pub struct AuditScope<'a> {
    /// Who is performing the operation
    pub actor: &'a str,
    /// Operation name recorded on the event
    pub operation: &'a str,
    /// Target recorded on the event (virtual path or statement summary)
    pub target: &'a str,
}

/// Orchestrates a single mutating statement through the safety gate
pub struct SafeWriteExecutor {
    manager: Arc<TransactionManager>,
    sink: Arc<dyn AuditSink>,
    safety: SafetyConfig,
    degraded: AtomicBool,
}

impl SafeWriteExecutor {
    /// Create an executor over the given manager and audit sink
    pub fn new(
        manager: Arc<TransactionManager>,
        sink: Arc<dyn AuditSink>,
        safety: SafetyConfig,
    ) -> Self {
        Self { manager, sink, safety, degraded: AtomicBool::new(false) }
    }

    /// Whether any audit emission has failed since startup
    #[must_use]
    pub fn audit_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Emit an audit event, fire-and-forget
    ///
    /// A sink failure latches degraded mode instead of failing the caller.
    pub fn emit(&self, event: &AuditEvent) {
        if self.sink.emit(event).is_err() {
            self.degraded.store(true, Ordering::Relaxed);
        }
    }

    /// Execute an ad-hoc mutating statement for a session
    ///
    /// Runs inside the session's current transaction when one exists. With no
    /// transaction and a policy that does not require one, the statement runs
    /// in a one-shot autocommit transaction owned by this executor.
    pub fn execute(&self, sql: &str, params: &SqlParams, session: &str) -> Result<StatementOutcome> {
        let target = statement_summary(sql);
        let current = self.manager.current_transaction(session);

        let verdict = validator::validate(
            sql,
            ValidationContext {
                has_active_transaction: current.is_some(),
                config: &self.safety,
            },
        );
        if verdict.verdict != Verdict::Allowed {
            let rule = verdict.rule.unwrap_or_else(|| "blocked".to_string());
            let reason = verdict.reason.unwrap_or_else(|| "statement rejected".to_string());
            self.emit(&AuditEvent::failed(
                session,
                "execute_query_write",
                &target,
                format!("blocked by rule {rule}"),
            ));
            return Err(TutelaError::validation_failed(rule, reason));
        }

        let outcome = match current {
            Some(txn) => self.manager.execute_in(txn, sql, params),
            None => self.execute_autocommit(sql, params, session),
        };

        match &outcome {
            Ok(out) => self.emit(
                &AuditEvent::success(session, "execute_query_write", &target).with_detail(
                    format!("rows_affected={}", out.rows_affected.unwrap_or(0)),
                ),
            ),
            Err(e) => self.emit(&AuditEvent::failed(
                session,
                "execute_query_write",
                &target,
                e.message(),
            )),
        }

        outcome
    }

    /// Execute a statement inside an existing transaction on behalf of a
    /// lifecycle operation
    ///
    /// Same gate as [`execute`](Self::execute): the statement is validated
    /// first and audited afterwards, labeled with the caller's scope.
    pub fn execute_in_transaction(
        &self,
        txn: Uuid,
        sql: &str,
        params: &SqlParams,
        scope: AuditScope<'_>,
    ) -> Result<StatementOutcome> {
        let verdict = validator::validate(
            sql,
            ValidationContext { has_active_transaction: true, config: &self.safety },
        );
        if verdict.verdict != Verdict::Allowed {
            let rule = verdict.rule.unwrap_or_else(|| "blocked".to_string());
            let reason = verdict.reason.unwrap_or_else(|| "statement rejected".to_string());
            self.emit(&AuditEvent::failed(
                scope.actor,
                scope.operation,
                scope.target,
                format!("blocked by rule {rule}"),
            ));
            return Err(TutelaError::validation_failed(rule, reason));
        }

        let outcome = self.manager.execute_in(txn, sql, params);

        match &outcome {
            Ok(out) => self.emit(
                &AuditEvent::success(scope.actor, scope.operation, scope.target).with_detail(
                    format!("rows_affected={}", out.rows_affected.unwrap_or(0)),
                ),
            ),
            Err(e) => self.emit(&AuditEvent::failed(
                scope.actor,
                scope.operation,
                scope.target,
                e.message(),
            )),
        }

        outcome
    }

    fn execute_autocommit(
        &self,
        sql: &str,
        params: &SqlParams,
        session: &str,
    ) -> Result<StatementOutcome> {
        let auto_session = format!("{session}::autocommit::{}", Uuid::new_v4());
        let txn = self.manager.begin(&auto_session, IsolationLevel::Immediate)?;

        match self.manager.execute_in(txn, sql, params) {
            Ok(out) => {
                self.manager.commit(txn)?;
                Ok(out)
            }
            Err(e) => {
                let _ = self.manager.rollback(txn);
                Err(e)
            }
        }
    }
}

/// Compress a statement into an audit-friendly target label
fn statement_summary(sql: &str) -> String {
    let collapsed: String = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.len() <= 80 {
        collapsed
    } else {
        let mut cut = 80;
        while !collapsed.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &collapsed[..cut])
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::audit::MemorySink;
    use crate::engine::sqlite::SqliteStore;
    use crate::engine::SqlValue;
    use crate::error::Result as TutelaResult;

    struct FailingSink;

    impl AuditSink for FailingSink {
        fn emit(&self, _event: &AuditEvent) -> TutelaResult<()> {
            Err(TutelaError::store_error("sink offline"))
        }
    }

    fn temp_db(tag: &str) -> std::path::PathBuf {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!("tutela_safewrite_{tag}_{id}.db"));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn executor_with(
        tag: &str,
        safety: SafetyConfig,
        sink: Arc<dyn AuditSink>,
    ) -> (SafeWriteExecutor, Arc<TransactionManager>, std::path::PathBuf) {
        let path = temp_db(tag);
        let store = Arc::new(SqliteStore::open(&path).expect("open store"));
        {
            let mut txn = store
                .begin(IsolationLevel::Immediate)
                .expect("begin");
            txn.execute("CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT)", &SqlParams::None)
                .expect("create table");
            txn.commit().expect("commit");
        }
        let manager = TransactionManager::new(store, safety.clone());
        (SafeWriteExecutor::new(Arc::clone(&manager), sink, safety), manager, path)
    }

    use crate::engine::{MutationStore, StoreTransaction};

    #[test]
    fn test_blocked_statement_never_reaches_store() {
        let sink = Arc::new(MemorySink::new());
        let (executor, manager, path) =
            executor_with("blocked", SafetyConfig::default(), sink.clone());

        let txn = manager.begin("s1", IsolationLevel::Immediate).unwrap();
        let err = executor.execute("DROP TABLE items", &SqlParams::None, "s1").unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_FAILED");

        // Table still exists and the transaction is untouched
        let out = manager.execute_in(txn, "SELECT COUNT(*) FROM items", &SqlParams::None).unwrap();
        assert_eq!(out.rows[0][0], serde_json::json!(0));
        manager.rollback(txn).unwrap();

        // The block was audited as a failure
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].operation, "execute_query_write");
        assert!(events[0].detail.as_deref().unwrap().contains("denied_keyword:DROP"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_mutation_without_transaction_rejected_by_policy() {
        let sink = Arc::new(MemorySink::new());
        let (executor, _manager, path) =
            executor_with("requires_txn", SafetyConfig::default(), sink.clone());

        let err = executor
            .execute(
                "INSERT INTO items (label) VALUES (?1)",
                &SqlParams::Positional(vec![SqlValue::Text("x".to_string())]),
                "s1",
            )
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_FAILED");
        assert!(err.message().contains("requires_transaction"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_autocommit_when_policy_relaxed() {
        let safety = SafetyConfig { require_transactions: false, ..Default::default() };
        let sink = Arc::new(MemorySink::new());
        let (executor, manager, path) = executor_with("autocommit", safety, sink.clone());

        let out = executor
            .execute(
                "INSERT INTO items (label) VALUES (?1)",
                &SqlParams::Positional(vec![SqlValue::Text("x".to_string())]),
                "s1",
            )
            .unwrap();
        assert_eq!(out.rows_affected, Some(1));

        // Committed: visible from a fresh transaction
        let txn = manager.begin("s1", IsolationLevel::Deferred).unwrap();
        let check = manager.execute_in(txn, "SELECT COUNT(*) FROM items", &SqlParams::None).unwrap();
        assert_eq!(check.rows[0][0], serde_json::json!(1));
        manager.rollback(txn).unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, crate::audit::AuditOutcome::Success);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_execution_in_session_transaction() {
        let sink = Arc::new(MemorySink::new());
        let (executor, manager, path) =
            executor_with("in_txn", SafetyConfig::default(), sink.clone());

        let txn = manager.begin("s1", IsolationLevel::Immediate).unwrap();
        let out = executor
            .execute(
                "INSERT INTO items (label) VALUES (?1)",
                &SqlParams::Positional(vec![SqlValue::Text("x".to_string())]),
                "s1",
            )
            .unwrap();
        assert_eq!(out.rows_affected, Some(1));
        manager.commit(txn).unwrap();

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_sink_failure_latches_degraded_mode_without_failing_operation() {
        let safety = SafetyConfig { require_transactions: false, ..Default::default() };
        let (executor, _manager, path) = executor_with("degraded", safety, Arc::new(FailingSink));

        assert!(!executor.audit_degraded());
        let out = executor
            .execute(
                "INSERT INTO items (label) VALUES (?1)",
                &SqlParams::Positional(vec![SqlValue::Text("x".to_string())]),
                "s1",
            )
            .unwrap();
        assert_eq!(out.rows_affected, Some(1), "sink failure must not fail the write");
        assert!(executor.audit_degraded());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_statement_summary_truncates() {
        let long = format!("UPDATE t SET c = 1 WHERE x IN ({})", "1, ".repeat(100));
        let summary = statement_summary(&long);
        assert!(summary.len() <= 83);
        assert!(summary.ends_with("..."));

        assert_eq!(statement_summary("SELECT  1"), "SELECT 1");
    }
}
