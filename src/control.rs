//! Control Surface
//!
//! `Tutela` wires the components together and exposes the tool-call surface
//! consumed by both the CLI and the MCP server. Both interfaces are thin
//! wrappers over these methods; neither carries logic of its own.

use std::sync::Arc;

use uuid::Uuid;

use crate::audit::AuditSink;
#[cfg(feature = "sqlite")]
use crate::config::EngineConfig;
use crate::config::SafetyConfig;
use crate::engine::{IsolationLevel, MutationStore, SqlParams, StatementOutcome};
use crate::error::{Result, TutelaError};
use crate::lifecycle::{DeployOutcome, RollbackOutcome, SpLifecycleEngine};
use crate::safewrite::SafeWriteExecutor;
use crate::txn::{TransactionManager, TransactionRecord};
use crate::version::{SpDraft, SpVersion};

/// Default session identifier used when a caller does not supply one
pub const DEFAULT_SESSION: &str = "default";

/// The assembled engine: manager, executor, lifecycle
pub struct Tutela {
    manager: Arc<TransactionManager>,
    executor: Arc<SafeWriteExecutor>,
    lifecycle: SpLifecycleEngine,
}

impl Tutela {
    /// Assemble the engine over an arbitrary store and audit sink
    pub fn with_store(
        store: Arc<dyn MutationStore>,
        safety: SafetyConfig,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        let manager = TransactionManager::new(store, safety.clone());
        let executor =
            Arc::new(SafeWriteExecutor::new(Arc::clone(&manager), sink, safety.clone()));
        let lifecycle =
            SpLifecycleEngine::new(Arc::clone(&manager), Arc::clone(&executor), safety);
        Self { manager, executor, lifecycle }
    }

    /// Open the engine from a resolved configuration
    #[cfg(feature = "sqlite")]
    pub fn open(config: &EngineConfig) -> Result<Self> {
        use crate::audit::{JsonLinesSink, StderrSink};
        use crate::engine::sqlite::SqliteStore;

        let database = config
            .database
            .as_ref()
            .ok_or_else(|| TutelaError::config_error("no database configured"))?;
        let store = Arc::new(SqliteStore::open(database)?);

        let sink: Arc<dyn AuditSink> = match &config.audit_log {
            Some(path) => Arc::new(JsonLinesSink::open(path)?),
            None => Arc::new(StderrSink),
        };

        Ok(Self::with_store(store, config.safety.clone(), sink))
    }

    /// Shared transaction manager
    #[must_use]
    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// Whether the audit trail has degraded (a sink emission failed)
    #[must_use]
    pub fn audit_degraded(&self) -> bool {
        self.executor.audit_degraded()
    }

    // Stored-procedure lifecycle surface

    /// `create_sp_draft(schema, name, definition)`
    pub fn create_sp_draft(
        &self,
        schema: &str,
        name: &str,
        definition: &str,
        actor: &str,
    ) -> Result<SpDraft> {
        self.lifecycle.create_draft(schema, name, definition, actor)
    }

    /// `test_sp_draft(schema, name, params)` - params as JSON array/object
    pub fn test_sp_draft(
        &self,
        schema: &str,
        name: &str,
        params: Option<&serde_json::Value>,
        actor: &str,
    ) -> Result<StatementOutcome> {
        let params = SqlParams::from_json(params)?;
        self.lifecycle.test_draft(schema, name, &params, actor)
    }

    /// `deploy_sp(schema, name)`
    pub fn deploy_sp(&self, schema: &str, name: &str, actor: &str) -> Result<DeployOutcome> {
        self.lifecycle.deploy(schema, name, actor)
    }

    /// `rollback_sp(schema, name, version?)`
    pub fn rollback_sp(
        &self,
        schema: &str,
        name: &str,
        version: Option<i64>,
        actor: &str,
    ) -> Result<RollbackOutcome> {
        self.lifecycle.rollback(schema, name, version, actor)
    }

    /// `list_sp_versions(schema, name)`
    pub fn list_sp_versions(&self, schema: &str, name: &str) -> Result<Vec<SpVersion>> {
        self.lifecycle.list_versions(schema, name)
    }

    /// `discard_sp_draft(schema, name)`
    pub fn discard_sp_draft(&self, schema: &str, name: &str, actor: &str) -> Result<()> {
        self.lifecycle.discard_draft(schema, name, actor)
    }

    /// Read a virtual path (`/database/stored_procedures/<schema>/<name>.sql`)
    pub fn read_object(&self, path: &str) -> Result<String> {
        self.lifecycle.read_object(path)
    }

    // Ad-hoc mutation surface

    /// `execute_query_write(sql, params)` under the given session
    pub fn execute_query_write(
        &self,
        sql: &str,
        params: Option<&serde_json::Value>,
        session: &str,
    ) -> Result<StatementOutcome> {
        let params = SqlParams::from_json(params)?;
        self.executor.execute(sql, &params, session)
    }

    // Transaction surface

    /// `begin_transaction()` for the given session
    pub fn begin_transaction(
        &self,
        session: &str,
        isolation: Option<IsolationLevel>,
    ) -> Result<TransactionRecord> {
        let id = self.manager.begin(session, isolation.unwrap_or_default())?;
        self.manager
            .record(id)
            .ok_or_else(|| TutelaError::store_error("transaction record missing after begin"))
    }

    /// `commit_transaction(id)`
    pub fn commit_transaction(&self, id: &str) -> Result<TransactionRecord> {
        self.manager.commit(parse_transaction_id(id)?)
    }

    /// `rollback_transaction(id)` - idempotent once terminal
    pub fn rollback_transaction(&self, id: &str) -> Result<TransactionRecord> {
        self.manager.rollback(parse_transaction_id(id)?)
    }
}

fn parse_transaction_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id)
        .map_err(|_| TutelaError::invalid_input(format!("'{id}' is not a transaction id")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transaction_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_transaction_id(&id.to_string()).unwrap(), id);

        let err = parse_transaction_id("not-a-uuid").unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
    }
}
