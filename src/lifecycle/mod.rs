//! Stored-Procedure Lifecycle Engine
//!
//! The draft→test→deploy→rollback state machine. Each operation runs in its
//! own transaction on an internal session, built entirely out of safe
//! writes: every mutation goes through the [`SafeWriteExecutor`] gate, and
//! the version history is only ever appended to.
//!
//! # State machine (per procedure)
//! - `create_draft`: no draft → draft (one draft per name at a time)
//! - `test_draft`: runs the draft body in a transaction that is always
//!   rolled back, then marks the draft tested in a second short transaction
//! - `deploy`: tested draft → new active version; the previous active row is
//!   archived in place (the automatic backup), the live definition is
//!   rewritten, and the draft is consumed - all in one transaction
//! - `rollback`: re-activates an archived version and rewrites the live
//!   definition; history keeps growing, nothing is deleted
//!
//! # Concurrency
//! Racing deploys serialize on the store's write lock and on the unique
//! active-version index; the loser surfaces `ConcurrentDeployConflict` and
//! its draft survives for retry.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use serde::Serialize;

use crate::audit::AuditEvent;
use crate::config::SafetyConfig;
use crate::engine::{IsolationLevel, SqlParams, StatementOutcome};
use crate::error::{LifecycleError, Result, TutelaError};
use crate::safewrite::{AuditScope, SafeWriteExecutor};
use crate::txn::TransactionManager;
use crate::validator;
use crate::version::{self, SpDraft, SpVersion};
use crate::vpath::{self, ObjectCategory, ObjectRef};

/// Result of a successful deploy
#[derive(Debug, Clone, Serialize)]
pub struct DeployOutcome {
    /// Schema of the procedure
    pub schema: String,
    /// Procedure name
    pub name: String,
    /// The newly active version number
    pub version: i64,
    /// The version that was active before, now archived
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<i64>,
}

/// Result of a successful rollback
#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    /// Schema of the procedure
    pub schema: String,
    /// Procedure name
    pub name: String,
    /// The version whose text is live again
    pub restored_version: i64,
    /// The version that was active before this rollback
    pub previous_active: i64,
}

/// The draft→test→deploy→rollback state machine
pub struct SpLifecycleEngine {
    manager: Arc<TransactionManager>,
    executor: Arc<SafeWriteExecutor>,
    safety: SafetyConfig,
}

impl SpLifecycleEngine {
    /// Create the engine over shared manager and executor
    pub fn new(
        manager: Arc<TransactionManager>,
        executor: Arc<SafeWriteExecutor>,
        safety: SafetyConfig,
    ) -> Self {
        Self { manager, executor, safety }
    }

    /// Create a draft in the isolated draft schema
    ///
    /// The definition is validated with procedure-DDL rules before anything
    /// touches the store. Fails with `DraftAlreadyExists` while an
    /// undiscarded draft for the same name is present.
    pub fn create_draft(
        &self,
        schema: &str,
        name: &str,
        definition: &str,
        actor: &str,
    ) -> Result<SpDraft> {
        check_identifier("schema", schema)?;
        check_identifier("name", name)?;
        let target = sp_path(schema, name);

        let verdict = validator::validate_procedure_definition(definition, &self.safety);
        if !verdict.is_allowed() {
            let rule = verdict.rule.unwrap_or_else(|| "blocked".to_string());
            let reason = verdict.reason.unwrap_or_else(|| "definition rejected".to_string());
            self.executor.emit(&AuditEvent::failed(
                actor,
                "create_sp_draft",
                &target,
                format!("blocked by rule {rule}"),
            ));
            return Err(TutelaError::validation_failed(rule, reason));
        }

        let txn = self.begin_op(IsolationLevel::Immediate)?;
        let scope = AuditScope { actor, operation: "create_sp_draft", target: &target };

        let result = (|| {
            if version::draft(&self.manager, txn, schema, name)?.is_some() {
                return Err(LifecycleError::DraftAlreadyExists {
                    schema: schema.to_string(),
                    name: name.to_string(),
                }
                .into());
            }

            let source_version =
                version::active_version(&self.manager, txn, schema, name)?.map(|v| v.version);

            let new_draft = SpDraft {
                schema: schema.to_string(),
                name: name.to_string(),
                definition: definition.to_string(),
                created_at: Utc::now(),
                source_version,
                tested: false,
            };
            version::insert_draft(&self.executor, txn, &new_draft, scope)?;
            Ok(new_draft)
        })();

        self.finish_op(txn, result, actor, "create_sp_draft", &target)
    }

    /// Run the draft's body with caller-supplied parameters
    ///
    /// The test transaction is always rolled back, success or failure - a
    /// test must never leave residual state. On success a second short
    /// transaction marks the draft tested.
    pub fn test_draft(
        &self,
        schema: &str,
        name: &str,
        params: &SqlParams,
        actor: &str,
    ) -> Result<StatementOutcome> {
        check_identifier("schema", schema)?;
        check_identifier("name", name)?;
        let target = sp_path(schema, name);

        let txn = self.begin_op(IsolationLevel::Immediate)?;
        let result = (|| {
            let tested_draft = version::draft(&self.manager, txn, schema, name)?
                .ok_or_else(|| TutelaError::not_found(format!("no draft for {schema}.{name}")))?;
            let body = validator::procedure_body(&tested_draft.definition).ok_or_else(|| {
                TutelaError::invalid_input("draft definition has no AS body to execute")
            })?;
            self.manager.execute_in(txn, body, params)
        })();
        // Always rolled back, even on success
        let _ = self.manager.rollback(txn);

        match result {
            Ok(outcome) => {
                let mark_txn = self.begin_op(IsolationLevel::Immediate)?;
                let scope = AuditScope { actor, operation: "test_sp_draft", target: &target };
                let marked = version::mark_draft_tested(
                    &self.executor,
                    mark_txn,
                    schema,
                    name,
                    scope,
                );
                self.finish_op(mark_txn, marked, actor, "test_sp_draft", &target)?;
                Ok(outcome)
            }
            Err(e) => {
                self.executor.emit(&AuditEvent::failed(actor, "test_sp_draft", &target, e.message()));
                Err(e)
            }
        }
    }

    /// Deploy the tested draft as the new active version
    ///
    /// Within a single transaction: archive the current active row, append
    /// the `max + 1` version, rewrite the live definition, consume the
    /// draft. Any failure rolls the whole transaction back, leaving the
    /// previous version live and the draft still tested for retry.
    pub fn deploy(&self, schema: &str, name: &str, actor: &str) -> Result<DeployOutcome> {
        check_identifier("schema", schema)?;
        check_identifier("name", name)?;
        let target = sp_path(schema, name);

        let txn = self
            .begin_op(IsolationLevel::Immediate)
            .map_err(|e| map_write_conflict(e, schema, name))?;
        let scope = AuditScope { actor, operation: "deploy_sp", target: &target };

        let result = (|| {
            let tested_draft = version::draft(&self.manager, txn, schema, name)?
                .filter(|d| d.tested)
                .ok_or_else(|| LifecycleError::DraftNotTested {
                    schema: schema.to_string(),
                    name: name.to_string(),
                })?;

            let previous = version::active_version(&self.manager, txn, schema, name)?;
            if let Some(prev) = &previous {
                // Archived in place: this is the automatic backup
                version::set_active(&self.executor, txn, schema, name, prev.version, false, scope)?;
            }

            let next = version::max_version(&self.manager, txn, schema, name)? + 1;
            let new_version = SpVersion {
                schema: schema.to_string(),
                name: name.to_string(),
                version: next,
                definition: tested_draft.definition.clone(),
                definition_sha256: version::definition_hash(&tested_draft.definition),
                deployed_at: Utc::now(),
                deployed_by: actor.to_string(),
                is_active: true,
            };
            version::insert_version(&self.executor, txn, &new_version, scope)?;
            version::upsert_procedure(
                &self.executor,
                txn,
                schema,
                name,
                &tested_draft.definition,
                scope,
            )?;
            version::delete_draft(&self.executor, txn, schema, name, scope)?;

            Ok(DeployOutcome {
                schema: schema.to_string(),
                name: name.to_string(),
                version: next,
                previous_version: previous.map(|p| p.version),
            })
        })();

        let result = result.map_err(|e| map_write_conflict(e, schema, name));
        self.finish_op(txn, result, actor, "deploy_sp", &target)
            .map_err(|e| map_write_conflict(e, schema, name))
    }

    /// Restore an archived version as the live definition
    ///
    /// With no explicit target, the version immediately preceding the
    /// current active one is restored. History is never deleted; only the
    /// active marker moves.
    pub fn rollback(
        &self,
        schema: &str,
        name: &str,
        target_version: Option<i64>,
        actor: &str,
    ) -> Result<RollbackOutcome> {
        check_identifier("schema", schema)?;
        check_identifier("name", name)?;
        let target = sp_path(schema, name);

        let txn = self
            .begin_op(IsolationLevel::Immediate)
            .map_err(|e| map_write_conflict(e, schema, name))?;
        let scope = AuditScope { actor, operation: "rollback_sp", target: &target };

        let result = (|| {
            let active = version::active_version(&self.manager, txn, schema, name)?
                .ok_or_else(|| {
                    TutelaError::not_found(format!("{schema}.{name} has no deployed version"))
                })?;

            let restore = match target_version {
                Some(v) if v == active.version => {
                    return Err(TutelaError::invalid_input(format!(
                        "version {v} of {schema}.{name} is already active"
                    )));
                }
                Some(v) => version::get_version(&self.manager, txn, schema, name, v)?
                    .ok_or_else(|| LifecycleError::VersionNotFound {
                        schema: schema.to_string(),
                        name: name.to_string(),
                        version: v,
                    })?,
                None => {
                    let prev = version::previous_version(
                        &self.manager,
                        txn,
                        schema,
                        name,
                        active.version,
                    )?
                    .ok_or_else(|| LifecycleError::VersionNotFound {
                        schema: schema.to_string(),
                        name: name.to_string(),
                        version: active.version - 1,
                    })?;
                    version::get_version(&self.manager, txn, schema, name, prev)?.ok_or_else(
                        || LifecycleError::VersionNotFound {
                            schema: schema.to_string(),
                            name: name.to_string(),
                            version: prev,
                        },
                    )?
                }
            };

            version::set_active(&self.executor, txn, schema, name, active.version, false, scope)?;
            version::set_active(&self.executor, txn, schema, name, restore.version, true, scope)?;
            version::upsert_procedure(&self.executor, txn, schema, name, &restore.definition, scope)?;

            Ok(RollbackOutcome {
                schema: schema.to_string(),
                name: name.to_string(),
                restored_version: restore.version,
                previous_active: active.version,
            })
        })();

        let result = result.map_err(|e| map_write_conflict(e, schema, name));
        self.finish_op(txn, result, actor, "rollback_sp", &target)
            .map_err(|e| map_write_conflict(e, schema, name))
    }

    /// Full version history, ascending; read-only
    pub fn list_versions(&self, schema: &str, name: &str) -> Result<Vec<SpVersion>> {
        check_identifier("schema", schema)?;
        check_identifier("name", name)?;

        let txn = self.begin_op(IsolationLevel::Deferred)?;
        let result = version::list_versions(&self.manager, txn, schema, name);
        let _ = self.manager.rollback(txn);
        result
    }

    /// Explicitly destroy the draft without deploying it
    pub fn discard_draft(&self, schema: &str, name: &str, actor: &str) -> Result<()> {
        check_identifier("schema", schema)?;
        check_identifier("name", name)?;
        let target = sp_path(schema, name);

        let txn = self.begin_op(IsolationLevel::Immediate)?;
        let scope = AuditScope { actor, operation: "discard_sp_draft", target: &target };

        let result = (|| {
            version::draft(&self.manager, txn, schema, name)?
                .ok_or_else(|| TutelaError::not_found(format!("no draft for {schema}.{name}")))?;
            version::delete_draft(&self.executor, txn, schema, name, scope)
        })();

        self.finish_op(txn, result, actor, "discard_sp_draft", &target)
    }

    /// The active version's definition text, if the procedure is deployed
    pub fn active_definition(&self, schema: &str, name: &str) -> Result<Option<String>> {
        check_identifier("schema", schema)?;
        check_identifier("name", name)?;

        let txn = self.begin_op(IsolationLevel::Deferred)?;
        let result = version::active_version(&self.manager, txn, schema, name);
        let _ = self.manager.rollback(txn);
        Ok(result?.map(|v| v.definition))
    }

    /// Read a virtual path
    ///
    /// `/database/stored_procedures/<schema>/<name>.sql` returns the active
    /// version's text. Other categories are an extension point and report
    /// not-found.
    pub fn read_object(&self, path: &str) -> Result<String> {
        let object: ObjectRef = vpath::resolve(path)
            .ok_or_else(|| TutelaError::not_found(format!("no object at '{path}'")))?;

        match object.category {
            ObjectCategory::StoredProcedures => self
                .active_definition(&object.schema, &object.name)?
                .ok_or_else(|| {
                    TutelaError::not_found(format!(
                        "{}.{} has no deployed version",
                        object.schema, object.name
                    ))
                }),
            other => Err(TutelaError::not_found(format!(
                "browsing {other} is not supported through the virtual namespace"
            ))),
        }
    }

    /// Begin a transaction on a fresh internal session
    fn begin_op(&self, isolation: IsolationLevel) -> Result<Uuid> {
        let session = format!("lifecycle:{}", Uuid::new_v4());
        self.manager.begin(&session, isolation)
    }

    /// Commit on success / roll back on failure, then emit the operation's
    /// summary audit event
    fn finish_op<T>(
        &self,
        txn: Uuid,
        result: Result<T>,
        actor: &str,
        operation: &str,
        target: &str,
    ) -> Result<T> {
        match result {
            Ok(value) => match self.manager.commit(txn) {
                Ok(_) => {
                    self.executor.emit(&AuditEvent::success(actor, operation, target));
                    Ok(value)
                }
                Err(e) => {
                    self.executor
                        .emit(&AuditEvent::failed(actor, operation, target, e.message()));
                    Err(e)
                }
            },
            Err(e) => {
                let _ = self.manager.rollback(txn);
                self.executor.emit(&AuditEvent::failed(actor, operation, target, e.message()));
                Err(e)
            }
        }
    }
}

fn sp_path(schema: &str, name: &str) -> String {
    vpath::to_path(&ObjectRef::stored_procedure(schema, name))
}

fn map_write_conflict(e: TutelaError, schema: &str, name: &str) -> TutelaError {
    if e.is_write_conflict() {
        LifecycleError::ConcurrentDeployConflict {
            schema: schema.to_string(),
            name: name.to_string(),
        }
        .into()
    } else {
        e
    }
}

/// Schema and procedure names are plain identifiers; anything else is
/// rejected before it can reach path rendering or catalog rows.
fn check_identifier(label: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value.len() <= 128
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !value.chars().next().is_some_and(|c| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(TutelaError::invalid_input(format!("{label} '{value}' is not a valid identifier")))
    }
}
