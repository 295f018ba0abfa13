//! Transaction Management
//!
//! This module owns the lifecycle of every explicit transaction: begin,
//! commit, rollback, the idle-timeout watchdog, and the per-transaction
//! row-affected ceiling.
//!
//! # Session Model
//! The "current transaction" is an explicit mapping from session identifier
//! to at most one Active transaction - never a module-level singleton. A
//! second `begin` on the same session is rejected, not queued.
//!
//! # Timeout Enforcement
//! A tokio watchdog task sleeps to the deadline and rolls the transaction
//! back with reason `TimedOut`. The same deadline is also checked lazily at
//! the top of every commit/rollback/execute, so the transition is observed
//! even when no runtime is present. This bounds the lifetime of any lock
//! held by the underlying store.
//!
//! # Row Cap
//! Every mutating statement accumulates into `rows_affected_total`; crossing
//! `max_rows_affected` forces a rollback of the whole transaction - the
//! statement's effects are undone, not partially applied.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::SafetyConfig;
use crate::engine::{IsolationLevel, MutationStore, SqlParams, StatementOutcome, StoreTransaction};
use crate::error::{Result, TransactionError, TutelaError};

/// Why a transaction reached the RolledBack state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackReason {
    /// Explicit rollback request
    Requested,
    /// The idle-timeout watchdog fired
    TimedOut,
    /// The row-affected ceiling was exceeded
    RowCapExceeded,
    /// The store failed mid-commit; effects were rolled back
    StoreFailure,
}

/// Transaction state machine: `Active` is the only non-terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TxnState {
    /// Accepting statements
    Active,
    /// Terminal: committed
    Committed,
    /// Terminal: rolled back
    RolledBack {
        /// What triggered the rollback
        reason: RollbackReason,
    },
}

impl TxnState {
    fn describe(&self) -> String {
        match self {
            Self::Active => "transaction is active".to_string(),
            Self::Committed => "transaction is already committed".to_string(),
            Self::RolledBack { reason } => {
                format!("transaction was rolled back ({})", match reason {
                    RollbackReason::Requested => "requested",
                    RollbackReason::TimedOut => "timed out",
                    RollbackReason::RowCapExceeded => "row cap exceeded",
                    RollbackReason::StoreFailure => "store failure",
                })
            }
        }
    }
}

/// Serializable view of a transaction, suitable for JSON payloads
#[derive(Debug, Clone, Serialize)]
pub struct TransactionRecord {
    /// Transaction identifier
    pub id: Uuid,
    /// Session that owns (or owned) this transaction
    pub session: String,
    /// Isolation level it was begun with
    pub isolation: IsolationLevel,
    /// Current state
    #[serde(flatten)]
    pub state: TxnState,
    /// Wall-clock begin time
    pub started_at: DateTime<Utc>,
    /// Configured idle timeout
    pub timeout_ms: u64,
    /// Cumulative rows affected by statements in this transaction
    pub rows_affected_total: u64,
}

struct TxnSlot {
    record: TransactionRecord,
    deadline: Instant,
    txn: Option<Box<dyn StoreTransaction>>,
}

#[derive(Default)]
struct ManagerState {
    sessions: HashMap<String, Uuid>,
    transactions: HashMap<Uuid, TxnSlot>,
}

/// Terminal records kept for state queries before the oldest are evicted
const MAX_TERMINAL_RECORDS: usize = 1024;

/// Owner of every explicit transaction's lifecycle
pub struct TransactionManager {
    store: Arc<dyn MutationStore>,
    safety: SafetyConfig,
    inner: Mutex<ManagerState>,
}

impl TransactionManager {
    /// Create a manager over the given store
    pub fn new(store: Arc<dyn MutationStore>, safety: SafetyConfig) -> Arc<Self> {
        Arc::new(Self { store, safety, inner: Mutex::new(ManagerState::default()) })
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin a transaction for the given session
    ///
    /// Fails with `AlreadyActive` if the session already owns an Active
    /// transaction. The returned id is the handle for all later calls.
    ///
    /// The store `begin` runs outside the bookkeeping mutex: acquiring the
    /// store's write lock may block, and nothing else (rollbacks included)
    /// must stall behind it.
    pub fn begin(self: &Arc<Self>, session: &str, isolation: IsolationLevel) -> Result<Uuid> {
        let timeout = Duration::from_millis(self.safety.transaction_timeout_ms);

        {
            let mut state = self.lock_state();
            Self::expire_due(&mut state);
            if state.sessions.contains_key(session) {
                return Err(TransactionError::AlreadyActive { session: session.to_string() }.into());
            }
        }

        let txn = self.store.begin(isolation)?;

        let id = Uuid::new_v4();
        {
            let mut state = self.lock_state();
            Self::expire_due(&mut state);
            // Re-check: another begin for this session may have won the race
            if state.sessions.contains_key(session) {
                let mut txn = txn;
                let _ = txn.rollback();
                return Err(TransactionError::AlreadyActive { session: session.to_string() }.into());
            }

            let record = TransactionRecord {
                id,
                session: session.to_string(),
                isolation,
                state: TxnState::Active,
                started_at: Utc::now(),
                timeout_ms: self.safety.transaction_timeout_ms,
                rows_affected_total: 0,
            };
            state.sessions.insert(session.to_string(), id);
            state.transactions.insert(
                id,
                TxnSlot { record, deadline: Instant::now() + timeout, txn: Some(txn) },
            );
        }

        self.spawn_watchdog(id, timeout);
        Ok(id)
    }

    /// Commit a transaction
    ///
    /// Fails with `InvalidState` if the transaction is not Active - including
    /// when the watchdog already rolled it back for exceeding its timeout.
    pub fn commit(&self, id: Uuid) -> Result<TransactionRecord> {
        let mut state = self.lock_state();
        Self::expire_due(&mut state);

        let slot = state
            .transactions
            .get_mut(&id)
            .ok_or_else(|| unknown_transaction(id))?;

        if slot.record.state != TxnState::Active {
            return Err(TransactionError::InvalidState { detail: slot.record.state.describe() }
                .into());
        }

        let Some(mut txn) = slot.txn.take() else {
            return Err(busy_executing());
        };

        match txn.commit() {
            Ok(()) => {
                slot.record.state = TxnState::Committed;
                let record = slot.record.clone();
                Self::release_session(&mut state, id);
                Self::prune_terminal(&mut state);
                Ok(record)
            }
            Err(e) => {
                let _ = txn.rollback();
                slot.record.state = TxnState::RolledBack { reason: RollbackReason::StoreFailure };
                Self::release_session(&mut state, id);
                Self::prune_terminal(&mut state);
                Err(e)
            }
        }
    }

    /// Roll a transaction back
    ///
    /// Always honored immediately for an Active transaction, best-effort
    /// against the store. Idempotent once terminal: the existing terminal
    /// state is returned rather than an error.
    pub fn rollback(&self, id: Uuid) -> Result<TransactionRecord> {
        let mut state = self.lock_state();
        Self::expire_due(&mut state);

        let slot = state.transactions.get(&id).ok_or_else(|| unknown_transaction(id))?;

        if slot.record.state == TxnState::Active {
            Self::terminate(&mut state, id, RollbackReason::Requested);
        }

        Ok(state
            .transactions
            .get(&id)
            .map(|s| s.record.clone())
            .unwrap_or_else(|| unreachable_record(id)))
    }

    /// Execute a statement inside an Active transaction
    ///
    /// Mutating statements accumulate into the row cap; crossing it forces a
    /// rollback and surfaces `RowCapExceeded`. A store error from the
    /// statement itself propagates without closing the transaction.
    ///
    /// The store handle is checked out of the slot for the duration of the
    /// statement so the bookkeeping mutex is never held across store I/O. If
    /// the watchdog (or an explicit rollback) terminates the transaction
    /// while the statement is in flight, the handle is rolled back on
    /// check-in and the terminal state is honored.
    pub fn execute_in(&self, id: Uuid, sql: &str, params: &SqlParams) -> Result<StatementOutcome> {
        let mut txn = {
            let mut state = self.lock_state();
            Self::expire_due(&mut state);

            let slot = state
                .transactions
                .get_mut(&id)
                .ok_or_else(|| unknown_transaction(id))?;

            match slot.record.state {
                TxnState::Active => {}
                TxnState::RolledBack { reason: RollbackReason::TimedOut } => {
                    return Err(TransactionError::TimedOut {
                        timeout_ms: slot.record.timeout_ms,
                    }
                    .into());
                }
                other => {
                    return Err(TransactionError::InvalidState { detail: other.describe() }.into());
                }
            }

            slot.txn.take().ok_or_else(|| busy_executing())?
        };

        let result = txn.execute(sql, params);

        let mut state = self.lock_state();
        let Some(slot) = state.transactions.get_mut(&id) else {
            let _ = txn.rollback();
            return Err(unknown_transaction(id));
        };

        if slot.record.state != TxnState::Active {
            // Terminated while the statement ran; honor the terminal state
            let _ = txn.rollback();
            return Err(match slot.record.state {
                TxnState::RolledBack { reason: RollbackReason::TimedOut } => {
                    TransactionError::TimedOut { timeout_ms: slot.record.timeout_ms }.into()
                }
                other => TransactionError::InvalidState { detail: other.describe() }.into(),
            });
        }

        slot.txn = Some(txn);
        let outcome = result?;

        if let Some(n) = outcome.rows_affected {
            slot.record.rows_affected_total += n;
            if slot.record.rows_affected_total > self.safety.max_rows_affected {
                let attempted = slot.record.rows_affected_total;
                Self::terminate(&mut state, id, RollbackReason::RowCapExceeded);
                return Err(TransactionError::RowCapExceeded {
                    limit: self.safety.max_rows_affected,
                    attempted,
                }
                .into());
            }
        }

        Ok(outcome)
    }

    /// The session's current Active transaction, if any
    pub fn current_transaction(&self, session: &str) -> Option<Uuid> {
        let mut state = self.lock_state();
        Self::expire_due(&mut state);
        state.sessions.get(session).copied()
    }

    /// Look up a transaction's record (Active or terminal)
    pub fn record(&self, id: Uuid) -> Option<TransactionRecord> {
        let mut state = self.lock_state();
        Self::expire_due(&mut state);
        state.transactions.get(&id).map(|s| s.record.clone())
    }

    fn spawn_watchdog(self: &Arc<Self>, id: Uuid, timeout: Duration) {
        // No runtime means no watchdog task; the lazy deadline check still
        // enforces the timeout on the next touch.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            loop {
                let Some(manager) = weak.upgrade() else { return };
                let remaining = {
                    let mut state = manager.lock_state();
                    Self::expire_due(&mut state);
                    match state.transactions.get(&id) {
                        Some(slot) if slot.record.state == TxnState::Active => {
                            Some(slot.deadline.saturating_duration_since(Instant::now()))
                        }
                        _ => None,
                    }
                };
                match remaining {
                    Some(d) if !d.is_zero() => {
                        drop(manager);
                        tokio::time::sleep(d).await;
                    }
                    Some(_) => {}
                    None => return,
                }
            }
        });
    }

    /// Roll back every Active transaction whose deadline has passed
    fn expire_due(state: &mut ManagerState) {
        let now = Instant::now();
        let due: Vec<Uuid> = state
            .transactions
            .iter()
            .filter(|(_, slot)| slot.record.state == TxnState::Active && now >= slot.deadline)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            Self::terminate(state, id, RollbackReason::TimedOut);
        }
    }

    fn terminate(state: &mut ManagerState, id: Uuid, reason: RollbackReason) {
        if let Some(slot) = state.transactions.get_mut(&id) {
            if let Some(mut txn) = slot.txn.take() {
                let _ = txn.rollback();
            }
            slot.record.state = TxnState::RolledBack { reason };
        }
        Self::release_session(state, id);
        Self::prune_terminal(state);
    }

    /// Evict the oldest terminal records once the retention bound is crossed.
    /// Active transactions are never evicted.
    fn prune_terminal(state: &mut ManagerState) {
        let terminal: Vec<(Uuid, DateTime<Utc>)> = state
            .transactions
            .iter()
            .filter(|(_, slot)| slot.record.state != TxnState::Active)
            .map(|(id, slot)| (*id, slot.record.started_at))
            .collect();
        if terminal.len() <= MAX_TERMINAL_RECORDS {
            return;
        }
        let mut terminal = terminal;
        terminal.sort_by_key(|(_, started_at)| *started_at);
        for (id, _) in terminal.iter().take(terminal.len() - MAX_TERMINAL_RECORDS) {
            state.transactions.remove(id);
        }
    }

    fn release_session(state: &mut ManagerState, id: Uuid) {
        let session = match state.transactions.get(&id) {
            Some(slot) => slot.record.session.clone(),
            None => return,
        };
        if state.sessions.get(&session) == Some(&id) {
            state.sessions.remove(&session);
        }
    }
}

fn unknown_transaction(id: Uuid) -> TutelaError {
    TransactionError::InvalidState { detail: format!("unknown transaction {id}") }.into()
}

fn busy_executing() -> TutelaError {
    TransactionError::InvalidState {
        detail: "a statement is currently executing in this transaction".to_string(),
    }
    .into()
}

fn unreachable_record(id: Uuid) -> TransactionRecord {
    // terminate() never removes the slot, so this cannot happen; keep a
    // harmless placeholder instead of panicking in non-test code
    TransactionRecord {
        id,
        session: String::new(),
        isolation: IsolationLevel::default(),
        state: TxnState::RolledBack { reason: RollbackReason::Requested },
        started_at: Utc::now(),
        timeout_ms: 0,
        rows_affected_total: 0,
    }
}
