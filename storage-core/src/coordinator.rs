//! TwoPhaseCommitCoordinator (C6): prepare → decide (write journal) →
//! commit/rollback across heterogeneous resources, with recovery-journal
//! based crash recovery.
//!
//! `Resource` is a trait rather than a duck-typed `{prepare, commit,
//! rollback}` object; the coordinator is polymorphic over the resources
//! passed to a given transaction rather than any fixed set.

use std::sync::{Arc, Mutex};

use crate::collaborators::{Clock, EventBus, IndexedStore};
use crate::compensation::CompensationLogger;
use crate::error::{CResult, Error};
use crate::events::{self, EventPayload};
use crate::model::{JournalRecord, Operation, TransactionStatus, MAX_OPERATIONS_PER_TRANSACTION, TRANSACTION_JOURNAL};
use crate::txn_state::{FatalStateHandle, NestedTransactionGuardState};

/// A resource participating in a two-phase-committed transaction. A
/// resource *prepares* by making its intended writes durable-but-tentative;
/// *commits* by making them visible; *rolls back* by discarding tentative
/// state; and *recovers*, at startup, resources left mid-flight by a crash.
pub trait Resource: Send {
    fn prepare(&mut self, ctx: &TxnContext) -> CResult<()>;
    fn commit(&mut self, ctx: &TxnContext) -> CResult<()>;
    fn rollback(&mut self, ctx: &TxnContext) -> CResult<()>;

    /// `is_tx_prepared` returns true iff the journal record for `tx_id`
    /// still exists. Returning `Ok(true)` tells the coordinator this
    /// resource believes commit should be re-driven; `Ok(false)` means it
    /// has undone its tentative state.
    fn recover(&mut self, is_tx_prepared: &dyn Fn(&str) -> bool, tx_id: &str) -> CResult<bool>;
}

/// The mutable transaction context a `run` callback populates before
/// `execute` drives it through the coordinator's phases. Operations queued
/// here are immutable from the callback's perspective once Prepare begins.
pub struct TxnContext {
    pub id: String,
    operations: Vec<Operation>,
    status: TransactionStatus,
}

impl TxnContext {
    fn new(id: String) -> Self {
        Self { id, operations: Vec::new(), status: TransactionStatus::Active }
    }

    pub fn put(&mut self, store: impl Into<String>, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, now_ms: i64) -> CResult<()> {
        self.push(Operation::put(store, key, value, now_ms))
    }

    pub fn delete(&mut self, store: impl Into<String>, key: impl Into<Vec<u8>>, now_ms: i64) -> CResult<()> {
        self.push(Operation::delete(store, key, now_ms))
    }

    fn push(&mut self, operation: Operation) -> CResult<()> {
        if self.operations.len() >= MAX_OPERATIONS_PER_TRANSACTION {
            return Err(Error::Value(format!("transaction exceeds {MAX_OPERATIONS_PER_TRANSACTION} operations")));
        }
        self.operations.push(operation);
        Ok(())
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }
}

pub struct TwoPhaseCommitCoordinator {
    indexed: Arc<dyn IndexedStore>,
    clock: Arc<dyn Clock>,
    bus: Arc<dyn EventBus>,
    fatal: Arc<FatalStateHandle>,
    nested: Arc<NestedTransactionGuardState>,
    compensation: Arc<CompensationLogger>,
    next_id: Mutex<u64>,
}

impl TwoPhaseCommitCoordinator {
    pub fn new(
        indexed: Arc<dyn IndexedStore>,
        clock: Arc<dyn Clock>,
        bus: Arc<dyn EventBus>,
        fatal: Arc<FatalStateHandle>,
        nested: Arc<NestedTransactionGuardState>,
        compensation: Arc<CompensationLogger>,
    ) -> Self {
        Self { indexed, clock, bus, fatal, nested, compensation, next_id: Mutex::new(1) }
    }

    fn new_transaction_id(&self) -> String {
        let mut next = self.next_id.lock().unwrap();
        let id = *next;
        *next += 1;
        format!("tx-{id}")
    }

    /// Creates a context, invokes `populate` to queue operations, then
    /// executes the transaction. Returns the transaction id on success.
    pub fn run(
        &self,
        populate: impl FnOnce(&mut TxnContext) -> CResult<()>,
        mut resources: Vec<Box<dyn Resource>>,
    ) -> CResult<String> {
        self.fatal.guard_begin()?;
        let id = self.new_transaction_id();
        let _guard = self.nested.enter(&id)?;

        let mut ctx = TxnContext::new(id.clone());
        populate(&mut ctx)?;
        self.execute(&mut ctx, &mut resources)?;
        Ok(id)
    }

    /// Drives an already-populated context through Guard/Prepare/Decision/
    /// Commit/Cleanup. Empty transactions short-circuit to success.
    pub fn execute(&self, ctx: &mut TxnContext, resources: &mut [Box<dyn Resource>]) -> CResult<()> {
        if ctx.operations.is_empty() {
            ctx.status = TransactionStatus::Committed;
            return Ok(());
        }

        let start_ms = self.clock.now_ms();

        let mut prepared = 0usize;
        let mut failure: Option<Error> = None;
        for resource in resources.iter_mut() {
            match resource.prepare(ctx) {
                Ok(()) => prepared += 1,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = failure {
            return self.fail_and_rollback(ctx, resources, prepared, Error::PrepareFailure(err.to_string()), start_ms);
        }
        ctx.status = TransactionStatus::Prepared;

        let record = JournalRecord { id: ctx.id.clone(), operation_count: ctx.operations.len(), started_at: start_ms };
        if let Err(err) = self.write_journal(&record) {
            return self.fail_and_rollback(ctx, resources, prepared, Error::JournalWriteFailure(err.to_string()), start_ms);
        }

        let mut committed = 0usize;
        let mut commit_failure: Option<Error> = None;
        for resource in resources.iter_mut() {
            match resource.commit(ctx) {
                Ok(()) => committed += 1,
                Err(err) => {
                    commit_failure = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = commit_failure {
            let _ = committed; // all entered resources were prepared; rollback all of them
            return self.fail_and_rollback(ctx, resources, prepared, Error::CommitFailure(err.to_string()), start_ms);
        }

        if let Err(err) = self.delete_journal(&ctx.id) {
            log::error!("journal cleanup failed for {}: {err}", ctx.id);
            self.bus.emit(
                events::TRANSACTION_CLEANUP_FAILED,
                EventPayload::TransactionCleanupFailed { transaction_id: ctx.id.clone(), error: err.to_string() }.to_value(),
            );
        }

        ctx.status = TransactionStatus::Committed;
        let duration_ms = self.clock.now_ms() - start_ms;
        self.bus.emit(
            events::TRANSACTION_COMMITTED,
            EventPayload::TransactionCommitted { transaction_id: ctx.id.clone(), duration_ms }.to_value(),
        );
        Ok(())
    }

    /// Rolls back every resource that was entered, in reverse order. If a
    /// rollback itself fails, logs a compensation entry, enters fatal state,
    /// and returns `RollbackFailure` wrapping both causes. Otherwise returns
    /// the original failure.
    fn fail_and_rollback(
        &self,
        ctx: &mut TxnContext,
        resources: &mut [Box<dyn Resource>],
        entered: usize,
        original_cause: Error,
        start_ms: i64,
    ) -> CResult<()> {
        let mut rollback_failure: Option<Error> = None;
        for resource in resources[..entered].iter_mut().rev() {
            if let Err(err) = resource.rollback(ctx) {
                rollback_failure = Some(err);
                break;
            }
        }

        if let Some(rollback_err) = rollback_failure {
            self.compensation.log_compensation(ctx.id.clone(), ctx.operations().to_vec(), self.clock.as_ref());
            let compensation_count = self.compensation.get_all_logs().len();
            self.fatal.enter_fatal_state(
                rollback_err.to_string(),
                ctx.id.clone(),
                compensation_count,
                self.clock.as_ref(),
                self.bus.as_ref(),
            );
            ctx.status = TransactionStatus::Fatal;
            return Err(Error::RollbackFailure {
                transaction_id: ctx.id.clone(),
                rollback_cause: rollback_err.to_string(),
                original_cause: original_cause.to_string(),
            });
        }

        ctx.status = TransactionStatus::RolledBack;
        let duration_ms = self.clock.now_ms() - start_ms;
        self.bus.emit(
            events::TRANSACTION_ROLLED_BACK,
            EventPayload::TransactionRolledBack { transaction_id: ctx.id.clone(), duration_ms }.to_value(),
        );
        Err(original_cause)
    }

    fn write_journal(&self, record: &JournalRecord) -> CResult<()> {
        let bytes = bincode::serialize(record)?;
        self.indexed.put(TRANSACTION_JOURNAL, record.id.as_bytes(), &bytes)
    }

    fn delete_journal(&self, id: &str) -> CResult<()> {
        self.indexed.delete(TRANSACTION_JOURNAL, id.as_bytes())
    }

    /// Startup recovery: for every journal record found, asks each resource
    /// to recover, then deletes the record. Returns the recovered ids.
    pub fn recover(&self, resources: &mut [Box<dyn Resource>]) -> CResult<Vec<String>> {
        let mut recovered = Vec::new();
        for record in self.indexed.get_all(TRANSACTION_JOURNAL)? {
            let journal: JournalRecord = bincode::deserialize(&record.value)?;
            let indexed = self.indexed.clone();
            let is_tx_prepared = move |id: &str| indexed.get(TRANSACTION_JOURNAL, id.as_bytes()).ok().flatten().is_some();

            for resource in resources.iter_mut() {
                if let Err(err) = resource.recover(&is_tx_prepared, &journal.id) {
                    log::error!("resource recovery failed for {}: {err}", journal.id);
                }
            }
            self.delete_journal(&journal.id)?;
            recovered.push(journal.id);
        }
        Ok(recovered)
    }
}
