//! TransactionStateManager & NestedTransactionGuard (C5).
//!
//! Both hold their state as plain fields behind a `Mutex`, owned by the
//! embedder's `CoreContext` rather than as module-level `static`s — the
//! process-wide singletons a browser tab would get away with don't survive
//! being embedded in a multi-threaded host.

use std::sync::Mutex;

use crate::collaborators::{Clock, EventBus};
use crate::error::{CResult, Error};
use crate::events::{self, EventPayload};
use crate::model::FatalStateInner;

/// Single writer into fatal state. `enter_fatal_state` is the sole write
/// path (Open Question 4: the broken alternate setter described in the
/// original source has no counterpart here).
pub struct FatalStateHandle {
    inner: Mutex<Option<FatalStateInner>>,
}

impl FatalStateHandle {
    pub fn new() -> Self {
        Self { inner: Mutex::new(None) }
    }

    pub fn is_fatal(&self) -> bool {
        self.inner.lock().unwrap().is_some()
    }

    pub fn current(&self) -> Option<FatalStateInner> {
        self.inner.lock().unwrap().clone()
    }

    pub fn enter_fatal_state(
        &self,
        reason: impl Into<String>,
        transaction_id: impl Into<String>,
        compensation_log_count: usize,
        clock: &dyn Clock,
        bus: &dyn EventBus,
    ) {
        let reason = reason.into();
        let transaction_id = transaction_id.into();
        log::error!("entering fatal state: {reason} (transaction {transaction_id})");
        *self.inner.lock().unwrap() = Some(FatalStateInner {
            reason: reason.clone(),
            transaction_id: transaction_id.clone(),
            compensation_log_count,
            timestamp_ms: clock.now_ms(),
        });
        bus.emit(
            events::TRANSACTION_FATAL_STATE,
            EventPayload::TransactionFatalState { transaction_id, reason }.to_value(),
        );
    }

    /// Idempotent: clearing when not set is a no-op (still publishes the
    /// cleared event, matching the operator's expectation that the call
    /// succeeded).
    pub fn clear_fatal_state(&self, reason: impl Into<String>, bus: &dyn EventBus) {
        let reason = reason.into();
        *self.inner.lock().unwrap() = None;
        log::info!("fatal state cleared: {reason}");
        bus.emit(events::TRANSACTION_FATAL_CLEARED, EventPayload::TransactionFatalCleared { reason }.to_value());
    }

    pub fn guard_begin(&self) -> CResult<()> {
        if self.is_fatal() {
            let reason = self.current().map(|s| s.reason).unwrap_or_default();
            return Err(Error::FatalState { reason });
        }
        Ok(())
    }
}

impl Default for FatalStateHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide counter with single-owner discipline: at most one
/// transaction may be in progress within a process at a time.
pub struct NestedTransactionGuardState {
    holder: Mutex<Option<String>>,
}

impl NestedTransactionGuardState {
    pub fn new() -> Self {
        Self { holder: Mutex::new(None) }
    }

    /// Enters the guard on behalf of `id`, rejecting with `NestedTransaction`
    /// if another transaction is already in progress.
    pub fn enter(&self, id: impl Into<String>) -> CResult<NestedGuard<'_>> {
        let id = id.into();
        let mut holder = self.holder.lock().unwrap();
        if holder.is_some() {
            return Err(Error::NestedTransaction);
        }
        *holder = Some(id.clone());
        Ok(NestedGuard { state: self, id })
    }

    pub fn depth(&self) -> i64 {
        if self.holder.lock().unwrap().is_some() { 1 } else { 0 }
    }

    /// Drains any held guard state. For test setup/teardown only.
    pub fn drain(&self) {
        *self.holder.lock().unwrap() = None;
    }
}

impl Default for NestedTransactionGuardState {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle returned by `NestedTransactionGuardState::enter`. Dropping it
/// exits the guard, decrementing depth back to zero.
pub struct NestedGuard<'a> {
    state: &'a NestedTransactionGuardState,
    id: String,
}

impl Drop for NestedGuard<'_> {
    fn drop(&mut self) {
        let mut holder = self.state.holder.lock().unwrap();
        match holder.take() {
            Some(ref current) if *current == self.id => {}
            Some(other) => {
                log::warn!(
                    "nested transaction guard exit id mismatch: entered as {}, exiting as {other}",
                    self.id
                );
            }
            None => {
                log::warn!("nested transaction guard exit with no recorded holder (id {})", self.id);
            }
        }
    }
}
