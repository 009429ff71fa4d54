//! Reference `Resource` implementation that applies a transaction's queued
//! `Operation`s to an `IndexedStore`.
//!
//! Only `Backend::Indexed` operations participate in two-phase commit;
//! sync-kv writes are never part of a transaction's atomic set, so this
//! resource ignores `Backend::SyncKv` operations and leaves them for the
//! caller to apply directly.
//!
//! Tentative state is itself durable: `prepare` writes each operation,
//! keyed by its index, into a namespace scoped to the transaction id, so a
//! crash between prepare and commit can be recovered exactly as the
//! Decision-phase journal record describes it.

use std::sync::{Arc, Mutex};

use crate::collaborators::IndexedStore;
use crate::coordinator::{Resource, TxnContext};
use crate::error::CResult;
use crate::model::{Backend, Operation, OperationKind};

fn tentative_store(tx_id: &str) -> String {
    format!("__tentative__/{tx_id}")
}

/// Applies queued `put`/`delete` operations against a single named
/// `IndexedStore` logical store (e.g. `"users"`).
pub struct IndexedStoreResource {
    indexed: Arc<dyn IndexedStore>,
    target_store: String,
    staged: Mutex<Vec<(usize, Operation)>>,
}

impl IndexedStoreResource {
    pub fn new(indexed: Arc<dyn IndexedStore>, target_store: impl Into<String>) -> Self {
        Self { indexed, target_store: target_store.into(), staged: Mutex::new(Vec::new()) }
    }

    fn indexed_ops(ctx: &TxnContext) -> impl Iterator<Item = (usize, &Operation)> {
        ctx.operations().iter().enumerate().filter(|(_, op)| op.backend == Backend::Indexed)
    }

    fn apply(&self, op: &Operation) -> CResult<()> {
        match op.kind {
            OperationKind::Put => {
                let value = op.value.clone().unwrap_or_default();
                self.indexed.put(&op.store, &op.key, &value)
            }
            OperationKind::Delete => self.indexed.delete(&op.store, &op.key),
        }
    }
}

impl Resource for IndexedStoreResource {
    fn prepare(&mut self, ctx: &TxnContext) -> CResult<()> {
        let tentative = tentative_store(&ctx.id);
        let mut staged = Vec::new();
        for (idx, op) in Self::indexed_ops(ctx) {
            if op.store != self.target_store {
                continue;
            }
            let bytes = bincode::serialize(op)?;
            self.indexed.put(&tentative, idx.to_string().as_bytes(), &bytes)?;
            staged.push((idx, op.clone()));
        }
        *self.staged.lock().unwrap() = staged;
        Ok(())
    }

    fn commit(&mut self, ctx: &TxnContext) -> CResult<()> {
        let tentative = tentative_store(&ctx.id);
        let staged = self.staged.lock().unwrap().clone();
        for (idx, op) in &staged {
            self.apply(op)?;
            self.indexed.delete(&tentative, idx.to_string().as_bytes())?;
        }
        Ok(())
    }

    fn rollback(&mut self, ctx: &TxnContext) -> CResult<()> {
        let tentative = tentative_store(&ctx.id);
        let staged = self.staged.lock().unwrap().clone();
        for (idx, _) in &staged {
            self.indexed.delete(&tentative, idx.to_string().as_bytes())?;
        }
        Ok(())
    }

    fn recover(&mut self, is_tx_prepared: &dyn Fn(&str) -> bool, tx_id: &str) -> CResult<bool> {
        let tentative = tentative_store(tx_id);
        let records = self.indexed.get_all(&tentative)?;
        if records.is_empty() {
            return Ok(false);
        }

        let should_commit = is_tx_prepared(tx_id);
        for record in &records {
            let op: Operation = bincode::deserialize(&record.value)?;
            if should_commit {
                self.apply(&op)?;
            }
            self.indexed.delete(&tentative, &record.key)?;
        }
        Ok(should_commit)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::collaborators::{FixedClock, MemoryIndexedStore, MemorySyncKv, RecordingEventBus};
    use crate::compensation::CompensationLogger;
    use crate::coordinator::TwoPhaseCommitCoordinator;
    use crate::txn_state::{FatalStateHandle, NestedTransactionGuardState};

    fn make_coordinator(indexed: Arc<dyn IndexedStore>) -> TwoPhaseCommitCoordinator {
        TwoPhaseCommitCoordinator::new(
            indexed.clone(),
            Arc::new(FixedClock::new(0)),
            Arc::new(RecordingEventBus::new()),
            Arc::new(FatalStateHandle::new()),
            Arc::new(NestedTransactionGuardState::new()),
            Arc::new(CompensationLogger::new(indexed, Arc::new(MemorySyncKv::new()))),
        )
    }

    #[test]
    fn commits_queued_put_through_resource() {
        let indexed: Arc<dyn IndexedStore> = Arc::new(MemoryIndexedStore::new());
        let coordinator = make_coordinator(indexed.clone());
        let resource = Box::new(IndexedStoreResource::new(indexed.clone(), "users"));

        coordinator
            .run(|ctx| ctx.put("users", b"u1".to_vec(), b"alice".to_vec(), 0), vec![resource])
            .unwrap();

        assert_eq!(indexed.get("users", b"u1").unwrap(), Some(b"alice".to_vec()));
    }

    #[test]
    fn rollback_discards_tentative_state() {
        let indexed: Arc<dyn IndexedStore> = Arc::new(MemoryIndexedStore::new());
        let coordinator = make_coordinator(indexed.clone());

        struct AlwaysFails;
        impl Resource for AlwaysFails {
            fn prepare(&mut self, _ctx: &TxnContext) -> CResult<()> {
                Err(crate::error::Error::Value("Intentional prepare failure".into()))
            }
            fn commit(&mut self, _ctx: &TxnContext) -> CResult<()> {
                Ok(())
            }
            fn rollback(&mut self, _ctx: &TxnContext) -> CResult<()> {
                Ok(())
            }
            fn recover(&mut self, _is_tx_prepared: &dyn Fn(&str) -> bool, _tx_id: &str) -> CResult<bool> {
                Ok(false)
            }
        }

        let resource = Box::new(IndexedStoreResource::new(indexed.clone(), "users"));
        let failing = Box::new(AlwaysFails);

        let result = coordinator.run(|ctx| ctx.put("users", b"u1".to_vec(), b"alice".to_vec(), 0), vec![resource, failing]);

        assert!(result.is_err());
        assert_eq!(indexed.get("users", b"u1").unwrap(), None);
        assert!(indexed.get_all("__tentative__/tx-1").unwrap().is_empty());
    }

    #[test]
    fn recover_redrives_commit_when_journal_present() {
        let indexed: Arc<dyn IndexedStore> = Arc::new(MemoryIndexedStore::new());
        let tx_id = "tx-crash";
        let tentative = tentative_store(tx_id);
        let op = Operation::put("users", b"u1".to_vec(), b"alice".to_vec(), 0);
        indexed.put(&tentative, b"0", &bincode::serialize(&op).unwrap()).unwrap();
        indexed.put(crate::model::TRANSACTION_JOURNAL, tx_id.as_bytes(), b"marker").unwrap();

        let mut resource = IndexedStoreResource::new(indexed.clone(), "users");
        let is_prepared = |id: &str| indexed.get(crate::model::TRANSACTION_JOURNAL, id.as_bytes()).unwrap().is_some();
        let recommit = resource.recover(&is_prepared, tx_id).unwrap();

        assert!(recommit);
        assert_eq!(indexed.get("users", b"u1").unwrap(), Some(b"alice".to_vec()));
        assert!(indexed.get_all(&tentative).unwrap().is_empty());
    }
}
