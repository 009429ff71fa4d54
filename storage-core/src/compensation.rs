//! CompensationLogger (C4): durable record of operations whose rollback
//! failed, with tiered fallback storage — indexed store, then sync-kv, then
//! an in-process ring buffer, tagging each entry with the tier actually
//! used. Mirrors the layered-storage instinct the engine implementations
//! already use: a primary store with an explicit `Result` fallback chain.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::collaborators::{Clock, IndexedStore, SyncKvStore};
use crate::error::{CResult, Error};
use crate::model::{CompensationEntry, Operation, StorageTier};

pub const COMPENSATION_STORE: &str = "compensation_log";
pub const COMPENSATION_SYNC_KV_KEY: &str = "compensation_log";
pub const RING_BUFFER_CAPACITY: usize = 256;

trait CompensationSink: Send + Sync {
    fn tier(&self) -> StorageTier;
    fn write(&self, entry: &CompensationEntry) -> CResult<()>;
    fn read_all(&self) -> CResult<Vec<CompensationEntry>>;
}

struct IndexedSink {
    store: Arc<dyn IndexedStore>,
}

impl CompensationSink for IndexedSink {
    fn tier(&self) -> StorageTier {
        StorageTier::Indexed
    }

    fn write(&self, entry: &CompensationEntry) -> CResult<()> {
        let bytes = bincode::serialize(entry)?;
        self.store.put(COMPENSATION_STORE, entry.transaction_id.as_bytes(), &bytes)
    }

    fn read_all(&self) -> CResult<Vec<CompensationEntry>> {
        self.store
            .get_all(COMPENSATION_STORE)?
            .into_iter()
            .map(|record| bincode::deserialize(&record.value).map_err(Error::from))
            .collect()
    }
}

struct SyncKvSink {
    kv: Arc<dyn SyncKvStore>,
}

impl SyncKvSink {
    fn read_raw(&self) -> CResult<Vec<CompensationEntry>> {
        match self.kv.get(COMPENSATION_SYNC_KV_KEY)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }
}

impl CompensationSink for SyncKvSink {
    fn tier(&self) -> StorageTier {
        StorageTier::SyncKv
    }

    fn write(&self, entry: &CompensationEntry) -> CResult<()> {
        let mut existing = self.read_raw()?;
        existing.push(entry.clone());
        let json = serde_json::to_string(&existing)?;
        self.kv.set(COMPENSATION_SYNC_KV_KEY, &json)
    }

    fn read_all(&self) -> CResult<Vec<CompensationEntry>> {
        self.read_raw()
    }
}

struct MemorySink {
    buffer: Mutex<VecDeque<CompensationEntry>>,
}

impl CompensationSink for MemorySink {
    fn tier(&self) -> StorageTier {
        StorageTier::Memory
    }

    fn write(&self, entry: &CompensationEntry) -> CResult<()> {
        let mut buffer = self.buffer.lock().unwrap();
        if buffer.len() >= RING_BUFFER_CAPACITY {
            buffer.pop_front();
        }
        buffer.push_back(entry.clone());
        Ok(())
    }

    fn read_all(&self) -> CResult<Vec<CompensationEntry>> {
        Ok(self.buffer.lock().unwrap().iter().cloned().collect())
    }
}

/// Tiered compensation log. Entries are append-only and never pruned, save
/// for the in-memory ring buffer's fixed capacity (the last resort tier,
/// only reached when both durable tiers are unavailable).
pub struct CompensationLogger {
    sinks: Vec<Box<dyn CompensationSink>>,
}

impl CompensationLogger {
    pub fn new(indexed: Arc<dyn IndexedStore>, sync_kv: Arc<dyn SyncKvStore>) -> Self {
        Self {
            sinks: vec![
                Box::new(IndexedSink { store: indexed }),
                Box::new(SyncKvSink { kv: sync_kv }),
                Box::new(MemorySink { buffer: Mutex::new(VecDeque::new()) }),
            ],
        }
    }

    /// Writes a compensation entry only when a rollback itself failed,
    /// trying each tier in order and falling back on failure. The in-memory
    /// ring buffer tier cannot fail, so this always succeeds in practice.
    pub fn log_compensation(&self, transaction_id: impl Into<String>, operations: Vec<Operation>, clock: &dyn Clock) {
        let transaction_id = transaction_id.into();
        let timestamp_ms = clock.now_ms();

        for sink in &self.sinks {
            let entry = CompensationEntry {
                transaction_id: transaction_id.clone(),
                operations: operations.clone(),
                timestamp_ms,
                storage_tier: sink.tier(),
            };
            match sink.write(&entry) {
                Ok(()) => {
                    log::warn!("logged compensation for {transaction_id} at tier {:?}", sink.tier());
                    return;
                }
                Err(err) => {
                    log::warn!("compensation sink {:?} failed, falling back: {err}", sink.tier());
                }
            }
        }
    }

    pub fn get_all_logs(&self) -> Vec<CompensationEntry> {
        let mut all = Vec::new();
        for sink in &self.sinks {
            match sink.read_all() {
                Ok(mut entries) => all.append(&mut entries),
                Err(err) => log::warn!("failed to read compensation sink {:?}: {err}", sink.tier()),
            }
        }
        all
    }
}
