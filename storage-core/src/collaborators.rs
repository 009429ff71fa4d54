//! Collaborator traits the core consumes, plus reference implementations
//! used by tests and by `storage-cli`.
//!
//! The indexed-store and sync-kv implementations are deliberately thin
//! adapters over the engine types in `engine/`: `MemoryIndexedStore` wraps
//! `engine::memory::Memory`, and `FileIndexedStore` wraps
//! `engine::log_cask::LogCask` — the same production log-structured engine,
//! reused here as the one piece of this system that legitimately needs
//! durable storage outside a browser host.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_derive::{Deserialize, Serialize};

use crate::engine::backend::Engine;
use crate::engine::log_cask::LogCask;
use crate::engine::memory::Memory;
use crate::error::CResult;

/// A record stored in the indexed store: an opaque byte blob plus the key it
/// was stored under, mirroring the `{store, key} -> bytes` shape the real
/// host's IndexedDB binding would expose.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Exposed as plain synchronous `fn`s: `storage-core` does not depend on an
/// async runtime; an embedder running an async host binding awaits its own
/// wrapper around these calls.
pub trait IndexedStore: Send + Sync {
    fn get(&self, store: &str, key: &[u8]) -> CResult<Option<Vec<u8>>>;
    fn put(&self, store: &str, key: &[u8], value: &[u8]) -> CResult<()>;
    fn delete(&self, store: &str, key: &[u8]) -> CResult<()>;
    fn get_all(&self, store: &str) -> CResult<Vec<IndexedRecord>>;
    fn clear(&self, store: &str) -> CResult<()>;
}

pub trait SyncKvStore: Send + Sync {
    fn get(&self, key: &str) -> CResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> CResult<()>;
    fn delete(&self, key: &str) -> CResult<()>;
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuotaEstimate {
    pub usage_bytes: u64,
    pub quota_bytes: u64,
}

pub trait HostQuota: Send + Sync {
    fn estimate(&self) -> CResult<QuotaEstimate>;
}

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Returned by `EventBus::on`; calling it (or dropping it, for
/// implementations that track that) removes the subscription.
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

pub trait EventBus: Send + Sync {
    fn emit(&self, topic: &str, payload: serde_json::Value);

    /// Subscribes to incoming events on `topic`. The default implementation
    /// is a no-op for collaborators (like `RecordingEventBus`'s simplest
    /// uses) that only need to observe outgoing emissions; a bus that
    /// actually routes incoming events overrides this.
    fn on(&self, topic: &str, handler: Box<dyn Fn(serde_json::Value) + Send + Sync>) -> Unsubscribe {
        let _ = (topic, handler);
        Box::new(|| {})
    }
}

/// A namespaced key, `store/key`, used to multiplex one flat engine across
/// the many logical stores the indexed-store interface exposes.
fn namespaced(store: &str, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(store.len() + 1 + key.len());
    out.extend_from_slice(store.as_bytes());
    out.push(0); // NUL separator: never appears in a store name
    out.extend_from_slice(key);
    out
}

/// In-memory `IndexedStore`, grounded on `engine::memory::Memory`.
pub struct MemoryIndexedStore {
    engine: Mutex<Memory>,
}

impl MemoryIndexedStore {
    pub fn new() -> Self {
        Self { engine: Mutex::new(Memory::new()) }
    }
}

impl Default for MemoryIndexedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexedStore for MemoryIndexedStore {
    fn get(&self, store: &str, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        self.engine.lock().unwrap().get(&namespaced(store, key))
    }

    fn put(&self, store: &str, key: &[u8], value: &[u8]) -> CResult<()> {
        self.engine.lock().unwrap().set(&namespaced(store, key), value.to_vec())
    }

    fn delete(&self, store: &str, key: &[u8]) -> CResult<()> {
        self.engine.lock().unwrap().delete(&namespaced(store, key))
    }

    fn get_all(&self, store: &str) -> CResult<Vec<IndexedRecord>> {
        let mut engine = self.engine.lock().unwrap();
        let prefix = {
            let mut p = store.as_bytes().to_vec();
            p.push(0);
            p
        };
        let mut out = Vec::new();
        for item in engine.scan_prefix(&prefix) {
            let (full_key, value) = item?;
            out.push(IndexedRecord { key: full_key[prefix.len()..].to_vec(), value });
        }
        Ok(out)
    }

    fn clear(&self, store: &str) -> CResult<()> {
        let records = self.get_all(store)?;
        let mut engine = self.engine.lock().unwrap();
        for record in records {
            engine.delete(&namespaced(store, &record.key))?;
        }
        Ok(())
    }
}

/// In-memory `SyncKvStore`, a plain `BTreeMap` behind a `Mutex`, the same
/// shape as `engine::memory::Memory`.
pub struct MemorySyncKv {
    data: Mutex<BTreeMap<String, String>>,
}

impl MemorySyncKv {
    pub fn new() -> Self {
        Self { data: Mutex::new(BTreeMap::new()) }
    }
}

impl Default for MemorySyncKv {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncKvStore for MemorySyncKv {
    fn get(&self, key: &str) -> CResult<Option<String>> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> CResult<()> {
        self.data.lock().unwrap().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> CResult<()> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }
}

/// On-disk `IndexedStore`, a thin adapter over the `LogCask`
/// engine. One `LogCask` instance covers all stores; keys are namespaced
/// the same way as `MemoryIndexedStore`.
pub struct FileIndexedStore {
    engine: Mutex<LogCask>,
}

impl FileIndexedStore {
    pub fn open(path: PathBuf) -> CResult<Self> {
        Ok(Self { engine: Mutex::new(LogCask::new(path)?) })
    }
}

impl IndexedStore for FileIndexedStore {
    fn get(&self, store: &str, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        self.engine.lock().unwrap().get(&namespaced(store, key))
    }

    fn put(&self, store: &str, key: &[u8], value: &[u8]) -> CResult<()> {
        self.engine.lock().unwrap().set(&namespaced(store, key), value.to_vec())
    }

    fn delete(&self, store: &str, key: &[u8]) -> CResult<()> {
        self.engine.lock().unwrap().delete(&namespaced(store, key))
    }

    fn get_all(&self, store: &str) -> CResult<Vec<IndexedRecord>> {
        let mut engine = self.engine.lock().unwrap();
        let prefix = {
            let mut p = store.as_bytes().to_vec();
            p.push(0);
            p
        };
        let mut out = Vec::new();
        for item in engine.scan_prefix(&prefix) {
            let (full_key, value) = item?;
            out.push(IndexedRecord { key: full_key[prefix.len()..].to_vec(), value });
        }
        Ok(out)
    }

    fn clear(&self, store: &str) -> CResult<()> {
        let records = self.get_all(store)?;
        let mut engine = self.engine.lock().unwrap();
        for record in records {
            engine.delete(&namespaced(store, &record.key))?;
        }
        Ok(())
    }
}

/// On-disk `SyncKvStore`, a second `LogCask` instance (sync-kv and indexed
/// store are distinct backends, so they get distinct files).
pub struct FileSyncKv {
    engine: Mutex<LogCask>,
}

impl FileSyncKv {
    pub fn open(path: PathBuf) -> CResult<Self> {
        Ok(Self { engine: Mutex::new(LogCask::new(path)?) })
    }
}

impl SyncKvStore for FileSyncKv {
    fn get(&self, key: &str) -> CResult<Option<String>> {
        match self.engine.lock().unwrap().get(key.as_bytes())? {
            Some(bytes) => Ok(Some(String::from_utf8(bytes)?)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> CResult<()> {
        self.engine.lock().unwrap().set(key.as_bytes(), value.as_bytes().to_vec())
    }

    fn delete(&self, key: &str) -> CResult<()> {
        self.engine.lock().unwrap().delete(key.as_bytes())
    }
}

/// A `Clock` that reads the wall clock, for production use.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A `Clock` whose time is set explicitly, for deterministic tests.
pub struct FixedClock {
    now_ms: std::sync::atomic::AtomicI64,
}

impl FixedClock {
    pub fn new(now_ms: i64) -> Self {
        Self { now_ms: std::sync::atomic::AtomicI64::new(now_ms) }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(std::sync::atomic::Ordering::SeqCst)
    }
}

type Handler = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// An `EventBus` that records emitted events for test assertions and also
/// routes them to any subscriber registered via `on`, so collaborators like
/// `ContextAwareRecovery::start_monitoring` are exercisable without a real
/// host event loop. The subscriber map lives behind its own `Arc<Mutex<_>>`
/// so `Unsubscribe` closures can remove themselves without borrowing `self`.
pub struct RecordingEventBus {
    events: Mutex<Vec<(String, serde_json::Value)>>,
    subscribers: Arc<Mutex<HashMap<String, Vec<(u64, Handler)>>>>,
    next_sub_id: Mutex<u64>,
}

impl RecordingEventBus {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_sub_id: Mutex::new(1),
        }
    }

    pub fn recorded(&self) -> Vec<(String, serde_json::Value)> {
        self.events.lock().unwrap().clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }
}

impl Default for RecordingEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for RecordingEventBus {
    fn emit(&self, topic: &str, payload: serde_json::Value) {
        log::info!("event emitted: {topic}");
        self.events.lock().unwrap().push((topic.to_string(), payload.clone()));

        // Snapshot the subscriber list before dispatch so a handler that
        // re-subscribes or unsubscribes during dispatch doesn't mutate the
        // iteration in progress.
        let snapshot: Vec<Handler> = {
            let subscribers = self.subscribers.lock().unwrap();
            subscribers.get(topic).map(|handlers| handlers.iter().map(|(_, h)| h.clone()).collect()).unwrap_or_default()
        };
        for handler in snapshot {
            handler(payload.clone());
        }
    }

    fn on(&self, topic: &str, handler: Box<dyn Fn(serde_json::Value) + Send + Sync>) -> Unsubscribe {
        let id = {
            let mut next = self.next_sub_id.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };
        self.subscribers.lock().unwrap().entry(topic.to_string()).or_default().push((id, Handler::from(handler)));

        let subscribers = self.subscribers.clone();
        let topic = topic.to_string();
        Box::new(move || {
            if let Some(handlers) = subscribers.lock().unwrap().get_mut(&topic) {
                handlers.retain(|(existing_id, _)| *existing_id != id);
            }
        })
    }
}

/// A constant `HostQuota`, for tests that need a fixed usage/quota pair.
pub struct FixedHostQuota {
    estimate: Mutex<QuotaEstimate>,
}

impl FixedHostQuota {
    pub fn new(usage_bytes: u64, quota_bytes: u64) -> Self {
        Self { estimate: Mutex::new(QuotaEstimate { usage_bytes, quota_bytes }) }
    }

    pub fn set_usage(&self, usage_bytes: u64) {
        self.estimate.lock().unwrap().usage_bytes = usage_bytes;
    }
}

impl HostQuota for FixedHostQuota {
    fn estimate(&self) -> CResult<QuotaEstimate> {
        Ok(*self.estimate.lock().unwrap())
    }
}
