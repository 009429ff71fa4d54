//! Data model shared across the transaction coordinator, quota manager and
//! encryption layers.

use serde_derive::{Deserialize, Serialize};

/// Namespace journal records are written under in the indexed store.
pub const TRANSACTION_JOURNAL: &str = "TRANSACTION_JOURNAL";

/// Sync-store key the archive namespace lives under.
pub const ARCHIVED_STREAMS_KEY: &str = "archived_streams_data";

/// Maximum number of operations a single transaction may queue.
pub const MAX_OPERATIONS_PER_TRANSACTION: usize = 100;

/// Reservation safety-net expiry, in milliseconds.
pub const RESERVATION_EXPIRY_MS: i64 = 30_000;

/// `Transaction` lifecycle. Forward-only by construction: the coordinator
/// never matches backward, so there is no runtime check needed to prevent
/// regressing a transaction's status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Active,
    Prepared,
    Committed,
    RolledBack,
    Fatal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    Indexed,
    SyncKv,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Put,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub backend: Backend,
    pub kind: OperationKind,
    pub store: String,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub previous_value: Option<Vec<u8>>,
    pub timestamp_ms: i64,
}

impl Operation {
    pub fn put(store: impl Into<String>, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, timestamp_ms: i64) -> Self {
        Self {
            backend: Backend::Indexed,
            kind: OperationKind::Put,
            store: store.into(),
            key: key.into(),
            value: Some(value.into()),
            previous_value: None,
            timestamp_ms,
        }
    }

    pub fn delete(store: impl Into<String>, key: impl Into<Vec<u8>>, timestamp_ms: i64) -> Self {
        Self {
            backend: Backend::Indexed,
            kind: OperationKind::Delete,
            store: store.into(),
            key: key.into(),
            value: None,
            previous_value: None,
            timestamp_ms,
        }
    }
}

/// Durable record written at the Decision phase. Only `prepared` records
/// ever exist on disk; `committed` is represented by the record's absence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub id: String,
    pub operation_count: usize,
    pub started_at: i64,
}

/// Process-wide (here: per-`CoreContext`) fatal-state payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatalStateInner {
    pub reason: String,
    pub transaction_id: String,
    pub compensation_log_count: usize,
    pub timestamp_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageTier {
    Indexed,
    SyncKv,
    Memory,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationEntry {
    pub transaction_id: String,
    pub operations: Vec<Operation>,
    pub timestamp_ms: i64,
    pub storage_tier: StorageTier,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuotaTier {
    Normal,
    Warning,
    Critical,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub used_bytes: u64,
    pub quota_bytes: u64,
    pub percent: f64,
    pub available_bytes: u64,
    pub tier: QuotaTier,
    pub is_blocked: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRecord {
    pub id: u64,
    pub size_bytes: u64,
    pub created_at_ms: i64,
}

/// Persistable half of a key session: non-extractable key material itself
/// never appears here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySessionMeta {
    pub session_salt: [u8; 32],
    pub created_at_ms: i64,
    pub version: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub encrypted: bool,
    pub key_version: u32,
    /// base64(nonce || ciphertext || tag)
    pub value: String,
    pub created_at_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockPriority {
    Low = 25,
    Normal = 50,
    High = 75,
    Critical = 100,
}

impl LockPriority {
    pub fn value(self) -> i32 {
        self as i32
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub lock_id: String,
    pub holder_priority: LockPriority,
    pub acquired_at_ms: i64,
}
