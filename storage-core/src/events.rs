//! Event bus topics and payloads. The bus itself is a collaborator trait
//! (`collaborators::EventBus`); this module only names the wire surface
//! crossing it.

use serde_derive::{Deserialize, Serialize};

pub const QUOTA_WARNING: &str = "storage:quota_warning";
pub const QUOTA_CRITICAL: &str = "storage:quota_critical";
pub const QUOTA_NORMAL: &str = "storage:quota_normal";
pub const THRESHOLD_EXCEEDED: &str = "storage:threshold_exceeded";
pub const QUOTA_CLEANED: &str = "storage:quota_cleaned";
pub const ARCHIVE_RESTORED: &str = "storage:archive_restored";
pub const READ_ONLY_MODE: &str = "storage:read_only_mode";
pub const TRANSACTION_FATAL_STATE: &str = "transaction:fatal_state";
pub const TRANSACTION_FATAL_CLEARED: &str = "transaction:fatal_cleared";
pub const TRANSACTION_COMMITTED: &str = "transaction:committed";
pub const TRANSACTION_ROLLED_BACK: &str = "transaction:rolled_back";
/// Journal cleanup failed after a successful commit. Non-fatal — the
/// record is reconciled by startup recovery.
pub const TRANSACTION_CLEANUP_FAILED: &str = "transaction:cleanup_failed";
pub const RECOVERY_STORAGE_CLEANUP: &str = "recovery:storage_cleanup";
pub const RECOVERY_CONTEXT_CHANGED: &str = "recovery:context_changed";

/// Incoming topics `ContextAwareRecovery::start_monitoring` subscribes to,
/// feeding the process-wide app-state snapshot.
pub const STORAGE_ERROR: &str = "STORAGE:ERROR";
pub const STORAGE_WRITE: &str = "STORAGE:WRITE";
pub const UI_VIEW_CHANGED: &str = "ui:view_changed";
pub const DATA_STATE_CHANGED: &str = "data:state_changed";
pub const USER_INTENT_DETECTED: &str = "user:intent_detected";
pub const STORAGE_CONNECTION_FAILED: &str = "storage:connection_failed";
pub const STORAGE_CONNECTION_BLOCKED: &str = "storage:connection_blocked";

/// Flat payload shapes for outgoing events, carried as `serde_json::Value`
/// at the `EventBus` boundary so the CLI and any host bridge can serialize
/// them uniformly. Every emit site builds one of these and converts it with
/// `serde_json::to_value` rather than hand-assembling a `json!` object, so
/// the field names on the wire can't drift from the names declared here.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EventPayload {
    #[serde(rename_all = "camelCase")]
    Quota { percent: f64, used_bytes: u64, quota_bytes: u64 },
    ThresholdExceeded { percent: f64 },
    #[serde(rename_all = "camelCase")]
    QuotaCleaned { archived: usize, bytes_saved: u64 },
    #[serde(rename_all = "camelCase")]
    ArchiveRestored { restored: usize, remaining: usize, filtered_count: usize },
    ReadOnlyMode { enabled: bool },
    #[serde(rename_all = "camelCase")]
    TransactionFatalState { transaction_id: String, reason: String },
    TransactionFatalCleared { reason: String },
    #[serde(rename_all = "camelCase")]
    TransactionCommitted { transaction_id: String, duration_ms: i64 },
    #[serde(rename_all = "camelCase")]
    TransactionRolledBack { transaction_id: String, duration_ms: i64 },
    #[serde(rename_all = "camelCase")]
    TransactionCleanupFailed { transaction_id: String, error: String },
    RecoveryStorageCleanup { strategy: String },
    RecoveryContextChanged { strategy: String },
}

impl EventPayload {
    /// Converts to the `serde_json::Value` the `EventBus` trait carries.
    /// Infallible in practice: every field here is a primitive or `String`.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("EventPayload fields are all primitives or Strings")
    }
}
