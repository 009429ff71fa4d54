//! Error taxonomy for the storage substrate.
//!
//! One flat enum rather than a per-subsystem hierarchy: every component in
//! this crate funnels its failures through `Error`, and `CResult<T>` is the
//! crate-wide result alias.

use std::fmt;

pub type CResult<T> = Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Wraps an underlying I/O failure (file engine, journal writes).
    Internal(String),

    /// A value failed to parse or decode (bincode/serde/utf8).
    Parse(String),

    /// A value was invalid for the operation attempted.
    Value(String),

    /// `KeyManager::initialize_session` was called outside a secure context.
    InsecureContext,

    /// A password shorter than 8 characters was supplied to `initialize_session`.
    WeakPassword,

    /// Key derivation failed (PBKDF2/HMAC internal failure).
    KdfFailure(String),

    /// A write classified as sensitive could not be encrypted because the
    /// KeyManager is unavailable (degraded SecurityCoordinator).
    EncryptionUnavailable,

    /// Decryption did not authenticate; recovered locally as `None` by
    /// `StorageEncryption::decrypt`, but raised here when a caller needs the
    /// failure (e.g. `migrate`).
    DecryptionFailed,

    /// A write would exceed the effective quota.
    QuotaExceeded,

    /// A write was refused because the quota tier is `critical` and no
    /// covering reservation was presented.
    WriteBlocked,

    /// Lock acquisition exhausted its retry budget without preempting.
    LockBusy { name: String },

    /// Lock acquisition exceeded its timeout.
    LockTimeout { name: String },

    /// A transient failure acquiring a lock, retried internally.
    LockAcquisition(String),

    /// `begin` was called while another transaction was already in progress.
    NestedTransaction,

    /// A new transaction was refused because fatal state is set.
    FatalState { reason: String },

    /// A resource's `prepare` failed.
    PrepareFailure(String),

    /// A resource's `commit` failed.
    CommitFailure(String),

    /// A resource's `rollback` itself failed, compounding an earlier failure.
    RollbackFailure {
        transaction_id: String,
        rollback_cause: String,
        original_cause: String,
    },

    /// The journal write in the Decision phase failed.
    JournalWriteFailure(String),

    /// Deleting the journal record after commit failed. Non-fatal: logged
    /// and reconciled by startup recovery.
    CleanupFailure(String),

    /// `ArchiveService::restore` rejected the archive because more than 10%
    /// of entries failed validation.
    ArchiveIntegrity { invalid: usize, total: usize },

    /// `ContextAwareRecovery::execute` was asked to run a strategy with no
    /// registered handler.
    RecoveryHandlerMissing(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
            Error::Parse(msg) => write!(f, "parse error: {msg}"),
            Error::Value(msg) => write!(f, "invalid value: {msg}"),
            Error::InsecureContext => write!(f, "insecure context"),
            Error::WeakPassword => write!(f, "weak password"),
            Error::KdfFailure(msg) => write!(f, "key derivation failed: {msg}"),
            Error::EncryptionUnavailable => write!(f, "encryption unavailable"),
            Error::DecryptionFailed => write!(f, "decryption failed"),
            Error::QuotaExceeded => write!(f, "quota exceeded"),
            Error::WriteBlocked => write!(f, "write blocked by quota"),
            Error::LockBusy { name } => write!(f, "lock busy: {name}"),
            Error::LockTimeout { name } => write!(f, "lock timeout: {name}"),
            Error::LockAcquisition(msg) => write!(f, "lock acquisition failed: {msg}"),
            Error::NestedTransaction => write!(f, "nested transaction"),
            Error::FatalState { reason } => write!(f, "fatal state: {reason}"),
            Error::PrepareFailure(msg) => write!(f, "prepare failure: {msg}"),
            Error::CommitFailure(msg) => write!(f, "commit failure: {msg}"),
            Error::RollbackFailure { transaction_id, rollback_cause, original_cause } => write!(
                f,
                "rollback failure for {transaction_id}: {rollback_cause} (original: {original_cause})"
            ),
            Error::JournalWriteFailure(msg) => write!(f, "journal write failure: {msg}"),
            Error::CleanupFailure(msg) => write!(f, "cleanup failure: {msg}"),
            Error::ArchiveIntegrity { invalid, total } => {
                write!(f, "archive integrity: {invalid}/{total} entries invalid")
            }
            Error::RecoveryHandlerMissing(strategy) => {
                write!(f, "no recovery handler registered for {strategy}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::Parse(err.to_string())
    }
}

/// `{critical, high, medium}` classification attached by `ContextAwareRecovery`
/// when it surfaces an error, per the error-handling policy's severity split.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde_derive::Serialize, serde_derive::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::High => write!(f, "high"),
            Severity::Medium => write!(f, "medium"),
        }
    }
}
