//! SecurityCoordinator (C10): ordered initialization and readiness state
//! machine for KeyManager, StorageEncryption's classification tables,
//! TransactionStateManager, and CompensationLogger (C1-C5).
//!
//! `init` is a single synchronous call rather than an async pipeline — there
//! is no event loop to yield to between steps in this port — but the
//! `Mutex<CoordinatorState>` + `Condvar` pairing still lets a second real OS
//! thread call `wait_for_ready`/`on_ready` while `init` is running on the
//! first, so one caller can drive initialization while another merely
//! observes it, without reaching for an async runtime.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::collaborators::{Clock, SyncKvStore};
use crate::config::InitOptions;
use crate::encryption;
use crate::error::{CResult, Error};
use crate::key_manager::{DeviceFingerprintInputs, KeyManager, SecureContextCheck};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadinessState {
    NotStarted,
    InProgress,
    Ready,
    Degraded,
    Failed,
}

/// Which initialization step caused a `Degraded` outcome. Recorded in full
/// (not just the first) so `can_encrypt` can ask specifically about
/// `KeyManager` rather than trusting initialization order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DegradedCause {
    KeyManager,
    Encryption,
    TokenBinding,
    AnomalyDetection,
}

impl DegradedCause {
    fn label(self) -> &'static str {
        match self {
            DegradedCause::KeyManager => "key_manager",
            DegradedCause::Encryption => "encryption",
            DegradedCause::TokenBinding => "token_binding",
            DegradedCause::AnomalyDetection => "anomaly_detection",
        }
    }
}

/// A collaborator the embedder provides to validate that outgoing
/// transactions are bound to the expected auth token. No core subsystem
/// depends on its internals; a failure here only degrades readiness.
pub trait TokenBindingCheck: Send + Sync {
    fn check(&self) -> CResult<()>;
}

/// A collaborator the embedder provides to confirm its anomaly/geo
/// heuristics (this crate doesn't implement the heuristics themselves, only
/// gates readiness on whether they loaded) loaded successfully.
pub trait AnomalyDetectionCheck: Send + Sync {
    fn check(&self) -> CResult<()>;
}

/// Always-succeeding doubles for tests and for embedders that have not
/// wired a real check yet.
pub struct AlwaysBound;
impl TokenBindingCheck for AlwaysBound {
    fn check(&self) -> CResult<()> {
        Ok(())
    }
}

pub struct AlwaysClean;
impl AnomalyDetectionCheck for AlwaysClean {
    fn check(&self) -> CResult<()> {
        Ok(())
    }
}

/// Snapshot returned by `init` and handed to `on_ready`/`on_failure`
/// callbacks. Cloned freely; holds no key material.
#[derive(Clone, Debug, PartialEq)]
pub struct InitReport {
    pub state: ReadinessState,
    pub key_manager_available: bool,
    pub degraded_causes: Vec<DegradedCause>,
    pub warnings: Vec<String>,
    pub failed_step: Option<String>,
}

impl InitReport {
    fn ready() -> Self {
        Self { state: ReadinessState::Ready, key_manager_available: true, degraded_causes: Vec::new(), warnings: Vec::new(), failed_step: None }
    }

    fn failed(step: impl Into<String>) -> Self {
        Self {
            state: ReadinessState::Failed,
            key_manager_available: false,
            degraded_causes: Vec::new(),
            warnings: Vec::new(),
            failed_step: Some(step.into()),
        }
    }
}

struct CoordinatorState {
    readiness: ReadinessState,
    report: Option<InitReport>,
}

type Callback = Arc<dyn Fn(&InitReport) + Send + Sync>;

/// `NotStarted -> InProgress -> {Ready, Degraded, Failed}`.
pub struct SecurityCoordinator {
    inner: Mutex<CoordinatorState>,
    cvar: std::sync::Condvar,
    on_ready: Mutex<Vec<Callback>>,
    on_failure: Mutex<Vec<Callback>>,
}

impl SecurityCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CoordinatorState { readiness: ReadinessState::NotStarted, report: None }),
            cvar: std::sync::Condvar::new(),
            on_ready: Mutex::new(Vec::new()),
            on_failure: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ReadinessState {
        self.inner.lock().unwrap().readiness
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ReadinessState::Ready
    }

    pub fn is_degraded(&self) -> bool {
        self.state() == ReadinessState::Degraded
    }

    pub fn is_failed(&self) -> bool {
        self.state() == ReadinessState::Failed
    }

    /// True once encryption-classified writes are safe to attempt: `Ready`
    /// outright, or `Degraded` for a reason other than KeyManager
    /// unavailability.
    pub fn can_encrypt(&self) -> bool {
        match self.inner.lock().unwrap().report.as_ref() {
            Some(r) => matches!(r.state, ReadinessState::Ready) || (r.state == ReadinessState::Degraded && r.key_manager_available),
            None => false,
        }
    }

    /// Idempotent: a second call returns the report from the first,
    /// re-running nothing. If another thread's `init` is in flight, blocks
    /// until it concludes rather than racing it.
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        &self,
        opts: &InitOptions,
        password: &str,
        fingerprint_inputs: &DeviceFingerprintInputs,
        key_manager: &KeyManager,
        secure_context: &dyn SecureContextCheck,
        token_binding: &dyn TokenBindingCheck,
        anomaly_detection: &dyn AnomalyDetectionCheck,
        sync_kv: &dyn SyncKvStore,
        clock: &dyn Clock,
    ) -> InitReport {
        {
            let mut guard = self.inner.lock().unwrap();
            match guard.readiness {
                ReadinessState::NotStarted => {
                    guard.readiness = ReadinessState::InProgress;
                }
                ReadinessState::InProgress => {
                    let guard = self.cvar.wait_while(guard, |g| g.report.is_none()).unwrap();
                    return guard.report.clone().unwrap();
                }
                _ => return guard.report.clone().unwrap(),
            }
        }
        self.cvar.notify_all();

        let report = self.run_steps(opts, password, fingerprint_inputs, key_manager, secure_context, token_binding, anomaly_detection, sync_kv, clock);

        {
            let mut guard = self.inner.lock().unwrap();
            guard.readiness = report.state;
            guard.report = Some(report.clone());
        }
        self.cvar.notify_all();
        self.dispatch(&report);
        report
    }

    #[allow(clippy::too_many_arguments)]
    fn run_steps(
        &self,
        opts: &InitOptions,
        password: &str,
        fingerprint_inputs: &DeviceFingerprintInputs,
        key_manager: &KeyManager,
        secure_context: &dyn SecureContextCheck,
        token_binding: &dyn TokenBindingCheck,
        anomaly_detection: &dyn AnomalyDetectionCheck,
        sync_kv: &dyn SyncKvStore,
        clock: &dyn Clock,
    ) -> InitReport {
        // Step 1: secure-context check.
        if let Err(err) = secure_context.check() {
            if opts.require_secure_context {
                log::error!("security coordinator: secure context check failed: {err}");
                return InitReport::failed("secure_context");
            }
            log::warn!("security coordinator: secure context check failed but require_secure_context is disabled, continuing");
        }

        let mut degraded_causes = Vec::new();
        let mut warnings = Vec::new();

        // Step 2: KeyManager.initialize_session.
        let key_manager_available = match key_manager.initialize_session(password, fingerprint_inputs, secure_context, sync_kv, clock) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("security coordinator: key manager init failed, degrading: {err}");
                degraded_causes.push(DegradedCause::KeyManager);
                warnings.push(format!("key_manager: {err}"));
                false
            }
        };

        // Step 3: encryption readiness - the classification tables are
        // static and always loaded in this port, so this can only fail if
        // the tables were emptied, which would be a packaging bug.
        if encryption::classification_tables_loaded() {
            // ready
        } else {
            log::warn!("security coordinator: encryption classification tables empty, degrading");
            degraded_causes.push(DegradedCause::Encryption);
            warnings.push("encryption: classification tables empty".to_string());
        }

        // Step 4: token-binding check.
        if let Err(err) = token_binding.check() {
            log::warn!("security coordinator: token binding check failed, degrading: {err}");
            degraded_causes.push(DegradedCause::TokenBinding);
            warnings.push(format!("token_binding: {err}"));
        }

        // Step 5: anomaly-detection readiness.
        if let Err(err) = anomaly_detection.check() {
            log::warn!("security coordinator: anomaly detection check failed, degrading: {err}");
            degraded_causes.push(DegradedCause::AnomalyDetection);
            warnings.push(format!("anomaly_detection: {err}"));
        }

        // Step 6 (optional prototype-hardening pass): no Rust analog for this
        // one — nothing to run, nothing to fail.

        if degraded_causes.is_empty() {
            InitReport::ready()
        } else {
            InitReport {
                state: ReadinessState::Degraded,
                key_manager_available,
                degraded_causes,
                warnings,
                failed_step: None,
            }
        }
    }

    fn dispatch(&self, report: &InitReport) {
        match report.state {
            ReadinessState::Ready | ReadinessState::Degraded => {
                let snapshot: Vec<Callback> = self.on_ready.lock().unwrap().clone();
                for cb in snapshot {
                    cb(report);
                }
            }
            ReadinessState::Failed => {
                let snapshot: Vec<Callback> = self.on_failure.lock().unwrap().clone();
                for cb in snapshot {
                    cb(report);
                }
            }
            ReadinessState::NotStarted | ReadinessState::InProgress => {}
        }
    }

    /// Registers `cb` to run once the coordinator reaches `Ready` or
    /// `Degraded`. If that has already happened, invokes it immediately
    /// with the existing report.
    pub fn on_ready(&self, cb: impl Fn(&InitReport) + Send + Sync + 'static) {
        let cb: Callback = Arc::new(cb);
        let existing = {
            let guard = self.inner.lock().unwrap();
            guard.report.clone().filter(|r| matches!(r.state, ReadinessState::Ready | ReadinessState::Degraded))
        };
        self.on_ready.lock().unwrap().push(cb.clone());
        if let Some(report) = existing {
            cb(&report);
        }
    }

    /// Registers `cb` to run if/when the coordinator reaches `Failed`.
    /// Invokes immediately if already failed.
    pub fn on_failure(&self, cb: impl Fn(&InitReport) + Send + Sync + 'static) {
        let cb: Callback = Arc::new(cb);
        let existing = {
            let guard = self.inner.lock().unwrap();
            guard.report.clone().filter(|r| r.state == ReadinessState::Failed)
        };
        self.on_failure.lock().unwrap().push(cb.clone());
        if let Some(report) = existing {
            cb(&report);
        }
    }

    /// Blocks the calling thread until `init` concludes (any terminal
    /// state) or `timeout_ms` elapses.
    pub fn wait_for_ready(&self, timeout_ms: u64) -> CResult<()> {
        let guard = self.inner.lock().unwrap();
        let (guard, result) = self
            .cvar
            .wait_timeout_while(guard, Duration::from_millis(timeout_ms), |g| g.report.is_none())
            .unwrap();
        if result.timed_out() {
            return Err(Error::Internal("wait_for_ready timed out".into()));
        }
        match guard.report.as_ref().unwrap().state {
            ReadinessState::Failed => Err(Error::Internal("security coordinator failed to initialize".into())),
            _ => Ok(()),
        }
    }
}

impl Default for SecurityCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DegradedCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::collaborators::{FixedClock, MemorySyncKv};
    use crate::config::{InitOptions, KeyManagerOptions};
    use crate::key_manager::AlwaysSecure;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NeverSecure;
    impl SecureContextCheck for NeverSecure {
        fn check(&self) -> CResult<()> {
            Err(Error::InsecureContext)
        }
    }

    struct AlwaysFailingTokenBinding;
    impl TokenBindingCheck for AlwaysFailingTokenBinding {
        fn check(&self) -> CResult<()> {
            Err(Error::Internal("token mismatch".into()))
        }
    }

    fn fingerprint_inputs() -> DeviceFingerprintInputs {
        DeviceFingerprintInputs { user_agent: "ua".into(), language: "en".into(), hardware_concurrency: 4, origin: "https://example.test".into() }
    }

    #[test]
    fn happy_path_reaches_ready() {
        let coordinator = SecurityCoordinator::new();
        let key_manager = KeyManager::new(KeyManagerOptions { kdf_iterations: crate::config::MIN_KDF_ITERATIONS });
        let kv = MemorySyncKv::new();
        let clock = FixedClock::new(0);

        let report = coordinator.init(&InitOptions::default(), "correct horse battery staple", &fingerprint_inputs(), &key_manager, &AlwaysSecure, &AlwaysBound, &AlwaysClean, &kv, &clock);

        assert_eq!(report.state, ReadinessState::Ready);
        assert!(coordinator.is_ready());
        assert!(coordinator.can_encrypt());
    }

    #[test]
    fn second_init_is_idempotent() {
        let coordinator = SecurityCoordinator::new();
        let key_manager = KeyManager::new(KeyManagerOptions { kdf_iterations: crate::config::MIN_KDF_ITERATIONS });
        let kv = MemorySyncKv::new();
        let clock = FixedClock::new(0);

        let first = coordinator.init(&InitOptions::default(), "correct horse battery staple", &fingerprint_inputs(), &key_manager, &AlwaysSecure, &AlwaysBound, &AlwaysClean, &kv, &clock);
        let second = coordinator.init(&InitOptions::default(), "a different password entirely", &fingerprint_inputs(), &key_manager, &AlwaysSecure, &AlwaysBound, &AlwaysClean, &kv, &clock);
        assert_eq!(first, second);
    }

    #[test]
    fn insecure_context_is_fatal_by_default() {
        let coordinator = SecurityCoordinator::new();
        let key_manager = KeyManager::new(KeyManagerOptions { kdf_iterations: crate::config::MIN_KDF_ITERATIONS });
        let kv = MemorySyncKv::new();
        let clock = FixedClock::new(0);

        let report = coordinator.init(&InitOptions::default(), "correct horse battery staple", &fingerprint_inputs(), &key_manager, &NeverSecure, &AlwaysBound, &AlwaysClean, &kv, &clock);
        assert_eq!(report.state, ReadinessState::Failed);
        assert!(coordinator.is_failed());
        assert!(!coordinator.can_encrypt());
    }

    #[test]
    fn insecure_context_is_tolerated_when_policy_disabled() {
        let coordinator = SecurityCoordinator::new();
        let key_manager = KeyManager::new(KeyManagerOptions { kdf_iterations: crate::config::MIN_KDF_ITERATIONS });
        let kv = MemorySyncKv::new();
        let clock = FixedClock::new(0);
        let opts = InitOptions { require_secure_context: false, ..InitOptions::default() };

        let report = coordinator.init(&opts, "correct horse battery staple", &fingerprint_inputs(), &key_manager, &NeverSecure, &AlwaysBound, &AlwaysClean, &kv, &clock);
        assert_eq!(report.state, ReadinessState::Ready);
    }

    #[test]
    fn key_manager_failure_degrades_and_blocks_encryption() {
        let coordinator = SecurityCoordinator::new();
        let key_manager = KeyManager::new(KeyManagerOptions { kdf_iterations: crate::config::MIN_KDF_ITERATIONS });
        let kv = MemorySyncKv::new();
        let clock = FixedClock::new(0);

        // weak password -> KeyManager::initialize_session fails.
        let report = coordinator.init(&InitOptions::default(), "short", &fingerprint_inputs(), &key_manager, &AlwaysSecure, &AlwaysBound, &AlwaysClean, &kv, &clock);
        assert_eq!(report.state, ReadinessState::Degraded);
        assert!(report.degraded_causes.contains(&DegradedCause::KeyManager));
        assert!(coordinator.is_degraded());
        assert!(!coordinator.can_encrypt());
    }

    #[test]
    fn non_key_manager_failure_degrades_but_allows_encryption() {
        let coordinator = SecurityCoordinator::new();
        let key_manager = KeyManager::new(KeyManagerOptions { kdf_iterations: crate::config::MIN_KDF_ITERATIONS });
        let kv = MemorySyncKv::new();
        let clock = FixedClock::new(0);

        let report = coordinator.init(&InitOptions::default(), "correct horse battery staple", &fingerprint_inputs(), &key_manager, &AlwaysSecure, &AlwaysFailingTokenBinding, &AlwaysClean, &kv, &clock);
        assert_eq!(report.state, ReadinessState::Degraded);
        assert_eq!(report.degraded_causes, vec![DegradedCause::TokenBinding]);
        assert!(coordinator.can_encrypt());
    }

    #[test]
    fn on_ready_fires_immediately_for_already_ready_coordinator() {
        let coordinator = SecurityCoordinator::new();
        let key_manager = KeyManager::new(KeyManagerOptions { kdf_iterations: crate::config::MIN_KDF_ITERATIONS });
        let kv = MemorySyncKv::new();
        let clock = FixedClock::new(0);
        coordinator.init(&InitOptions::default(), "correct horse battery staple", &fingerprint_inputs(), &key_manager, &AlwaysSecure, &AlwaysBound, &AlwaysClean, &kv, &clock);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        coordinator.on_ready(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn on_failure_fires_for_fatal_init() {
        let coordinator = SecurityCoordinator::new();
        let key_manager = KeyManager::new(KeyManagerOptions { kdf_iterations: crate::config::MIN_KDF_ITERATIONS });
        let kv = MemorySyncKv::new();
        let clock = FixedClock::new(0);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        coordinator.on_failure(move |report| {
            assert_eq!(report.failed_step.as_deref(), Some("secure_context"));
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        coordinator.init(&InitOptions::default(), "correct horse battery staple", &fingerprint_inputs(), &key_manager, &NeverSecure, &AlwaysBound, &AlwaysClean, &kv, &clock);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_for_ready_returns_once_init_concludes() {
        let coordinator = SecurityCoordinator::new();
        let key_manager = KeyManager::new(KeyManagerOptions { kdf_iterations: crate::config::MIN_KDF_ITERATIONS });
        let kv = MemorySyncKv::new();
        let clock = FixedClock::new(0);
        coordinator.init(&InitOptions::default(), "correct horse battery staple", &fingerprint_inputs(), &key_manager, &AlwaysSecure, &AlwaysBound, &AlwaysClean, &kv, &clock);
        assert!(coordinator.wait_for_ready(1_000).is_ok());
    }

    #[test]
    fn wait_for_ready_times_out_before_init_runs() {
        let coordinator = SecurityCoordinator::new();
        assert!(coordinator.wait_for_ready(20).is_err());
    }
}
