//! ContextAwareRecovery (C9): classifies errors, selects a recovery
//! strategy, and executes it under a priority lock.
//!
//! `RecoveryStrategy` is a closed enum rather than a runtime-mutable map:
//! the error→strategy table is deterministic by design, so a `match` gives
//! that for free plus exhaustiveness checking when a new `ErrorKind` is
//! added.

use std::sync::Mutex;

use crate::collaborators::{Clock, EventBus, SyncKvStore};
use crate::error::{CResult, Error, Severity};
use crate::events::{self, EventPayload};
use crate::lock::{PriorityLockManager, DEFAULT_TIMEOUT_MS};
use crate::model::LockPriority;

/// Coarse classification of the failures this engine knows how to recover
/// from. Distinct from `error::Error`: several `Error` variants can map to
/// the same `ErrorKind` (e.g. any lock failure maps to `LockContention`),
/// and some `ErrorKind`s (network, worker-crash) have no direct `Error`
/// counterpart because they originate outside this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    AuthExpired,
    StorageFull,
    NetworkFailure,
    LockContention,
    WorkerCrashed,
    TransientIo,
    GeographicLockout,
    /// The secure-context check (HTTPS/TLS origin) failed after session
    /// bring-up, not just at `SecurityCoordinator::init`.
    SecureContextLost,
    /// The token-binding check rejected the current session token.
    TokenBindingFailure,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryStrategy {
    RefreshToken,
    CleanupStorage,
    AdaptiveRetry,
    ImmediateRetry,
    WaitAndRetry,
    RestartWorker,
    RetryOperation,
    LogAndContinue,
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RecoveryStrategy::RefreshToken => "refresh_token",
            RecoveryStrategy::CleanupStorage => "cleanup_storage",
            RecoveryStrategy::AdaptiveRetry => "adaptive_retry",
            RecoveryStrategy::ImmediateRetry => "immediate_retry",
            RecoveryStrategy::WaitAndRetry => "wait_and_retry",
            RecoveryStrategy::RestartWorker => "restart_worker",
            RecoveryStrategy::RetryOperation => "retry_operation",
            RecoveryStrategy::LogAndContinue => "log_and_continue",
        };
        write!(f, "{label}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkQuality {
    Good,
    Fair,
    Poor,
}

impl NetworkQuality {
    /// Adaptive per-attempt delay multiplier: ×1 / ×1.5 / ×3.
    fn delay_multiplier(self) -> f64 {
        match self {
            NetworkQuality::Good => 1.0,
            NetworkQuality::Fair => 1.5,
            NetworkQuality::Poor => 3.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceClass {
    Desktop,
    Mobile,
    LowPower,
}

/// Context that modifies a selected strategy's timing parameters and
/// required lock name, without changing which strategy is chosen.
#[derive(Clone, Debug)]
pub struct RecoveryContext {
    pub network_quality: NetworkQuality,
    pub user_intent: Option<String>,
    pub background: bool,
    pub device_class: DeviceClass,
}

impl Default for RecoveryContext {
    fn default() -> Self {
        Self { network_quality: NetworkQuality::Good, user_intent: None, background: false, device_class: DeviceClass::Desktop }
    }
}

/// Default retry budget.
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Base per-attempt delay before the network-quality multiplier is applied.
pub const BASE_ADAPTIVE_DELAY_MS: u64 = 200;

#[derive(Clone, Debug)]
pub struct StrategyPlan {
    pub strategy: RecoveryStrategy,
    pub priority: LockPriority,
    pub required_lock: Option<String>,
    pub retry_count: u32,
    pub adaptive_delay_ms: u64,
}

/// Process-wide (here: per-`CoreContext`) app-state snapshot: view mode,
/// data state, user intent, operation-in-progress, last error, network
/// quality, device type, background flag, memory pressure.
#[derive(Clone, Debug)]
pub struct AppStateSnapshot {
    pub view_mode: String,
    pub data_state: String,
    pub user_intent: Option<String>,
    pub operation_in_progress: bool,
    pub last_error: Option<String>,
    pub network_quality: NetworkQuality,
    pub device_type: DeviceClass,
    pub background: bool,
    pub memory_pressure: bool,
}

impl Default for AppStateSnapshot {
    fn default() -> Self {
        Self {
            view_mode: "default".into(),
            data_state: "idle".into(),
            user_intent: None,
            operation_in_progress: false,
            last_error: None,
            network_quality: NetworkQuality::Good,
            device_type: DeviceClass::Desktop,
            background: false,
            memory_pressure: false,
        }
    }
}

/// Owns the app-state snapshot behind a `Mutex` rather than a process-wide
/// singleton, updated by the observer subscriptions `start_monitoring` sets
/// up.
pub struct AppStateHandle {
    state: Mutex<AppStateSnapshot>,
}

impl AppStateHandle {
    pub fn new() -> Self {
        Self { state: Mutex::new(AppStateSnapshot::default()) }
    }

    pub fn snapshot(&self) -> AppStateSnapshot {
        self.state.lock().unwrap().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut AppStateSnapshot)) {
        f(&mut self.state.lock().unwrap());
    }
}

impl Default for AppStateHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Optional handlers for the non-retry strategies. A strategy whose handler
/// is `None` fails `execute` with `RecoveryHandlerMissing` rather than being
/// silently skipped — a missing handler is a wiring bug, not something to
/// guess around.
#[derive(Default)]
pub struct RecoveryHandlers<'a> {
    pub refresh_token: Option<&'a mut dyn FnMut() -> CResult<()>>,
    pub cleanup_storage: Option<&'a mut dyn FnMut() -> CResult<()>>,
    pub restart_worker: Option<&'a mut dyn FnMut() -> CResult<()>>,
}

/// A recovery error wraps the underlying failure with the path that was
/// attempted and a user-facing severity for surfacing to the caller.
#[derive(Debug)]
pub struct RecoveryError {
    pub recovery_path: RecoveryStrategy,
    pub severity: Severity,
    pub cause: Error,
}

impl std::fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "recovery via {} ({}) failed: {}", self.recovery_path, self.severity, self.cause)
    }
}

impl std::error::Error for RecoveryError {}

fn severity_for(kind: ErrorKind) -> Severity {
    match kind {
        ErrorKind::SecureContextLost | ErrorKind::TokenBindingFailure => Severity::Critical,
        ErrorKind::GeographicLockout | ErrorKind::AuthExpired => Severity::High,
        _ => Severity::Medium,
    }
}

/// Selects a strategy for `kind`, deterministically. `context`, when
/// present, only adjusts `retry_count`/`adaptive_delay_ms`/`required_lock`
/// — never which strategy is chosen.
pub fn select_strategy(kind: ErrorKind, context: Option<&RecoveryContext>) -> StrategyPlan {
    let (strategy, priority, required_lock) = match kind {
        ErrorKind::AuthExpired => (RecoveryStrategy::RefreshToken, LockPriority::High, Some("auth".to_string())),
        ErrorKind::StorageFull => (RecoveryStrategy::CleanupStorage, LockPriority::Normal, Some("storage_cleanup".to_string())),
        ErrorKind::NetworkFailure => (RecoveryStrategy::AdaptiveRetry, LockPriority::Normal, None),
        ErrorKind::LockContention => (RecoveryStrategy::WaitAndRetry, LockPriority::Low, None),
        ErrorKind::WorkerCrashed => (RecoveryStrategy::RestartWorker, LockPriority::Critical, Some("worker".to_string())),
        ErrorKind::TransientIo => (RecoveryStrategy::ImmediateRetry, LockPriority::Normal, None),
        ErrorKind::GeographicLockout => (RecoveryStrategy::LogAndContinue, LockPriority::Low, None),
        ErrorKind::TokenBindingFailure => (RecoveryStrategy::RefreshToken, LockPriority::Critical, Some("auth".to_string())),
        ErrorKind::SecureContextLost => (RecoveryStrategy::LogAndContinue, LockPriority::Critical, None),
        ErrorKind::Unknown => (RecoveryStrategy::RetryOperation, LockPriority::Normal, None),
    };

    let network_quality = context.map(|c| c.network_quality).unwrap_or(NetworkQuality::Good);
    let adaptive_delay_ms = (BASE_ADAPTIVE_DELAY_MS as f64 * network_quality.delay_multiplier()) as u64;

    StrategyPlan { strategy, priority, required_lock, retry_count: DEFAULT_RETRY_COUNT, adaptive_delay_ms }
}

/// Wraps `cause` with a `recovery_path` tag and user-facing severity so the
/// caller gets a classified, not just a raw, error.
pub fn classify(kind: ErrorKind, plan: &StrategyPlan, cause: Error) -> RecoveryError {
    RecoveryError { recovery_path: plan.strategy, severity: severity_for(kind), cause }
}

pub struct ContextAwareRecovery {
    app_state: AppStateHandle,
}

impl ContextAwareRecovery {
    pub fn new() -> Self {
        Self { app_state: AppStateHandle::new() }
    }

    pub fn app_state(&self) -> AppStateSnapshot {
        self.app_state.snapshot()
    }

    /// Subscribes to the incoming event topics, updating the app-state
    /// snapshot as they arrive. Returns the unsubscribe handles so the
    /// embedder can tear monitoring down.
    pub fn start_monitoring(self: &std::sync::Arc<Self>, bus: &dyn EventBus) -> Vec<crate::collaborators::Unsubscribe> {
        let mut unsubscribes = Vec::new();

        let this = self.clone();
        unsubscribes.push(bus.on(events::UI_VIEW_CHANGED, Box::new(move |payload| {
            if let Some(mode) = payload.get("viewMode").and_then(|v| v.as_str()) {
                this.app_state.update(|s| s.view_mode = mode.to_string());
            }
        })));

        let this = self.clone();
        unsubscribes.push(bus.on(events::DATA_STATE_CHANGED, Box::new(move |payload| {
            if let Some(state) = payload.get("dataState").and_then(|v| v.as_str()) {
                this.app_state.update(|s| s.data_state = state.to_string());
            }
        })));

        let this = self.clone();
        unsubscribes.push(bus.on(events::USER_INTENT_DETECTED, Box::new(move |payload| {
            let intent = payload.get("intent").and_then(|v| v.as_str()).map(str::to_string);
            this.app_state.update(|s| s.user_intent = intent);
        })));

        let this = self.clone();
        unsubscribes.push(bus.on(events::STORAGE_ERROR, Box::new(move |payload| {
            let error = payload.get("error").and_then(|v| v.as_str()).map(str::to_string);
            this.app_state.update(|s| s.last_error = error);
        })));

        let this = self.clone();
        unsubscribes.push(bus.on(events::STORAGE_CONNECTION_FAILED, Box::new(move |_payload| {
            this.app_state.update(|s| s.last_error = Some("connection_failed".to_string()));
        })));

        unsubscribes
    }

    /// Acquires `required_lock` at the plan's priority (if any), updates
    /// `operation_in_progress`, dispatches on the strategy, and releases
    /// the lock on every exit path.
    #[allow(clippy::too_many_arguments)]
    pub fn execute(
        &self,
        kind: ErrorKind,
        plan: StrategyPlan,
        mut operation: Option<&mut dyn FnMut() -> CResult<()>>,
        handlers: RecoveryHandlers<'_>,
        locks: &PriorityLockManager,
        clock: &dyn Clock,
        sync_kv: &dyn SyncKvStore,
        bus: &dyn EventBus,
    ) -> Result<(), RecoveryError> {
        let lock_id = match &plan.required_lock {
            Some(name) => match locks.acquire(name, plan.priority, DEFAULT_TIMEOUT_MS, clock, sync_kv) {
                Ok(id) => Some(id),
                Err(err) => return Err(classify(kind, &plan, err)),
            },
            None => None,
        };

        self.app_state.update(|s| s.operation_in_progress = true);
        bus.emit(
            events::RECOVERY_CONTEXT_CHANGED,
            EventPayload::RecoveryContextChanged { strategy: plan.strategy.to_string() }.to_value(),
        );

        let result = self.dispatch(kind, &plan, &mut operation, handlers);

        self.app_state.update(|s| {
            s.operation_in_progress = false;
            if let Err(ref err) = result {
                s.last_error = Some(err.to_string());
            }
        });

        if let Some(name) = &plan.required_lock {
            locks.release(name, &lock_id.unwrap_or_default(), sync_kv);
        }

        result
    }

    fn dispatch(
        &self,
        kind: ErrorKind,
        plan: &StrategyPlan,
        operation: &mut Option<&mut dyn FnMut() -> CResult<()>>,
        mut handlers: RecoveryHandlers<'_>,
    ) -> Result<(), RecoveryError> {
        match plan.strategy {
            RecoveryStrategy::ImmediateRetry => self.retry_loop(kind, plan, operation, 0),
            RecoveryStrategy::AdaptiveRetry => self.retry_loop(kind, plan, operation, plan.adaptive_delay_ms),
            RecoveryStrategy::WaitAndRetry => self.retry_loop(kind, plan, operation, plan.adaptive_delay_ms),
            RecoveryStrategy::RetryOperation => self.retry_loop(kind, plan, operation, plan.adaptive_delay_ms),
            RecoveryStrategy::RefreshToken => Self::run_handler(kind, plan, handlers.refresh_token.take()),
            RecoveryStrategy::CleanupStorage => Self::run_handler(kind, plan, handlers.cleanup_storage.take()),
            RecoveryStrategy::RestartWorker => Self::run_handler(kind, plan, handlers.restart_worker.take()),
            RecoveryStrategy::LogAndContinue => {
                log::info!("recovery: log_and_continue for {kind:?}");
                Ok(())
            }
        }
    }

    fn run_handler(kind: ErrorKind, plan: &StrategyPlan, handler: Option<&mut dyn FnMut() -> CResult<()>>) -> Result<(), RecoveryError> {
        match handler {
            Some(f) => f().map_err(|err| classify(kind, plan, err)),
            None => Err(classify(kind, plan, Error::RecoveryHandlerMissing(plan.strategy.to_string()))),
        }
    }

    fn retry_loop(
        &self,
        kind: ErrorKind,
        plan: &StrategyPlan,
        operation: &mut Option<&mut dyn FnMut() -> CResult<()>>,
        per_attempt_delay_ms: u64,
    ) -> Result<(), RecoveryError> {
        let Some(operation) = operation.as_mut() else {
            return Err(classify(kind, plan, Error::RecoveryHandlerMissing(plan.strategy.to_string())));
        };

        let mut last_error = None;
        for attempt in 0..plan.retry_count.max(1) {
            match operation() {
                Ok(()) => return Ok(()),
                Err(err) => {
                    log::warn!("recovery attempt {} via {} failed: {err}", attempt + 1, plan.strategy);
                    last_error = Some(err);
                    if per_attempt_delay_ms > 0 {
                        std::thread::sleep(std::time::Duration::from_millis(per_attempt_delay_ms));
                    }
                }
            }
        }
        Err(classify(kind, plan, last_error.unwrap_or(Error::Internal("retry exhausted with no recorded error".into()))))
    }
}

impl Default for ContextAwareRecovery {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::collaborators::{FixedClock, MemorySyncKv, RecordingEventBus};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn select_strategy_is_deterministic() {
        let plan1 = select_strategy(ErrorKind::StorageFull, None);
        let plan2 = select_strategy(ErrorKind::StorageFull, None);
        assert_eq!(plan1.strategy, RecoveryStrategy::CleanupStorage);
        assert_eq!(plan1.strategy, plan2.strategy);
        assert_eq!(plan1.required_lock, Some("storage_cleanup".to_string()));
    }

    #[test]
    fn severity_reserves_critical_for_secure_context_and_token_binding() {
        let plan = select_strategy(ErrorKind::SecureContextLost, None);
        let err = classify(ErrorKind::SecureContextLost, &plan, Error::InsecureContext);
        assert_eq!(err.severity, Severity::Critical);

        let plan = select_strategy(ErrorKind::TokenBindingFailure, None);
        let err = classify(ErrorKind::TokenBindingFailure, &plan, Error::InsecureContext);
        assert_eq!(err.severity, Severity::Critical);
    }

    #[test]
    fn worker_crash_is_medium_severity_not_critical() {
        let plan = select_strategy(ErrorKind::WorkerCrashed, None);
        let err = classify(ErrorKind::WorkerCrashed, &plan, Error::Internal("worker down".into()));
        assert_eq!(err.severity, Severity::Medium);
        assert_eq!(plan.strategy, RecoveryStrategy::RestartWorker);
    }

    #[test]
    fn adaptive_delay_scales_with_network_quality() {
        let poor = select_strategy(ErrorKind::NetworkFailure, Some(&RecoveryContext { network_quality: NetworkQuality::Poor, ..Default::default() }));
        let good = select_strategy(ErrorKind::NetworkFailure, Some(&RecoveryContext { network_quality: NetworkQuality::Good, ..Default::default() }));
        assert_eq!(poor.adaptive_delay_ms, good.adaptive_delay_ms * 3);
    }

    #[test]
    fn immediate_retry_succeeds_without_handler_registration() {
        let recovery = ContextAwareRecovery::new();
        let locks = PriorityLockManager::new();
        let clock = FixedClock::new(0);
        let kv = MemorySyncKv::new();
        let bus = RecordingEventBus::new();

        let attempts = AtomicU32::new(0);
        let mut op = || -> CResult<()> {
            if attempts.fetch_add(1, Ordering::SeqCst) < 1 {
                Err(Error::Internal("transient".into()))
            } else {
                Ok(())
            }
        };

        let plan = select_strategy(ErrorKind::TransientIo, None);
        let result = recovery.execute(ErrorKind::TransientIo, plan, Some(&mut op), RecoveryHandlers::default(), &locks, &clock, &kv, &bus);
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn missing_handler_fails_with_recovery_handler_missing() {
        let recovery = ContextAwareRecovery::new();
        let locks = PriorityLockManager::new();
        let clock = FixedClock::new(0);
        let kv = MemorySyncKv::new();
        let bus = RecordingEventBus::new();

        let plan = select_strategy(ErrorKind::WorkerCrashed, None);
        let result = recovery.execute(ErrorKind::WorkerCrashed, plan, None, RecoveryHandlers::default(), &locks, &clock, &kv, &bus);
        assert!(matches!(result.unwrap_err().cause, Error::RecoveryHandlerMissing(_)));
    }

    #[test]
    fn execute_releases_lock_on_handler_failure() {
        let recovery = ContextAwareRecovery::new();
        let locks = PriorityLockManager::new();
        let clock = FixedClock::new(0);
        let kv = MemorySyncKv::new();
        let bus = RecordingEventBus::new();

        let mut cleanup = || -> CResult<()> { Err(Error::Internal("cleanup failed".into())) };
        let handlers = RecoveryHandlers { cleanup_storage: Some(&mut cleanup), ..Default::default() };

        let plan = select_strategy(ErrorKind::StorageFull, None);
        let required_lock = plan.required_lock.clone().unwrap();
        let result = recovery.execute(ErrorKind::StorageFull, plan, None, handlers, &locks, &clock, &kv, &bus);
        assert!(result.is_err());
        assert!(!locks.status(&required_lock).is_locked);
    }

    #[test]
    fn start_monitoring_updates_app_state_from_incoming_events() {
        let recovery = Arc::new(ContextAwareRecovery::new());
        let bus = RecordingEventBus::new();
        let _subs = recovery.start_monitoring(&bus);

        bus.emit(events::UI_VIEW_CHANGED, serde_json::json!({ "viewMode": "settings" }));
        bus.emit(events::USER_INTENT_DETECTED, serde_json::json!({ "intent": "export_data" }));

        let snapshot = recovery.app_state();
        assert_eq!(snapshot.view_mode, "settings");
        assert_eq!(snapshot.user_intent, Some("export_data".to_string()));
    }
}
