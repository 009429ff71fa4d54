//! Integration test driving SecurityCoordinator's bring-up sequence across
//! real collaborators (KeyManager, QuotaManager, CompensationLogger) rather
//! than the single-module doubles used in each unit's own tests, mirroring
//! `kv-cli/tests/cli.rs`'s role as the cross-crate check.

use storage_core::collaborators::{FixedClock, FixedHostQuota, MemoryIndexedStore, MemorySyncKv, RecordingEventBus};
use storage_core::compensation::CompensationLogger;
use storage_core::config::{InitOptions, KeyManagerOptions, MIN_KDF_ITERATIONS};
use storage_core::key_manager::{AlwaysSecure, DeviceFingerprintInputs, KeyManager};
use storage_core::quota::{QuotaManager, QuotaManagerOptions};
use storage_core::security_coordinator::{AlwaysBound, AlwaysClean, ReadinessState, SecurityCoordinator};
use std::sync::Arc;

fn fingerprint() -> DeviceFingerprintInputs {
    DeviceFingerprintInputs {
        user_agent: "integration-test-agent".into(),
        language: "en-US".into(),
        hardware_concurrency: 8,
        origin: "https://app.example.test".into(),
    }
}

#[test]
fn bring_up_wires_key_manager_quota_and_compensation() {
    let coordinator = SecurityCoordinator::new();
    let key_manager = KeyManager::new(KeyManagerOptions { kdf_iterations: MIN_KDF_ITERATIONS });
    let sync_kv = MemorySyncKv::new();
    let clock = FixedClock::new(0);

    let report = coordinator.init(
        &InitOptions::default(),
        "correct horse battery staple",
        &fingerprint(),
        &key_manager,
        &AlwaysSecure,
        &AlwaysBound,
        &AlwaysClean,
        &sync_kv,
        &clock,
    );
    assert_eq!(report.state, ReadinessState::Ready);
    assert!(coordinator.can_encrypt());
    assert!(key_manager.is_session_active());

    // Once the coordinator is ready, the key manager it brought up can serve
    // a data key for encrypted writes, and the quota/compensation layers it
    // gates are independently usable.
    let data_key = key_manager.get_data_key().expect("session active after Ready");
    let envelope = storage_core::encryption::encrypt(b"token", &data_key, 1, &clock).unwrap();
    assert!(envelope.encrypted);

    let indexed = Arc::new(MemoryIndexedStore::new());
    let comp_sync_kv = Arc::new(MemorySyncKv::new());
    let logger = CompensationLogger::new(indexed, comp_sync_kv);
    assert!(logger.get_all_logs().is_empty());

    let quota = QuotaManager::new(QuotaManagerOptions::default()).unwrap();
    let host = FixedHostQuota::new(0, 1_000_000);
    let bus = RecordingEventBus::new();
    let status = quota.check_now(0, &host, &clock, &bus);
    assert!(!status.is_blocked);
}

#[test]
fn bring_up_degrades_without_blocking_quota_or_compensation() {
    let coordinator = SecurityCoordinator::new();
    // Weak password fails KeyManager::initialize_session, degrading the
    // coordinator, but sibling subsystems that do not depend on key
    // material keep working per the "degraded is not down" rule.
    let key_manager = KeyManager::new(KeyManagerOptions { kdf_iterations: MIN_KDF_ITERATIONS });
    let sync_kv = MemorySyncKv::new();
    let clock = FixedClock::new(0);

    let report = coordinator.init(
        &InitOptions::default(),
        "short",
        &fingerprint(),
        &key_manager,
        &AlwaysSecure,
        &AlwaysBound,
        &AlwaysClean,
        &sync_kv,
        &clock,
    );
    assert_eq!(report.state, ReadinessState::Degraded);
    assert!(!coordinator.can_encrypt());
    assert!(!key_manager.is_session_active());

    let quota = QuotaManager::new(QuotaManagerOptions::default()).unwrap();
    let host = FixedHostQuota::new(500_000, 1_000_000);
    let bus = RecordingEventBus::new();
    let status = quota.check_now(0, &host, &clock, &bus);
    assert!(!status.is_blocked);
}
