//! QuotaManager (C3): usage tracking, tier transitions, TOCTOU-safe write
//! reservations.
//!
//! The poll loop is an explicit `tick()` the embedder drives rather than a
//! background thread, keeping the crate single-threaded cooperative.
//! Reservations are owning `ReservationGuard`s rather than ids the caller
//! must remember to release; the 30s expiry remains only as a safety net
//! for a guard that was leaked. `write_permitted` composes the read-only
//! degraded-mode gate on top of a `QuotaStatus`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::collaborators::{Clock, EventBus, HostQuota};
use crate::error::{CResult, Error};
use crate::events::{self, EventPayload};
use crate::model::{QuotaStatus, QuotaTier, ReservationRecord, RESERVATION_EXPIRY_MS};

/// Effective percent at or above which `threshold_exceeded` fires,
/// independent of the configurable warning/critical thresholds.
pub const THRESHOLD_EXCEEDED_PERCENT: f64 = 90.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuotaManagerOptions {
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub fallback_quota_bytes: u64,
    pub poll_interval_ms: u64,
}

impl Default for QuotaManagerOptions {
    fn default() -> Self {
        Self {
            warning_threshold: 0.80,
            critical_threshold: 0.95,
            fallback_quota_bytes: 50 * 1024 * 1024,
            poll_interval_ms: 60_000,
        }
    }
}

impl QuotaManagerOptions {
    fn validate(&self) -> CResult<()> {
        if self.warning_threshold >= self.critical_threshold {
            return Err(Error::Value("warning_threshold must be < critical_threshold".into()));
        }
        Ok(())
    }
}

struct QuotaState {
    reservations: HashMap<u64, ReservationRecord>,
    next_reservation_id: u64,
    last_tier: Option<QuotaTier>,
    last_poll_ms: Option<i64>,
    notified_pending_bytes: u64,
}

struct QuotaInner {
    state: Mutex<QuotaState>,
    options: Mutex<QuotaManagerOptions>,
}

#[derive(Clone)]
pub struct QuotaManager {
    inner: Arc<QuotaInner>,
}

pub struct CheckWriteFitsOutcome {
    pub fits: bool,
    pub status: QuotaStatus,
    pub reservation: Option<ReservationGuard>,
}

/// An owning handle over a quota reservation. Dropping it releases the
/// reservation; the 30s expiry in `tick`/`check_now` is a safety net for a
/// guard that leaked past a panic or `mem::forget`, not the primary path.
pub struct ReservationGuard {
    inner: Arc<QuotaInner>,
    id: u64,
    size_bytes: u64,
}

impl ReservationGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Releases the reservation early, rather than waiting for drop.
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.reservations.remove(&self.id).is_some() {
            log::info!("released reservation {}", self.id);
        }
    }
}

impl QuotaManager {
    pub fn new(options: QuotaManagerOptions) -> CResult<Self> {
        options.validate()?;
        Ok(Self {
            inner: Arc::new(QuotaInner {
                state: Mutex::new(QuotaState {
                    reservations: HashMap::new(),
                    next_reservation_id: 1,
                    last_tier: None,
                    last_poll_ms: None,
                    notified_pending_bytes: 0,
                }),
                options: Mutex::new(options),
            }),
        })
    }

    pub fn set_warning_threshold(&self, value: f64) -> CResult<()> {
        let mut options = self.inner.options.lock().unwrap();
        let candidate = QuotaManagerOptions { warning_threshold: value, ..*options };
        candidate.validate()?;
        options.warning_threshold = value;
        Ok(())
    }

    pub fn set_critical_threshold(&self, value: f64) -> CResult<()> {
        let mut options = self.inner.options.lock().unwrap();
        let candidate = QuotaManagerOptions { critical_threshold: value, ..*options };
        candidate.validate()?;
        options.critical_threshold = value;
        Ok(())
    }

    fn gc_expired_reservations(&self, now_ms: i64) {
        let mut state = self.inner.state.lock().unwrap();
        let expired: Vec<u64> = state
            .reservations
            .iter()
            .filter(|(_, r)| now_ms - r.created_at_ms >= RESERVATION_EXPIRY_MS)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            state.reservations.remove(&id);
            log::warn!("reclaimed expired reservation {id}");
        }
    }

    fn active_reservation_bytes(&self, now_ms: i64) -> u64 {
        let state = self.inner.state.lock().unwrap();
        state
            .reservations
            .values()
            .filter(|r| now_ms - r.created_at_ms < RESERVATION_EXPIRY_MS)
            .map(|r| r.size_bytes)
            .sum()
    }

    fn tier_for(percent: f64, options: &QuotaManagerOptions) -> QuotaTier {
        if percent >= options.critical_threshold * 100.0 {
            QuotaTier::Critical
        } else if percent >= options.warning_threshold * 100.0 {
            QuotaTier::Warning
        } else {
            QuotaTier::Normal
        }
    }

    /// Registers an upcoming write's size so the *next* `check_now` /
    /// `check_write_fits` call folds it into effective usage even if that
    /// caller passes `pending_bytes = 0`. Consumed (zeroed) by the next
    /// check — this is a one-shot hint, not a standing addition to usage.
    /// Equivalent to passing `size_bytes` as `pending_bytes` directly; it
    /// exists for callers that learn of the write before they are the ones
    /// performing the next quota check (e.g. a write queued on another
    /// task).
    pub fn notify_large_write(&self, size_bytes: u64) {
        let mut state = self.inner.state.lock().unwrap();
        state.notified_pending_bytes = state.notified_pending_bytes.saturating_add(size_bytes);
    }

    /// Computes effective usage and tier, GC'ing expired reservations and
    /// publishing tier-change / threshold events along the way. Host
    /// estimate failures never propagate: they fall back to the configured
    /// default.
    pub fn check_now(
        &self,
        pending_bytes: u64,
        host: &dyn HostQuota,
        clock: &dyn Clock,
        bus: &dyn EventBus,
    ) -> QuotaStatus {
        let now_ms = clock.now_ms();
        self.gc_expired_reservations(now_ms);

        let notified = {
            let mut state = self.inner.state.lock().unwrap();
            std::mem::take(&mut state.notified_pending_bytes)
        };

        let options = *self.inner.options.lock().unwrap();
        let estimate = host.estimate().unwrap_or_else(|err| {
            log::warn!("host quota estimate unavailable, using fallback: {err}");
            crate::collaborators::QuotaEstimate { usage_bytes: 0, quota_bytes: options.fallback_quota_bytes }
        });

        let reserved = self.active_reservation_bytes(now_ms);
        let used_bytes = estimate.usage_bytes + reserved + pending_bytes + notified;
        let quota_bytes = estimate.quota_bytes.max(1);
        let percent = (used_bytes as f64 / quota_bytes as f64) * 100.0;
        let available_bytes = quota_bytes.saturating_sub(used_bytes);
        let tier = Self::tier_for(percent, &options);
        let is_blocked = tier == QuotaTier::Critical;

        let status = QuotaStatus { used_bytes, quota_bytes, percent, available_bytes, tier, is_blocked };

        self.publish_tier_change(tier, &status, bus);
        if percent >= THRESHOLD_EXCEEDED_PERCENT {
            bus.emit(events::THRESHOLD_EXCEEDED, EventPayload::ThresholdExceeded { percent }.to_value());
        }

        status
    }

    fn publish_tier_change(&self, tier: QuotaTier, status: &QuotaStatus, bus: &dyn EventBus) {
        let mut state = self.inner.state.lock().unwrap();
        let previous = state.last_tier;
        state.last_tier = Some(tier);
        drop(state);

        let Some(previous) = previous else {
            // First observation establishes the baseline silently.
            return;
        };
        if previous == tier {
            return;
        }

        let payload = EventPayload::Quota {
            percent: status.percent,
            used_bytes: status.used_bytes,
            quota_bytes: status.quota_bytes,
        }
        .to_value();
        match tier {
            QuotaTier::Normal => bus.emit(events::QUOTA_NORMAL, payload),
            QuotaTier::Warning => bus.emit(events::QUOTA_WARNING, payload),
            QuotaTier::Critical => bus.emit(events::QUOTA_CRITICAL, payload),
        }

        // Read-only mode tracks entry into / exit from `critical` specifically,
        // independent of the warning/normal churn above.
        if tier == QuotaTier::Critical && previous != QuotaTier::Critical {
            bus.emit(events::READ_ONLY_MODE, EventPayload::ReadOnlyMode { enabled: true }.to_value());
        } else if previous == QuotaTier::Critical && tier != QuotaTier::Critical {
            bus.emit(events::READ_ONLY_MODE, EventPayload::ReadOnlyMode { enabled: false }.to_value());
        }
    }

    /// Composes the read-only degraded-mode quota gate: a write is
    /// permitted when the tier is not `critical`, or when the caller already
    /// holds a reservation whose size covers it (issued before the tier
    /// became critical, since `check_write_fits` refuses to mint new
    /// reservations once critical).
    pub fn write_permitted(status: &QuotaStatus, size_bytes: u64, reservation: Option<&ReservationGuard>) -> bool {
        if status.tier != QuotaTier::Critical {
            return size_bytes <= status.available_bytes;
        }
        reservation.is_some_and(|r| r.size_bytes() >= size_bytes)
    }

    /// Returns `fits=true` iff `size` fits within available bytes and the
    /// tier is not `critical`; on success, atomically issues a reservation.
    pub fn check_write_fits(
        &self,
        size_bytes: u64,
        host: &dyn HostQuota,
        clock: &dyn Clock,
        bus: &dyn EventBus,
    ) -> CResult<CheckWriteFitsOutcome> {
        let status = self.check_now(0, host, clock, bus);
        let fits = size_bytes <= status.available_bytes && status.tier != QuotaTier::Critical;
        if !fits {
            return Ok(CheckWriteFitsOutcome { fits: false, status, reservation: None });
        }
        let reservation = self.create_reservation(size_bytes, clock);
        Ok(CheckWriteFitsOutcome { fits: true, status, reservation: Some(reservation) })
    }

    /// Low-level reservation creation, bypassing the fit check. Reservation
    /// ids are monotonically increasing.
    pub fn create_reservation(&self, size_bytes: u64, clock: &dyn Clock) -> ReservationGuard {
        let mut state = self.inner.state.lock().unwrap();
        let id = state.next_reservation_id;
        state.next_reservation_id += 1;
        state.reservations.insert(id, ReservationRecord { id, size_bytes, created_at_ms: clock.now_ms() });
        ReservationGuard { inner: self.inner.clone(), id, size_bytes }
    }

    /// Releases a reservation by id, for callers that tracked the id rather
    /// than holding the guard (e.g. across an FFI boundary). Prefer holding
    /// the `ReservationGuard` directly where possible.
    pub fn release_reservation(&self, id: u64) {
        let mut state = self.inner.state.lock().unwrap();
        if state.reservations.remove(&id).is_some() {
            log::info!("released reservation {id}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::collaborators::{FixedClock, FixedHostQuota, RecordingEventBus};

    const MB: u64 = 1024 * 1024;

    #[test]
    fn toctou_reservation_scenario() {
        let manager = QuotaManager::new(QuotaManagerOptions::default()).unwrap();
        let clock = FixedClock::new(0);
        let bus = RecordingEventBus::new();
        let host = FixedHostQuota::new(85 * MB, 100 * MB);

        let first = manager.check_write_fits(5 * MB, &host, &clock, &bus).unwrap();
        assert!(first.fits);
        let second = manager.check_write_fits(5 * MB, &host, &clock, &bus).unwrap();
        assert!(second.fits);

        let third = manager.check_write_fits(5 * MB, &host, &clock, &bus).unwrap();
        assert!(!third.fits);

        drop(first.reservation);
        let fourth = manager.check_write_fits(5 * MB, &host, &clock, &bus).unwrap();
        assert!(fourth.fits);

        drop(second.reservation);
        drop(fourth.reservation);
    }

    #[test]
    fn tier_emission_sequence() {
        let manager = QuotaManager::new(QuotaManagerOptions::default()).unwrap();
        let clock = FixedClock::new(0);
        let bus = RecordingEventBus::new();
        let host = FixedHostQuota::new(0, 100 * MB);

        for usage_mb in [50, 85, 96, 85, 50] {
            host.set_usage(usage_mb * MB);
            manager.check_now(0, &host, &clock, &bus);
        }

        let tier_topics: Vec<String> = bus
            .topics()
            .into_iter()
            .filter(|t| t == events::QUOTA_WARNING || t == events::QUOTA_CRITICAL || t == events::QUOTA_NORMAL)
            .collect();

        assert_eq!(
            tier_topics,
            vec![
                events::QUOTA_WARNING.to_string(),
                events::QUOTA_CRITICAL.to_string(),
                events::QUOTA_WARNING.to_string(),
                events::QUOTA_NORMAL.to_string(),
            ]
        );
    }

    #[test]
    fn threshold_exceeded_fires_at_90_percent() {
        let manager = QuotaManager::new(QuotaManagerOptions::default()).unwrap();
        let clock = FixedClock::new(0);
        let bus = RecordingEventBus::new();
        let host = FixedHostQuota::new(91 * MB, 100 * MB);

        manager.check_now(0, &host, &clock, &bus);
        assert!(bus.topics().contains(&events::THRESHOLD_EXCEEDED.to_string()));
    }

    #[test]
    fn release_reservation_restores_available_bytes() {
        let manager = QuotaManager::new(QuotaManagerOptions::default()).unwrap();
        let clock = FixedClock::new(0);
        let bus = RecordingEventBus::new();
        let host = FixedHostQuota::new(50 * MB, 100 * MB);

        let before = manager.check_now(0, &host, &clock, &bus);
        let outcome = manager.check_write_fits(10 * MB, &host, &clock, &bus).unwrap();
        assert!(outcome.fits);
        drop(outcome.reservation);
        let after = manager.check_now(0, &host, &clock, &bus);
        assert_eq!(before.available_bytes, after.available_bytes);
    }

    #[test]
    fn host_estimate_failure_falls_back_to_default() {
        struct FailingHost;
        impl HostQuota for FailingHost {
            fn estimate(&self) -> CResult<crate::collaborators::QuotaEstimate> {
                Err(Error::Internal("host unavailable".into()))
            }
        }

        let manager = QuotaManager::new(QuotaManagerOptions::default()).unwrap();
        let clock = FixedClock::new(0);
        let bus = RecordingEventBus::new();

        let status = manager.check_now(0, &FailingHost, &clock, &bus);
        assert_eq!(status.quota_bytes, QuotaManagerOptions::default().fallback_quota_bytes);
    }

    #[test]
    fn notify_large_write_is_consumed_by_the_next_check_only() {
        let manager = QuotaManager::new(QuotaManagerOptions::default()).unwrap();
        let clock = FixedClock::new(0);
        let bus = RecordingEventBus::new();
        let host = FixedHostQuota::new(50 * MB, 100 * MB);

        manager.notify_large_write(46 * MB);
        let first = manager.check_now(0, &host, &clock, &bus);
        assert_eq!(first.used_bytes, 96 * MB);
        assert_eq!(first.tier, QuotaTier::Critical);

        let second = manager.check_now(0, &host, &clock, &bus);
        assert_eq!(second.used_bytes, 50 * MB);
        assert_eq!(second.tier, QuotaTier::Warning);
    }

    #[test]
    fn read_only_mode_toggles_on_critical_entry_and_exit() {
        let manager = QuotaManager::new(QuotaManagerOptions::default()).unwrap();
        let clock = FixedClock::new(0);
        let bus = RecordingEventBus::new();
        let host = FixedHostQuota::new(0, 100 * MB);

        for usage_mb in [50, 96, 50] {
            host.set_usage(usage_mb * MB);
            manager.check_now(0, &host, &clock, &bus);
        }

        let read_only_topics: Vec<String> =
            bus.topics().into_iter().filter(|t| t == events::READ_ONLY_MODE).collect();
        assert_eq!(read_only_topics.len(), 2, "expected one enter and one exit");
    }

    #[test]
    fn write_permitted_blocks_plain_writes_in_critical_but_honors_covering_reservation() {
        let manager = QuotaManager::new(QuotaManagerOptions::default()).unwrap();
        let clock = FixedClock::new(0);
        let bus = RecordingEventBus::new();
        let host = FixedHostQuota::new(70 * MB, 100 * MB);

        let outcome = manager.check_write_fits(10 * MB, &host, &clock, &bus).unwrap();
        assert!(outcome.fits);
        let reservation = outcome.reservation.unwrap();

        host.set_usage(96 * MB);
        let status = manager.check_now(0, &host, &clock, &bus);
        assert_eq!(status.tier, QuotaTier::Critical);

        assert!(!QuotaManager::write_permitted(&status, 10 * MB, None));
        assert!(QuotaManager::write_permitted(&status, 10 * MB, Some(&reservation)));
        assert!(!QuotaManager::write_permitted(&status, 20 * MB, Some(&reservation)));
    }

    #[test]
    fn threshold_setters_reject_violations() {
        let manager = QuotaManager::new(QuotaManagerOptions::default()).unwrap();
        assert!(manager.set_warning_threshold(0.99).is_err());
        assert!(manager.set_critical_threshold(0.5).is_err());
    }

    #[test]
    fn expired_reservations_are_reclaimed() {
        let manager = QuotaManager::new(QuotaManagerOptions::default()).unwrap();
        let clock = FixedClock::new(0);
        let bus = RecordingEventBus::new();
        let host = FixedHostQuota::new(50 * MB, 100 * MB);

        let outcome = manager.check_write_fits(5 * MB, &host, &clock, &bus).unwrap();
        let guard = outcome.reservation.unwrap();
        std::mem::forget(guard); // simulate a leaked guard

        clock.advance(31_000);
        let status = manager.check_now(0, &host, &clock, &bus);
        assert_eq!(status.used_bytes, 50 * MB);
    }
}
