//! OperationLock + PriorityLockManager (C8).
//!
//! Lock priority is `LockPriority::{Low,Normal,High,Critical} = {25,50,75,100}`,
//! so the preemption-margin comparison is plain integer arithmetic rather
//! than a lookup table.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::collaborators::{Clock, SyncKvStore};
use crate::error::{CResult, Error};
use crate::model::LockPriority;

/// An acquirer whose priority exceeds the current holder's by more than this
/// margin may force-release and re-acquire.
pub const PREEMPTION_MARGIN: i32 = 20;

/// Retry attempts for a non-preempting, blocked acquirer before `LockBusy`.
pub const MAX_ACQUIRE_ATTEMPTS: u32 = 5;

/// Linear backoff step between retry attempts.
pub const BACKOFF_STEP_MS: u64 = 5;

/// Default acquisition timeout.
pub const DEFAULT_TIMEOUT_MS: i64 = 30_000;

#[derive(Clone, Debug, PartialEq, Eq)]
struct Holder {
    lock_id: String,
    priority: LockPriority,
    acquired_at_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockStatus {
    pub is_locked: bool,
    pub priority: Option<LockPriority>,
}

pub struct PriorityLockManager {
    locks: Mutex<HashMap<String, Holder>>,
    next_id: Mutex<u64>,
}

impl PriorityLockManager {
    pub fn new() -> Self {
        Self { locks: Mutex::new(HashMap::new()), next_id: Mutex::new(1) }
    }

    fn new_lock_id(&self) -> String {
        let mut next = self.next_id.lock().unwrap();
        let id = *next;
        *next += 1;
        format!("lock-{id}")
    }

    /// Publishes the holder's priority to the cross-tab sync-kv surface so
    /// other tabs can see it without consulting this in-process manager —
    /// the sync store is the authoritative priority map.
    fn publish_priority(&self, sync_kv: &dyn SyncKvStore, name: &str, holder: Option<&Holder>) {
        let key = format!("lock_priority:{name}");
        let result = match holder {
            Some(h) => sync_kv.set(&key, &(h.priority as i32).to_string()),
            None => sync_kv.delete(&key),
        };
        if let Err(err) = result {
            log::warn!("failed to publish lock priority for {name}: {err}");
        }
    }

    pub fn acquire(
        &self,
        name: &str,
        priority: LockPriority,
        timeout_ms: i64,
        clock: &dyn Clock,
        sync_kv: &dyn SyncKvStore,
    ) -> CResult<String> {
        let start = clock.now_ms();
        let mut attempt: u32 = 0;

        loop {
            let mut locks = self.locks.lock().unwrap();
            match locks.get(name).cloned() {
                None => {
                    let lock_id = self.new_lock_id();
                    let holder = Holder { lock_id: lock_id.clone(), priority, acquired_at_ms: clock.now_ms() };
                    locks.insert(name.to_string(), holder.clone());
                    drop(locks);
                    self.publish_priority(sync_kv, name, Some(&holder));
                    return Ok(lock_id);
                }
                Some(holder) => {
                    if priority.value() - holder.priority.value() > PREEMPTION_MARGIN {
                        log::warn!(
                            "preempting lock {name}: incoming priority {:?} exceeds holder {:?} by more than {PREEMPTION_MARGIN}",
                            priority, holder.priority
                        );
                        locks.remove(name);
                        drop(locks);
                        self.publish_priority(sync_kv, name, None);
                        continue;
                    }
                }
            }
            drop(locks);

            if clock.now_ms() - start >= timeout_ms {
                return Err(Error::LockTimeout { name: name.to_string() });
            }
            attempt += 1;
            if attempt > MAX_ACQUIRE_ATTEMPTS {
                return Err(Error::LockBusy { name: name.to_string() });
            }
            std::thread::sleep(Duration::from_millis(BACKOFF_STEP_MS * attempt as u64));
        }
    }

    /// Releasing with a stale lock id is a no-op, but logged.
    pub fn release(&self, name: &str, lock_id: &str, sync_kv: &dyn SyncKvStore) {
        let mut locks = self.locks.lock().unwrap();
        match locks.get(name) {
            Some(holder) if holder.lock_id == lock_id => {
                locks.remove(name);
                drop(locks);
                self.publish_priority(sync_kv, name, None);
            }
            Some(_) => {
                log::warn!("release of stale lock id {lock_id} for {name} ignored");
            }
            None => {
                log::warn!("release of {lock_id} for unheld lock {name} ignored");
            }
        }
    }

    /// Force-release always succeeds and stamps a reason in the log.
    pub fn force_release(&self, name: &str, reason: &str, sync_kv: &dyn SyncKvStore) {
        let mut locks = self.locks.lock().unwrap();
        if locks.remove(name).is_some() {
            drop(locks);
            self.publish_priority(sync_kv, name, None);
        }
        log::warn!("force-released lock {name}: {reason}");
    }

    pub fn status(&self, name: &str) -> LockStatus {
        match self.locks.lock().unwrap().get(name) {
            Some(holder) => LockStatus { is_locked: true, priority: Some(holder.priority) },
            None => LockStatus { is_locked: false, priority: None },
        }
    }
}

impl Default for PriorityLockManager {
    fn default() -> Self {
        Self::new()
    }
}
