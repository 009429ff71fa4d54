//! ArchiveService (C7): age-based move of records between a live set and an
//! archive set, invoked by quota handlers or an operator CLI.
//!
//! Implementing `Resource` itself is not required: this service *issues* a
//! transaction through C6 instead, queuing the live-set deletes and the
//! archive-blob rewrite as two `IndexedStoreResource`s in one
//! `TwoPhaseCommitCoordinator::run`, so the live and archive sets are never
//! jointly inconsistent. A sync-kv-backed archive namespace would sit
//! outside that transaction's atomic set and break the guarantee, so this
//! service keeps the archive blob in the indexed store under a reserved
//! store name instead (same external JSON shape, same key) — noted in
//! DESIGN.md.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Datelike, TimeZone, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::collaborators::{Clock, EventBus, IndexedStore};
use crate::coordinator::TwoPhaseCommitCoordinator;
use crate::error::{CResult, Error};
use crate::events::{self, EventPayload};
use crate::resources::IndexedStoreResource;

/// Most-recent items retained regardless of cutoff.
pub const DEFAULT_RETAIN_FLOOR: usize = 100;

/// Field every archivable live record must carry.
pub const TIMESTAMP_FIELD: &str = "timestamp_ms";

const ARCHIVE_KEY_FIELD: &str = "__archive_key__";
const ARCHIVE_PAYLOAD_FIELD: &str = "__payload__";
const ARCHIVE_BLOB_KEY: &[u8] = b"archive";

/// 2000-01-01T00:00:00Z in epoch milliseconds.
const MIN_VALID_TIMESTAMP_MS: i64 = 946_684_800_000;

/// Restore aborts if more than this fraction of archived entries fail
/// integrity validation.
const INTEGRITY_FAILURE_RATIO: f64 = 0.10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArchiveOptions {
    pub retain_floor: usize,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self { retain_floor: DEFAULT_RETAIN_FLOOR }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ArchiveBlob {
    streams: Vec<serde_json::Value>,
    last_archive_date: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArchiveOldReport {
    pub archived: usize,
    pub kept: usize,
    pub bytes_saved: u64,
    pub oldest: Option<i64>,
    pub newest: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub remaining: usize,
    pub filtered_count: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArchiveStats {
    pub live_count: usize,
    pub archived_count: usize,
    pub last_archive_date: Option<String>,
    pub oldest_archived: Option<i64>,
    pub newest_archived: Option<i64>,
}

pub struct ArchiveService {
    indexed: Arc<dyn IndexedStore>,
    coordinator: Arc<TwoPhaseCommitCoordinator>,
    live_store: String,
    archive_store: String,
    options: ArchiveOptions,
}

impl ArchiveService {
    pub fn new(
        indexed: Arc<dyn IndexedStore>,
        coordinator: Arc<TwoPhaseCommitCoordinator>,
        live_store: impl Into<String>,
        archive_store: impl Into<String>,
        options: ArchiveOptions,
    ) -> Self {
        Self { indexed, coordinator, live_store: live_store.into(), archive_store: archive_store.into(), options }
    }

    fn read_archive_blob(&self) -> CResult<ArchiveBlob> {
        match self.indexed.get(&self.archive_store, ARCHIVE_BLOB_KEY)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(ArchiveBlob::default()),
        }
    }

    fn extract_timestamp(raw_value: &[u8]) -> Option<i64> {
        let value: serde_json::Value = serde_json::from_slice(raw_value).ok()?;
        value.get(TIMESTAMP_FIELD)?.as_i64()
    }

    fn to_archive_entry(key: &[u8], timestamp_ms: i64, raw_value: &[u8]) -> serde_json::Value {
        let payload: serde_json::Value = serde_json::from_slice(raw_value).unwrap_or(serde_json::Value::Null);
        serde_json::json!({
            ARCHIVE_KEY_FIELD: BASE64.encode(key),
            TIMESTAMP_FIELD: timestamp_ms,
            ARCHIVE_PAYLOAD_FIELD: payload,
        })
    }

    fn validate_entry(entry: &serde_json::Value, max_ts: i64) -> Option<i64> {
        let obj = entry.as_object()?;
        let ts = obj.get(TIMESTAMP_FIELD)?.as_i64()?;
        if ts < MIN_VALID_TIMESTAMP_MS || ts > max_ts {
            return None;
        }
        Some(ts)
    }

    fn max_valid_timestamp_ms(clock: &dyn Clock) -> i64 {
        let now = Utc.timestamp_millis_opt(clock.now_ms()).single().unwrap_or_else(Utc::now);
        Utc.with_ymd_and_hms(now.year() + 1, 1, 1, 0, 0, 0).single().map(|dt| dt.timestamp_millis()).unwrap_or(i64::MAX)
    }

    /// Moves items with `timestamp_ms < cutoff_ms` out of the live store and
    /// into the archive blob, retaining the `retain_floor` most recent items
    /// unconditionally. `dry_run` computes the report without writing.
    pub fn archive_old(&self, cutoff_ms: i64, dry_run: bool, clock: &dyn Clock, bus: &dyn EventBus) -> CResult<ArchiveOldReport> {
        let records = self.indexed.get_all(&self.live_store)?;
        let mut dated: Vec<_> = records
            .into_iter()
            .map(|record| {
                // Unparseable timestamps fail safe toward "never archive": treat as newest.
                let ts = Self::extract_timestamp(&record.value).unwrap_or(i64::MAX);
                (record, ts)
            })
            .collect();
        dated.sort_by(|a, b| b.1.cmp(&a.1));

        let floor = self.options.retain_floor;
        let mut archived = Vec::new();
        let mut kept = 0usize;
        for (idx, (record, ts)) in dated.into_iter().enumerate() {
            if idx < floor || ts >= cutoff_ms {
                kept += 1;
            } else {
                archived.push((record, ts));
            }
        }

        let oldest = archived.iter().map(|(_, ts)| *ts).min();
        let newest = archived.iter().map(|(_, ts)| *ts).max();
        let bytes_saved: u64 = archived.iter().map(|(record, _)| record.value.len() as u64).sum();
        let archived_count = archived.len();

        if dry_run || archived.is_empty() {
            return Ok(ArchiveOldReport { archived: archived_count, kept, bytes_saved, oldest, newest });
        }

        let mut blob = self.read_archive_blob()?;
        for (record, ts) in &archived {
            blob.streams.push(Self::to_archive_entry(&record.key, *ts, &record.value));
        }
        blob.last_archive_date = Some(Utc.timestamp_millis_opt(clock.now_ms()).single().unwrap_or_else(Utc::now).to_rfc3339());
        let blob_bytes = serde_json::to_vec(&blob)?;

        let live_store = self.live_store.clone();
        let archive_store = self.archive_store.clone();
        let archived_keys: Vec<Vec<u8>> = archived.into_iter().map(|(record, _)| record.key).collect();
        let now_ms = clock.now_ms();

        let live_resource = Box::new(IndexedStoreResource::new(self.indexed.clone(), live_store.clone()));
        let archive_resource = Box::new(IndexedStoreResource::new(self.indexed.clone(), archive_store.clone()));

        self.coordinator.run(
            move |ctx| {
                for key in &archived_keys {
                    ctx.delete(live_store.clone(), key.clone(), now_ms)?;
                }
                ctx.put(archive_store.clone(), ARCHIVE_BLOB_KEY.to_vec(), blob_bytes.clone(), now_ms)?;
                Ok(())
            },
            vec![live_resource, archive_resource],
        )?;

        bus.emit(
            events::QUOTA_CLEANED,
            EventPayload::QuotaCleaned { archived: archived_count, bytes_saved }.to_value(),
        );
        Ok(ArchiveOldReport { archived: archived_count, kept, bytes_saved, oldest, newest })
    }

    /// Validates archived entries, restores the ones at or after
    /// `after_date_ms` (all of them if `None`) back into the live store, and
    /// either trims the restored entries from the archive or discards the
    /// whole archive when `clear_archive` is set.
    pub fn restore(&self, after_date_ms: Option<i64>, clear_archive: bool, clock: &dyn Clock, bus: &dyn EventBus) -> CResult<RestoreReport> {
        let blob = self.read_archive_blob()?;
        let total = blob.streams.len();
        if total == 0 {
            return Ok(RestoreReport { restored: 0, remaining: 0, filtered_count: 0 });
        }

        let max_ts = Self::max_valid_timestamp_ms(clock);
        let mut valid = Vec::new();
        let mut invalid = Vec::new();
        for entry in blob.streams {
            match Self::validate_entry(&entry, max_ts) {
                Some(ts) => valid.push((entry, ts)),
                None => invalid.push(entry),
            }
        }

        if (invalid.len() as f64 / total as f64) > INTEGRITY_FAILURE_RATIO {
            return Err(Error::ArchiveIntegrity { invalid: invalid.len(), total });
        }

        let (to_restore, to_keep): (Vec<_>, Vec<_>) = match after_date_ms {
            Some(cutoff) => valid.into_iter().partition(|(_, ts)| *ts >= cutoff),
            None => (valid, Vec::new()),
        };
        let filtered_count = invalid.len();

        if to_restore.is_empty() {
            return Ok(RestoreReport { restored: 0, remaining: total, filtered_count });
        }

        let mut puts = Vec::new();
        for (entry, _) in &to_restore {
            let Some(obj) = entry.as_object() else { continue };
            let key_b64 = obj.get(ARCHIVE_KEY_FIELD).and_then(|v| v.as_str()).unwrap_or_default();
            let key = BASE64.decode(key_b64).unwrap_or_default();
            let payload = obj.get(ARCHIVE_PAYLOAD_FIELD).cloned().unwrap_or(serde_json::Value::Null);
            puts.push((key, serde_json::to_vec(&payload)?));
        }

        let remaining_entries: Vec<serde_json::Value> =
            if clear_archive { Vec::new() } else { to_keep.into_iter().map(|(v, _)| v).chain(invalid).collect() };
        let remaining = remaining_entries.len();

        let new_blob = ArchiveBlob { streams: remaining_entries, last_archive_date: blob.last_archive_date };
        let blob_bytes = serde_json::to_vec(&new_blob)?;

        let live_store = self.live_store.clone();
        let archive_store = self.archive_store.clone();
        let now_ms = clock.now_ms();
        let restored_count = puts.len();

        let live_resource = Box::new(IndexedStoreResource::new(self.indexed.clone(), live_store.clone()));
        let archive_resource = Box::new(IndexedStoreResource::new(self.indexed.clone(), archive_store.clone()));

        self.coordinator.run(
            move |ctx| {
                for (key, value) in &puts {
                    ctx.put(live_store.clone(), key.clone(), value.clone(), now_ms)?;
                }
                ctx.put(archive_store.clone(), ARCHIVE_BLOB_KEY.to_vec(), blob_bytes.clone(), now_ms)?;
                Ok(())
            },
            vec![live_resource, archive_resource],
        )?;

        bus.emit(
            events::ARCHIVE_RESTORED,
            EventPayload::ArchiveRestored { restored: restored_count, remaining, filtered_count }.to_value(),
        );
        Ok(RestoreReport { restored: restored_count, remaining, filtered_count })
    }

    pub fn stats(&self) -> CResult<ArchiveStats> {
        let blob = self.read_archive_blob()?;
        let live_count = self.indexed.get_all(&self.live_store)?.len();

        let mut oldest = None;
        let mut newest = None;
        for entry in &blob.streams {
            if let Some(ts) = entry.get(TIMESTAMP_FIELD).and_then(|v| v.as_i64()) {
                oldest = Some(oldest.map_or(ts, |o: i64| o.min(ts)));
                newest = Some(newest.map_or(ts, |n: i64| n.max(ts)));
            }
        }

        Ok(ArchiveStats {
            live_count,
            archived_count: blob.streams.len(),
            last_archive_date: blob.last_archive_date,
            oldest_archived: oldest,
            newest_archived: newest,
        })
    }

    /// Discards the archive entirely, returning the number of entries dropped.
    pub fn clear(&self) -> CResult<usize> {
        let blob = self.read_archive_blob()?;
        let deleted = blob.streams.len();
        self.indexed.put(&self.archive_store, ARCHIVE_BLOB_KEY, &serde_json::to_vec(&ArchiveBlob::default())?)?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::collaborators::{FixedClock, MemoryIndexedStore, MemorySyncKv, RecordingEventBus};
    use crate::compensation::CompensationLogger;
    use crate::txn_state::{FatalStateHandle, NestedTransactionGuardState};

    fn make_service(indexed: Arc<dyn IndexedStore>) -> ArchiveService {
        let coordinator = Arc::new(TwoPhaseCommitCoordinator::new(
            indexed.clone(),
            Arc::new(FixedClock::new(0)),
            Arc::new(RecordingEventBus::new()),
            Arc::new(FatalStateHandle::new()),
            Arc::new(NestedTransactionGuardState::new()),
            Arc::new(CompensationLogger::new(indexed.clone(), Arc::new(MemorySyncKv::new()))),
        ));
        ArchiveService::new(indexed, coordinator, "streams", "streams_archive", ArchiveOptions { retain_floor: 2 })
    }

    fn seed(indexed: &dyn IndexedStore, key: &str, timestamp_ms: i64) {
        indexed.put("streams", key.as_bytes(), serde_json::json!({ "timestamp_ms": timestamp_ms, "body": key }).to_string().as_bytes()).unwrap();
    }

    #[test]
    fn archive_old_retains_floor_and_moves_the_rest() {
        let indexed: Arc<dyn IndexedStore> = Arc::new(MemoryIndexedStore::new());
        seed(&*indexed, "a", 1_000);
        seed(&*indexed, "b", 2_000);
        seed(&*indexed, "c", 3_000);
        seed(&*indexed, "d", 4_000);

        let service = make_service(indexed.clone());
        let clock = FixedClock::new(0);
        let bus = RecordingEventBus::new();

        let report = service.archive_old(3_500, false, &clock, &bus).unwrap();
        // floor=2 keeps "c" and "d" (the two newest) regardless of cutoff; "a" and "b" move.
        assert_eq!(report.kept, 2);
        assert_eq!(indexed.get("streams", b"a").unwrap(), None);
        assert_eq!(indexed.get("streams", b"b").unwrap(), None);
        assert!(indexed.get("streams", b"c").unwrap().is_some());

        let stats = service.stats().unwrap();
        assert_eq!(stats.archived_count, 2);
        assert_eq!(stats.live_count, 2);
    }

    #[test]
    fn dry_run_reports_without_mutating() {
        let indexed: Arc<dyn IndexedStore> = Arc::new(MemoryIndexedStore::new());
        seed(&*indexed, "a", 1_000);
        let service = make_service(indexed.clone());
        let clock = FixedClock::new(0);
        let bus = RecordingEventBus::new();

        service.archive_old(5_000, true, &clock, &bus).unwrap();
        assert!(indexed.get("streams", b"a").unwrap().is_some());
        assert_eq!(service.stats().unwrap().archived_count, 0);
    }

    #[test]
    fn archive_then_restore_round_trips() {
        let indexed: Arc<dyn IndexedStore> = Arc::new(MemoryIndexedStore::new());
        seed(&*indexed, "a", 1_000);
        seed(&*indexed, "b", 2_000);
        seed(&*indexed, "c", 3_000);
        let service = make_service(indexed.clone());
        let clock = FixedClock::new(50_000_000_000); // safely within [2000, now_year+1]
        let bus = RecordingEventBus::new();

        service.archive_old(2_500, false, &clock, &bus).unwrap();
        assert_eq!(indexed.get("streams", b"a").unwrap(), None);

        let restore_report = service.restore(None, false, &clock, &bus).unwrap();
        assert_eq!(restore_report.restored, 1);
        assert_eq!(restore_report.remaining, 0);
        assert_eq!(indexed.get("streams", b"a").unwrap(), Some(br#"{"body":"a","timestamp_ms":1000}"#.to_vec()));
    }

    #[test]
    fn restore_aborts_when_integrity_ratio_exceeded() {
        let indexed: Arc<dyn IndexedStore> = Arc::new(MemoryIndexedStore::new());
        let service = make_service(indexed.clone());
        let clock = FixedClock::new(50_000_000_000);
        let bus = RecordingEventBus::new();

        let mut streams = Vec::new();
        for i in 0..100 {
            let ts = if i < 15 { 9_999_999_999_999i64 } else { 1_000 + i };
            streams.push(serde_json::json!({ ARCHIVE_KEY_FIELD: BASE64.encode(format!("k{i}")), TIMESTAMP_FIELD: ts, ARCHIVE_PAYLOAD_FIELD: {} }));
        }
        let blob = ArchiveBlob { streams, last_archive_date: None };
        indexed.put("streams_archive", ARCHIVE_BLOB_KEY, &serde_json::to_vec(&blob).unwrap()).unwrap();

        let result = service.restore(None, false, &clock, &bus);
        assert!(matches!(result.unwrap_err(), Error::ArchiveIntegrity { invalid: 15, total: 100 }));
    }

    #[test]
    fn restore_filters_a_minority_of_invalid_entries() {
        let indexed: Arc<dyn IndexedStore> = Arc::new(MemoryIndexedStore::new());
        let service = make_service(indexed.clone());
        let clock = FixedClock::new(50_000_000_000);
        let bus = RecordingEventBus::new();

        let mut streams = Vec::new();
        for i in 0..100 {
            let ts = if i < 5 { 9_999_999_999_999i64 } else { 1_000 + i };
            streams.push(serde_json::json!({ ARCHIVE_KEY_FIELD: BASE64.encode(format!("k{i}")), TIMESTAMP_FIELD: ts, ARCHIVE_PAYLOAD_FIELD: {"i": i} }));
        }
        let blob = ArchiveBlob { streams, last_archive_date: None };
        indexed.put("streams_archive", ARCHIVE_BLOB_KEY, &serde_json::to_vec(&blob).unwrap()).unwrap();

        let report = service.restore(None, false, &clock, &bus).unwrap();
        assert_eq!(report.filtered_count, 5);
        assert_eq!(report.restored, 95);
        assert_eq!(bus.topics().into_iter().filter(|t| t == events::ARCHIVE_RESTORED).count(), 1);
    }

    #[test]
    fn clear_discards_the_whole_archive() {
        let indexed: Arc<dyn IndexedStore> = Arc::new(MemoryIndexedStore::new());
        seed(&*indexed, "a", 1_000);
        let service = make_service(indexed.clone());
        let clock = FixedClock::new(0);
        let bus = RecordingEventBus::new();
        service.archive_old(5_000, false, &clock, &bus).unwrap();

        let deleted = service.clear().unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(service.stats().unwrap().archived_count, 0);
    }
}
