//! Subcommands for `storagectl`, the operator tool that inspects and
//! repairs a `storage-core` data directory from outside a running host.
//!
//! Fatal-state is process-local (never persisted), so there is no
//! `clear-fatal-state` subcommand here — that only makes sense called on the
//! live host, not a separate CLI process reading its files.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use storage_core::archive::{ArchiveOptions, ArchiveService};
use storage_core::collaborators::{
    Clock, EventBus, FileIndexedStore, FileSyncKv, FixedHostQuota, IndexedStore, SystemClock,
};
use storage_core::compensation::CompensationLogger;
use storage_core::coordinator::TwoPhaseCommitCoordinator;
use storage_core::model::TRANSACTION_JOURNAL;
use storage_core::quota::{QuotaManager, QuotaManagerOptions};
use storage_core::txn_state::{FatalStateHandle, NestedTransactionGuardState};

const LIVE_STORE: &str = "records";
const ARCHIVE_STORE: &str = "archive";

/// Emits nothing anywhere but `log`; an operator run against files on disk
/// has no live host bridge to forward events to.
struct LoggingEventBus;

impl EventBus for LoggingEventBus {
    fn emit(&self, topic: &str, payload: serde_json::Value) {
        log::info!("event {topic}: {payload}");
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Lists transactions still sitting in the recovery journal, i.e. a
    /// prepare that never reached a decision before the process crashed.
    Journal,

    /// Evaluates quota status against a supplied usage/quota pair.
    Quota {
        #[clap(long)]
        used_bytes: u64,
        #[clap(long)]
        quota_bytes: u64,
    },

    /// Lists operations whose rollback failed and were logged for manual
    /// compensation.
    Compensation,

    /// Archive namespace operations.
    #[clap(subcommand)]
    Archive(ArchiveCommand),
}

#[derive(Debug, Subcommand)]
pub enum ArchiveCommand {
    /// Reports live/archived counts without mutating anything.
    Stats,

    /// Moves records older than `--cutoff-ms` out of the live store.
    Old {
        #[clap(long)]
        cutoff_ms: i64,
        #[clap(long)]
        dry_run: bool,
    },

    /// Restores archived records back into the live store.
    Restore {
        #[clap(long)]
        after_date_ms: Option<i64>,
        #[clap(long)]
        clear_archive: bool,
    },

    /// Discards the entire archive namespace.
    Clear,
}

fn open_stores(data_dir: &std::path::Path) -> Result<(Arc<FileIndexedStore>, Arc<FileSyncKv>)> {
    std::fs::create_dir_all(data_dir).context("creating data directory")?;
    let indexed = Arc::new(
        FileIndexedStore::open(data_dir.join("indexed.db")).context("opening indexed store")?,
    );
    let sync_kv =
        Arc::new(FileSyncKv::open(data_dir.join("synckv.db")).context("opening sync-kv store")?);
    Ok((indexed, sync_kv))
}

fn build_coordinator(
    indexed: Arc<FileIndexedStore>,
    sync_kv: Arc<FileSyncKv>,
) -> Arc<TwoPhaseCommitCoordinator> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus: Arc<dyn EventBus> = Arc::new(LoggingEventBus);
    let fatal = Arc::new(FatalStateHandle::new());
    let nested = Arc::new(NestedTransactionGuardState::new());
    let compensation = Arc::new(CompensationLogger::new(indexed.clone(), sync_kv));
    Arc::new(TwoPhaseCommitCoordinator::new(indexed, clock, bus, fatal, nested, compensation))
}

pub fn run(data_dir: PathBuf, cmd: Command) -> Result<()> {
    match cmd {
        Command::Journal => {
            let (indexed, _sync_kv) = open_stores(&data_dir)?;
            let records = indexed.get_all(TRANSACTION_JOURNAL).context("reading journal")?;
            if records.is_empty() {
                println!("{}", "no pending transactions".green());
                return Ok(());
            }
            for record in records {
                let id = String::from_utf8_lossy(&record.key).into_owned();
                match bincode::deserialize::<storage_core::model::JournalRecord>(&record.value) {
                    Ok(journal) => println!(
                        "{} operations={} started_at={}",
                        journal.id.yellow(),
                        journal.operation_count,
                        journal.started_at
                    ),
                    Err(err) => println!("{id}: {} ({err})", "unreadable journal record".red()),
                }
            }
        }
        Command::Quota { used_bytes, quota_bytes } => {
            let manager = QuotaManager::new(QuotaManagerOptions::default())?;
            let host = FixedHostQuota::new(used_bytes, quota_bytes);
            let clock = SystemClock;
            let bus = LoggingEventBus;
            let status = manager.check_now(0, &host, &clock, &bus);
            println!(
                "tier={:?} percent={:.1}% used={} available={} blocked={}",
                status.tier, status.percent, status.used_bytes, status.available_bytes, status.is_blocked
            );
        }
        Command::Compensation => {
            let (indexed, sync_kv) = open_stores(&data_dir)?;
            let logger = CompensationLogger::new(indexed, sync_kv);
            let entries = logger.get_all_logs();
            if entries.is_empty() {
                println!("{}", "no compensation entries".green());
                return Ok(());
            }
            for entry in entries {
                println!(
                    "{} tier={:?} ops={} at={}",
                    entry.transaction_id.yellow(),
                    entry.storage_tier,
                    entry.operations.len(),
                    entry.timestamp_ms
                );
            }
        }
        Command::Archive(sub) => run_archive(&data_dir, sub)?,
    }
    Ok(())
}

fn run_archive(data_dir: &std::path::Path, cmd: ArchiveCommand) -> Result<()> {
    let (indexed, sync_kv) = open_stores(data_dir)?;
    let coordinator = build_coordinator(indexed.clone(), sync_kv);
    let service =
        ArchiveService::new(indexed, coordinator, LIVE_STORE, ARCHIVE_STORE, ArchiveOptions::default());
    let clock = SystemClock;
    let bus = LoggingEventBus;

    match cmd {
        ArchiveCommand::Stats => {
            let stats = service.stats()?;
            println!(
                "live={} archived={} last_archive_date={:?} oldest={:?} newest={:?}",
                stats.live_count, stats.archived_count, stats.last_archive_date, stats.oldest_archived, stats.newest_archived
            );
        }
        ArchiveCommand::Old { cutoff_ms, dry_run } => {
            let report = service.archive_old(cutoff_ms, dry_run, &clock, &bus)?;
            println!(
                "archived={} kept={} bytes_saved={} oldest={:?} newest={:?}{}",
                report.archived,
                report.kept,
                report.bytes_saved,
                report.oldest,
                report.newest,
                if dry_run { " (dry run)".dimmed().to_string() } else { String::new() }
            );
        }
        ArchiveCommand::Restore { after_date_ms, clear_archive } => {
            let report = service.restore(after_date_ms, clear_archive, &clock, &bus)?;
            println!(
                "restored={} remaining={} filtered={}",
                report.restored, report.remaining, report.filtered_count
            );
        }
        ArchiveCommand::Clear => {
            let cleared = service.clear()?;
            println!("cleared {cleared} archived entries");
        }
    }
    Ok(())
}
