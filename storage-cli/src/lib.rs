//! `storagectl` — operator tool for inspecting and repairing a
//! `storage-core` data directory: recovery journal, compensation log, quota
//! status, and the archive namespace.

pub mod command;
