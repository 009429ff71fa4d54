//! Client-side transactional storage substrate: atomic multi-key writes over
//! heterogeneous backends, quota-aware admission control, authenticated
//! encryption at rest, priority-preemptive locking, and context-aware error
//! recovery.
//!
//! The crate is single-threaded cooperative (`storage-core` does not pull in
//! an async runtime; see `engine` for the durable log-structured backend
//! this substrate's indexed store is built on). An embedder wires the
//! collaborator traits in `collaborators` to its own host bindings and owns
//! the long-lived components (`coordinator::TwoPhaseCommitCoordinator`,
//! `quota::QuotaManager`, `lock::PriorityLockManager`, ...) for the lifetime
//! of its session.

pub mod archive;
pub mod collaborators;
pub mod compensation;
pub mod config;
pub mod coordinator;
pub mod encryption;
pub mod engine;
pub mod error;
pub mod events;
pub mod key_manager;
pub mod lock;
pub mod model;
pub mod quota;
pub mod recovery;
pub mod resources;
pub mod security_coordinator;
pub mod txn_state;
