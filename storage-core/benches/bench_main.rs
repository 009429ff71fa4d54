use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use storage_core::collaborators::{
    Clock, EventBus, FixedClock, MemoryIndexedStore, MemorySyncKv, RecordingEventBus,
};
use storage_core::compensation::CompensationLogger;
use storage_core::coordinator::TwoPhaseCommitCoordinator;
use storage_core::resources::IndexedStoreResource;
use storage_core::txn_state::{FatalStateHandle, NestedTransactionGuardState};

fn new_coordinator() -> (TwoPhaseCommitCoordinator, Arc<MemoryIndexedStore>) {
    let indexed = Arc::new(MemoryIndexedStore::new());
    let sync_kv = Arc::new(MemorySyncKv::new());
    let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(0));
    let bus: Arc<dyn EventBus> = Arc::new(RecordingEventBus::new());
    let fatal = Arc::new(FatalStateHandle::new());
    let nested = Arc::new(NestedTransactionGuardState::new());
    let compensation = Arc::new(CompensationLogger::new(indexed.clone(), sync_kv));
    let coordinator =
        TwoPhaseCommitCoordinator::new(indexed.clone(), clock, bus, fatal, nested, compensation);
    (coordinator, indexed)
}

fn commit_single_put(c: &mut Criterion) {
    let (coordinator, indexed) = new_coordinator();

    c.bench_function("two_phase_commit single put", |b| {
        b.iter(|| {
            let resource = Box::new(IndexedStoreResource::new(indexed.clone(), "bench_store"));
            let id = coordinator
                .run(
                    |ctx| ctx.put("bench_store", black_box(b"k".to_vec()), black_box(b"v".to_vec()), 0),
                    vec![resource],
                )
                .unwrap();
            black_box(id);
        })
    });
}

criterion_group!(benches, commit_single_put);
criterion_main!(benches);
