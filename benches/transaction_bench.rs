use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tempfile::TempDir;

use tundradb::transaction::concurrency::{IsolationLevel, MemoryTable, TransactionManager};
use tundradb::transaction::wal::{LogManager, LogManagerConfig, MemorySpillStore};
use tundradb::EngineConfig;

// Create a transaction manager logging to a temporary directory
fn setup_test_environment(chill_threshold: u64) -> (Arc<TransactionManager>, TempDir) {
    let log_dir = tempfile::tempdir().unwrap();
    let log = LogManager::new(LogManagerConfig {
        force_sync: false, // For benchmarks, don't force sync on every commit
        ..LogManagerConfig::in_dir(log_dir.path())
    })
    .unwrap();
    let config = EngineConfig::default().with_chill_threshold(chill_threshold);
    let manager = TransactionManager::new(&config, Arc::new(log), Arc::new(MemorySpillStore::new()), None);
    (manager, log_dir)
}

fn transaction_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("Transactions");

    group.bench_function("read_only_begin_commit", |b| {
        let (manager, _dir) = setup_test_environment(1 << 20);
        b.iter(|| {
            let mut txn = manager.begin(IsolationLevel::RepeatableRead).unwrap();
            txn.commit().unwrap();
        });
    });

    for records in [1u32, 10, 100].iter() {
        group.bench_with_input(BenchmarkId::new("update_commit", records), records, |b, &records| {
            let (manager, _dir) = setup_test_environment(1 << 20);
            let table = Arc::new(MemoryTable::new(1));
            let payload = vec![7u8; 128];
            b.iter(|| {
                let mut txn = manager.begin(IsolationLevel::ReadCommitted).unwrap();
                for rn in 0..records {
                    table.store(&mut txn, rn, payload.clone()).unwrap();
                }
                txn.commit().unwrap();
            });
        });
    }

    group.bench_function("savepoint_rollback", |b| {
        let (manager, _dir) = setup_test_environment(1 << 20);
        let table = Arc::new(MemoryTable::new(1));
        b.iter(|| {
            let mut txn = manager.begin(IsolationLevel::ReadCommitted).unwrap();
            table.store(&mut txn, 0, vec![1; 64]).unwrap();
            let savepoint = txn.create_savepoint().unwrap();
            for rn in 1..20 {
                table.store(&mut txn, rn, vec![2; 64]).unwrap();
            }
            txn.rollback_savepoint(savepoint).unwrap();
            txn.commit().unwrap();
        });
    });

    group.bench_function("chill_and_thaw", |b| {
        let (manager, _dir) = setup_test_environment(4 * 1024);
        let table = Arc::new(MemoryTable::new(1));
        b.iter(|| {
            let mut txn = manager.begin(IsolationLevel::ReadCommitted).unwrap();
            for rn in 0..16 {
                table.store(&mut txn, rn, vec![rn as u8; 1024]).unwrap();
            }
            let first = txn.records()[0].clone();
            txn.thaw(&first).unwrap();
            txn.rollback().unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, transaction_benchmark);
criterion_main!(benches);
