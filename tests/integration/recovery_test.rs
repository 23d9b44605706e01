use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use tundradb::common::types::{LockMode, PageId};
use tundradb::transaction::concurrency::{IsolationLevel, MemoryTable, TransactionState};
use tundradb::transaction::wal::{LogRecordContent, LogRecordType};
use tundradb::{Engine, EngineConfig, PageType};

#[path = "../common/mod.rs"]
mod common;
use common::generate_test_data;

const TABLESPACE: u32 = 1;

fn engine_config() -> EngineConfig {
    EngineConfig {
        force_sync: false,
        ..EngineConfig::default().with_frames(8).with_flush_threads(1)
    }
}

#[test]
fn test_prepared_transaction_is_in_doubt_after_restart() -> Result<()> {
    let dir = TempDir::new()?;
    let (prepared_id, committed_id) = {
        let engine = Engine::open(engine_config(), dir.path())?;
        let table = Arc::new(MemoryTable::new(1));

        let mut committed = engine.transactions().begin(IsolationLevel::RepeatableRead)?;
        table.store(&mut committed, 1, b"done".to_vec())?;
        committed.prepare(b"branch-1")?;
        committed.commit()?;

        let mut prepared = engine.transactions().begin(IsolationLevel::RepeatableRead)?;
        table.store(&mut prepared, 2, b"pending".to_vec())?;
        prepared.prepare(b"branch-2")?;
        let ids = (prepared.id(), committed.id());

        // Crash: the prepared transaction never hears its verdict
        std::mem::forget(prepared);
        engine.shutdown_now();
        ids
    };

    let engine = Engine::open(engine_config(), dir.path())?;
    let in_doubt = engine.in_doubt();
    assert_eq!(in_doubt.len(), 1);
    assert_eq!(in_doubt[0].txn_id, prepared_id);
    assert_eq!(in_doubt[0].xid, b"branch-2".to_vec());
    assert_ne!(in_doubt[0].txn_id, committed_id);

    let txn = engine.transactions().begin(IsolationLevel::ReadCommitted)?;
    assert!(txn.id() > prepared_id);
    Ok(())
}

#[test]
fn test_checkpoint_makes_pages_durable() -> Result<()> {
    let dir = TempDir::new()?;
    let data = generate_test_data(512);
    let data_path = dir.path().join("data.tbs");

    {
        let engine = Engine::open(engine_config(), dir.path())?;
        engine.add_tablespace(TABLESPACE, &data_path)?;
        let cache = engine.cache();

        // Page 2 (the index) may only reach disk after page 1 (the row)
        drop(cache.allocate_fresh(PageId::new(TABLESPACE, 2), PageType::Data, 1)?);
        {
            let mut row = cache.allocate_fresh(PageId::new(TABLESPACE, 1), PageType::Data, 1)?;
            row.body_mut()?[..data.len()].copy_from_slice(&data);
            cache.add_precedence(&row, 2)?;
        }
        assert!(cache.exists_dependency(PageId::new(TABLESPACE, 1), PageId::new(TABLESPACE, 2)));

        let lsn = engine.checkpoint()?;
        assert!(!cache.has_dirty_pages(TABLESPACE));

        let checkpoint = engine
            .log()
            .iter()?
            .filter_map(|item| item.ok())
            .map(|(_, record)| record)
            .find(|record| record.lsn == lsn)
            .expect("checkpoint record");
        assert_eq!(checkpoint.record_type, LogRecordType::Checkpoint);
        let LogRecordContent::Checkpoint(content) = checkpoint.content else {
            panic!("expected checkpoint content");
        };
        assert_eq!(content.dirty_pages.len(), 2);

        // Crash right after the checkpoint
        engine.shutdown_now();
    }

    let engine = Engine::open(engine_config(), dir.path())?;
    engine.add_tablespace(TABLESPACE, &data_path)?;
    let page = engine
        .cache()
        .fetch(PageId::new(TABLESPACE, 1), Some(PageType::Data), LockMode::Shared)?;
    assert_eq!(&page.body()[..data.len()], &data[..]);
    Ok(())
}

#[test]
fn test_graceful_shutdown_writes_everything() -> Result<()> {
    let dir = TempDir::new()?;
    let data_path = dir.path().join("data.tbs");

    {
        let engine = Engine::open(engine_config(), dir.path())?;
        engine.add_tablespace(TABLESPACE, &data_path)?;
        for number in 1..=12u32 {
            let mut guard = engine
                .cache()
                .allocate_fresh(PageId::new(TABLESPACE, number), PageType::Data, 1)?;
            guard.body_mut()?[..4].copy_from_slice(&number.to_le_bytes());
        }
        engine.shutdown()?;
    }

    let engine = Engine::open(engine_config(), dir.path())?;
    engine.add_tablespace(TABLESPACE, &data_path)?;
    for number in 1..=12u32 {
        let page = engine
            .cache()
            .fetch(PageId::new(TABLESPACE, number), Some(PageType::Data), LockMode::Shared)?;
        assert_eq!(&page.body()[..4], &number.to_le_bytes());
    }
    Ok(())
}

#[test]
fn test_checkpoint_leaves_unresolved_transactions_alone() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = Engine::open(engine_config(), dir.path())?;
    let manager = engine.transactions();
    let table = Arc::new(MemoryTable::new(3));

    let mut old_reader = manager.begin(IsolationLevel::RepeatableRead)?;
    let mut writer = manager.begin(IsolationLevel::RepeatableRead)?;
    table.store(&mut writer, 1, b"row".to_vec())?;
    writer.commit()?;

    let mut late = manager.begin(IsolationLevel::RepeatableRead)?;
    table.store(&mut late, 2, b"late".to_vec())?;
    assert_eq!(manager.find_oldest_active(), Some(old_reader.id()));

    engine.checkpoint()?;
    // Nothing held the writer back: its versions are already permanent
    assert_eq!(manager.transaction_state(writer.id()), None);
    assert!(table.committed_data(1).is_some());

    old_reader.rollback()?;
    late.commit()?;
    assert_eq!(manager.summary().active, 0);
    assert_eq!(late.state(), TransactionState::Committed);
    engine.shutdown()?;
    Ok(())
}
