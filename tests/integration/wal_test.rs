use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;

use tundradb::transaction::concurrency::{IsolationLevel, MemoryTable, TransactionManager};
use tundradb::transaction::wal::{
    IndexUpdate, IndexUpdateKind, LogManager, LogManagerConfig, LogRecord, LogRecordContent, LogRecordType,
    RecordImageKind, SpillHandle, SpillStore,
};

#[path = "../common/mod.rs"]
mod common;
use common::{generate_test_data, test_config};

fn create_test_log_manager(buffer_size: usize) -> Result<(Arc<LogManager>, TempDir)> {
    let temp_dir = TempDir::new()?;
    let log = LogManager::new(LogManagerConfig {
        buffer_size,
        force_sync: false,
        ..LogManagerConfig::in_dir(temp_dir.path())
    })?;
    Ok((Arc::new(log), temp_dir))
}

// Manager that logs and spills into the same log
fn create_logged_manager(log: &Arc<LogManager>, chill_threshold: u64) -> Arc<TransactionManager> {
    let config = test_config(4).with_chill_threshold(chill_threshold);
    TransactionManager::new(&config, log.clone(), log.clone(), None)
}

fn records_of(log: &LogManager, txn: u32) -> Result<Vec<LogRecord>> {
    let mut records = Vec::new();
    for item in log.iter()? {
        let (_, record) = item?;
        if record.txn_id == txn {
            records.push(record);
        }
    }
    Ok(records)
}

#[test]
fn test_commit_logs_images_before_commit_record() -> Result<()> {
    let (log, _dir) = create_test_log_manager(64 * 1024)?;
    let manager = create_logged_manager(&log, 1 << 20);
    let table = Arc::new(MemoryTable::new(7));

    let mut txn = manager.begin(IsolationLevel::RepeatableRead)?;
    table.store(&mut txn, 1, b"first".to_vec())?;
    table.store(&mut txn, 1, b"second".to_vec())?;
    table.delete(&mut txn, 2)?;
    txn.add_index_update(IndexUpdate {
        index_id: 3,
        record_number: 1,
        key: b"second".to_vec(),
        kind: IndexUpdateKind::Insert,
    })?;
    let id = txn.id();
    txn.commit()?;
    assert!(log.durable_lsn() >= log.current_lsn() - 1);

    let records = records_of(&log, id)?;
    let types: Vec<LogRecordType> = records.iter().map(|r| r.record_type).collect();
    assert_eq!(
        types,
        vec![
            LogRecordType::Begin,
            LogRecordType::IndexUpdate,
            LogRecordType::UpdateRecord,
            LogRecordType::Commit
        ]
    );
    for pair in records.windows(2) {
        assert_eq!(pair[1].prev_lsn, pair[0].lsn);
    }

    // The superseded first image is not logged
    let LogRecordContent::Records(images) = &records[2].content else {
        panic!("expected record images, got {:?}", records[2].content);
    };
    assert_eq!(images.len(), 2);
    assert_eq!(images[0].data.as_deref(), Some(&b"second"[..]));
    assert_eq!(images[1].kind, RecordImageKind::Deleted);
    assert_eq!(images[1].data, None);
    Ok(())
}

#[test]
fn test_read_only_transaction_logs_nothing() -> Result<()> {
    let (log, _dir) = create_test_log_manager(64 * 1024)?;
    let manager = create_logged_manager(&log, 1 << 20);
    let table = Arc::new(MemoryTable::new(1));

    let mut txn = manager.begin(IsolationLevel::ReadCommitted)?;
    table.lock(&mut txn, 5)?;
    let id = txn.id();
    txn.commit()?;
    assert!(records_of(&log, id)?.is_empty());
    Ok(())
}

#[test]
fn test_rollback_logs_abort() -> Result<()> {
    let (log, _dir) = create_test_log_manager(64 * 1024)?;
    let manager = create_logged_manager(&log, 1 << 20);
    let table = Arc::new(MemoryTable::new(1));

    let mut txn = manager.begin(IsolationLevel::ReadCommitted)?;
    table.store(&mut txn, 1, b"gone".to_vec())?;
    let id = txn.id();
    txn.rollback()?;

    let types: Vec<LogRecordType> = records_of(&log, id)?.iter().map(|r| r.record_type).collect();
    assert_eq!(types, vec![LogRecordType::Begin, LogRecordType::Abort]);
    Ok(())
}

#[test]
fn test_chilled_payloads_are_recalled_from_file() -> Result<()> {
    let (log, _dir) = create_test_log_manager(256)?;
    let manager = create_logged_manager(&log, 128);
    let table = Arc::new(MemoryTable::new(1));

    let payloads: Vec<Vec<u8>> = (0..5u8)
        .map(|i| generate_test_data(100).into_iter().map(|b| b.wrapping_add(i)).collect())
        .collect();
    let mut txn = manager.begin(IsolationLevel::RepeatableRead)?;
    for (rn, payload) in payloads.iter().enumerate() {
        table.store(&mut txn, rn as u32, payload.clone())?;
    }
    assert!(txn.stats().chilled_records >= 4);
    let id = txn.id();
    txn.commit()?;

    // Chilled images point at the spill records instead of carrying bytes
    let records = records_of(&log, id)?;
    let images = records
        .iter()
        .find_map(|r| match &r.content {
            LogRecordContent::Records(images) => Some(images.clone()),
            _ => None,
        })
        .expect("record images logged");
    let chilled = &images[0];
    assert_eq!(chilled.data, None);
    let offset = chilled.spilled_at.expect("spill offset");
    let spill = log.read_at(offset)?;
    assert_eq!(spill.record_type, LogRecordType::Spill);
    assert_eq!(spill.txn_id, id);

    let recalls = log.window_recalls();
    let reader = manager.begin(IsolationLevel::ReadCommitted)?;
    for (rn, payload) in payloads.iter().enumerate() {
        assert_eq!(table.read(&reader, rn as u32)?.as_ref(), Some(payload));
    }
    assert!(log.window_recalls() > recalls);
    Ok(())
}

#[test]
fn test_spill_store_rejects_non_spill_offsets() -> Result<()> {
    let (log, _dir) = create_test_log_manager(64 * 1024)?;
    log.append_log_record(9, LogRecordType::Begin, LogRecord::transaction_content())?;
    let handle = log.store(9, b"payload")?;
    assert_eq!(log.load(handle)?, b"payload".to_vec());

    // Offset 0 holds the Begin record
    let bogus = SpillHandle { offset: 0, length: 7 };
    assert!(log.load(bogus).is_err());
    Ok(())
}

#[test]
fn test_torn_tail_is_cut_on_reopen() -> Result<()> {
    let dir = TempDir::new()?;
    let config = LogManagerConfig {
        force_sync: false,
        ..LogManagerConfig::in_dir(dir.path())
    };

    let path = {
        let log = LogManager::new(config.clone())?;
        log.append_log_record(1, LogRecordType::Begin, LogRecord::transaction_content())?;
        log.append_log_record(1, LogRecordType::Commit, LogRecord::transaction_content())?;
        log.path().to_path_buf()
    };

    // Half a frame: a length prefix promising more bytes than follow
    {
        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(&[200, 0, 0, 0, 1, 2, 3])?;
    }

    let log = LogManager::new(config)?;
    assert_eq!(log.current_lsn(), 3);
    let lsn = log.append_log_record(2, LogRecordType::Begin, LogRecord::transaction_content())?;
    assert_eq!(lsn, 3);

    let lsns: Vec<u64> = log.iter()?.map(|item| item.map(|(_, r)| r.lsn)).collect::<Result<_, _>>()?;
    assert_eq!(lsns, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn test_checkpoint_record_lists_active_work() -> Result<()> {
    let (log, _dir) = create_test_log_manager(64 * 1024)?;
    let manager = create_logged_manager(&log, 1 << 20);
    let table = Arc::new(MemoryTable::new(1));

    let mut open = manager.begin(IsolationLevel::ReadCommitted)?;
    table.store(&mut open, 1, b"open".to_vec())?;
    let lsn = log.checkpoint(&manager.active_transaction_ids(), &[])?;
    assert_eq!(log.durable_lsn(), lsn);

    let checkpoint = records_of(&log, 0)?.pop().expect("checkpoint record");
    let LogRecordContent::Checkpoint(content) = checkpoint.content else {
        panic!("expected checkpoint content");
    };
    assert_eq!(content.active_transactions, vec![open.id()]);
    open.rollback()?;
    Ok(())
}
