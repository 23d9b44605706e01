#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;
use tundradb::common::types::{Lsn, TxnId};
use tundradb::storage::buffer::BufferCache;
use tundradb::storage::disk::MemoryTablespace;
use tundradb::transaction::concurrency::TransactionManager;
use tundradb::transaction::wal::{
    LogManager, LogManagerConfig, LogManagerError, LogRecordContent, LogRecordType, MemorySpillStore, TransactionLog,
};
use tundradb::EngineConfig;

pub const TABLESPACE: u32 = 1;

// Engine configuration sized for tests: synchronous flushing, short waits
pub fn test_config(frames: usize) -> EngineConfig {
    EngineConfig {
        force_sync: false,
        ..EngineConfig::default()
            .with_frames(frames)
            .with_flush_threads(0)
            .with_lock_wait_timeout(Duration::from_millis(300))
    }
}

// Create a buffer cache over an in-memory tablespace
pub fn create_test_cache(config: &EngineConfig) -> Result<(Arc<BufferCache>, Arc<MemoryTablespace>)> {
    let cache = BufferCache::new(config)?;
    let tablespace = Arc::new(MemoryTablespace::new(TABLESPACE, config.page_size));
    cache.register_tablespace(tablespace.clone())?;
    Ok((cache, tablespace))
}

// Create a log manager in a temporary directory
pub fn create_test_log() -> Result<(Arc<LogManager>, TempDir)> {
    let temp_dir = TempDir::new()?;
    let log = LogManager::new(LogManagerConfig {
        force_sync: false,
        ..LogManagerConfig::in_dir(temp_dir.path())
    })?;
    Ok((Arc::new(log), temp_dir))
}

// Create a transaction manager that spills to memory and logs to `log`
pub fn create_test_manager(config: &EngineConfig, log: Arc<dyn TransactionLog>) -> Arc<TransactionManager> {
    TransactionManager::new(config, log, Arc::new(MemorySpillStore::new()), None)
}

// Generate test data of specified size
pub fn generate_test_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

/// Log that can be switched to fail every append
pub struct FailingLog {
    inner: Arc<LogManager>,
    failing: AtomicBool,
}

impl FailingLog {
    pub fn new(inner: Arc<LogManager>) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), LogManagerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LogManagerError::IoError(std::io::Error::other("injected log failure")));
        }
        Ok(())
    }
}

impl TransactionLog for FailingLog {
    fn append_log(&self, txn: TxnId, record_type: LogRecordType, content: LogRecordContent) -> Result<Lsn, LogManagerError> {
        self.check()?;
        self.inner.append_log(txn, record_type, content)
    }

    fn flush(&self) -> Result<Lsn, LogManagerError> {
        self.check()?;
        TransactionLog::flush(self.inner.as_ref())
    }
}
