//! Wires the log, the page cache and the transaction manager together.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use thiserror::Error;

use crate::common::config::{ConfigError, EngineConfig};
use crate::common::error::ErrorClass;
use crate::common::types::{Lsn, TablespaceId, TxnId};
use crate::storage::buffer::{BufferCache, BufferPoolError};
use crate::storage::disk::{FileTablespace, TablespaceError};
use crate::transaction::concurrency::{TransactionError, TransactionManager};
use crate::transaction::wal::{InDoubtTransaction, LogManager, LogManagerConfig, LogManagerError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Log error: {0}")]
    Log(#[from] LogManagerError),

    #[error("Buffer pool error: {0}")]
    Buffer(#[from] BufferPoolError),

    #[error("Tablespace error: {0}")]
    Tablespace(#[from] TablespaceError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Config(_) => ErrorClass::InvalidState,
            EngineError::Io(_) | EngineError::Tablespace(_) => ErrorClass::Io,
            EngineError::Log(e) => e.class(),
            EngineError::Buffer(e) => e.class(),
            EngineError::Transaction(e) => e.class(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// A running engine rooted at one directory
pub struct Engine {
    config: EngineConfig,
    dir: PathBuf,
    log: Arc<LogManager>,
    cache: Arc<BufferCache>,
    transactions: Arc<TransactionManager>,
    /// Prepared transactions found in the log at open
    in_doubt: Vec<InDoubtTransaction>,
}

impl Engine {
    /// Open (or create) the engine in `dir`. The log lives in `dir/log`.
    pub fn open(config: EngineConfig, dir: impl AsRef<Path>) -> Result<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let log = Arc::new(LogManager::new(LogManagerConfig {
            buffer_size: config.log_buffer_size,
            force_sync: config.force_sync,
            ..LogManagerConfig::in_dir(dir.join("log"))
        })?);

        let mut last_txn: TxnId = 0;
        for item in log.iter()? {
            let (_, record) = item?;
            last_txn = last_txn.max(record.txn_id);
        }
        let in_doubt = log.in_doubt_transactions()?;
        for txn in &in_doubt {
            warn!(
                "Transaction {} is prepared as {} with no outcome in the log",
                txn.txn_id,
                hex::encode(&txn.xid)
            );
        }

        let cache = BufferCache::new(&config)?;
        let transactions = TransactionManager::new(&config, log.clone(), log.clone(), Some(cache.clone()));
        transactions.resume_after(last_txn);

        info!(
            "Engine opened in {} ({} frames, transaction ids from {})",
            dir.display(),
            config.buffer_pool_frames,
            last_txn + 1
        );
        Ok(Self {
            config,
            dir,
            log,
            cache,
            transactions,
            in_doubt,
        })
    }

    /// Open a file tablespace and serve it through the cache
    pub fn add_tablespace(&self, id: TablespaceId, path: impl AsRef<Path>) -> Result<Arc<FileTablespace>> {
        let tablespace = Arc::new(FileTablespace::open(id, path, self.config.page_size)?);
        self.cache.register_tablespace(tablespace.clone())?;
        Ok(tablespace)
    }

    /// Log a checkpoint, write every dirty page, and wait for the writes
    pub fn checkpoint(&self) -> Result<Lsn> {
        let active = self.transactions.active_transaction_ids();
        let dirty = self.cache.dirty_pages();
        let lsn = self.log.checkpoint(&active, &dirty)?;
        self.cache.flush_all(lsn).wait(self.config.lock_wait_timeout())?;
        let purged = self.transactions.purge_transactions();
        info!(
            "Checkpoint {} wrote {} dirty pages ({} active transactions, {} purged)",
            lsn,
            dirty.len(),
            active.len(),
            purged
        );
        Ok(lsn)
    }

    /// Write everything out and stop the flush threads
    pub fn shutdown(&self) -> Result<()> {
        self.cache.shutdown()?;
        self.log.flush()?;
        info!("Engine in {} shut down", self.dir.display());
        Ok(())
    }

    /// Stop as fast as possible: dirty pages that can be written without
    /// waiting are, the rest are abandoned
    pub fn shutdown_now(&self) {
        warn!("Engine in {} shutting down in panic mode", self.dir.display());
        self.cache.shutdown_now();
        if let Err(e) = self.log.flush() {
            warn!("Final log flush failed: {}", e);
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    pub fn in_doubt(&self) -> &[InDoubtTransaction] {
        &self.in_doubt
    }
}
