//! Spill storage for chilled record payloads.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::error::ErrorClass;
use crate::common::types::{TxnId, VirtualOffset};
use crate::transaction::wal::log_manager::{LogManager, LogManagerError};
use crate::transaction::wal::log_record::{LogRecordContent, LogRecordType};

#[derive(Error, Debug)]
pub enum SpillError {
    #[error("Log error: {0}")]
    Log(#[from] LogManagerError),

    #[error("No spilled payload at offset {0}")]
    NotFound(VirtualOffset),

    #[error("Spilled payload at offset {offset} has {found} bytes, expected {expected}")]
    LengthMismatch {
        offset: VirtualOffset,
        expected: u32,
        found: usize,
    },
}

impl SpillError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SpillError::Log(e) => e.class(),
            SpillError::NotFound(_) | SpillError::LengthMismatch { .. } => ErrorClass::Corruption,
        }
    }
}

/// Where a spilled payload lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpillHandle {
    pub offset: VirtualOffset,
    pub length: u32,
}

/// Somewhere to park record payloads a transaction cannot keep in memory.
///
/// Bytes stored under a handle must stay loadable, unchanged, for as long
/// as the owning transaction may need them.
pub trait SpillStore: Send + Sync {
    fn store(&self, owner: TxnId, bytes: &[u8]) -> Result<SpillHandle, SpillError>;

    fn load(&self, handle: SpillHandle) -> Result<Vec<u8>, SpillError>;
}

fn check_length(handle: SpillHandle, bytes: Vec<u8>) -> Result<Vec<u8>, SpillError> {
    if bytes.len() != handle.length as usize {
        return Err(SpillError::LengthMismatch {
            offset: handle.offset,
            expected: handle.length,
            found: bytes.len(),
        });
    }
    Ok(bytes)
}

impl SpillStore for LogManager {
    fn store(&self, owner: TxnId, bytes: &[u8]) -> Result<SpillHandle, SpillError> {
        let (_, offset) = self.append_at(owner, LogRecordType::Spill, LogRecordContent::Spill(bytes.to_vec()))?;
        Ok(SpillHandle {
            offset,
            length: bytes.len() as u32,
        })
    }

    fn load(&self, handle: SpillHandle) -> Result<Vec<u8>, SpillError> {
        let record = self.read_at(handle.offset)?;
        match (record.record_type, record.content) {
            (LogRecordType::Spill, LogRecordContent::Spill(bytes)) => check_length(handle, bytes),
            _ => Err(SpillError::NotFound(handle.offset)),
        }
    }
}

/// In-memory spill store for tests and log-less setups
#[derive(Debug, Default)]
pub struct MemorySpillStore {
    chunks: Mutex<Vec<Vec<u8>>>,
    stored_bytes: AtomicU64,
}

impl MemorySpillStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total payload bytes ever stored
    pub fn stored_bytes(&self) -> u64 {
        self.stored_bytes.load(Ordering::Relaxed)
    }
}

impl SpillStore for MemorySpillStore {
    fn store(&self, _owner: TxnId, bytes: &[u8]) -> Result<SpillHandle, SpillError> {
        let mut chunks = self.chunks.lock();
        chunks.push(bytes.to_vec());
        self.stored_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(SpillHandle {
            offset: (chunks.len() - 1) as VirtualOffset,
            length: bytes.len() as u32,
        })
    }

    fn load(&self, handle: SpillHandle) -> Result<Vec<u8>, SpillError> {
        let chunks = self.chunks.lock();
        let bytes = chunks
            .get(handle.offset as usize)
            .cloned()
            .ok_or(SpillError::NotFound(handle.offset))?;
        check_length(handle, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::wal::log_manager::LogManagerConfig;
    use tempfile::TempDir;

    #[test]
    fn test_log_spill_survives_window_flush() {
        let dir = TempDir::new().unwrap();
        let log = LogManager::new(LogManagerConfig {
            buffer_size: 256,
            force_sync: false,
            ..LogManagerConfig::in_dir(dir.path())
        })
        .unwrap();

        let payloads: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 100 + i as usize]).collect();
        let handles: Vec<SpillHandle> = payloads.iter().map(|p| log.store(42, p).unwrap()).collect();

        // The small window forced earlier payloads out to the file
        assert!(log.durable_lsn() > 0);
        for (handle, payload) in handles.iter().zip(&payloads) {
            assert_eq!(&log.load(*handle).unwrap(), payload);
        }
        assert!(log.window_recalls() > 0);
    }

    #[test]
    fn test_memory_store_rejects_bad_handles() {
        let store = MemorySpillStore::new();
        let handle = store.store(1, b"payload").unwrap();
        assert_eq!(store.load(handle).unwrap(), b"payload");
        assert_eq!(store.stored_bytes(), 7);

        assert!(matches!(
            store.load(SpillHandle { offset: 9, length: 7 }),
            Err(SpillError::NotFound(9))
        ));
        assert!(matches!(
            store.load(SpillHandle { length: 3, ..handle }),
            Err(SpillError::LengthMismatch { .. })
        ));
    }
}
