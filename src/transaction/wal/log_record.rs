use bincode::{deserialize, serialize};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::types::{Lsn, PageId, RecordNumber, TableId, TxnId, VirtualOffset};

/// Error type for log record operations
#[derive(Error, Debug)]
pub enum LogRecordError {
    #[error("Failed to serialize log record: {0}")]
    SerializationError(String),

    #[error("Failed to deserialize log record: {0}")]
    DeserializationError(String),

    #[error("Invalid log record format")]
    InvalidFormat,
}

/// Result type for log record operations
pub type Result<T> = std::result::Result<T, LogRecordError>;

/// Types of log records written by the transaction manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecordType {
    /// Marks the beginning of a transaction
    Begin,
    /// Marks the durable commit of a transaction
    Commit,
    /// Marks the rollback of a transaction
    Abort,
    /// First phase of two-phase commit; carries the external xid
    Prepare,
    /// After-images of the record versions a transaction created
    UpdateRecord,
    /// Deferred index insertions and deletions
    IndexUpdate,
    /// A chilled record payload
    Spill,
    /// Active transactions and dirty pages at checkpoint time
    Checkpoint,
}

/// Kind of row image carried by an `UpdateRecord` entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordImageKind {
    Data,
    Deleted,
}

/// After-image of one record version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordImage {
    pub table_id: TableId,
    pub record_number: RecordNumber,
    pub kind: RecordImageKind,
    /// Row bytes; `None` for deletions and for payloads already in the log
    pub data: Option<Vec<u8>>,
    /// Offset of the spill record holding the payload, if it was chilled
    pub spilled_at: Option<VirtualOffset>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexUpdateKind {
    Insert,
    Delete,
}

/// A deferred index change buffered by a transaction until prepare/commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexUpdate {
    pub index_id: u32,
    pub record_number: RecordNumber,
    pub key: Vec<u8>,
    pub kind: IndexUpdateKind,
}

/// Structure representing the content of a transaction operation log record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionOperationContent {
    /// Timestamp when the operation occurred
    pub timestamp: u64,
    /// External transaction id for prepared transactions
    pub xid: Option<Vec<u8>>,
}

/// Structure representing the content of a checkpoint log record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointContent {
    /// Timestamp when the checkpoint occurred
    pub timestamp: u64,
    /// Transactions active at checkpoint time
    pub active_transactions: Vec<TxnId>,
    /// Dirty pages at checkpoint time, with the transaction that last dirtied each
    pub dirty_pages: Vec<(PageId, TxnId)>,
}

/// Union of all possible log record content types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogRecordContent {
    Transaction(TransactionOperationContent),
    Records(Vec<RecordImage>),
    IndexUpdates(Vec<IndexUpdate>),
    Spill(Vec<u8>),
    Checkpoint(CheckpointContent),
}

/// Main log record structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Log Sequence Number - unique identifier for this log record
    pub lsn: Lsn,
    /// Transaction that generated this log record (0 for checkpoints)
    pub txn_id: TxnId,
    /// LSN of the previous log record in this transaction
    pub prev_lsn: Lsn,
    /// Type of operation this log record represents
    pub record_type: LogRecordType,
    /// Content of the log record, depends on the record type
    pub content: LogRecordContent,
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl LogRecord {
    pub fn new(lsn: Lsn, txn_id: TxnId, prev_lsn: Lsn, record_type: LogRecordType, content: LogRecordContent) -> Self {
        Self {
            lsn,
            txn_id,
            prev_lsn,
            record_type,
            content,
        }
    }

    /// Content for `Begin`, `Commit` and `Abort` records
    pub fn transaction_content() -> LogRecordContent {
        LogRecordContent::Transaction(TransactionOperationContent {
            timestamp: now_secs(),
            xid: None,
        })
    }

    pub fn prepare_content(xid: &[u8]) -> LogRecordContent {
        LogRecordContent::Transaction(TransactionOperationContent {
            timestamp: now_secs(),
            xid: Some(xid.to_vec()),
        })
    }

    pub fn new_checkpoint(lsn: Lsn, active_transactions: Vec<TxnId>, dirty_pages: Vec<(PageId, TxnId)>) -> Self {
        Self::new(
            lsn,
            0,
            0,
            LogRecordType::Checkpoint,
            LogRecordContent::Checkpoint(CheckpointContent {
                timestamp: now_secs(),
                active_transactions,
                dirty_pages,
            }),
        )
    }

    /// The xid of a `Prepare` record
    pub fn xid(&self) -> Option<&[u8]> {
        match (&self.record_type, &self.content) {
            (LogRecordType::Prepare, LogRecordContent::Transaction(content)) => content.xid.as_deref(),
            _ => None,
        }
    }

    /// Serialize the log record to bytes
    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self).map_err(|e| LogRecordError::SerializationError(e.to_string()))
    }

    /// Deserialize bytes into a log record
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        deserialize(data).map_err(|e| LogRecordError::DeserializationError(e.to_string()))
    }
}
