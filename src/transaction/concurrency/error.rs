use thiserror::Error;

use crate::common::error::ErrorClass;
use crate::common::types::{SavepointId, TxnId};
use crate::storage::buffer::BufferPoolError;
use crate::transaction::concurrency::state::TransactionState;
use crate::transaction::concurrency::table::TableError;
use crate::transaction::wal::{LogManagerError, SpillError};

/// Errors that can occur during transaction processing
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {txn} cannot {operation} while {state}")]
    InvalidState {
        txn: TxnId,
        state: TransactionState,
        operation: &'static str,
    },

    #[error("Savepoint {0} does not exist")]
    InvalidSavepoint(SavepointId),

    #[error("All {0} transaction slots are in use")]
    TooManyTransactions(usize),

    #[error("Transaction {txn} would deadlock waiting for transaction {other}")]
    Deadlock { txn: TxnId, other: TxnId },

    #[error("Transaction {txn} timed out waiting for transaction {other}")]
    LockTimeout { txn: TxnId, other: TxnId },

    #[error("No prepared transaction has xid {0}")]
    UnknownXid(String),

    #[error("Failed to write to WAL: {0}")]
    Log(#[from] LogManagerError),

    #[error("Spill store error: {0}")]
    Spill(#[from] SpillError),

    #[error("Buffer pool error: {0}")]
    Buffer(#[from] BufferPoolError),

    #[error("Table error: {0}")]
    Table(#[from] TableError),

    #[error("Commit of transaction {txn} failed after it became durable: {reason}")]
    CommitFailed { txn: TxnId, fatal: bool, reason: String },

    #[error("Rollback of transaction {txn} did not undo every record: {reason}")]
    RollbackIncomplete { txn: TxnId, reason: String },
}

impl TransactionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransactionError::InvalidState { .. }
            | TransactionError::InvalidSavepoint(_)
            | TransactionError::UnknownXid(_) => ErrorClass::InvalidState,
            TransactionError::TooManyTransactions(_) => ErrorClass::ResourceExhaustion,
            TransactionError::Deadlock { .. } => ErrorClass::Deadlock,
            TransactionError::LockTimeout { .. } => ErrorClass::LockTimeout,
            TransactionError::Log(e) => e.class(),
            TransactionError::Spill(e) => e.class(),
            TransactionError::Buffer(e) => e.class(),
            TransactionError::Table(e) => e.class(),
            TransactionError::CommitFailed { fatal: true, .. } => ErrorClass::Corruption,
            TransactionError::CommitFailed { fatal: false, .. } => ErrorClass::InvalidState,
            TransactionError::RollbackIncomplete { .. } => ErrorClass::Corruption,
        }
    }

    /// Whether the engine can keep running after this error
    pub fn is_fatal(&self) -> bool {
        match self {
            TransactionError::CommitFailed { fatal, .. } => *fatal,
            other => other.class().is_fatal(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransactionError::CommitFailed { .. }) && self.class().is_retryable()
    }
}

/// Result type for transaction operations
pub type Result<T> = std::result::Result<T, TransactionError>;
