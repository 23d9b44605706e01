use crate::common::types::{Lsn, TxnId};
use crate::transaction::wal::log_manager::{LogManager, LogManagerError};
use crate::transaction::wal::log_record::{IndexUpdate, LogRecordContent, LogRecordType, RecordImage};

/// The log operations the transaction manager depends on
pub trait TransactionLog: Send + Sync {
    /// Append one record. `Commit` and `Prepare` must be durable on return.
    fn append_log(&self, txn: TxnId, record_type: LogRecordType, content: LogRecordContent)
        -> Result<Lsn, LogManagerError>;

    fn log_updated_records(&self, txn: TxnId, images: Vec<RecordImage>) -> Result<Lsn, LogManagerError> {
        self.append_log(txn, LogRecordType::UpdateRecord, LogRecordContent::Records(images))
    }

    fn log_index_updates(&self, txn: TxnId, updates: Vec<IndexUpdate>) -> Result<Lsn, LogManagerError> {
        self.append_log(txn, LogRecordType::IndexUpdate, LogRecordContent::IndexUpdates(updates))
    }

    fn flush(&self) -> Result<Lsn, LogManagerError>;
}

impl TransactionLog for LogManager {
    fn append_log(
        &self,
        txn: TxnId,
        record_type: LogRecordType,
        content: LogRecordContent,
    ) -> Result<Lsn, LogManagerError> {
        self.append_log_record(txn, record_type, content)
    }

    fn flush(&self) -> Result<Lsn, LogManagerError> {
        LogManager::flush(self)
    }
}
