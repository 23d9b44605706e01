// Write-ahead log and spill storage

pub mod log_buffer;
pub mod log_iterator;
pub mod log_manager;
pub mod log_record;
pub mod spill;
pub mod transaction_log;

pub use log_iterator::LogRecordIterator;
pub use log_manager::{InDoubtTransaction, LogManager, LogManagerConfig, LogManagerError, Result};
pub use log_record::{IndexUpdate, IndexUpdateKind, LogRecord, LogRecordContent, LogRecordType, RecordImage, RecordImageKind};
pub use spill::{MemorySpillStore, SpillError, SpillHandle, SpillStore};
pub use transaction_log::TransactionLog;
