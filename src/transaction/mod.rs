// Transaction management: MVCC transactions and the write-ahead log

pub mod concurrency;
pub mod wal;

// Public exports
pub use concurrency::{IsolationLevel, Transaction, TransactionError, TransactionManager, TransactionState};
pub use wal::log_manager::LogManager;
pub use wal::log_record::{LogRecord, LogRecordType};
