// Transactions, record versions and snapshot visibility

pub mod error;
pub mod record;
pub mod savepoint;
pub(crate) mod slots;
pub mod state;
pub mod table;
pub mod transaction;
pub mod transaction_manager;

// Public exports
pub use error::{Result, TransactionError};
pub use record::{RecordData, RecordKind, RecordVersion};
pub use savepoint::Savepoint;
pub use state::{Access, IsolationLevel, RelativeState, TransactionState, WaitMode};
pub use table::{MemoryTable, RowTable, TableCallback, TableError, TableEvent};
pub use transaction::{Transaction, TransactionShared, TransactionStats};
pub use transaction_manager::{TransactionManager, TransactionSummary};
