// Tundra transactional core: a page cache with write ordering and an MVCC
// transaction manager

pub mod common;
pub mod engine;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use common::{EngineConfig, ErrorClass};
pub use engine::{Engine, EngineError};
pub use storage::buffer::{BufferCache, BufferPoolError, PageGuard};
pub use storage::disk::{FileTablespace, MemoryTablespace, Tablespace, WriteKind};
pub use storage::page::{PageError, PageType};
pub use transaction::concurrency::{
    IsolationLevel, MemoryTable, RecordVersion, RowTable, Transaction, TransactionError, TransactionManager,
    TransactionState,
};
pub use transaction::wal::{LogManager, SpillStore, TransactionLog};
