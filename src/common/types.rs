use std::fmt;

use serde::{Deserialize, Serialize};

/// Default page size in bytes (4KB)
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Tablespace ID type
pub type TablespaceId = u32;

/// Page number within a tablespace
pub type PageNumber = u32;

/// Transaction ID type
pub type TxnId = u32;

/// Buffer pool frame ID type
pub type FrameId = u32;

/// Table ID type
pub type TableId = u32;

/// Record number within a table
pub type RecordNumber = u32;

/// Savepoint ID type
pub type SavepointId = u32;

/// LSN (Log Sequence Number) type
pub type Lsn = u64;

/// Byte offset into the write-ahead log, stable for the life of the log file
pub type VirtualOffset = u64;

/// Identity of a page: the tablespace it lives in plus its page number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId {
    pub tablespace: TablespaceId,
    pub page_number: PageNumber,
}

impl PageId {
    pub const fn new(tablespace: TablespaceId, page_number: PageNumber) -> Self {
        Self { tablespace, page_number }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tablespace, self.page_number)
    }
}

/// Latch mode requested when pinning a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}
