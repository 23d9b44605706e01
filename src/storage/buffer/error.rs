use thiserror::Error;

use crate::common::error::ErrorClass;
use crate::common::types::{PageId, TablespaceId, TxnId};
use crate::storage::disk::TablespaceError;
use crate::storage::page::{PageError, PageType};

#[derive(Error, Debug)]
pub enum BufferPoolError {
    #[error("Page {page} is corrupt: {source}")]
    Corruption {
        page: PageId,
        #[source]
        source: PageError,
    },
    #[error("Page {page} has type {found:?}, expected {expected:?}")]
    WrongPageType {
        page: PageId,
        expected: PageType,
        found: PageType,
    },
    #[error("Buffer pool is exhausted: every frame is pinned or ordered behind a pinned page")]
    PoolExhausted,
    #[error("Timed out waiting for the latch on page {0}")]
    LockTimeout(PageId),
    #[error("Timed out waiting for pending page writes of transaction {0}")]
    WriteWaitTimeout(TxnId),
    #[error("Tablespace error: {0}")]
    Tablespace(#[from] TablespaceError),
    #[error("Tablespace {0} is not registered")]
    UnknownTablespace(TablespaceId),
    #[error("Page cache is in panic shutdown")]
    PanicShutdown,
    #[error("Background flush failed: {0}")]
    FlushFailed(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl BufferPoolError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BufferPoolError::Corruption { .. } | BufferPoolError::WrongPageType { .. } => ErrorClass::Corruption,
            BufferPoolError::PoolExhausted => ErrorClass::ResourceExhaustion,
            BufferPoolError::LockTimeout(_) | BufferPoolError::WriteWaitTimeout(_) => ErrorClass::LockTimeout,
            BufferPoolError::Tablespace(_) | BufferPoolError::FlushFailed(_) => ErrorClass::Io,
            BufferPoolError::UnknownTablespace(_)
            | BufferPoolError::PanicShutdown
            | BufferPoolError::InvalidOperation(_) => ErrorClass::InvalidState,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}
