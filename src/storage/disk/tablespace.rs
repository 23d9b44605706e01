use thiserror::Error;

use crate::common::types::{PageNumber, TablespaceId};

#[derive(Error, Debug)]
pub enum TablespaceError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Buffer of {actual} bytes does not match page size {expected}")]
    BufferSizeMismatch { expected: usize, actual: usize },
    #[error("Page number {0} is out of range")]
    InvalidPageNumber(PageNumber),
}

/// Why a page is being written; passed through to the tablespace for
/// accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    /// Evicting a dirty victim so its frame can be reused
    Reuse,
    /// Writing a page that another page must not precede
    Precedence,
    /// Explicit synchronous write requested by a caller
    Force,
    /// Background flush thread
    Flush,
    /// Shutdown drain
    Shutdown,
}

/// Page-granular storage behind the buffer cache.
///
/// Page size is fixed for the life of a tablespace. Reads of pages that were
/// never written return zeros.
pub trait Tablespace: Send + Sync {
    fn id(&self) -> TablespaceId;

    fn page_size(&self) -> usize;

    fn read_page(&self, page_number: PageNumber, buf: &mut [u8]) -> Result<(), TablespaceError>;

    fn write_page(&self, page_number: PageNumber, buf: &[u8], kind: WriteKind) -> Result<(), TablespaceError>;

    /// Write `count` physically adjacent pages starting at `start` from one
    /// contiguous buffer.
    fn write_pages(
        &self,
        start: PageNumber,
        count: usize,
        buf: &[u8],
        kind: WriteKind,
    ) -> Result<(), TablespaceError> {
        let page_size = self.page_size();
        check_len(page_size * count, buf.len())?;
        for (i, page) in buf.chunks_exact(page_size).enumerate() {
            self.write_page(start + i as PageNumber, page, kind)?;
        }
        Ok(())
    }

    /// Make previously written pages durable
    fn sync(&self) -> Result<(), TablespaceError>;
}

pub(crate) fn check_len(expected: usize, actual: usize) -> Result<(), TablespaceError> {
    if expected != actual {
        return Err(TablespaceError::BufferSizeMismatch { expected, actual });
    }
    Ok(())
}
