use thiserror::Error;

use crate::common::types::PageNumber;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PageError {
    #[error("Unknown page type tag {0}")]
    UnknownPageType(u16),
    #[error("Checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("Page header names page {found}, expected {expected}")]
    PageNumberMismatch { expected: PageNumber, found: PageNumber },
    #[error("Buffer of {0} bytes is too small for a page")]
    BufferTooSmall(usize),
}
