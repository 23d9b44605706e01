// Byte layout of the common page header. Every page starts with it,
// whatever its type; the rest of the page belongs to the page's owner.

pub const PAGE_TYPE_OFFSET: usize = 0; // u16
pub const FLAGS_OFFSET: usize = 2; // u16
pub const PAGE_NUMBER_OFFSET: usize = 4; // u32
pub const CHECKSUM_OFFSET: usize = 8; // u32
pub const HEADER_SIZE: usize = 16; // 4 reserved bytes at the end

/// Smallest page size the header layout allows
pub const MIN_PAGE_SIZE: usize = 1024;

/// Range of the page body available to the page's owner
pub fn body_range(page_size: usize) -> std::ops::Range<usize> {
    HEADER_SIZE..page_size
}
