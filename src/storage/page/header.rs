use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::common::types::PageNumber;
use crate::storage::page::error::PageError;
use crate::storage::page::layout::{
    CHECKSUM_OFFSET, FLAGS_OFFSET, HEADER_SIZE, PAGE_NUMBER_OFFSET, PAGE_TYPE_OFFSET,
};

/// Type tag stored in every page header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum PageType {
    /// Unformatted or released page
    Free = 0,
    /// Tablespace header page
    Header = 1,
    /// Page allocation inventory
    Inventory = 2,
    /// Section (table) directory
    Section = 3,
    /// Maps record numbers to data pages
    RecordLocator = 4,
    /// Row data
    Data = 5,
    /// Index node
    Index = 6,
    /// Overflow for large values
    Overflow = 7,
}

impl TryFrom<u16> for PageType {
    type Error = PageError;

    fn try_from(tag: u16) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => PageType::Free,
            1 => PageType::Header,
            2 => PageType::Inventory,
            3 => PageType::Section,
            4 => PageType::RecordLocator,
            5 => PageType::Data,
            6 => PageType::Index,
            7 => PageType::Overflow,
            other => return Err(PageError::UnknownPageType(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub page_type: PageType,
    pub flags: u16,
    pub page_number: PageNumber,
    pub checksum: u32,
}

impl PageHeader {
    pub fn new(page_type: PageType, page_number: PageNumber) -> Self {
        Self {
            page_type,
            flags: 0,
            page_number,
            checksum: 0,
        }
    }

    // Serialize header into the front of a page
    pub fn write_to(&self, page: &mut [u8]) {
        LittleEndian::write_u16(&mut page[PAGE_TYPE_OFFSET..PAGE_TYPE_OFFSET + 2], self.page_type as u16);
        LittleEndian::write_u16(&mut page[FLAGS_OFFSET..FLAGS_OFFSET + 2], self.flags);
        LittleEndian::write_u32(&mut page[PAGE_NUMBER_OFFSET..PAGE_NUMBER_OFFSET + 4], self.page_number);
        LittleEndian::write_u32(&mut page[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4], self.checksum);
    }

    // Deserialize header from the front of a page
    pub fn read_from(page: &[u8]) -> Result<Self, PageError> {
        if page.len() < HEADER_SIZE {
            return Err(PageError::BufferTooSmall(page.len()));
        }
        let tag = LittleEndian::read_u16(&page[PAGE_TYPE_OFFSET..PAGE_TYPE_OFFSET + 2]);

        Ok(Self {
            page_type: PageType::try_from(tag)?,
            flags: LittleEndian::read_u16(&page[FLAGS_OFFSET..FLAGS_OFFSET + 2]),
            page_number: LittleEndian::read_u32(&page[PAGE_NUMBER_OFFSET..PAGE_NUMBER_OFFSET + 4]),
            checksum: LittleEndian::read_u32(&page[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]),
        })
    }
}

/// Stamp a freshly allocated page: zero it and write a header for `page_type`.
pub fn format_page(page: &mut [u8], page_type: PageType, page_number: PageNumber) {
    page.fill(0);
    PageHeader::new(page_type, page_number).write_to(page);
}

/// CRC-32 of the page with the checksum field taken as zero.
pub fn compute_checksum(page: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&page[..CHECKSUM_OFFSET]);
    hasher.update(&[0u8; 4]);
    hasher.update(&page[CHECKSUM_OFFSET + 4..]);
    hasher.finalize()
}

/// Prepare an outgoing copy of a page for disk: fix the page number and
/// store the checksum.
pub fn seal(page: &mut [u8], page_number: PageNumber) {
    LittleEndian::write_u32(&mut page[PAGE_NUMBER_OFFSET..PAGE_NUMBER_OFFSET + 4], page_number);
    let checksum = compute_checksum(page);
    LittleEndian::write_u32(&mut page[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4], checksum);
}

/// Validate a page image just read from disk and strip its checksum so the
/// in-memory copy matches what was handed to `seal`.
///
/// A page that is entirely zero was never written and is accepted as an
/// unformatted `Free` page.
pub fn verify_and_open(page: &mut [u8], page_number: PageNumber) -> Result<PageHeader, PageError> {
    if page.iter().all(|&b| b == 0) {
        return Ok(PageHeader::new(PageType::Free, page_number));
    }

    let header = PageHeader::read_from(page)?;
    let computed = compute_checksum(page);
    if header.checksum != computed {
        return Err(PageError::ChecksumMismatch {
            stored: header.checksum,
            computed,
        });
    }
    if header.page_number != page_number {
        return Err(PageError::PageNumberMismatch {
            expected: page_number,
            found: header.page_number,
        });
    }

    LittleEndian::write_u32(&mut page[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4], 0);
    Ok(PageHeader { checksum: 0, ..header })
}
