use std::fmt;
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;

use crate::common::types::{FrameId, LockMode, PageId};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::frame::{Frame, FramePin};
use crate::storage::page::layout::HEADER_SIZE;
use crate::storage::page::{PageError, PageHeader, PageType};

pub(crate) type SharedLatch = ArcRwLockReadGuard<RawRwLock, Box<[u8]>>;
pub(crate) type ExclusiveLatch = ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>;

pub(crate) enum Latch {
    Shared(SharedLatch),
    Exclusive(ExclusiveLatch),
}

impl Latch {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Latch::Shared(guard) => &guard[..],
            Latch::Exclusive(guard) => &guard[..],
        }
    }

    pub fn mode(&self) -> LockMode {
        match self {
            Latch::Shared(_) => LockMode::Shared,
            Latch::Exclusive(_) => LockMode::Exclusive,
        }
    }
}

/// A pinned, latched page.
///
/// Dropping the guard releases the latch and then the pin, so a frame can
/// never be left pinned by a forgotten release.
pub struct PageGuard {
    // Declaration order is drop order: latch first, then pin.
    latch: Latch,
    pin: FramePin,
    page_id: PageId,
}

impl PageGuard {
    pub(crate) fn new(page_id: PageId, pin: FramePin, latch: Latch) -> Self {
        Self { latch, pin, page_id }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn frame_id(&self) -> FrameId {
        self.pin.frame().id
    }

    pub fn mode(&self) -> LockMode {
        self.latch.mode()
    }

    /// Whole page image, header included
    pub fn data(&self) -> &[u8] {
        self.latch.bytes()
    }

    /// Mutable page image. Requires an exclusive latch on a page that has
    /// already been marked dirty.
    pub fn data_mut(&mut self) -> Result<&mut [u8], BufferPoolError> {
        if !self.is_dirty() {
            return Err(BufferPoolError::InvalidOperation(format!(
                "page {} must be marked dirty before it is modified",
                self.page_id
            )));
        }
        match &mut self.latch {
            Latch::Exclusive(guard) => Ok(&mut guard[..]),
            Latch::Shared(_) => Err(BufferPoolError::InvalidOperation(format!(
                "page {} is only latched shared",
                self.page_id
            ))),
        }
    }

    /// Page contents after the common header
    pub fn body(&self) -> &[u8] {
        &self.data()[HEADER_SIZE..]
    }

    pub fn body_mut(&mut self) -> Result<&mut [u8], BufferPoolError> {
        Ok(&mut self.data_mut()?[HEADER_SIZE..])
    }

    pub fn page_type(&self) -> Result<PageType, PageError> {
        PageHeader::read_from(self.data()).map(|header| header.page_type)
    }

    pub fn is_dirty(&self) -> bool {
        self.pin.frame().meta.lock().dirty
    }

    pub(crate) fn frame(&self) -> &Arc<Frame> {
        self.pin.frame()
    }
}

impl fmt::Debug for PageGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageGuard")
            .field("page_id", &self.page_id)
            .field("frame_id", &self.frame_id())
            .field("mode", &self.mode())
            .finish()
    }
}
