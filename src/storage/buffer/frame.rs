use std::cell::Cell;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::common::types::{FrameId, LockMode, PageId, TxnId};

thread_local! {
    // Pins held by the current thread; panic shutdown only lets threads
    // that already hold pins fault in more pages.
    static THREAD_PINS: Cell<usize> = const { Cell::new(0) };
}

pub(crate) fn thread_pins() -> usize {
    THREAD_PINS.with(Cell::get)
}

/// Bookkeeping for one frame. The mutex around it is a leaf lock: it is
/// never held while waiting on anything else.
#[derive(Debug, Default)]
pub(crate) struct FrameMeta {
    pub page_id: Option<PageId>,
    pub use_count: u32,
    pub dirty: bool,
    pub dirty_txn: TxnId,
    pub writing: bool,
    pub is_new: bool,
}

pub(crate) struct Frame {
    pub id: FrameId,
    pub meta: Mutex<FrameMeta>,
    pub data: Arc<RwLock<Box<[u8]>>>,
    /// Serializes physical writes of this frame
    pub write_lock: Mutex<()>,
}

impl Frame {
    pub fn new(id: FrameId, page_size: usize) -> Self {
        Self {
            id,
            meta: Mutex::new(FrameMeta::default()),
            data: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
            write_lock: Mutex::new(()),
        }
    }

    pub fn page_id(&self) -> Option<PageId> {
        self.meta.lock().page_id
    }

    /// Take a use-count reference. Callers must hold the cache index lock
    /// so the frame cannot be rebound underneath them.
    pub fn pin(self: &Arc<Self>) -> FramePin {
        self.meta.lock().use_count += 1;
        THREAD_PINS.with(|pins| pins.set(pins.get() + 1));
        FramePin { frame: Arc::clone(self) }
    }

    pub fn info(&self) -> Option<FrameInfo> {
        let meta = self.meta.lock();
        let latch = if self.data.is_locked_exclusive() {
            Some(LockMode::Exclusive)
        } else if self.data.is_locked() {
            Some(LockMode::Shared)
        } else {
            None
        };
        meta.page_id.map(|page_id| FrameInfo {
            frame_id: self.id,
            page_id,
            use_count: meta.use_count,
            dirty: meta.dirty,
            dirty_txn: meta.dirty_txn,
            is_new: meta.is_new,
            latch,
        })
    }
}

/// A use-count reference on a frame, released on drop.
pub(crate) struct FramePin {
    frame: Arc<Frame>,
}

impl FramePin {
    pub fn frame(&self) -> &Arc<Frame> {
        &self.frame
    }
}

impl Drop for FramePin {
    fn drop(&mut self) {
        {
            let mut meta = self.frame.meta.lock();
            debug_assert!(meta.use_count > 0, "frame {} unpinned below zero", self.frame.id);
            meta.use_count = meta.use_count.saturating_sub(1);
        }
        THREAD_PINS.with(|pins| pins.set(pins.get().saturating_sub(1)));
    }
}

/// Point-in-time view of a bound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_id: FrameId,
    pub page_id: PageId,
    pub use_count: u32,
    pub dirty: bool,
    pub dirty_txn: TxnId,
    pub is_new: bool,
    pub latch: Option<LockMode>,
}
