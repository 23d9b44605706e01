use std::sync::Arc;

use log::{error, trace};
use parking_lot::lock_api::ArcRwLockWriteGuard;

use super::{BufferCache, CacheCounters};
use crate::common::types::{LockMode, PageId, TxnId};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::frame::{Frame, FramePin};
use crate::storage::buffer::guard::{ExclusiveLatch, Latch, PageGuard};
use crate::storage::disk::Tablespace;
use crate::storage::page::header::{format_page, verify_and_open, PageHeader};
use crate::storage::page::PageType;

impl BufferCache {
    /// Pin and latch a page, reading it from its tablespace on a miss.
    ///
    /// With `expected` set, a page of any other type fails with
    /// `WrongPageType`.
    pub fn fetch(
        &self,
        page_id: PageId,
        expected: Option<PageType>,
        mode: LockMode,
    ) -> Result<PageGuard, BufferPoolError> {
        self.check_panic()?;
        let tablespace = self.tablespace(page_id.tablespace)?;

        loop {
            if let Some(pin) = self.pin_cached(page_id) {
                let latch = self
                    .acquire_latch(pin.frame(), mode)
                    .ok_or(BufferPoolError::LockTimeout(page_id))?;
                // The frame may have been released by a failed read
                if pin.frame().page_id() != Some(page_id) {
                    continue;
                }
                CacheCounters::bump(&self.counters.hits, 1);
                let guard = PageGuard::new(page_id, pin, latch);
                check_type(page_id, guard.data(), expected)?;
                return Ok(guard);
            }

            let mut index = self.index.write();
            if index.page_table.contains_key(&page_id) {
                continue;
            }
            let frame_id = self.find_victim(&mut index)?;
            let (pin, mut latch) = self.bind(&mut index, frame_id, page_id)?;
            drop(index);

            CacheCounters::bump(&self.counters.misses, 1);
            if let Err(e) = load_page(&*tablespace, page_id, &mut latch)
                .and_then(|_| check_type(page_id, &latch[..], expected))
            {
                drop(latch);
                self.unbind(frame_id, page_id);
                return Err(e);
            }
            trace!("Read page {} into frame {}", page_id, frame_id);

            let latch = match mode {
                LockMode::Exclusive => Latch::Exclusive(latch),
                LockMode::Shared => Latch::Shared(ArcRwLockWriteGuard::downgrade(latch)),
            };
            return Ok(PageGuard::new(page_id, pin, latch));
        }
    }

    /// Like `fetch` but never reads: `None` when the page is not cached or
    /// is a free page.
    pub fn probe(&self, page_id: PageId, mode: LockMode) -> Result<Option<PageGuard>, BufferPoolError> {
        self.check_panic()?;
        let Some(pin) = self.pin_cached(page_id) else {
            return Ok(None);
        };
        let latch = self
            .acquire_latch(pin.frame(), mode)
            .ok_or(BufferPoolError::LockTimeout(page_id))?;
        if pin.frame().page_id() != Some(page_id) {
            return Ok(None);
        }
        let guard = PageGuard::new(page_id, pin, latch);
        match guard.page_type() {
            Ok(PageType::Free) => Ok(None),
            _ => Ok(Some(guard)),
        }
    }

    /// Non-blocking probe: `None` when the page is not cached or its latch
    /// is not immediately available.
    pub fn try_fetch(&self, page_id: PageId, mode: LockMode) -> Result<Option<PageGuard>, BufferPoolError> {
        self.check_panic()?;
        let Some(pin) = self.pin_cached(page_id) else {
            return Ok(None);
        };
        let latch = match mode {
            LockMode::Shared => pin.frame().data.try_read_arc().map(Latch::Shared),
            LockMode::Exclusive => pin.frame().data.try_write_arc().map(Latch::Exclusive),
        };
        let Some(latch) = latch else {
            return Ok(None);
        };
        if pin.frame().page_id() != Some(page_id) {
            return Ok(None);
        }
        Ok(Some(PageGuard::new(page_id, pin, latch)))
    }

    /// Bind `page_id` to a frame without reading it, format it as an empty
    /// page of `page_type` and mark it dirty on behalf of `txn`.
    pub fn allocate_fresh(
        &self,
        page_id: PageId,
        page_type: PageType,
        txn: TxnId,
    ) -> Result<PageGuard, BufferPoolError> {
        self.check_panic()?;
        self.tablespace(page_id.tablespace)?;

        let (pin, mut latch) = loop {
            if let Some(pin) = self.pin_cached(page_id) {
                let latch = pin
                    .frame()
                    .data
                    .try_write_arc_for(self.lock_wait_timeout)
                    .ok_or(BufferPoolError::LockTimeout(page_id))?;
                if pin.frame().page_id() != Some(page_id) {
                    continue;
                }
                break (pin, latch);
            }

            let mut index = self.index.write();
            if index.page_table.contains_key(&page_id) {
                continue;
            }
            let frame_id = self.find_victim(&mut index)?;
            break self.bind(&mut index, frame_id, page_id)?;
        };

        format_page(&mut latch[..], page_type, page_id.page_number);
        let guard = PageGuard::new(page_id, pin, Latch::Exclusive(latch));
        self.mark_dirty(&guard, txn)?;
        guard.frame().meta.lock().is_new = true;
        Ok(guard)
    }

    /// Latch a frame, waiting at most the lock-wait timeout
    pub(crate) fn acquire_latch(&self, frame: &Arc<Frame>, mode: LockMode) -> Option<Latch> {
        match mode {
            LockMode::Shared => frame.data.try_read_arc_for(self.lock_wait_timeout).map(Latch::Shared),
            LockMode::Exclusive => frame
                .data
                .try_write_arc_for(self.lock_wait_timeout)
                .map(Latch::Exclusive),
        }
    }

    /// Pin the frame holding `page_id`, refreshing its LRU position when
    /// it has aged out of the hot end.
    pub(crate) fn pin_cached(&self, page_id: PageId) -> Option<FramePin> {
        let (pin, refresh) = {
            let index = self.index.read();
            let frame_id = *index.page_table.get(&page_id)?;
            (
                self.frames[frame_id as usize].pin(),
                index.replacer.needs_refresh(frame_id),
            )
        };

        if refresh {
            let mut index = self.index.write();
            let frame_id = pin.frame().id;
            if index.page_table.get(&page_id) == Some(&frame_id) {
                index.replacer.record_access(frame_id);
            }
        }
        Some(pin)
    }
}

fn load_page(
    tablespace: &dyn Tablespace,
    page_id: PageId,
    latch: &mut ExclusiveLatch,
) -> Result<(), BufferPoolError> {
    tablespace.read_page(page_id.page_number, &mut latch[..])?;
    verify_and_open(&mut latch[..], page_id.page_number).map_err(|source| {
        error!("Page {} failed verification: {}", page_id, source);
        BufferPoolError::Corruption { page: page_id, source }
    })?;
    Ok(())
}

fn check_type(page_id: PageId, data: &[u8], expected: Option<PageType>) -> Result<(), BufferPoolError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let found = PageHeader::read_from(data)
        .map(|header| header.page_type)
        .map_err(|source| BufferPoolError::Corruption { page: page_id, source })?;
    if found != expected {
        error!("Page {} has type {:?}, expected {:?}", page_id, found, expected);
        return Err(BufferPoolError::WrongPageType {
            page: page_id,
            expected,
            found,
        });
    }
    Ok(())
}
