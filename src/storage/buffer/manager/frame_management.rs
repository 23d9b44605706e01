use std::sync::Arc;

use log::{debug, warn};

use super::flushing::WriteOutcome;
use super::{BufferCache, CacheCounters, CacheIndex};
use crate::common::types::{FrameId, PageId};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::frame::FramePin;
use crate::storage::buffer::guard::ExclusiveLatch;
use crate::storage::disk::WriteKind;

impl BufferCache {
    /// Pick a frame for a new binding. The caller holds the index lock
    /// exclusively; the returned frame is unbound and unpinned.
    ///
    /// Free frames come first. Otherwise the LRU queue is walked from the
    /// cold end; a candidate that must wait for other dirty pages is
    /// replaced by the page at the head of its ordering chain, which is
    /// written first if dirty.
    pub(crate) fn find_victim(&self, index: &mut CacheIndex) -> Result<FrameId, BufferPoolError> {
        let free = index
            .free_list
            .iter()
            .position(|&id| self.frames[id as usize].meta.lock().use_count == 0);
        if let Some(frame_id) = free.and_then(|pos| index.free_list.remove(pos)) {
            return Ok(frame_id);
        }

        loop {
            let Some((victim, dirty)) = self.choose_victim(index) else {
                warn!("No replaceable frame among {} cached pages", index.page_table.len());
                return Err(BufferPoolError::PoolExhausted);
            };

            if dirty {
                self.write_victim(victim)?;
                continue;
            }

            let frame = &self.frames[victim as usize];
            if let Some(old) = frame.meta.lock().page_id.take() {
                index.page_table.remove(&old);
                debug!("Evicting page {} from frame {}", old, victim);
            }
            index.replacer.remove(victim);
            CacheCounters::bump(&self.counters.evictions, 1);
            return Ok(victim);
        }
    }

    fn choose_victim(&self, index: &CacheIndex) -> Option<(FrameId, bool)> {
        let dirty = self.dirty.lock();
        index.replacer.cold_to_hot().find_map(|candidate| {
            let target = dirty.graph.terminal_predecessor(candidate);
            let meta = self.frames[target as usize].meta.lock();
            (meta.use_count == 0 && !meta.writing && meta.page_id.is_some()).then_some((target, meta.dirty))
        })
    }

    /// Write out a dirty, unpinned frame chosen for replacement
    fn write_victim(&self, frame_id: FrameId) -> Result<(), BufferPoolError> {
        let frame = Arc::clone(&self.frames[frame_id as usize]);
        let Some(page_id) = frame.page_id() else {
            return Ok(());
        };
        let latch = frame
            .data
            .try_read_arc()
            .ok_or(BufferPoolError::LockTimeout(page_id))?;

        match self.write_locked(&frame, page_id, &latch[..], WriteKind::Reuse)? {
            WriteOutcome::Written => debug!("Wrote page {} for frame reuse", page_id),
            WriteOutcome::AlreadyClean | WriteOutcome::PredecessorPending => {}
        }
        Ok(())
    }

    /// Bind an unbound frame to `page_id` and hand back a pin plus an
    /// exclusive latch taken before anyone else can find the frame.
    pub(crate) fn bind(
        &self,
        index: &mut CacheIndex,
        frame_id: FrameId,
        page_id: PageId,
    ) -> Result<(FramePin, ExclusiveLatch), BufferPoolError> {
        let frame = &self.frames[frame_id as usize];
        {
            let mut meta = frame.meta.lock();
            debug_assert!(!meta.dirty, "binding dirty frame {}", frame_id);
            meta.page_id = Some(page_id);
            meta.dirty = false;
            meta.dirty_txn = 0;
            meta.writing = false;
            meta.is_new = false;
        }

        let Some(latch) = frame.data.try_write_arc() else {
            frame.meta.lock().page_id = None;
            index.free_list.push_back(frame_id);
            return Err(BufferPoolError::InvalidOperation(format!(
                "frame {} is latched while unbound",
                frame_id
            )));
        };

        index.page_table.insert(page_id, frame_id);
        index.replacer.record_access(frame_id);
        Ok((frame.pin(), latch))
    }

    /// Release a binding whose page never became valid
    pub(crate) fn unbind(&self, frame_id: FrameId, page_id: PageId) {
        let mut index = self.index.write();
        if index.page_table.get(&page_id) != Some(&frame_id) {
            return;
        }
        index.page_table.remove(&page_id);
        index.replacer.remove(frame_id);

        {
            let mut dirty = self.dirty.lock();
            let mut meta = self.frames[frame_id as usize].meta.lock();
            meta.page_id = None;
            if meta.dirty {
                meta.dirty = false;
                dirty.list.remove(&frame_id);
                dirty.graph.clear_frame(frame_id);
            }
        }
        index.free_list.push_back(frame_id);
    }
}
