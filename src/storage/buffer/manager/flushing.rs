use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};
use parking_lot::MutexGuard;

use super::{BufferCache, CacheCounters};
use crate::common::types::{FrameId, LockMode, PageId, TablespaceId, TxnId};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::flusher::{CheckpointWaiter, RunOutcome};
use crate::storage::buffer::frame::{Frame, FramePin};
use crate::storage::buffer::guard::{PageGuard, SharedLatch};
use crate::storage::disk::{Tablespace, WriteKind};
use crate::storage::page::header::seal;

pub(crate) enum WriteOutcome {
    Written,
    AlreadyClean,
    PredecessorPending,
}

type ReadyPage = (PageId, FramePin, SharedLatch);

impl BufferCache {
    /// Write the latched page now, after every page ordered before it.
    pub fn write(&self, guard: &PageGuard, kind: WriteKind) -> Result<(), BufferPoolError> {
        self.write_with_predecessors(guard.frame(), guard.page_id(), guard.data(), kind)
    }

    /// Write a cached page if it is dirty. Returns false when the page is
    /// not cached.
    pub fn write_page_by_id(&self, page_id: PageId, kind: WriteKind) -> Result<bool, BufferPoolError> {
        let Some(pin) = self.pin_cached(page_id) else {
            return Ok(false);
        };
        let latch = self
            .acquire_latch(pin.frame(), LockMode::Shared)
            .ok_or(BufferPoolError::LockTimeout(page_id))?;
        if pin.frame().page_id() != Some(page_id) {
            return Ok(false);
        }
        self.write_with_predecessors(pin.frame(), page_id, latch.bytes(), kind)?;
        Ok(true)
    }

    pub(crate) fn write_with_predecessors(
        &self,
        frame: &Frame,
        page_id: PageId,
        image: &[u8],
        kind: WriteKind,
    ) -> Result<(), BufferPoolError> {
        loop {
            let predecessors = self.dirty.lock().graph.predecessors(frame.id);
            for predecessor in predecessors {
                self.write_predecessor(predecessor)?;
            }
            match self.write_locked(frame, page_id, image, kind)? {
                WriteOutcome::PredecessorPending => continue,
                WriteOutcome::Written | WriteOutcome::AlreadyClean => return Ok(()),
            }
        }
    }

    fn write_predecessor(&self, frame_id: FrameId) -> Result<(), BufferPoolError> {
        let frame = Arc::clone(&self.frames[frame_id as usize]);
        let pin = {
            let _index = self.index.read();
            frame.pin()
        };
        let Some(page_id) = frame.page_id() else {
            return Ok(());
        };
        let latch = self
            .acquire_latch(pin.frame(), LockMode::Shared)
            .ok_or(BufferPoolError::LockTimeout(page_id))?;
        if frame.page_id() != Some(page_id) {
            return Ok(());
        }
        self.write_with_predecessors(&frame, page_id, latch.bytes(), WriteKind::Precedence)
    }

    /// Write one frame whose latch the caller holds. Refuses while other
    /// pages are still ordered before it. On failure the page stays dirty.
    pub(crate) fn write_locked(
        &self,
        frame: &Frame,
        page_id: PageId,
        image: &[u8],
        kind: WriteKind,
    ) -> Result<WriteOutcome, BufferPoolError> {
        let tablespace = self.tablespace(page_id.tablespace)?;
        let _writer = frame.write_lock.lock();
        {
            let dirty = self.dirty.lock();
            let mut meta = frame.meta.lock();
            if meta.page_id != Some(page_id) || !meta.dirty {
                return Ok(WriteOutcome::AlreadyClean);
            }
            if dirty.graph.has_predecessors(frame.id) {
                return Ok(WriteOutcome::PredecessorPending);
            }
            meta.writing = true;
        }

        let mut buffer = image.to_vec();
        seal(&mut buffer, page_id.page_number);
        let result = tablespace.write_page(page_id.page_number, &buffer, kind);

        let mut dirty = self.dirty.lock();
        let mut meta = frame.meta.lock();
        meta.writing = false;
        if let Err(e) = result {
            error!("Failed to write page {} ({:?}): {}", page_id, kind, e);
            return Err(e.into());
        }
        meta.dirty = false;
        meta.is_new = false;
        drop(meta);
        dirty.list.remove(&frame.id);
        dirty.graph.clear_frame(frame.id);
        CacheCounters::bump(&self.counters.writes, 1);
        Ok(WriteOutcome::Written)
    }

    /// Schedule every dirty page for writing. With no flush threads the
    /// pages are written before this returns.
    pub fn flush_all(&self, checkpoint: u64) -> CheckpointWaiter {
        let pages = self.dirty_pages();
        info!("Checkpoint {}: {} dirty page(s)", checkpoint, pages.len());

        if self.flush_thread_count() == 0 {
            let result = pages
                .iter()
                .try_for_each(|&(page, _)| self.write_page_by_id(page, WriteKind::Flush).map(|_| ()));
            return CheckpointWaiter::completed(checkpoint, result.map(|_| checkpoint).map_err(|e| e.to_string()));
        }

        match self.flush_queue.schedule(&pages, Some(checkpoint)) {
            Some(waiter) => waiter,
            None => CheckpointWaiter::completed(checkpoint, Ok(checkpoint)),
        }
    }

    /// Write every dirty page of a tablespace, release its unpinned frames
    /// and sync it.
    pub fn flush_tablespace(&self, tablespace: TablespaceId) -> Result<(), BufferPoolError> {
        let ts = self.tablespace(tablespace)?;
        let pages: Vec<PageId> = self
            .dirty_pages()
            .into_iter()
            .map(|(page, _)| page)
            .filter(|page| page.tablespace == tablespace)
            .collect();
        debug!("Flushing {} page(s) of tablespace {}", pages.len(), tablespace);
        for page in pages {
            self.write_page_by_id(page, WriteKind::Shutdown)?;
        }

        {
            let mut index = self.index.write();
            let bound: Vec<(PageId, FrameId)> = index
                .page_table
                .iter()
                .filter(|(page, _)| page.tablespace == tablespace)
                .map(|(&page, &frame)| (page, frame))
                .collect();
            for (page, frame_id) in bound {
                let mut meta = self.frames[frame_id as usize].meta.lock();
                if meta.use_count > 0 || meta.dirty {
                    continue;
                }
                meta.page_id = None;
                drop(meta);
                index.page_table.remove(&page);
                index.replacer.remove(frame_id);
                index.free_list.push_back(frame_id);
            }
        }

        ts.sync()?;
        Ok(())
    }

    /// Block until no page dirtied by `txn` is waiting for a flush thread
    pub fn wait_for_writes(&self, txn: TxnId) -> Result<(), BufferPoolError> {
        if self.flush_queue.wait_for_txn(txn, self.lock_wait_timeout) {
            Ok(())
        } else {
            warn!("Transaction {} still has scheduled page writes", txn);
            Err(BufferPoolError::WriteWaitTimeout(txn))
        }
    }

    pub fn has_pending_writes(&self, txn: TxnId) -> bool {
        self.flush_queue.has_pending_writes(txn)
    }

    /// Hand pages that have been dirty longer than the stale threshold to
    /// the flush threads
    pub(crate) fn schedule_stale_pages(&self) {
        let now = Instant::now();
        let stale: Vec<(PageId, TxnId)> = {
            let dirty = self.dirty.lock();
            dirty
                .list
                .iter()
                .filter(|&(_, &since)| now.duration_since(since) >= self.stale_page_threshold)
                .filter_map(|(&frame_id, _)| {
                    let meta = self.frames[frame_id as usize].meta.lock();
                    meta.page_id.filter(|_| meta.dirty).map(|page| (page, meta.dirty_txn))
                })
                .collect()
        };
        if !stale.is_empty() {
            debug!("Scheduling {} stale page(s)", stale.len());
            self.flush_queue.schedule(&stale, None);
        }
    }

    /// Write a run of adjacent pages claimed by a flush thread. Pages that
    /// still have predecessors are written one at a time in order; the
    /// rest go out in as few physical writes as adjacency allows.
    pub(crate) fn flush_run(&self, run: &[PageId]) -> RunOutcome {
        let mut outcome = RunOutcome::default();
        let Some(&first) = run.first() else {
            return outcome;
        };
        let tablespace = match self.tablespace(first.tablespace) {
            Ok(ts) => ts,
            Err(e) => {
                outcome.failure = Some(e.to_string());
                return outcome;
            }
        };

        let mut ready: Vec<ReadyPage> = Vec::with_capacity(run.len());
        for &page in run {
            let Some(pin) = self.pin_cached(page) else {
                continue;
            };
            let Some(latch) = pin.frame().data.try_read_arc_for(self.lock_wait_timeout) else {
                outcome.requeue.push(page);
                continue;
            };
            let (writable, ordered) = {
                let dirty = self.dirty.lock();
                let meta = pin.frame().meta.lock();
                (
                    meta.page_id == Some(page) && meta.dirty && !meta.writing,
                    dirty.graph.has_predecessors(pin.frame().id),
                )
            };
            if !writable {
                continue;
            }
            if ordered {
                if let Err(e) = self.write_with_predecessors(pin.frame(), page, &latch[..], WriteKind::Flush) {
                    note_failure(&mut outcome, page, e);
                }
                continue;
            }
            ready.push((page, pin, latch));
        }

        let mut start = 0;
        while start < ready.len() {
            let mut end = start + 1;
            while end < ready.len() && ready[end].0.page_number == ready[end - 1].0.page_number + 1 {
                end += 1;
            }
            if let Err(e) = self.write_adjacent(&*tablespace, &ready[start..end]) {
                note_failure(&mut outcome, ready[start].0, e);
            }
            start = end;
        }
        outcome
    }

    fn write_adjacent(&self, tablespace: &dyn Tablespace, pages: &[ReadyPage]) -> Result<(), BufferPoolError> {
        if pages.len() == 1 {
            let (page, pin, latch) = &pages[0];
            return self.write_with_predecessors(pin.frame(), *page, &latch[..], WriteKind::Flush);
        }

        let writers: Vec<MutexGuard<'_, ()>> = pages.iter().map(|(_, pin, _)| pin.frame().write_lock.lock()).collect();
        let claimed = {
            let dirty = self.dirty.lock();
            let claimable = pages.iter().all(|(page, pin, _)| {
                let meta = pin.frame().meta.lock();
                meta.page_id == Some(*page) && meta.dirty && !dirty.graph.has_predecessors(pin.frame().id)
            });
            if claimable {
                for (_, pin, _) in pages {
                    pin.frame().meta.lock().writing = true;
                }
            }
            claimable
        };

        if !claimed {
            // Something changed since the run was claimed
            drop(writers);
            for (page, pin, latch) in pages {
                self.write_with_predecessors(pin.frame(), *page, &latch[..], WriteKind::Flush)?;
            }
            return Ok(());
        }

        let mut buffer = Vec::with_capacity(self.page_size * pages.len());
        for (page, _, latch) in pages {
            let offset = buffer.len();
            buffer.extend_from_slice(&latch[..]);
            seal(&mut buffer[offset..], page.page_number);
        }
        let result = tablespace.write_pages(pages[0].0.page_number, pages.len(), &buffer, WriteKind::Flush);

        let mut dirty = self.dirty.lock();
        for (_, pin, _) in pages {
            let frame = pin.frame();
            let mut meta = frame.meta.lock();
            meta.writing = false;
            if result.is_ok() {
                meta.dirty = false;
                meta.is_new = false;
                drop(meta);
                dirty.list.remove(&frame.id);
                dirty.graph.clear_frame(frame.id);
            }
        }
        drop(dirty);
        drop(writers);

        match result {
            Ok(()) => {
                CacheCounters::bump(&self.counters.writes, pages.len() as u64);
                Ok(())
            }
            Err(e) => {
                error!("Failed to write {} pages from {}: {}", pages.len(), pages[0].0, e);
                Err(e.into())
            }
        }
    }

    /// Best-effort write of every dirty page whose latch is free right now.
    /// Pages still ordered behind a skipped page stay dirty.
    pub(crate) fn write_dirty_without_waiting(&self) -> usize {
        let mut written = 0;
        loop {
            let mut progress = false;
            for (page_id, _) in self.dirty_pages() {
                let Some(pin) = self.pin_cached(page_id) else {
                    continue;
                };
                let Some(latch) = pin.frame().data.try_read_arc() else {
                    warn!("Page {} is latched; skipped during panic shutdown", page_id);
                    continue;
                };
                match self.write_locked(pin.frame(), page_id, &latch[..], WriteKind::Shutdown) {
                    Ok(WriteOutcome::Written) => {
                        written += 1;
                        progress = true;
                    }
                    Ok(_) => {}
                    Err(e) => error!("Panic shutdown could not write page {}: {}", page_id, e),
                }
            }
            if !progress {
                return written;
            }
        }
    }

    pub(crate) fn flush_thread_count(&self) -> usize {
        self.flushers.lock().len()
    }
}

fn note_failure(outcome: &mut RunOutcome, page: PageId, error: BufferPoolError) {
    match error {
        BufferPoolError::LockTimeout(_) => outcome.requeue.push(page),
        other => {
            outcome.failure.get_or_insert_with(|| other.to_string());
        }
    }
}
