use std::time::Instant;

use log::debug;

use super::BufferCache;
use crate::common::types::{FrameId, LockMode, PageId, PageNumber, TablespaceId, TxnId};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::guard::PageGuard;
use crate::storage::buffer::precedence::PrecedenceError;
use crate::storage::disk::WriteKind;

enum Blocked {
    Writing(FrameId),
    Cycle,
}

impl BufferCache {
    /// Record that `txn` modified the exclusively latched page. Must be
    /// called before the page image is changed.
    pub fn mark_dirty(&self, guard: &PageGuard, txn: TxnId) -> Result<(), BufferPoolError> {
        require_exclusive(guard, "mark_dirty")?;
        let frame = guard.frame();

        let mut dirty = self.dirty.lock();
        let mut meta = frame.meta.lock();
        if !meta.dirty {
            meta.dirty = true;
            dirty.list.insert(frame.id, Instant::now());
        }
        meta.dirty_txn = txn;
        Ok(())
    }

    /// Drop the dirty state of a page without writing it. Ordering edges
    /// touching it are removed.
    pub fn mark_clean(&self, guard: &PageGuard) -> Result<(), BufferPoolError> {
        require_exclusive(guard, "mark_clean")?;
        let frame = guard.frame();

        let mut dirty = self.dirty.lock();
        let mut meta = frame.meta.lock();
        meta.dirty = false;
        meta.is_new = false;
        drop(meta);
        dirty.list.remove(&frame.id);
        let dropped = dirty.graph.clear_frame(frame.id);
        if dropped > 0 {
            debug!("Cleared {} ordering edge(s) of page {}", dropped, guard.page_id());
        }
        Ok(())
    }

    /// Require that the page held by `must_precede` reaches disk no later
    /// than page `must_follow` of the same tablespace.
    ///
    /// Nothing is recorded when `must_precede` is clean or `must_follow` is
    /// not cached. If the new edge would close a cycle, `must_follow` is
    /// written first; the caller must not hold it latched exclusively then.
    pub fn add_precedence(&self, must_precede: &PageGuard, must_follow: PageNumber) -> Result<(), BufferPoolError> {
        let precede_frame = must_precede.frame().id;
        let follow_id = PageId::new(must_precede.page_id().tablespace, must_follow);
        if follow_id == must_precede.page_id() {
            return Ok(());
        }

        loop {
            let blocked = {
                let index = self.index.read();
                let Some(&follow_frame) = index.page_table.get(&follow_id) else {
                    return Ok(());
                };
                let mut dirty = self.dirty.lock();
                if !self.frames[precede_frame as usize].meta.lock().dirty {
                    return Ok(());
                }
                if self.frames[follow_frame as usize].meta.lock().writing {
                    Blocked::Writing(follow_frame)
                } else {
                    match dirty.graph.add(precede_frame, follow_frame) {
                        Ok(_) | Err(PrecedenceError::SelfEdge(_)) => return Ok(()),
                        Err(PrecedenceError::Cycle { .. }) => Blocked::Cycle,
                    }
                }
            };

            match blocked {
                // Wait for the in-progress write to finish, then retry
                Blocked::Writing(frame_id) => drop(self.frames[frame_id as usize].write_lock.lock()),
                Blocked::Cycle => {
                    debug!(
                        "Ordering {} before {} would form a cycle; writing {} first",
                        must_precede.page_id(),
                        follow_id,
                        follow_id
                    );
                    self.write_page_by_id(follow_id, WriteKind::Precedence)?;
                }
            }
        }
    }

    /// Whether writing page `from` is (transitively) ordered before `to`
    pub fn exists_dependency(&self, from: PageId, to: PageId) -> bool {
        let index = self.index.read();
        let (Some(&a), Some(&b)) = (index.page_table.get(&from), index.page_table.get(&to)) else {
            return false;
        };
        self.dirty.lock().graph.exists_dependency(a, b)
    }

    /// Discard a released page from the cache without writing it.
    /// Returns whether the page was dirty.
    pub fn free_page(&self, page_id: PageId) -> Result<bool, BufferPoolError> {
        let Some(pin) = self.pin_cached(page_id) else {
            return Ok(false);
        };
        let latch = self
            .acquire_latch(pin.frame(), LockMode::Exclusive)
            .ok_or(BufferPoolError::LockTimeout(page_id))?;
        if pin.frame().page_id() != Some(page_id) {
            return Ok(false);
        }
        let guard = PageGuard::new(page_id, pin, latch);
        let was_dirty = guard.is_dirty();
        self.mark_clean(&guard)?;
        Ok(was_dirty)
    }

    /// Dirty pages in order of first modification, with the transaction
    /// that last dirtied each
    pub fn dirty_pages(&self) -> Vec<(PageId, TxnId)> {
        let dirty = self.dirty.lock();
        dirty
            .list
            .keys()
            .filter_map(|&frame_id| {
                let meta = self.frames[frame_id as usize].meta.lock();
                meta.page_id.filter(|_| meta.dirty).map(|page| (page, meta.dirty_txn))
            })
            .collect()
    }

    pub fn has_dirty_pages(&self, tablespace: TablespaceId) -> bool {
        self.dirty_pages().iter().any(|(page, _)| page.tablespace == tablespace)
    }
}

fn require_exclusive(guard: &PageGuard, operation: &str) -> Result<(), BufferPoolError> {
    if guard.mode() != LockMode::Exclusive {
        return Err(BufferPoolError::InvalidOperation(format!(
            "{} on page {} requires an exclusive latch",
            operation,
            guard.page_id()
        )));
    }
    Ok(())
}
