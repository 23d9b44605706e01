mod basic_operations;
mod dirty_pages;
mod flushing;
mod frame_management;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use linked_hash_map::LinkedHashMap;
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::common::config::EngineConfig;
use crate::common::types::{FrameId, PageId, TablespaceId};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::flusher::{spawn_flusher, FlushQueue};
use crate::storage::buffer::frame::{thread_pins, Frame, FrameInfo};
use crate::storage::buffer::precedence::PrecedenceGraph;
use crate::storage::buffer::replacer::LRUReplacer;
use crate::storage::disk::Tablespace;

/// Page table, LRU queue and unbound frames
pub(crate) struct CacheIndex {
    pub page_table: HashMap<PageId, FrameId>,
    pub free_list: VecDeque<FrameId>,
    pub replacer: LRUReplacer,
}

/// Dirty frames (in order of first modification) and the ordering
/// constraints between them
pub(crate) struct DirtyState {
    pub list: LinkedHashMap<FrameId, Instant>,
    pub graph: PrecedenceGraph,
}

#[derive(Default)]
pub(crate) struct CacheCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub writes: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheCounters {
    pub fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// Snapshot of cache occupancy and activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub frames: usize,
    pub bound: usize,
    pub in_use: usize,
    pub dirty: usize,
    pub longest_chain: usize,
    pub live_edges: usize,
    pub free_edges: usize,
    pub pending_flush: usize,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
}

/// Fixed pool of page frames with write-ordering guarantees.
///
/// Lock order, outermost first:
/// 1. page latches held through `PageGuard`s
/// 2. `index` (page table, LRU, free list)
/// 3. a frame's `write_lock`
/// 4. `dirty` (dirty list, precedence graph)
/// 5. a frame's metadata mutex (leaf)
///
/// Nothing blocks on a page latch while holding `index` or `dirty`;
/// eviction only try-latches frames whose use-count is zero. Latches on
/// two different pages are not ordered, so waits for them are bounded by
/// the lock-wait timeout.
pub struct BufferCache {
    pub(crate) page_size: usize,
    pub(crate) lock_wait_timeout: Duration,
    pub(crate) stale_page_threshold: Duration,
    pub(crate) frames: Vec<Arc<Frame>>,
    pub(crate) index: RwLock<CacheIndex>,
    pub(crate) dirty: Mutex<DirtyState>,
    pub(crate) tablespaces: RwLock<HashMap<TablespaceId, Arc<dyn Tablespace>>>,
    pub(crate) flush_queue: Arc<FlushQueue>,
    pub(crate) counters: CacheCounters,
    panic_mode: AtomicBool,
    flushers: Mutex<Vec<JoinHandle<()>>>,
}

impl BufferCache {
    /// Build the frame pool and start the background flush threads
    pub fn new(config: &EngineConfig) -> Result<Arc<Self>, BufferPoolError> {
        config
            .validate()
            .map_err(|e| BufferPoolError::InvalidOperation(e.to_string()))?;

        let pool_size = config.buffer_pool_frames;
        let frames: Vec<Arc<Frame>> = (0..pool_size)
            .map(|i| Arc::new(Frame::new(i as FrameId, config.page_size)))
            .collect();

        let cache = Arc::new(Self {
            page_size: config.page_size,
            lock_wait_timeout: config.lock_wait_timeout(),
            stale_page_threshold: config.stale_page_threshold(),
            frames,
            index: RwLock::new(CacheIndex {
                page_table: HashMap::with_capacity(pool_size),
                free_list: (0..pool_size as FrameId).collect(),
                replacer: LRUReplacer::new(pool_size),
            }),
            dirty: Mutex::new(DirtyState {
                list: LinkedHashMap::new(),
                graph: PrecedenceGraph::new(pool_size),
            }),
            tablespaces: RwLock::new(HashMap::new()),
            flush_queue: Arc::new(FlushQueue::new()),
            counters: CacheCounters::default(),
            panic_mode: AtomicBool::new(false),
            flushers: Mutex::new(Vec::new()),
        });

        {
            let mut flushers = cache.flushers.lock();
            for i in 0..config.flush_threads {
                let handle = spawn_flusher(
                    Arc::downgrade(&cache),
                    Arc::clone(&cache.flush_queue),
                    i,
                    config.flush_run_limit,
                    config.purifier_interval(),
                )
                .map_err(|e| BufferPoolError::InvalidOperation(format!("failed to start flush thread: {}", e)))?;
                flushers.push(handle);
            }
        }

        info!(
            "Page cache ready: {} frames of {} bytes, {} flush thread(s)",
            pool_size, config.page_size, config.flush_threads
        );
        Ok(cache)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn register_tablespace(&self, tablespace: Arc<dyn Tablespace>) -> Result<(), BufferPoolError> {
        if tablespace.page_size() != self.page_size {
            return Err(BufferPoolError::InvalidOperation(format!(
                "tablespace {} uses {}-byte pages, cache uses {}",
                tablespace.id(),
                tablespace.page_size(),
                self.page_size
            )));
        }
        self.tablespaces.write().insert(tablespace.id(), tablespace);
        Ok(())
    }

    pub(crate) fn tablespace(&self, id: TablespaceId) -> Result<Arc<dyn Tablespace>, BufferPoolError> {
        self.tablespaces
            .read()
            .get(&id)
            .cloned()
            .ok_or(BufferPoolError::UnknownTablespace(id))
    }

    pub(crate) fn check_panic(&self) -> Result<(), BufferPoolError> {
        if self.panic_mode.load(Ordering::SeqCst) && thread_pins() == 0 {
            return Err(BufferPoolError::PanicShutdown);
        }
        Ok(())
    }

    pub fn is_panicking(&self) -> bool {
        self.panic_mode.load(Ordering::SeqCst)
    }

    /// Metadata of the frame bound to `page_id`, if cached
    pub fn frame_info(&self, page_id: PageId) -> Option<FrameInfo> {
        let index = self.index.read();
        let frame_id = *index.page_table.get(&page_id)?;
        self.frames[frame_id as usize].info()
    }

    pub fn stats(&self) -> CacheStats {
        let pending_flush = self.flush_queue.pending_len();
        let index = self.index.read();
        let dirty = self.dirty.lock();

        let mut in_use = 0;
        let mut dirty_frames = 0;
        for frame in &self.frames {
            let meta = frame.meta.lock();
            in_use += usize::from(meta.use_count > 0);
            dirty_frames += usize::from(meta.dirty);
        }

        CacheStats {
            frames: self.frames.len(),
            bound: index.page_table.len(),
            in_use,
            dirty: dirty_frames,
            longest_chain: dirty.graph.longest_chain(),
            live_edges: dirty.graph.live_edges(),
            free_edges: dirty.graph.free_edges(),
            pending_flush,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    /// Graceful shutdown: write every dirty page, then stop the flush threads.
    pub fn shutdown(&self) -> Result<(), BufferPoolError> {
        info!("Shutting down page cache");
        let ids: Vec<TablespaceId> = self.tablespaces.read().keys().copied().collect();

        let mut first_error = None;
        for id in ids {
            if let Err(e) = self.flush_tablespace(id) {
                error!("Failed to flush tablespace {} during shutdown: {}", id, e);
                first_error.get_or_insert(e);
            }
        }
        self.stop_flushers();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Panic shutdown: refuse new page faults from threads that hold no
    /// pins, write what can be written without waiting, stop the flushers.
    pub fn shutdown_now(&self) {
        if self.panic_mode.swap(true, Ordering::SeqCst) {
            return;
        }
        error!("Page cache entering panic shutdown");

        let written = self.write_dirty_without_waiting();
        warn!("Panic shutdown wrote {} dirty page(s)", written);
        self.stop_flushers();
    }

    fn stop_flushers(&self) {
        self.flush_queue.shutdown();
        let handles: Vec<JoinHandle<()>> = self.flushers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("A flush thread panicked");
            }
        }
    }
}

impl Drop for BufferCache {
    fn drop(&mut self) {
        // Threads hold only weak references; tell them to exit.
        self.flush_queue.shutdown();
    }
}
