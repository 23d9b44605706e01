//! In-memory tablespace for tests and crash simulation.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::common::types::{PageNumber, TablespaceId};
use crate::storage::disk::tablespace::{check_len, Tablespace, TablespaceError, WriteKind};

/// One physical write as observed by the tablespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteEvent {
    pub start: PageNumber,
    pub count: usize,
    pub kind: WriteKind,
}

/// Tablespace that keeps its "disk" in a `HashMap`.
///
/// Outlives any buffer cache it is registered with, so dropping the cache
/// without writing is a faithful crash: only written pages survive. Every
/// physical write is recorded in order, which lets tests check write
/// ordering, and writes can be made to fail on demand.
pub struct MemoryTablespace {
    id: TablespaceId,
    page_size: usize,
    pages: Mutex<HashMap<PageNumber, Box<[u8]>>>,
    history: Mutex<Vec<WriteEvent>>,
    fail_writes: AtomicBool,
}

impl MemoryTablespace {
    pub fn new(id: TablespaceId, page_size: usize) -> Self {
        Self {
            id,
            page_size,
            pages: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail with an I/O error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Physical writes in the order they happened
    pub fn write_history(&self) -> Vec<WriteEvent> {
        self.history.lock().clone()
    }

    /// Position of the first write that covered `page_number`
    pub fn first_write_of(&self, page_number: PageNumber) -> Option<usize> {
        self.history
            .lock()
            .iter()
            .position(|w| (w.start..w.start + w.count as PageNumber).contains(&page_number))
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    /// Raw stored image of a page, if it was ever written
    pub fn stored_page(&self, page_number: PageNumber) -> Option<Vec<u8>> {
        self.pages.lock().get(&page_number).map(|p| p.to_vec())
    }

    /// Overwrite the stored image directly, bypassing the cache
    pub fn put_raw(&self, page_number: PageNumber, image: &[u8]) {
        self.pages.lock().insert(page_number, image.to_vec().into_boxed_slice());
    }
}

impl Tablespace for MemoryTablespace {
    fn id(&self) -> TablespaceId {
        self.id
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, page_number: PageNumber, buf: &mut [u8]) -> Result<(), TablespaceError> {
        check_len(self.page_size, buf.len())?;
        match self.pages.lock().get(&page_number) {
            Some(page) => buf.copy_from_slice(page),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_page(&self, page_number: PageNumber, buf: &[u8], kind: WriteKind) -> Result<(), TablespaceError> {
        self.write_pages(page_number, 1, buf, kind)
    }

    fn write_pages(
        &self,
        start: PageNumber,
        count: usize,
        buf: &[u8],
        kind: WriteKind,
    ) -> Result<(), TablespaceError> {
        check_len(self.page_size * count, buf.len())?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected write failure").into());
        }

        let mut pages = self.pages.lock();
        for (i, chunk) in buf.chunks_exact(self.page_size).enumerate() {
            pages.insert(start + i as PageNumber, chunk.to_vec().into_boxed_slice());
        }
        self.history.lock().push(WriteEvent { start, count, kind });
        Ok(())
    }

    fn sync(&self) -> Result<(), TablespaceError> {
        Ok(())
    }
}
