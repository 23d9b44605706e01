use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;
use parking_lot::Mutex;

use crate::common::types::{PageNumber, TablespaceId};
use crate::storage::disk::tablespace::{check_len, Tablespace, TablespaceError, WriteKind};

/// File-backed tablespace: page `n` lives at byte offset `n * page_size`.
pub struct FileTablespace {
    id: TablespaceId,
    page_size: usize,
    db_file: Mutex<File>,
}

impl FileTablespace {
    /// Open (or create) the tablespace file at `path`
    pub fn open(id: TablespaceId, path: impl AsRef<Path>, page_size: usize) -> Result<Self, TablespaceError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;

        debug!("Opened tablespace {} at {}", id, path.as_ref().display());

        Ok(Self {
            id,
            page_size,
            db_file: Mutex::new(file),
        })
    }

    /// Number of pages currently backed by the file
    pub fn page_count(&self) -> Result<PageNumber, TablespaceError> {
        let file = self.db_file.lock();
        let len = file.metadata()?.len();
        Ok((len / self.page_size as u64) as PageNumber)
    }

    fn page_offset(&self, page_number: PageNumber) -> u64 {
        page_number as u64 * self.page_size as u64
    }
}

impl Tablespace for FileTablespace {
    fn id(&self) -> TablespaceId {
        self.id
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, page_number: PageNumber, buf: &mut [u8]) -> Result<(), TablespaceError> {
        check_len(self.page_size, buf.len())?;
        let offset = self.page_offset(page_number);

        let mut file = self.db_file.lock();
        let file_size = file.metadata()?.len();

        // Never written: hand back an unformatted page
        if offset + self.page_size as u64 > file_size {
            buf.fill(0);
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
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
        _kind: WriteKind,
    ) -> Result<(), TablespaceError> {
        check_len(self.page_size * count, buf.len())?;
        let offset = self.page_offset(start);

        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        file.flush()?;
        Ok(())
    }

    fn sync(&self) -> Result<(), TablespaceError> {
        self.db_file.lock().sync_data()?;
        Ok(())
    }
}
