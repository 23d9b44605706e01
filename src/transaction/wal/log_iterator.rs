use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::VirtualOffset;
use crate::transaction::wal::log_buffer::FRAME_PREFIX;
use crate::transaction::wal::log_manager::{LogFileHeader, LogManagerError, Result};
use crate::transaction::wal::log_record::LogRecord;

/// Sequential reader over the records of a log file.
///
/// Yields each record with its virtual offset. Iteration ends quietly at a
/// torn frame (a crash during the last write); a frame that is complete
/// but does not decode is reported once as an error.
pub struct LogRecordIterator {
    reader: BufReader<File>,
    position: VirtualOffset,
    end: VirtualOffset,
    reached_end: bool,
}

impl LogRecordIterator {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).open(path)?;
        let header = LogFileHeader::read_from(&mut file)?;
        if !header.validate() {
            return Err(LogManagerError::InvalidFormat);
        }

        let end = file.metadata()?.len().saturating_sub(LogFileHeader::HEADER_SIZE);
        file.seek(SeekFrom::Start(LogFileHeader::HEADER_SIZE))?;
        Ok(Self {
            reader: BufReader::new(file),
            position: 0,
            end,
            reached_end: false,
        })
    }

    /// Virtual offset just past the last record returned
    pub fn position(&self) -> VirtualOffset {
        self.position
    }

    fn read_next(&mut self) -> Result<Option<(VirtualOffset, LogRecord)>> {
        if self.position + FRAME_PREFIX as u64 > self.end {
            return Ok(None);
        }

        let mut prefix = [0u8; FRAME_PREFIX];
        self.reader.read_exact(&mut prefix)?;
        let len = LittleEndian::read_u32(&prefix) as u64;
        let frame_end = self.position + FRAME_PREFIX as u64 + len;
        if frame_end > self.end {
            return Ok(None);
        }

        let mut data = vec![0u8; len as usize];
        match self.reader.read_exact(&mut data) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let offset = self.position;
        let record = LogRecord::deserialize(&data)?;
        self.position = frame_end;
        Ok(Some((offset, record)))
    }
}

impl Iterator for LogRecordIterator {
    type Item = Result<(VirtualOffset, LogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.reached_end {
            return None;
        }
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.reached_end = true;
                None
            }
            Err(e) => {
                self.reached_end = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::wal::log_manager::{LogManager, LogManagerConfig};
    use crate::transaction::wal::log_record::{LogRecordContent, LogRecordType};
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_torn_tail_ends_iteration() {
        let dir = TempDir::new().unwrap();
        let config = LogManagerConfig {
            force_sync: false,
            ..LogManagerConfig::in_dir(dir.path())
        };
        let path = config.log_path();
        {
            let log = LogManager::new(config.clone()).unwrap();
            for txn in 1..=3 {
                log.append_log_record(txn, LogRecordType::Spill, LogRecordContent::Spill(vec![txn as u8; 10]))
                    .unwrap();
            }
            log.flush().unwrap();
        }

        // A frame that claims more bytes than were written
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
        drop(file);

        let records: Vec<_> = LogRecordIterator::open(&path).unwrap().collect();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.is_ok()));

        // Reopening cuts the torn frame off and keeps numbering
        let log = LogManager::new(config).unwrap();
        assert_eq!(log.current_lsn(), 4);
        assert_eq!(log.iter().unwrap().count(), 3);
    }
}
