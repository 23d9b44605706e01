use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::common::types::{Lsn, VirtualOffset};
use crate::transaction::wal::log_record::{LogRecord, LogRecordError};

/// Bytes of the length prefix in front of every framed record
pub const FRAME_PREFIX: usize = 4;

/// Error type for log buffer operations
#[derive(Error, Debug)]
pub enum LogBufferError {
    #[error("Log record error: {0}")]
    LogRecordError(#[from] LogRecordError),

    #[error("Offset {0} is not the start of a buffered record")]
    BadOffset(VirtualOffset),

    #[error("Failed to write log window: {0}")]
    WriteFailed(#[from] std::io::Error),
}

/// Result type for log buffer operations
pub type Result<T> = std::result::Result<T, LogBufferError>;

/// Configuration for log buffer behavior
#[derive(Debug, Clone)]
pub struct LogBufferConfig {
    /// Window size in bytes after which the log manager writes it out
    pub buffer_size: usize,
}

impl Default for LogBufferConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024 * 1024, // 1 MB default
        }
    }
}

/// The unwritten tail of the log.
///
/// Records are framed as `[len: u32 LE][bincode record]`. The window starts
/// at `base_offset` in the log's virtual address space, so a record keeps
/// the same offset before and after the window is written out.
#[derive(Debug)]
pub struct LogBuffer {
    config: LogBufferConfig,
    window: Vec<u8>,
    base_offset: VirtualOffset,
    max_lsn: Lsn,
}

impl LogBuffer {
    pub fn new(config: LogBufferConfig, base_offset: VirtualOffset) -> Self {
        Self {
            window: Vec::with_capacity(config.buffer_size),
            config,
            base_offset,
            max_lsn: 0,
        }
    }

    /// Frame a record into the window and return its virtual offset
    pub fn append(&mut self, record: &LogRecord) -> Result<VirtualOffset> {
        let data = record.serialize()?;
        let offset = self.end_offset();

        let mut prefix = [0u8; FRAME_PREFIX];
        LittleEndian::write_u32(&mut prefix, data.len() as u32);
        self.window.extend_from_slice(&prefix);
        self.window.extend_from_slice(&data);

        self.max_lsn = self.max_lsn.max(record.lsn);
        Ok(offset)
    }

    /// Whether the window has grown past its configured size
    pub fn needs_flush(&self) -> bool {
        self.window.len() >= self.config.buffer_size
    }

    pub fn base_offset(&self) -> VirtualOffset {
        self.base_offset
    }

    pub fn end_offset(&self) -> VirtualOffset {
        self.base_offset + self.window.len() as VirtualOffset
    }

    pub fn contains(&self, offset: VirtualOffset) -> bool {
        offset >= self.base_offset && offset < self.end_offset()
    }

    /// Decode the record framed at `offset`, which must lie in the window
    pub fn record_at(&self, offset: VirtualOffset) -> Result<LogRecord> {
        if !self.contains(offset) {
            return Err(LogBufferError::BadOffset(offset));
        }
        let start = (offset - self.base_offset) as usize;
        if start + FRAME_PREFIX > self.window.len() {
            return Err(LogBufferError::BadOffset(offset));
        }
        let len = LittleEndian::read_u32(&self.window[start..start + FRAME_PREFIX]) as usize;
        let body = start + FRAME_PREFIX;
        if body + len > self.window.len() {
            return Err(LogBufferError::BadOffset(offset));
        }
        Ok(LogRecord::deserialize(&self.window[body..body + len])?)
    }

    /// Hand the window to `writer`, then start a new empty window right
    /// after it. Returns the highest LSN written, or 0 if nothing was.
    pub fn flush<F>(&mut self, mut writer: F) -> Result<Lsn>
    where
        F: FnMut(&[u8]) -> std::io::Result<()>,
    {
        if self.window.is_empty() {
            return Ok(0);
        }
        writer(&self.window)?;

        let max_lsn = self.max_lsn;
        self.base_offset = self.end_offset();
        self.window.clear();
        self.max_lsn = 0;
        Ok(max_lsn)
    }

    /// Drop everything from `offset` on. Used to withdraw a record that
    /// could not be made durable.
    pub fn truncate(&mut self, offset: VirtualOffset) {
        if self.contains(offset) {
            self.window.truncate((offset - self.base_offset) as usize);
        }
    }

    /// Get current buffer utilization as a fraction of the window size
    pub fn utilization(&self) -> f32 {
        self.window.len() as f32 / self.config.buffer_size as f32
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::wal::log_record::{LogRecordContent, LogRecordType};

    fn spill_record(lsn: Lsn, bytes: &[u8]) -> LogRecord {
        LogRecord::new(lsn, 1, 0, LogRecordType::Spill, LogRecordContent::Spill(bytes.to_vec()))
    }

    #[test]
    fn test_offsets_survive_flush() {
        let mut buffer = LogBuffer::new(LogBufferConfig { buffer_size: 1024 }, 0);
        let first = buffer.append(&spill_record(1, b"alpha")).unwrap();
        let second = buffer.append(&spill_record(2, b"beta")).unwrap();
        assert_eq!(first, 0);
        assert!(second > first);
        assert!(buffer.contains(second));

        let mut output = Vec::new();
        let max_lsn = buffer
            .flush(|data| {
                output.extend_from_slice(data);
                Ok(())
            })
            .unwrap();

        assert_eq!(max_lsn, 2);
        assert!(buffer.is_empty());
        assert_eq!(buffer.base_offset(), output.len() as VirtualOffset);
        assert!(!buffer.contains(second));

        let third = buffer.append(&spill_record(3, b"gamma")).unwrap();
        assert_eq!(third, output.len() as VirtualOffset);
        match buffer.record_at(third).unwrap().content {
            LogRecordContent::Spill(bytes) => assert_eq!(bytes, b"gamma"),
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[test]
    fn test_failed_write_keeps_window() {
        let mut buffer = LogBuffer::new(LogBufferConfig { buffer_size: 16 }, 100);
        buffer.append(&spill_record(1, &[7u8; 32])).unwrap();
        assert!(buffer.needs_flush());

        let result = buffer.flush(|_| Err(std::io::Error::other("disk full")));
        assert!(matches!(result, Err(LogBufferError::WriteFailed(_))));
        assert!(!buffer.is_empty());
        assert!(buffer.contains(100));
    }
}
