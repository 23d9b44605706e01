use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::error::ErrorClass;
use crate::common::types::{Lsn, PageId, TxnId, VirtualOffset};
use crate::transaction::wal::log_buffer::{LogBuffer, LogBufferConfig, LogBufferError, FRAME_PREFIX};
use crate::transaction::wal::log_iterator::LogRecordIterator;
use crate::transaction::wal::log_record::{LogRecord, LogRecordContent, LogRecordError, LogRecordType};

/// Error type for log manager operations
#[derive(Error, Debug)]
pub enum LogManagerError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Buffer error: {0}")]
    BufferError(#[from] LogBufferError),

    #[error("Log record error: {0}")]
    LogRecordError(#[from] LogRecordError),

    #[error("Invalid log file format")]
    InvalidFormat,

    #[error("Invalid log state: {0}")]
    InvalidState(String),
}

impl LogManagerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LogManagerError::IoError(_) | LogManagerError::BufferError(LogBufferError::WriteFailed(_)) => {
                ErrorClass::Io
            }
            LogManagerError::BufferError(_) | LogManagerError::LogRecordError(_) | LogManagerError::InvalidFormat => {
                ErrorClass::Corruption
            }
            LogManagerError::InvalidState(_) => ErrorClass::InvalidState,
        }
    }
}

/// Result type for log manager operations
pub type Result<T> = std::result::Result<T, LogManagerError>;

/// Fixed header at the front of the log file
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LogFileHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub header_size: u16,
    pub first_lsn: Lsn,
}

impl LogFileHeader {
    pub const MAGIC: [u8; 4] = *b"TNDL";
    pub const VERSION: u16 = 1;
    pub const HEADER_SIZE: u64 = 16;

    fn new(first_lsn: Lsn) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            header_size: Self::HEADER_SIZE as u16,
            first_lsn,
        }
    }

    fn write_to(&self, file: &mut File) -> io::Result<()> {
        let mut bytes = [0u8; Self::HEADER_SIZE as usize];
        bytes[0..4].copy_from_slice(&self.magic);
        LittleEndian::write_u16(&mut bytes[4..6], self.version);
        LittleEndian::write_u16(&mut bytes[6..8], self.header_size);
        LittleEndian::write_u64(&mut bytes[8..16], self.first_lsn);
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&bytes)?;
        file.flush()
    }

    pub fn read_from(file: &mut File) -> io::Result<Self> {
        let mut bytes = [0u8; Self::HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut bytes)?;
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        Ok(Self {
            magic,
            version: LittleEndian::read_u16(&bytes[4..6]),
            header_size: LittleEndian::read_u16(&bytes[6..8]),
            first_lsn: LittleEndian::read_u64(&bytes[8..16]),
        })
    }

    pub fn validate(&self) -> bool {
        self.magic == Self::MAGIC && self.version == Self::VERSION && self.header_size as u64 == Self::HEADER_SIZE
    }
}

/// Configuration for the log manager
#[derive(Debug, Clone)]
pub struct LogManagerConfig {
    /// Directory holding the log file
    pub log_dir: PathBuf,

    /// Name of the log file inside `log_dir`
    pub log_file_name: String,

    /// Size of the in-memory window before it is written out
    pub buffer_size: usize,

    /// Whether written windows are fsync'ed
    pub force_sync: bool,
}

impl Default for LogManagerConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            log_file_name: "tundra.log".to_string(),
            buffer_size: LogBufferConfig::default().buffer_size,
            force_sync: true,
        }
    }
}

impl LogManagerConfig {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(&self.log_file_name)
    }
}

/// A prepared transaction with no commit or abort record after it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InDoubtTransaction {
    pub txn_id: TxnId,
    pub xid: Vec<u8>,
    pub prepare_lsn: Lsn,
}

struct LogState {
    buffer: LogBuffer,
    next_lsn: Lsn,
    /// Last LSN written by each open transaction
    last_lsn: HashMap<TxnId, Lsn>,
}

/// Write-ahead log: one append-only file plus an in-memory tail window.
///
/// Lock order: `state` before `file`.
pub struct LogManager {
    config: LogManagerConfig,
    path: PathBuf,
    state: Mutex<LogState>,
    file: Mutex<File>,
    durable_lsn: AtomicU64,
    recalls: AtomicU64,
}

impl LogManager {
    /// Open the log in `config.log_dir`, creating it if needed. A torn
    /// record at the tail of an existing log is cut off.
    pub fn new(config: LogManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.log_dir)?;
        let path = config.log_path();

        let (file, next_lsn, end_offset) = if path.exists() {
            Self::open_existing(&path)?
        } else {
            let mut file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;
            LogFileHeader::new(1).write_to(&mut file)?;
            file.sync_all()?;
            info!("Created log file {}", path.display());
            (file, 1, 0)
        };

        let buffer = LogBuffer::new(
            LogBufferConfig {
                buffer_size: config.buffer_size,
            },
            end_offset,
        );

        Ok(Self {
            config,
            path,
            state: Mutex::new(LogState {
                buffer,
                next_lsn,
                last_lsn: HashMap::new(),
            }),
            file: Mutex::new(file),
            durable_lsn: AtomicU64::new(next_lsn - 1),
            recalls: AtomicU64::new(0),
        })
    }

    fn open_existing(path: &Path) -> Result<(File, Lsn, VirtualOffset)> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let header = LogFileHeader::read_from(&mut file)?;
        if !header.validate() {
            return Err(LogManagerError::InvalidFormat);
        }

        let mut iter = LogRecordIterator::open(path)?;
        let mut max_lsn = header.first_lsn.saturating_sub(1);
        let mut end = 0;
        while let Some(item) = iter.next() {
            match item {
                Ok((_, record)) => {
                    max_lsn = max_lsn.max(record.lsn);
                    end = iter.position();
                }
                Err(e) => {
                    warn!("Unreadable log record after offset {}: {}", end, e);
                    break;
                }
            }
        }

        let valid_len = LogFileHeader::HEADER_SIZE + end;
        if file.metadata()?.len() > valid_len {
            warn!("Truncating torn log tail of {} at {}", path.display(), valid_len);
            file.set_len(valid_len)?;
        }
        info!("Opened log file {}: next LSN {}", path.display(), max_lsn + 1);
        Ok((file, max_lsn + 1, end))
    }

    /// Append a record for `txn_id`. `Commit`, `Prepare` and `Checkpoint`
    /// records are written out before this returns; if that fails the
    /// record is withdrawn and the error returned.
    pub fn append_log_record(
        &self,
        txn_id: TxnId,
        record_type: LogRecordType,
        content: LogRecordContent,
    ) -> Result<Lsn> {
        self.append_at(txn_id, record_type, content).map(|(lsn, _)| lsn)
    }

    /// Like `append_log_record`, also returning the record's virtual offset
    pub(crate) fn append_at(
        &self,
        txn_id: TxnId,
        record_type: LogRecordType,
        content: LogRecordContent,
    ) -> Result<(Lsn, VirtualOffset)> {
        let mut state = self.state.lock();
        let lsn = state.next_lsn;
        let prev_lsn = match txn_id {
            0 => 0,
            id => state.last_lsn.get(&id).copied().unwrap_or(0),
        };

        let record = LogRecord::new(lsn, txn_id, prev_lsn, record_type, content);
        let offset = state.buffer.append(&record)?;
        state.next_lsn += 1;

        let durable = matches!(
            record_type,
            LogRecordType::Commit | LogRecordType::Prepare | LogRecordType::Checkpoint
        );
        if durable || state.buffer.needs_flush() {
            if let Err(e) = self.flush_locked(&mut state) {
                if durable {
                    state.buffer.truncate(offset);
                }
                return Err(e);
            }
        }

        match record_type {
            LogRecordType::Commit | LogRecordType::Abort => {
                state.last_lsn.remove(&txn_id);
            }
            _ if txn_id != 0 => {
                state.last_lsn.insert(txn_id, lsn);
            }
            _ => {}
        }
        Ok((lsn, offset))
    }

    /// Write the tail window to the file
    pub fn flush(&self) -> Result<Lsn> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut LogState) -> Result<Lsn> {
        let mut file = self.file.lock();
        let position = LogFileHeader::HEADER_SIZE + state.buffer.base_offset();
        let force_sync = self.config.force_sync;

        let max_lsn = state.buffer.flush(|data| {
            file.seek(SeekFrom::Start(position))?;
            file.write_all(data)?;
            file.flush()?;
            if force_sync {
                file.sync_data()?;
            }
            Ok(())
        })?;

        if max_lsn > 0 {
            self.durable_lsn.fetch_max(max_lsn, Ordering::SeqCst);
            debug!("Log flushed through LSN {}", max_lsn);
        }
        Ok(max_lsn)
    }

    /// Read the record framed at `offset`, from the tail window if it is
    /// still there or from the file otherwise.
    pub fn read_at(&self, offset: VirtualOffset) -> Result<LogRecord> {
        let state = self.state.lock();
        if state.buffer.contains(offset) {
            return Ok(state.buffer.record_at(offset)?);
        }
        if offset >= state.buffer.base_offset() {
            return Err(LogManagerError::InvalidState(format!(
                "offset {} is past the end of the log",
                offset
            )));
        }

        self.recalls.fetch_add(1, Ordering::Relaxed);
        let mut file = self.file.lock();
        drop(state);

        file.seek(SeekFrom::Start(LogFileHeader::HEADER_SIZE + offset))?;
        let mut prefix = [0u8; FRAME_PREFIX];
        file.read_exact(&mut prefix)?;
        let mut data = vec![0u8; LittleEndian::read_u32(&prefix) as usize];
        file.read_exact(&mut data)?;
        Ok(LogRecord::deserialize(&data)?)
    }

    /// Log a checkpoint record and make it durable
    pub fn checkpoint(&self, active_txns: &[TxnId], dirty_pages: &[(PageId, TxnId)]) -> Result<Lsn> {
        let record = LogRecord::new_checkpoint(0, active_txns.to_vec(), dirty_pages.to_vec());
        self.append_log_record(0, LogRecordType::Checkpoint, record.content)
    }

    /// Iterate over every record written so far
    pub fn iter(&self) -> Result<LogRecordIterator> {
        self.flush()?;
        LogRecordIterator::open(&self.path)
    }

    /// Prepared transactions whose outcome was never logged
    pub fn in_doubt_transactions(&self) -> Result<Vec<InDoubtTransaction>> {
        let mut prepared: BTreeMap<TxnId, InDoubtTransaction> = BTreeMap::new();
        for item in self.iter()? {
            let (_, record) = item?;
            match record.record_type {
                LogRecordType::Prepare => {
                    let xid = record.xid().map(<[u8]>::to_vec).unwrap_or_default();
                    prepared.insert(
                        record.txn_id,
                        InDoubtTransaction {
                            txn_id: record.txn_id,
                            xid,
                            prepare_lsn: record.lsn,
                        },
                    );
                }
                LogRecordType::Commit | LogRecordType::Abort => {
                    prepared.remove(&record.txn_id);
                }
                _ => {}
            }
        }
        Ok(prepared.into_values().collect())
    }

    /// Next LSN to be assigned
    pub fn current_lsn(&self) -> Lsn {
        self.state.lock().next_lsn
    }

    /// Highest LSN known to be written to the file
    pub fn durable_lsn(&self) -> Lsn {
        self.durable_lsn.load(Ordering::SeqCst)
    }

    /// How many reads had to go to the file because the window moved on
    pub fn window_recalls(&self) -> u64 {
        self.recalls.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
