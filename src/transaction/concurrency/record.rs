//! Record versions: one MVCC version of one row.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::common::types::{RecordNumber, SavepointId, TableId, TxnId};
use crate::transaction::concurrency::table::RowTable;
use crate::transaction::wal::{RecordImage, RecordImageKind, SpillError, SpillHandle, SpillStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// A new row image
    Data,
    /// Deletion of the row
    Deleted,
    /// A row lock without a new image
    Lock,
}

/// Where a version's payload currently lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    /// In memory, never spilled
    Warm(Vec<u8>),
    /// Spilled; only the handle is kept in memory
    Chilled(SpillHandle),
    /// Spilled and read back; the spilled copy is still valid
    Thawed { data: Vec<u8>, handle: SpillHandle },
    /// No payload (deletions and locks)
    Absent,
}

impl RecordData {
    fn resident_size(&self) -> usize {
        match self {
            RecordData::Warm(data) | RecordData::Thawed { data, .. } => data.len(),
            RecordData::Chilled(_) | RecordData::Absent => 0,
        }
    }
}

/// One version of one row, created by one transaction.
///
/// Versions are shared between the creating transaction's record chain and
/// the table's version chain, so everything that changes after creation
/// sits behind atomics or the payload mutex.
pub struct RecordVersion {
    table: Arc<dyn RowTable>,
    record_number: RecordNumber,
    transaction_id: TxnId,
    kind: RecordKind,
    /// The version this one replaced
    prior: Option<Arc<RecordVersion>>,
    savepoint_id: AtomicU32,
    /// A later version by the same transaction replaced this one
    superseded: AtomicBool,
    /// The owner is mutating the payload; chilling must leave it alone
    no_chill: AtomicBool,
    body: Mutex<RecordData>,
}

impl RecordVersion {
    pub fn new(
        table: Arc<dyn RowTable>,
        record_number: RecordNumber,
        transaction_id: TxnId,
        kind: RecordKind,
        data: Option<Vec<u8>>,
        prior: Option<Arc<RecordVersion>>,
    ) -> Arc<Self> {
        let body = match (kind, data) {
            (RecordKind::Data, Some(data)) => RecordData::Warm(data),
            _ => RecordData::Absent,
        };
        Arc::new(Self {
            table,
            record_number,
            transaction_id,
            kind,
            prior,
            savepoint_id: AtomicU32::new(0),
            superseded: AtomicBool::new(false),
            no_chill: AtomicBool::new(false),
            body: Mutex::new(body),
        })
    }

    pub fn table(&self) -> &Arc<dyn RowTable> {
        &self.table
    }

    pub fn table_id(&self) -> TableId {
        self.table.table_id()
    }

    pub fn record_number(&self) -> RecordNumber {
        self.record_number
    }

    pub fn transaction_id(&self) -> TxnId {
        self.transaction_id
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn is_lock(&self) -> bool {
        self.kind == RecordKind::Lock
    }

    pub fn prior(&self) -> Option<&Arc<RecordVersion>> {
        self.prior.as_ref()
    }

    pub fn savepoint_id(&self) -> SavepointId {
        self.savepoint_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_savepoint_id(&self, id: SavepointId) {
        self.savepoint_id.store(id, Ordering::Release);
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::Acquire)
    }

    pub(crate) fn set_superseded(&self, superseded: bool) {
        self.superseded.store(superseded, Ordering::Release);
    }

    pub fn is_no_chill(&self) -> bool {
        self.no_chill.load(Ordering::Acquire)
    }

    /// Pin the payload in memory while the owner edits it
    pub fn set_no_chill(&self, no_chill: bool) {
        self.no_chill.store(no_chill, Ordering::Release);
    }

    pub fn is_chilled(&self) -> bool {
        matches!(*self.body.lock(), RecordData::Chilled(_))
    }

    /// Payload bytes currently held in memory
    pub fn resident_size(&self) -> usize {
        self.body.lock().resident_size()
    }

    /// Current payload state
    pub fn data(&self) -> RecordData {
        self.body.lock().clone()
    }

    /// The payload if it is in memory
    pub fn payload(&self) -> Option<Vec<u8>> {
        match &*self.body.lock() {
            RecordData::Warm(data) | RecordData::Thawed { data, .. } => Some(data.clone()),
            RecordData::Chilled(_) | RecordData::Absent => None,
        }
    }

    /// The payload, read from `store` without thawing if it is chilled
    pub fn load_payload(&self, store: &dyn SpillStore) -> Result<Option<Vec<u8>>, SpillError> {
        let handle = match &*self.body.lock() {
            RecordData::Warm(data) | RecordData::Thawed { data, .. } => return Ok(Some(data.clone())),
            RecordData::Absent => return Ok(None),
            RecordData::Chilled(handle) => *handle,
        };
        store.load(handle).map(Some)
    }

    /// Move the payload out of memory. Returns the bytes released, or `None`
    /// when there was nothing to release.
    pub(crate) fn chill(&self, store: &dyn SpillStore, owner: TxnId) -> Result<Option<usize>, SpillError> {
        let mut body = self.body.lock();
        let (released, handle) = match &*body {
            RecordData::Warm(data) => (data.len(), store.store(owner, data)?),
            // The spilled copy is still good
            RecordData::Thawed { data, handle } => (data.len(), *handle),
            RecordData::Chilled(_) | RecordData::Absent => return Ok(None),
        };
        *body = RecordData::Chilled(handle);
        Ok(Some(released))
    }

    /// Bring a chilled payload back into memory. Returns the restored size,
    /// or `None` if the payload was not chilled.
    pub(crate) fn thaw(&self, store: &dyn SpillStore) -> Result<Option<usize>, SpillError> {
        let mut body = self.body.lock();
        let RecordData::Chilled(handle) = *body else {
            return Ok(None);
        };
        let data = store.load(handle)?;
        let restored = data.len();
        *body = RecordData::Thawed { data, handle };
        Ok(Some(restored))
    }

    /// After-image for the log
    pub(crate) fn image(&self) -> RecordImage {
        let (data, spilled_at) = match &*self.body.lock() {
            RecordData::Warm(data) => (Some(data.clone()), None),
            RecordData::Thawed { handle, .. } | RecordData::Chilled(handle) => (None, Some(handle.offset)),
            RecordData::Absent => (None, None),
        };
        RecordImage {
            table_id: self.table_id(),
            record_number: self.record_number,
            kind: match self.kind {
                RecordKind::Deleted => RecordImageKind::Deleted,
                _ => RecordImageKind::Data,
            },
            data,
            spilled_at,
        }
    }
}

impl fmt::Debug for RecordVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordVersion")
            .field("table", &self.table_id())
            .field("record_number", &self.record_number)
            .field("transaction_id", &self.transaction_id)
            .field("kind", &self.kind)
            .field("savepoint_id", &self.savepoint_id())
            .field("superseded", &self.is_superseded())
            .finish()
    }
}
