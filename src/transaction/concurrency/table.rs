//! Row-level callbacks the transaction manager drives, plus an in-memory
//! table that keeps a version chain per record.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use log::debug;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::error::ErrorClass;
use crate::common::types::{RecordNumber, TableId, TxnId};
use crate::storage::buffer::BufferPoolError;
use crate::transaction::concurrency::error::TransactionError;
use crate::transaction::concurrency::record::{RecordData, RecordKind, RecordVersion};
use crate::transaction::concurrency::state::{Access, RelativeState, WaitMode};
use crate::transaction::concurrency::transaction::Transaction;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("Record {record} of table {table} has no version to undo")]
    MissingVersion { table: TableId, record: RecordNumber },

    #[error("Record {record} of table {table} was changed by a transaction this one cannot see")]
    UpdateConflict { table: TableId, record: RecordNumber },

    #[error("Buffer pool error: {0}")]
    Buffer(#[from] BufferPoolError),

    #[error("{0}")]
    Failed(String),
}

impl TableError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TableError::Buffer(e) => e.class(),
            TableError::MissingVersion { .. } => ErrorClass::Corruption,
            TableError::UpdateConflict { .. } | TableError::Failed(_) => ErrorClass::InvalidState,
        }
    }
}

/// Callbacks from the transaction manager into the table that owns a record
///
/// The manager calls them in a fixed order: `unlock_record` and
/// `rollback_record` while undoing, then `update_record` and `post_commit`
/// right after the commit record is durable, and `commit_record` once no
/// snapshot can still need the prior versions.
pub trait RowTable: Send + Sync {
    fn table_id(&self) -> TableId;

    /// Drop a row lock
    fn unlock_record(&self, record: &Arc<RecordVersion>) -> Result<(), TableError>;

    /// Unlink an uncommitted version, making its prior the current one
    fn rollback_record(&self, record: &Arc<RecordVersion>) -> Result<(), TableError>;

    /// Apply a committed version to indexes and storage
    fn update_record(&self, record: &Arc<RecordVersion>) -> Result<(), TableError>;

    fn post_commit(&self, _record: &Arc<RecordVersion>) -> Result<(), TableError> {
        Ok(())
    }

    /// The version is now the permanent one; prior versions may go
    fn commit_record(&self, record: &Arc<RecordVersion>) -> Result<(), TableError>;

    fn adjust_cardinality(&self, delta: i64);
}

/// Which callback a [`TableEvent`] records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableCallback {
    Unlock,
    Rollback,
    Update,
    PostCommit,
    Commit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableEvent {
    pub callback: TableCallback,
    pub record_number: RecordNumber,
    pub transaction_id: TxnId,
}

/// A table held entirely in memory.
///
/// `heads` maps each record to its newest version, committed or not; older
/// versions hang off `prior`. Every callback is logged to an event list and
/// any one of them can be made to fail.
pub struct MemoryTable {
    id: TableId,
    heads: Mutex<HashMap<RecordNumber, Arc<RecordVersion>>>,
    /// Permanent images applied by `commit_record`
    committed: Mutex<HashMap<RecordNumber, RecordData>>,
    cardinality: AtomicI64,
    events: Mutex<Vec<TableEvent>>,
    fail_on: Mutex<Option<TableCallback>>,
}

impl MemoryTable {
    pub fn new(id: TableId) -> Self {
        Self {
            id,
            heads: Mutex::new(HashMap::new()),
            committed: Mutex::new(HashMap::new()),
            cardinality: AtomicI64::new(0),
            events: Mutex::new(Vec::new()),
            fail_on: Mutex::new(None),
        }
    }

    /// Make every later call of `callback` fail
    pub fn fail_on(&self, callback: Option<TableCallback>) {
        *self.fail_on.lock() = callback;
    }

    pub fn events(&self) -> Vec<TableEvent> {
        self.events.lock().clone()
    }

    pub fn cardinality(&self) -> i64 {
        self.cardinality.load(Ordering::Acquire)
    }

    pub fn committed_data(&self, record_number: RecordNumber) -> Option<RecordData> {
        self.committed.lock().get(&record_number).cloned()
    }

    pub fn head(&self, record_number: RecordNumber) -> Option<Arc<RecordVersion>> {
        self.heads.lock().get(&record_number).cloned()
    }

    /// Insert or replace a row
    pub fn store(
        self: &Arc<Self>,
        txn: &mut Transaction,
        record_number: RecordNumber,
        data: Vec<u8>,
    ) -> Result<Arc<RecordVersion>, TransactionError> {
        self.push_version(txn, record_number, RecordKind::Data, Some(data))
    }

    pub fn delete(
        self: &Arc<Self>,
        txn: &mut Transaction,
        record_number: RecordNumber,
    ) -> Result<Arc<RecordVersion>, TransactionError> {
        self.push_version(txn, record_number, RecordKind::Deleted, None)
    }

    /// Take a row lock without changing the row
    pub fn lock(
        self: &Arc<Self>,
        txn: &mut Transaction,
        record_number: RecordNumber,
    ) -> Result<Arc<RecordVersion>, TransactionError> {
        self.push_version(txn, record_number, RecordKind::Lock, None)
    }

    /// The row as `txn` sees it
    pub fn read(&self, txn: &Transaction, record_number: RecordNumber) -> Result<Option<Vec<u8>>, TransactionError> {
        let mut version = self.head(record_number);
        while let Some(current) = version {
            if !current.is_lock() && txn.visible(current.transaction_id(), Access::Reading) {
                return match current.kind() {
                    RecordKind::Deleted => Ok(None),
                    _ => Ok(current.load_payload(txn.spill_store())?),
                };
            }
            version = current.prior().cloned();
        }
        Ok(None)
    }

    fn push_version(
        self: &Arc<Self>,
        txn: &mut Transaction,
        record_number: RecordNumber,
        kind: RecordKind,
        data: Option<Vec<u8>>,
    ) -> Result<Arc<RecordVersion>, TransactionError> {
        loop {
            let head = self.head(record_number);
            if let Some(head) = &head {
                let owner = head.transaction_id();
                match txn.relative_state(owner, WaitMode::Wait)? {
                    RelativeState::Us | RelativeState::CommittedVisible | RelativeState::RolledBack => {}
                    RelativeState::CommittedInvisible if txn.visible(owner, Access::Writing) => {}
                    RelativeState::CommittedInvisible => {
                        return Err(TableError::UpdateConflict {
                            table: self.id,
                            record: record_number,
                        }
                        .into());
                    }
                    RelativeState::Deadlock => {
                        return Err(TransactionError::Deadlock { txn: txn.id(), other: owner });
                    }
                    RelativeState::Active | RelativeState::WasActive => continue,
                }
            }

            let table: Arc<dyn RowTable> = self.clone();
            let version = RecordVersion::new(table, record_number, txn.id(), kind, data.clone(), head.clone());
            {
                let mut heads = self.heads.lock();
                let current = heads.get(&record_number);
                let unchanged = match (current, &head) {
                    (Some(current), Some(head)) => Arc::ptr_eq(current, head),
                    (None, None) => true,
                    _ => false,
                };
                if !unchanged {
                    continue;
                }
                heads.insert(record_number, version.clone());
            }

            if let Err(e) = txn.add_record(version.clone()) {
                self.unlink(&version);
                return Err(e);
            }
            return Ok(version);
        }
    }

    fn note(&self, callback: TableCallback, record: &RecordVersion) -> Result<(), TableError> {
        self.events.lock().push(TableEvent {
            callback,
            record_number: record.record_number(),
            transaction_id: record.transaction_id(),
        });
        if *self.fail_on.lock() == Some(callback) {
            return Err(TableError::Failed(format!(
                "{:?} of record {} in table {} failed",
                callback,
                record.record_number(),
                self.id
            )));
        }
        Ok(())
    }

    /// Replace `record` with its prior if it is the head. Returns whether it was.
    fn unlink(&self, record: &Arc<RecordVersion>) -> bool {
        let mut heads = self.heads.lock();
        let number = record.record_number();
        match heads.get(&number) {
            Some(head) if Arc::ptr_eq(head, record) => {
                match record.prior() {
                    Some(prior) => heads.insert(number, prior.clone()),
                    None => heads.remove(&number),
                };
                true
            }
            _ => false,
        }
    }
}

impl RowTable for MemoryTable {
    fn table_id(&self) -> TableId {
        self.id
    }

    fn unlock_record(&self, record: &Arc<RecordVersion>) -> Result<(), TableError> {
        self.note(TableCallback::Unlock, record)?;
        // A lock buried under a newer version stays; readers skip it
        self.unlink(record);
        Ok(())
    }

    fn rollback_record(&self, record: &Arc<RecordVersion>) -> Result<(), TableError> {
        self.note(TableCallback::Rollback, record)?;
        if !self.unlink(record) {
            return Err(TableError::MissingVersion {
                table: self.id,
                record: record.record_number(),
            });
        }
        Ok(())
    }

    fn update_record(&self, record: &Arc<RecordVersion>) -> Result<(), TableError> {
        self.note(TableCallback::Update, record)
    }

    fn post_commit(&self, record: &Arc<RecordVersion>) -> Result<(), TableError> {
        self.note(TableCallback::PostCommit, record)
    }

    fn commit_record(&self, record: &Arc<RecordVersion>) -> Result<(), TableError> {
        self.note(TableCallback::Commit, record)?;
        let mut committed = self.committed.lock();
        match record.kind() {
            RecordKind::Data => {
                committed.insert(record.record_number(), record.data());
            }
            RecordKind::Deleted => {
                committed.remove(&record.record_number());
            }
            RecordKind::Lock => {}
        }
        Ok(())
    }

    fn adjust_cardinality(&self, delta: i64) {
        let now = self.cardinality.fetch_add(delta, Ordering::AcqRel) + delta;
        debug!("Table {} cardinality now {}", self.id, now);
    }
}
