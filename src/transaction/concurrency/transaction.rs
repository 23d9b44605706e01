// A database transaction: its record chain, savepoints, and snapshot

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::common::types::{SavepointId, TableId, TxnId};
use crate::transaction::concurrency::error::{Result, TransactionError};
use crate::transaction::concurrency::record::{RecordKind, RecordVersion};
use crate::transaction::concurrency::savepoint::SavepointStack;
use crate::transaction::concurrency::slots::SlotRef;
use crate::transaction::concurrency::state::{Access, IsolationLevel, RelativeState, TransactionState, WaitMode};
use crate::transaction::concurrency::table::{RowTable, TableError};
use crate::transaction::concurrency::transaction_manager::TransactionManager;
use crate::transaction::wal::{IndexUpdate, LogRecord, LogRecordType, RecordImage, SpillStore};

/// A transaction that was active when a later one began.
///
/// Each entry holds one dependency token on that transaction, which keeps
/// its committed versions from being applied while the later snapshot may
/// still need the prior versions.
pub(crate) struct SnapshotEntry {
    pub txn_id: TxnId,
    txn: Weak<TransactionShared>,
    released: AtomicBool,
}

impl SnapshotEntry {
    pub fn new(txn: &Arc<TransactionShared>) -> Self {
        txn.dependencies.fetch_add(1, Ordering::AcqRel);
        Self {
            txn_id: txn.id,
            txn: Arc::downgrade(txn),
            released: AtomicBool::new(false),
        }
    }

    /// Give the token back. Returns the transaction if this call released it.
    pub fn release(&self) -> Option<Arc<TransactionShared>> {
        if self.released.swap(true, Ordering::AcqRel) {
            return None;
        }
        let txn = self.txn.upgrade()?;
        txn.dependencies.fetch_sub(1, Ordering::AcqRel);
        Some(txn)
    }
}

/// The part of a transaction other threads may look at
pub struct TransactionShared {
    /// Transaction ID
    pub(crate) id: TxnId,

    /// Bookkeeping transactions never appear in snapshots
    pub(crate) system: bool,

    /// Slot this transaction occupies in the manager
    pub(crate) slot: SlotRef,

    pub(crate) isolation: IsolationLevel,

    state: Mutex<TransactionState>,

    state_changed: Condvar,

    /// Transaction this one is blocked on, 0 if none
    pub(crate) waiting_for: AtomicU32,

    /// Later transactions whose snapshots still hold a token on this one
    pub(crate) dependencies: AtomicU32,

    /// Updates not yet covered by a durable commit
    pub(crate) write_pending: AtomicBool,

    applied: AtomicBool,

    /// External id given at prepare
    pub(crate) xid: Mutex<Option<Vec<u8>>>,

    /// Versions waiting for `commit_record`
    pub(crate) committed_records: Mutex<Vec<Arc<RecordVersion>>>,

    /// Transactions active at begin, sorted by id
    pub(crate) snapshot: Box<[SnapshotEntry]>,

    /// Oldest transaction active at begin (own id if none)
    pub(crate) oldest_active: TxnId,
}

impl TransactionShared {
    pub(crate) fn new(
        id: TxnId,
        system: bool,
        slot: SlotRef,
        isolation: IsolationLevel,
        snapshot: Box<[SnapshotEntry]>,
    ) -> Self {
        let oldest_active = snapshot.first().map_or(id, |entry| entry.txn_id);
        Self {
            id,
            system,
            slot,
            isolation,
            state: Mutex::new(TransactionState::Initializing),
            state_changed: Condvar::new(),
            waiting_for: AtomicU32::new(0),
            dependencies: AtomicU32::new(0),
            write_pending: AtomicBool::new(false),
            applied: AtomicBool::new(false),
            xid: Mutex::new(None),
            committed_records: Mutex::new(Vec::new()),
            snapshot,
            oldest_active,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
        self.state_changed.notify_all();
    }

    pub(crate) fn in_snapshot(&self, id: TxnId) -> bool {
        self.snapshot.binary_search_by_key(&id, |entry| entry.txn_id).is_ok()
    }

    /// Claim the right to apply the committed versions; true only once
    pub(crate) fn claim_apply(&self) -> bool {
        self.applied
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_applied(&self) -> bool {
        self.applied.load(Ordering::Acquire)
    }

    /// Block until the transaction commits or rolls back. Returns false on timeout.
    pub(crate) fn wait_until_resolved(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.is_unresolved() {
            if self.state_changed.wait_until(&mut state, deadline).timed_out() {
                return !state.is_unresolved();
            }
        }
        true
    }
}

/// Per-transaction counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStats {
    /// Payload bytes of the record chain held in memory
    pub total_record_data: u64,
    pub total_records: u64,
    pub chilled_records: u64,
    pub chilled_bytes: u64,
    pub thawed_records: u64,
    pub thawed_bytes: u64,
    pub committed_records: u64,
}

/// Transaction - owned by the session that began it
pub struct Transaction {
    shared: Arc<TransactionShared>,

    manager: Arc<TransactionManager>,

    /// Record versions created by this transaction, oldest first
    records: Vec<Arc<RecordVersion>>,

    savepoints: SavepointStack,

    /// Records before this position are already chilled or skipped
    chill_point: usize,

    /// Thaws since the last chill pass
    thaws_since_chill: u64,

    /// Deferred index changes, logged at prepare or commit
    index_updates: Vec<IndexUpdate>,

    has_updates: bool,

    has_locks: bool,

    locks_released: bool,

    logged_at_prepare: bool,

    stats: TransactionStats,
}

impl Transaction {
    pub(crate) fn new(shared: Arc<TransactionShared>, manager: Arc<TransactionManager>) -> Self {
        Self {
            shared,
            manager,
            records: Vec::new(),
            savepoints: SavepointStack::default(),
            chill_point: 0,
            thaws_since_chill: 0,
            index_updates: Vec::new(),
            has_updates: false,
            has_locks: false,
            locks_released: false,
            logged_at_prepare: false,
            stats: TransactionStats::default(),
        }
    }

    /// Get the transaction ID
    pub fn id(&self) -> TxnId {
        self.shared.id
    }

    pub fn state(&self) -> TransactionState {
        self.shared.state()
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.shared.isolation
    }

    pub fn is_system(&self) -> bool {
        self.shared.system
    }

    pub fn stats(&self) -> TransactionStats {
        self.stats
    }

    pub fn records(&self) -> &[Arc<RecordVersion>] {
        &self.records
    }

    pub fn has_updates(&self) -> bool {
        self.has_updates
    }

    pub fn has_locks(&self) -> bool {
        self.has_locks
    }

    /// Ids of the transactions that were active when this one began
    pub fn snapshot_ids(&self) -> Vec<TxnId> {
        self.shared.snapshot.iter().map(|entry| entry.txn_id).collect()
    }

    pub fn oldest_active(&self) -> TxnId {
        self.shared.oldest_active
    }

    pub fn xid(&self) -> Option<Vec<u8>> {
        self.shared.xid.lock().clone()
    }

    pub fn spill_store(&self) -> &dyn SpillStore {
        self.manager.spill.as_ref()
    }

    fn require_state(&self, allowed: &[TransactionState], operation: &'static str) -> Result<TransactionState> {
        let state = self.shared.state();
        if allowed.contains(&state) {
            Ok(state)
        } else {
            Err(TransactionError::InvalidState {
                txn: self.id(),
                state,
                operation,
            })
        }
    }

    /// Add a version this transaction created to its record chain
    pub fn add_record(&mut self, record: Arc<RecordVersion>) -> Result<()> {
        self.require_state(&[TransactionState::Active], "add a record")?;

        let size = record.resident_size() as u64;
        if self.stats.total_record_data + size > self.manager.chill_threshold {
            self.chill_records()?;
        }

        if record.is_lock() {
            self.has_locks = true;
        } else {
            if !self.has_updates {
                self.manager
                    .log
                    .append_log(self.id(), LogRecordType::Begin, LogRecord::transaction_content())?;
                self.has_updates = true;
                self.shared.write_pending.store(true, Ordering::Release);
            }
            if let Some(prior) = record.prior() {
                if prior.transaction_id() == self.id() && !prior.is_lock() {
                    prior.set_superseded(true);
                }
            }
        }

        record.set_savepoint_id(self.savepoints.current_id());
        self.stats.total_record_data += size;
        self.stats.total_records += 1;
        self.records.push(record);
        Ok(())
    }

    /// Buffer an index change until prepare or commit
    pub fn add_index_update(&mut self, update: IndexUpdate) -> Result<()> {
        self.require_state(&[TransactionState::Active], "add an index update")?;
        self.index_updates.push(update);
        self.has_updates = true;
        Ok(())
    }

    /// Move record payloads from the chill point onward into the spill
    /// store. Returns the number of records chilled.
    pub fn chill_records(&mut self) -> Result<usize> {
        if self.thaws_since_chill > 0 {
            self.chill_point = 0;
            self.thaws_since_chill = 0;
        }

        let store = self.manager.spill.clone();
        let owner = self.id();
        let mut chilled = 0u64;
        let mut released = 0u64;
        let mut failure = None;
        for record in &self.records[self.chill_point..] {
            if record.is_lock() || record.is_no_chill() {
                continue;
            }
            match record.chill(store.as_ref(), owner) {
                Ok(Some(bytes)) => {
                    chilled += 1;
                    released += bytes as u64;
                }
                Ok(None) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.stats.total_record_data = self.stats.total_record_data.saturating_sub(released);
        self.stats.chilled_records += chilled;
        self.stats.chilled_bytes += released;
        if let Some(e) = failure {
            error!("Transaction {} failed to chill records: {}", owner, e);
            return Err(e.into());
        }

        self.chill_point = self.records.len();
        if chilled > 0 {
            info!("Transaction {} chilled {} records ({} bytes)", owner, chilled, released);
        }
        Ok(chilled as usize)
    }

    /// Bring a chilled payload back into memory; returns its size
    pub fn thaw(&mut self, record: &RecordVersion) -> Result<usize> {
        match record.thaw(self.manager.spill.as_ref())? {
            Some(restored) => {
                self.stats.thawed_records += 1;
                self.stats.thawed_bytes += restored as u64;
                if record.transaction_id() == self.id() {
                    self.stats.total_record_data += restored as u64;
                    self.thaws_since_chill += 1;
                }
                debug!(
                    "Transaction {} thawed record {} ({} bytes)",
                    self.id(),
                    record.record_number(),
                    restored
                );
                Ok(restored)
            }
            None => Ok(record.resident_size()),
        }
    }

    pub fn create_savepoint(&mut self) -> Result<SavepointId> {
        self.require_state(&[TransactionState::Active], "create a savepoint")?;
        Ok(self.savepoints.create(self.records.len()))
    }

    /// Fold a savepoint into the one below it. Unknown ids are ignored.
    pub fn release_savepoint(&mut self, id: SavepointId) -> Result<()> {
        self.require_state(&[TransactionState::Active], "release a savepoint")?;
        if let Some((released, lower)) = self.savepoints.release(id) {
            for record in &self.records[released.mark.min(self.records.len())..] {
                if record.savepoint_id() == id {
                    record.set_savepoint_id(lower);
                }
            }
        }
        Ok(())
    }

    /// Undo everything done since savepoint `id` was taken. The savepoint
    /// itself survives, so repeating the call changes nothing.
    pub fn rollback_savepoint(&mut self, id: SavepointId) -> Result<()> {
        self.require_state(&[TransactionState::Active], "roll back to a savepoint")?;
        let target = self
            .savepoints
            .rollback_target(id)
            .ok_or(TransactionError::InvalidSavepoint(id))?;

        let undone = self.records.split_off(target.mark.min(self.records.len()));
        let mut failure = None;
        for record in undone.iter().rev() {
            if let Err(e) = self.undo(record) {
                warn!("Transaction {} could not undo record {}: {}", self.id(), record.record_number(), e);
                failure.get_or_insert(e);
            }
        }
        self.savepoints.truncate_above(id);
        self.chill_point = self.chill_point.min(self.records.len());
        debug!("Transaction {} rolled back {} records to savepoint {}", self.id(), undone.len(), id);

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn undo(&mut self, record: &Arc<RecordVersion>) -> std::result::Result<(), TableError> {
        self.stats.total_record_data = self.stats.total_record_data.saturating_sub(record.resident_size() as u64);
        self.stats.total_records = self.stats.total_records.saturating_sub(1);

        let result = if record.is_lock() {
            if self.locks_released {
                Ok(())
            } else {
                record.table().unlock_record(record)
            }
        } else if record.is_superseded() {
            Ok(())
        } else {
            record.table().rollback_record(record)
        };

        // The version this one replaced is current again
        if let Some(prior) = record.prior() {
            if prior.transaction_id() == self.id() {
                prior.set_superseded(false);
            }
        }
        result
    }

    fn release_locks(&mut self) -> std::result::Result<(), TableError> {
        if self.locks_released {
            return Ok(());
        }
        self.locks_released = true;
        let mut failure = None;
        for record in self.records.iter().filter(|r| r.is_lock()) {
            if let Err(e) = record.table().unlock_record(record) {
                failure.get_or_insert(e);
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Log deferred index updates and the after-images of the record chain
    fn log_changes(&mut self) -> Result<()> {
        if !self.index_updates.is_empty() {
            self.manager.log.log_index_updates(self.id(), self.index_updates.clone())?;
        }
        let images: Vec<RecordImage> = self
            .records
            .iter()
            .filter(|r| !r.is_lock() && !r.is_superseded())
            .map(|r| r.image())
            .collect();
        if !images.is_empty() {
            self.manager.log.log_updated_records(self.id(), images)?;
        }
        self.index_updates.clear();
        Ok(())
    }

    /// First phase of two-phase commit.
    ///
    /// The transaction only enters `Limbo` once its changes and the
    /// `Prepare` record are durable; on any failure it stays `Active`.
    pub fn prepare(&mut self, xid: &[u8]) -> Result<()> {
        self.require_state(&[TransactionState::Active], "prepare")?;
        self.manager.wait_for_writes(self.id())?;
        self.log_changes()?;
        self.manager
            .log
            .append_log(self.id(), LogRecordType::Prepare, LogRecord::prepare_content(xid))?;

        self.logged_at_prepare = true;
        *self.shared.xid.lock() = Some(xid.to_vec());
        self.shared.set_state(TransactionState::Limbo);
        if let Err(e) = self.release_locks() {
            warn!("Transaction {} could not release its locks at prepare: {}", self.id(), e);
        }
        info!("Transaction {} prepared as {}", self.id(), hex::encode(xid));
        Ok(())
    }

    /// Commit the transaction.
    ///
    /// Errors returned before the commit record is durable leave the state
    /// unchanged and the caller must roll back. An `Io`-class error also
    /// obliges the caller to flush the cache the way shutdown does
    /// (`BufferCache::flush_tablespace` or `Engine::shutdown`), since the
    /// log device can no longer be trusted. `CommitFailed` means the
    /// commit is durable but a table callback failed afterwards.
    pub fn commit(&mut self) -> Result<()> {
        let state = self.require_state(&[TransactionState::Active, TransactionState::Limbo], "commit")?;
        if !self.has_updates && state == TransactionState::Active {
            self.commit_read_only();
            return Ok(());
        }

        if !self.logged_at_prepare {
            self.log_changes()?;
        }
        self.manager.wait_for_writes(self.id())?;
        self.manager
            .log
            .append_log(self.id(), LogRecordType::Commit, LogRecord::transaction_content())?;

        let mut failure: Option<String> = None;
        if let Err(e) = self.release_locks() {
            failure.get_or_insert(e.to_string());
        }

        let records: Vec<Arc<RecordVersion>> = mem::take(&mut self.records)
            .into_iter()
            .filter(|r| !r.is_lock())
            .collect();
        self.savepoints.clear();
        self.chill_point = 0;
        self.stats.total_record_data = 0;
        self.stats.committed_records = records.len() as u64;
        *self.shared.committed_records.lock() = records.clone();
        self.shared.write_pending.store(false, Ordering::Release);
        self.shared.set_state(TransactionState::Committed);

        let mut cardinality: HashMap<TableId, (Arc<dyn RowTable>, i64)> = HashMap::new();
        for record in records.iter().filter(|r| !r.is_superseded()) {
            let table = record.table();
            if let Err(e) = table.update_record(record).and_then(|_| table.post_commit(record)) {
                error!("Transaction {} failed to apply record {}: {}", self.id(), record.record_number(), e);
                failure.get_or_insert(e.to_string());
            }
            let delta = self.cardinality_delta(record);
            if delta != 0 {
                cardinality
                    .entry(record.table_id())
                    .or_insert_with(|| (table.clone(), 0))
                    .1 += delta;
            }
        }
        for (table, delta) in cardinality.into_values() {
            if delta != 0 {
                table.adjust_cardinality(delta);
            }
        }

        self.manager.release_snapshot(&self.shared);
        self.manager.note_committed();
        info!("Transaction {} committed {} records", self.id(), records.len());
        self.manager.try_apply(&self.shared);

        match failure {
            Some(reason) => Err(TransactionError::CommitFailed {
                txn: self.id(),
                fatal: true,
                reason,
            }),
            None => Ok(()),
        }
    }

    /// Row count change caused by the final version of a record
    fn cardinality_delta(&self, record: &RecordVersion) -> i64 {
        let mut base = record.prior();
        while let Some(prior) = base {
            if prior.transaction_id() != self.id() {
                break;
            }
            base = prior.prior();
        }
        let existed = base.is_some_and(|b| b.kind() != RecordKind::Deleted);
        match (record.kind(), existed) {
            (RecordKind::Data, false) => 1,
            (RecordKind::Deleted, true) => -1,
            _ => 0,
        }
    }

    fn commit_read_only(&mut self) {
        self.shared.set_state(TransactionState::CommittingReadOnly);
        if let Err(e) = self.release_locks() {
            warn!("Read-only transaction {} could not release its locks: {}", self.id(), e);
        }
        self.records.clear();
        self.savepoints.clear();
        self.manager.retire(&self.shared);
        self.shared.set_state(TransactionState::Available);
        self.manager.note_committed();
        debug!("Read-only transaction {} committed", self.id());
    }

    /// Undo every record and release the slot
    pub fn rollback(&mut self) -> Result<()> {
        self.require_state(&[TransactionState::Active, TransactionState::Limbo], "roll back")?;

        let records = mem::take(&mut self.records);
        let mut failure: Option<String> = None;
        for record in records.iter().rev() {
            if let Err(e) = self.undo(record) {
                warn!("Transaction {} could not undo record {}: {}", self.id(), record.record_number(), e);
                failure.get_or_insert(e.to_string());
            }
        }
        self.savepoints.clear();
        self.index_updates.clear();
        self.chill_point = 0;
        self.shared.write_pending.store(false, Ordering::Release);
        self.shared.set_state(TransactionState::RolledBack);

        if self.has_updates {
            if let Err(e) = self
                .manager
                .log
                .append_log(self.id(), LogRecordType::Abort, LogRecord::transaction_content())
            {
                warn!("Transaction {} could not log its rollback: {}", self.id(), e);
            }
        }
        self.manager.retire(&self.shared);
        self.manager.note_rolled_back();
        info!("Transaction {} rolled back {} records", self.id(), records.len());

        match failure {
            Some(reason) => Err(TransactionError::RollbackIncomplete { txn: self.id(), reason }),
            None => Ok(()),
        }
    }

    /// How `other`'s work looks from here, waiting for it if asked to
    pub fn relative_state(&self, other: TxnId, wait: WaitMode) -> Result<RelativeState> {
        if other == self.id() {
            return Ok(RelativeState::Us);
        }
        let Some(shared) = self.manager.lookup(other) else {
            return Ok(self.committed_state(other));
        };

        match shared.state() {
            state if state.is_unresolved() => {
                if wait == WaitMode::DoNotWait {
                    return Ok(RelativeState::Active);
                }
                match self.wait_for(&shared) {
                    Ok(()) => Ok(RelativeState::WasActive),
                    Err(TransactionError::Deadlock { .. }) => Ok(RelativeState::Deadlock),
                    Err(e) => Err(e),
                }
            }
            TransactionState::RolledBack => Ok(RelativeState::RolledBack),
            _ => Ok(self.committed_state(other)),
        }
    }

    fn committed_state(&self, other: TxnId) -> RelativeState {
        if self.committed_visible(other, Access::Reading) {
            RelativeState::CommittedVisible
        } else {
            RelativeState::CommittedInvisible
        }
    }

    /// Whether changes made by `other` are visible for `access`
    pub fn visible(&self, other: TxnId, access: Access) -> bool {
        if other == self.id() {
            return true;
        }
        match self.manager.transaction_state(other) {
            Some(state) if state.is_unresolved() || state == TransactionState::RolledBack => false,
            _ => self.committed_visible(other, access),
        }
    }

    fn committed_visible(&self, other: TxnId, access: Access) -> bool {
        match (self.shared.isolation, access) {
            (IsolationLevel::ReadCommitted, _) | (IsolationLevel::WriteCommitted, Access::Writing) => true,
            _ => other < self.id() && !self.shared.in_snapshot(other),
        }
    }

    /// Wait for `other` to finish. Returns whether it committed.
    pub fn wait_for_transaction(&self, other: TxnId) -> Result<bool> {
        let Some(shared) = self.manager.lookup(other) else {
            return Ok(true);
        };
        if shared.state().is_unresolved() {
            self.wait_for(&shared)?;
        }
        Ok(!matches!(shared.state(), TransactionState::RolledBack))
    }

    fn wait_for(&self, other: &TransactionShared) -> Result<()> {
        // Published before the chain check so two transactions closing a
        // cycle at the same time cannot both miss it
        self.shared.waiting_for.store(other.id, Ordering::Release);
        if self.manager.wait_chain_reaches(other, self.id()) {
            self.shared.waiting_for.store(0, Ordering::Release);
            info!("Transaction {} would deadlock on transaction {}", self.id(), other.id);
            return Err(TransactionError::Deadlock {
                txn: self.id(),
                other: other.id,
            });
        }

        let finished = other.wait_until_resolved(self.manager.lock_wait_timeout);
        self.shared.waiting_for.store(0, Ordering::Release);
        if finished {
            Ok(())
        } else {
            warn!("Transaction {} timed out waiting for transaction {}", self.id(), other.id);
            Err(TransactionError::LockTimeout {
                txn: self.id(),
                other: other.id,
            })
        }
    }

    /// Forget every record of a table that is being dropped
    pub fn drop_table(&mut self, table: TableId) {
        let mut removed = Vec::new();
        let mut position = 0;
        self.records.retain(|record| {
            let keep = record.table_id() != table;
            if !keep {
                removed.push(position);
            }
            position += 1;
            keep
        });
        if removed.is_empty() {
            return;
        }

        self.savepoints.shift_marks(|mark| removed.partition_point(|&p| p < mark));
        let chill_point = self.chill_point;
        self.chill_point -= removed.partition_point(|&p| p < chill_point);
        self.stats.total_records = self.records.len() as u64;
        self.stats.total_record_data = self.records.iter().map(|r| r.resident_size() as u64).sum();
        debug!("Transaction {} dropped {} records of table {}", self.id(), removed.len(), table);
    }

    pub fn has_uncommitted_records(&self, table: TableId) -> bool {
        self.records.iter().any(|record| record.table_id() == table)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        match self.shared.state() {
            TransactionState::Active => {
                warn!("Transaction {} dropped while active; rolling back", self.id());
            }
            TransactionState::Limbo => {
                error!("Prepared transaction {} dropped without a verdict; rolling back", self.id());
            }
            _ => return,
        }
        if let Err(e) = self.rollback() {
            error!("Rollback of dropped transaction {} failed: {}", self.id(), e);
        }
    }
}
