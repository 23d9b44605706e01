use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, error, info};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::common::config::EngineConfig;
use crate::common::types::TxnId;
use crate::storage::buffer::BufferCache;
use crate::transaction::concurrency::error::{Result, TransactionError};
use crate::transaction::concurrency::slots::SlotTable;
use crate::transaction::concurrency::state::{IsolationLevel, TransactionState};
use crate::transaction::concurrency::transaction::{SnapshotEntry, Transaction, TransactionShared};
use crate::transaction::wal::{SpillStore, TransactionLog};

/// Counts reported by [`TransactionManager::summary`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransactionSummary {
    pub committed: u64,
    pub rolled_back: u64,
    /// Initializing or active
    pub active: usize,
    /// Committed, waiting for snapshots that still need the prior versions
    pub pending_commit: usize,
    /// Prepared, waiting for a verdict
    pub pending_completion: usize,
}

/// Transaction manager - responsible for creating and tracking transactions
pub struct TransactionManager {
    /// Every live transaction, including committed ones not yet applied
    registry: RwLock<SlotTable>,

    /// Next transaction ID to assign
    next_id: AtomicU32,

    pub(crate) log: Arc<dyn TransactionLog>,

    pub(crate) spill: Arc<dyn SpillStore>,

    /// Page cache whose pending writes gate prepare and commit
    cache: Option<Arc<BufferCache>>,

    pub(crate) lock_wait_timeout: Duration,

    /// Buffered record bytes above which a transaction chills its records
    pub(crate) chill_threshold: u64,

    /// Prepared transactions handed over by their sessions, by xid
    limbo: Mutex<HashMap<Vec<u8>, Transaction>>,

    committed: AtomicU64,

    rolled_back: AtomicU64,
}

impl TransactionManager {
    /// Create a new transaction manager
    pub fn new(
        config: &EngineConfig,
        log: Arc<dyn TransactionLog>,
        spill: Arc<dyn SpillStore>,
        cache: Option<Arc<BufferCache>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: RwLock::new(SlotTable::new(config.max_transactions)),
            next_id: AtomicU32::new(1), // Start from 1
            log,
            spill,
            cache,
            lock_wait_timeout: config.lock_wait_timeout(),
            chill_threshold: config.record_chill_threshold,
            limbo: Mutex::new(HashMap::new()),
            committed: AtomicU64::new(0),
            rolled_back: AtomicU64::new(0),
        })
    }

    /// Never hand out ids at or below `last_id` (used after reading an existing log)
    pub fn resume_after(&self, last_id: TxnId) {
        self.next_id.fetch_max(last_id.saturating_add(1), Ordering::AcqRel);
    }

    /// Begin a new transaction
    pub fn begin(self: &Arc<Self>, isolation: IsolationLevel) -> Result<Transaction> {
        self.begin_with(isolation, false)
    }

    /// Begin a bookkeeping transaction that no snapshot will ever include
    pub fn begin_system(self: &Arc<Self>) -> Result<Transaction> {
        self.begin_with(IsolationLevel::ReadCommitted, true)
    }

    fn begin_with(self: &Arc<Self>, isolation: IsolationLevel, system: bool) -> Result<Transaction> {
        let shared = {
            let mut registry = self.registry.write();
            if registry.len() >= registry.capacity() {
                return Err(TransactionError::TooManyTransactions(registry.capacity()));
            }

            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let mut snapshot: Vec<SnapshotEntry> = if system {
                Vec::new()
            } else {
                registry
                    .iter()
                    .filter(|other| {
                        !other.system
                            && other.id < id
                            && matches!(other.state(), TransactionState::Active | TransactionState::Limbo)
                    })
                    .map(SnapshotEntry::new)
                    .collect()
            };
            snapshot.sort_by_key(|entry| entry.txn_id);

            let snapshot = snapshot.into_boxed_slice();
            let shared = registry
                .allocate(|slot| Arc::new(TransactionShared::new(id, system, slot, isolation, snapshot)))
                .ok_or_else(|| TransactionError::TooManyTransactions(registry.capacity()))?;
            shared.set_state(TransactionState::Active);
            shared
        };

        debug!(
            "Began transaction {} ({:?}, {} in snapshot)",
            shared.id,
            isolation,
            shared.snapshot.len()
        );
        Ok(Transaction::new(shared, Arc::clone(self)))
    }

    pub(crate) fn lookup(&self, id: TxnId) -> Option<Arc<TransactionShared>> {
        self.registry.read().get(id).cloned()
    }

    /// State of a registered transaction; `None` once its slot is freed
    pub fn transaction_state(&self, id: TxnId) -> Option<TransactionState> {
        self.lookup(id).map(|txn| txn.state())
    }

    /// Whether following the wait-for chain from `from` leads to `target`
    pub(crate) fn wait_chain_reaches(&self, from: &TransactionShared, target: TxnId) -> bool {
        let registry = self.registry.read();
        let mut next = from.waiting_for.load(Ordering::Acquire);
        for _ in 0..=registry.capacity() {
            if next == 0 {
                return false;
            }
            if next == target {
                return true;
            }
            match registry.get(next) {
                Some(txn) => next = txn.waiting_for.load(Ordering::Acquire),
                None => return false,
            }
        }
        false
    }

    pub(crate) fn wait_for_writes(&self, txn: TxnId) -> Result<()> {
        if let Some(cache) = &self.cache {
            cache.wait_for_writes(txn)?;
        }
        Ok(())
    }

    /// Give back every dependency token held by `txn`'s snapshot
    pub(crate) fn release_snapshot(&self, txn: &TransactionShared) {
        for entry in txn.snapshot.iter() {
            if let Some(other) = entry.release() {
                if other.dependencies.load(Ordering::Acquire) == 0 {
                    self.try_apply(&other);
                }
            }
        }
    }

    /// Drop the tokens later transactions hold on `txn`
    fn expunge(&self, txn: &TransactionShared) {
        let later: Vec<Arc<TransactionShared>> = self
            .registry
            .read()
            .iter()
            .filter(|other| other.id > txn.id)
            .cloned()
            .collect();
        for other in later {
            if let Ok(pos) = other.snapshot.binary_search_by_key(&txn.id, |entry| entry.txn_id) {
                other.snapshot[pos].release();
            }
        }
    }

    /// Tear down a transaction that ended without committed versions
    pub(crate) fn retire(&self, txn: &TransactionShared) {
        self.release_snapshot(txn);
        self.expunge(txn);
        self.registry.write().release(txn.slot);
    }

    /// Apply `commit_record` to a committed transaction's versions and free
    /// its slot, once no snapshot depends on it and no write is pending.
    pub(crate) fn try_apply(&self, txn: &TransactionShared) -> bool {
        if txn.state() != TransactionState::Committed
            || txn.dependencies.load(Ordering::Acquire) > 0
            || txn.write_pending.load(Ordering::Acquire)
            || !txn.claim_apply()
        {
            return false;
        }

        let records = std::mem::take(&mut *txn.committed_records.lock());
        for record in &records {
            if let Err(e) = record.table().commit_record(record) {
                error!(
                    "Transaction {} failed to make record {} of table {} permanent: {}",
                    txn.id,
                    record.record_number(),
                    record.table_id(),
                    e
                );
            }
        }
        self.registry.write().release(txn.slot);
        debug!("Transaction {} applied {} records", txn.id, records.len());
        true
    }

    /// Apply every committed transaction nothing depends on any more.
    /// Returns how many were applied.
    pub fn purge_transactions(&self) -> usize {
        let pending: Vec<Arc<TransactionShared>> = self
            .registry
            .read()
            .iter()
            .filter(|txn| txn.state() == TransactionState::Committed && !txn.is_applied())
            .cloned()
            .collect();
        pending.iter().filter(|txn| self.try_apply(txn)).count()
    }

    /// Oldest transaction that has not reached a verdict
    pub fn find_oldest_active(&self) -> Option<TxnId> {
        self.registry
            .read()
            .iter()
            .filter(|txn| !txn.system && txn.state().is_unresolved())
            .map(|txn| txn.id)
            .min()
    }

    pub fn active_transaction_ids(&self) -> Vec<TxnId> {
        let mut ids: Vec<TxnId> = self
            .registry
            .read()
            .iter()
            .filter(|txn| txn.state().is_unresolved())
            .map(|txn| txn.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn summary(&self) -> TransactionSummary {
        let mut summary = TransactionSummary {
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            ..TransactionSummary::default()
        };
        for txn in self.registry.read().iter() {
            match txn.state() {
                TransactionState::Initializing | TransactionState::Active => summary.active += 1,
                TransactionState::Limbo => summary.pending_completion += 1,
                TransactionState::Committed if !txn.is_applied() => summary.pending_commit += 1,
                _ => {}
            }
        }
        summary
    }

    pub(crate) fn note_committed(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_rolled_back(&self) {
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    /// Take charge of a prepared transaction so it can be resolved by xid
    /// after its session is gone
    pub fn register_prepared(&self, txn: Transaction) -> Result<()> {
        let state = txn.state();
        let xid = match (state, txn.xid()) {
            (TransactionState::Limbo, Some(xid)) => xid,
            _ => {
                return Err(TransactionError::InvalidState {
                    txn: txn.id(),
                    state,
                    operation: "hand over for xid resolution",
                });
            }
        };
        info!("Transaction {} waiting for a verdict on {}", txn.id(), hex::encode(&xid));
        self.limbo.lock().insert(xid, txn);
        Ok(())
    }

    pub fn prepared_xids(&self) -> Vec<Vec<u8>> {
        self.limbo.lock().keys().cloned().collect()
    }

    pub fn commit_by_xid(&self, xid: &[u8]) -> Result<()> {
        self.resolve(xid, Transaction::commit)
    }

    pub fn rollback_by_xid(&self, xid: &[u8]) -> Result<()> {
        self.resolve(xid, Transaction::rollback)
    }

    fn resolve(&self, xid: &[u8], verdict: impl FnOnce(&mut Transaction) -> Result<()>) -> Result<()> {
        let mut txn = self
            .limbo
            .lock()
            .remove(xid)
            .ok_or_else(|| TransactionError::UnknownXid(hex::encode(xid)))?;
        let result = verdict(&mut txn);
        if result.is_err() && txn.state() == TransactionState::Limbo {
            // Still undecided; keep it for another attempt
            self.limbo.lock().insert(xid.to_vec(), txn);
        }
        result
    }
}
