//! Fixed-capacity table of transaction slots.
//!
//! A slot is named by its index plus a generation that grows every time the
//! slot is handed out, so a stale reference to a reused slot is detected
//! instead of touching the new occupant.

use std::collections::HashMap;
use std::sync::Arc;

use crate::common::types::TxnId;
use crate::transaction::concurrency::transaction::TransactionShared;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub index: u32,
    pub generation: u32,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    txn: Option<Arc<TransactionShared>>,
}

pub(crate) struct SlotTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_id: HashMap<TxnId, u32>,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::default()).collect(),
            free: (0..capacity as u32).rev().collect(),
            by_id: HashMap::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Claim a free slot and fill it with whatever `make` builds for it
    pub fn allocate(
        &mut self,
        make: impl FnOnce(SlotRef) -> Arc<TransactionShared>,
    ) -> Option<Arc<TransactionShared>> {
        let index = self.free.pop()?;
        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        let txn = make(SlotRef {
            index,
            generation: slot.generation,
        });
        slot.txn = Some(txn.clone());
        self.by_id.insert(txn.id, index);
        Some(txn)
    }

    /// Free the slot if `slot` still names its current occupant
    pub fn release(&mut self, slot: SlotRef) -> bool {
        let Some(entry) = self.slots.get_mut(slot.index as usize) else {
            return false;
        };
        if entry.generation != slot.generation {
            return false;
        }
        let Some(txn) = entry.txn.take() else {
            return false;
        };
        self.by_id.remove(&txn.id);
        self.free.push(slot.index);
        true
    }

    pub fn get(&self, id: TxnId) -> Option<&Arc<TransactionShared>> {
        let index = *self.by_id.get(&id)?;
        self.slots[index as usize].txn.as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TransactionShared>> {
        self.slots.iter().filter_map(|slot| slot.txn.as_ref())
    }
}
