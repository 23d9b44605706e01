use crate::common::types::SavepointId;

/// A named position in a transaction's record chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savepoint {
    pub id: SavepointId,
    /// Number of records that existed when the savepoint was taken
    pub mark: usize,
}

/// Savepoints of one transaction, oldest first. Ids only grow, so the stack
/// is sorted by id.
#[derive(Debug, Default)]
pub(crate) struct SavepointStack {
    stack: Vec<Savepoint>,
    last_id: SavepointId,
}

impl SavepointStack {
    pub fn create(&mut self, mark: usize) -> SavepointId {
        self.last_id += 1;
        self.stack.push(Savepoint { id: self.last_id, mark });
        self.last_id
    }

    /// Id stamped on records added now; 0 outside any savepoint
    pub fn current_id(&self) -> SavepointId {
        self.stack.last().map_or(0, |sp| sp.id)
    }

    /// The savepoint a rollback to `id` unwinds to. The newest savepoint at
    /// or below `id` must be `id` itself.
    pub fn rollback_target(&self, id: SavepointId) -> Option<Savepoint> {
        self.stack.iter().rev().find(|sp| sp.id <= id).filter(|sp| sp.id == id).copied()
    }

    /// Drop the savepoints nested above `id`
    pub fn truncate_above(&mut self, id: SavepointId) {
        self.stack.retain(|sp| sp.id <= id);
    }

    /// Remove `id`, returning it together with the id its records now belong to
    pub fn release(&mut self, id: SavepointId) -> Option<(Savepoint, SavepointId)> {
        let pos = self.stack.iter().position(|sp| sp.id == id)?;
        let released = self.stack.remove(pos);
        let lower = if pos == 0 { 0 } else { self.stack[pos - 1].id };
        Some((released, lower))
    }

    /// Re-point marks after records were removed from the chain. `removed_before(m)`
    /// is the number of removed records at positions below `m`.
    pub fn shift_marks(&mut self, removed_before: impl Fn(usize) -> usize) {
        for sp in &mut self.stack {
            sp.mark -= removed_before(sp.mark);
        }
    }

    pub fn clear(&mut self) {
        self.stack.clear();
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }
}
