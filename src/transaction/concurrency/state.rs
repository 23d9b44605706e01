use std::fmt;

/// Lifecycle of a transaction slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Slot is free
    Available,
    /// Slot claimed, snapshot being taken
    Initializing,
    Active,
    /// Prepared; waiting for the coordinator's verdict
    Limbo,
    Committed,
    RolledBack,
    /// Commit of a transaction that changed nothing
    CommittingReadOnly,
}

impl TransactionState {
    /// Whether the transaction may still change its outcome
    pub fn is_unresolved(self) -> bool {
        matches!(
            self,
            TransactionState::Initializing | TransactionState::Active | TransactionState::Limbo
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How another transaction's work looks from a given transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelativeState {
    Us,
    Active,
    /// Was active; the caller waited for it to finish and must look again
    WasActive,
    Deadlock,
    CommittedVisible,
    CommittedInvisible,
    RolledBack,
}

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Every committed change is visible
    ReadCommitted,
    /// Consistent read, but committed changes are visible for writing
    WriteCommitted,
    /// Consistent read for both reading and writing
    RepeatableRead,
}

/// Whether a visibility question is asked for a read or for an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Reading,
    Writing,
}

/// Whether `relative_state` may block on an unfinished transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    Wait,
    DoNotWait,
}
