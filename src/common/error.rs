/// Coarse classification shared by every operational error in the engine.
///
/// Callers use it to decide between retrying, aborting the transaction, or
/// taking the engine down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Wrong page type, bad checksum, or an unreadable log record
    Corruption,
    /// The buffer pool or the transaction slot table is exhausted
    ResourceExhaustion,
    /// A latch or transaction wait exceeded the configured timeout
    LockTimeout,
    /// Waiting would close a cycle in the wait-for chain
    Deadlock,
    /// An I/O call on a tablespace or the log failed
    Io,
    /// The operation is not legal in the current state
    InvalidState,
}

impl ErrorClass {
    /// Whether a caller may retry the failed operation (possibly after
    /// restarting its transaction).
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::LockTimeout | ErrorClass::Deadlock | ErrorClass::ResourceExhaustion
        )
    }

    /// Whether the error means the engine can no longer vouch for its data.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorClass::Corruption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(ErrorClass::LockTimeout.is_retryable());
        assert!(ErrorClass::Deadlock.is_retryable());
        assert!(ErrorClass::ResourceExhaustion.is_retryable());
        assert!(!ErrorClass::Corruption.is_retryable());
        assert!(!ErrorClass::Io.is_retryable());
        assert!(ErrorClass::Corruption.is_fatal());
    }
}
