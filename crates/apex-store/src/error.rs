//! Error types for the durable layer.

use thiserror::Error;

/// Errors that can occur in the WAL, runtime store, or lock handling.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON (de)serialization failure.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The runtime DB writer lock is held by another live process.
    #[error("runtime store locked by pid {pid}")]
    LockHeld { pid: u32 },

    /// A WAL line could not be parsed.
    #[error("WAL corrupt at line {line}: {reason}")]
    WalCorrupt { line: usize, reason: String },

    /// A terminal WAL record referenced an action id with no STARTED record.
    #[error("unknown WAL action id: {0}")]
    UnknownAction(uuid::Uuid),

    /// Run not found in the runs table.
    #[error("run not found: {0}")]
    RunNotFound(String),
}

/// Result type for durable-layer operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_held_display() {
        let err = StoreError::LockHeld { pid: 4242 };
        assert!(err.to_string().contains("4242"));
    }

    #[test]
    fn test_wal_corrupt_display() {
        let err = StoreError::WalCorrupt {
            line: 7,
            reason: "bad json".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("line 7"));
        assert!(msg.contains("bad json"));
    }
}
