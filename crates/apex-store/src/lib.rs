//! Apex-Store: Durable Layer for Apex
//!
//! This crate provides the crash-recoverable persistence layer for the Apex
//! run orchestrator: the write-ahead action log, the runtime SQLite store,
//! and the advisory writer lock that serializes all mutations.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: Write-ahead durability, single-writer discipline, recovery.
//!
//! ## Key Components
//!
//! - `ActionWal`: STARTED-before-effect journal with startup recovery
//! - `RuntimeStore`: state/staging/runs/policy tables over SQLite
//! - `RuntimeLock`: flock-based writer lock with FREE/HELD/STALE probing

mod db;
mod error;
mod lock;
mod wal;

pub use db::{
    file_checksum, PolicyDrift, PolicyRow, RunRow, RuntimeStore, DB_FILE, LOCK_FILE,
    SCHEMA_VERSION,
};
pub use error::StoreError;
pub use lock::{LockState, RuntimeLock};
pub use wal::{ActionWal, RecoveryReport, WalRecord, WalStatus, WAL_FILE};

/// Result type for apex-store operations
pub type Result<T> = std::result::Result<T, StoreError>;
