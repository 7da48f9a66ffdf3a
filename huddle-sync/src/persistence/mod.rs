//! Durable storage for room documents.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  fragments   ┌─────────────────┐   bytes   ┌──────────────┐
//! │ RoomSession  │ ───────────► │ RoomPersistence │ ────────► │ KeyValueStore│
//! │ (writer task)│              │ (per room)      │           │ Rocks/Memory │
//! └──────────────┘              └─────────────────┘           └──────────────┘
//!
//! Keys:
//!   "doc-" ++ roomId                               LZ4(full state)
//!   "upd-" ++ u32be(len roomId) ++ roomId ++ u64be(seq)   LZ4(fragment)
//! ```
//!
//! Restore is the snapshot followed by the log in sequence order. Compaction
//! folds the log into a new snapshot in one atomic batch.

pub mod memory;
pub mod rocks;
pub mod room;

use thiserror::Error;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};
pub use room::{RestoredDocument, RoomPersistence, DEFAULT_COMPACTION_THRESHOLD};

/// One operation of an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Minimal ordered byte store the persistence adapter runs on.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, PersistenceError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), PersistenceError>;

    fn delete(&self, key: &[u8]) -> Result<(), PersistenceError>;

    /// All entries whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, PersistenceError>;

    /// Apply every operation or none.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), PersistenceError>;
}

/// Persistence errors.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(String),
    #[error("corrupt snapshot for room {room}: {reason}")]
    CorruptSnapshot { room: String, reason: String },
    #[error("room id must not be empty")]
    EmptyRoomId,
}

impl From<rocksdb::Error> for PersistenceError {
    fn from(e: rocksdb::Error) -> Self {
        PersistenceError::Database(e.to_string())
    }
}
