//! Error types for CinderKV
//!
//! Provides a unified error type for all operations.
//!
//! `KeyNotFound` and `IteratorExhausted` are ordinary outcomes rather than
//! failures; most read paths report them as `Ok(None)` and only the APIs
//! that cannot express absence otherwise return them as errors.

use thiserror::Error;

/// Result type alias using CinderError
pub type Result<T> = std::result::Result<T, CinderError>;

/// Unified error type for CinderKV operations
#[derive(Debug, Error)]
pub enum CinderError {
    // -------------------------------------------------------------------------
    // Lookup / Iteration Outcomes
    // -------------------------------------------------------------------------
    #[error("Key not found")]
    KeyNotFound,

    #[error("Iterator exhausted")]
    IteratorExhausted,

    // -------------------------------------------------------------------------
    // Transaction Errors
    // -------------------------------------------------------------------------
    #[error("Write conflict on key {key:?}: committed seq {committed_seq} is newer than snapshot seq {snapshot_seq}")]
    Conflict {
        key: Vec<u8>,
        committed_seq: u64,
        snapshot_seq: u64,
    },

    #[error("Transaction already closed")]
    TransactionAlreadyClosed,

    // -------------------------------------------------------------------------
    // Snapshot / Header Errors
    // -------------------------------------------------------------------------
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("Corrupt header: {0}")]
    CorruptHeader(String),

    // -------------------------------------------------------------------------
    // Compaction Errors
    // -------------------------------------------------------------------------
    #[error("Compaction aborted: {0}")]
    CompactionAborted(String),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Storage I/O error: {0}")]
    StorageIo(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<bincode::Error> for CinderError {
    fn from(e: bincode::Error) -> Self {
        CinderError::Serialization(e.to_string())
    }
}
