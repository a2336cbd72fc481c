//! Merge Iterator Module
//!
//! Ordered traversal that reconciles the WAL with the index root.
//!
//! ## Resolution Rules
//! - The WAL shadows the index: on equal keys the WAL version wins
//! - A WAL tombstone hides the key (unless `include_deleted`)
//! - Only versions visible to the iterator's view are considered
//!
//! ```text
//!   WAL    :   a@3          b@4(del)
//!   Index  :   a@1   b@2              c@0..
//!   Output :   a@3                    c
//! ```

mod merge;
mod options;

pub use merge::MergeIterator;
pub use options::{IterMode, IterOptions, Position};

use bytes::Bytes;

use crate::types::SeqNum;

/// Where an entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// The durable index root
    Index,
    /// The in-memory WAL (not yet merged into the index)
    Wal,
}

/// One iterator result
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: Vec<u8>,
    /// Sequence number (0 for the reader's own uncommitted writes)
    pub seq: SeqNum,
    /// Document body; `None` for tombstones and key-only iterators
    pub value: Option<Bytes>,
    pub deleted: bool,
    pub source: Source,
}
