//! Shared identifier types

use std::fmt;

use serde::{Deserialize, Serialize};

/// Sequence number assigned to every committed mutation
pub type SeqNum = u64;

/// Revision number of a committed header
pub type Revision = u64;

/// Byte offset of a block inside a generation file
pub type BlockId = u64;

/// Sequence number reported for writes that have not been committed yet.
/// Committed sequence numbers start at 1.
pub const UNCOMMITTED_SEQ: SeqNum = 0;

/// Transaction identifier (unique per database handle)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(pub(crate) u64);

impl TxnId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Where a document body lives: generation file + block offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocLocation {
    pub generation: u64,
    pub block: BlockId,
}

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    /// Sees every committed write, whenever it was committed
    ReadCommitted,

    /// Sees only writes committed before `begin()` (plus its own)
    RepeatableRead,
}

/// Cursor movement direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }
}
