//! WAL Entry definitions
//!
//! Defines the structure of individual WAL entries.

use crate::types::{DocLocation, SeqNum, TxnId, UNCOMMITTED_SEQ};

/// Stable handle of an entry inside the WAL arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(crate) usize);

/// Operations that can be logged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalOp {
    /// The key now maps to the document at `loc`
    Put { loc: DocLocation, size: u64 },

    /// The key was deleted (tombstone)
    Delete,
}

/// A single entry in the WAL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    pub key: Vec<u8>,

    /// Commit sequence number ([`UNCOMMITTED_SEQ`] while owned by a transaction)
    pub seq: SeqNum,

    pub op: WalOp,

    /// Owning transaction; `None` once globally committed
    pub owner: Option<TxnId>,

    /// Committed but not yet merged into the index
    pub dirty: bool,
}

impl WalEntry {
    pub fn is_tombstone(&self) -> bool {
        matches!(self.op, WalOp::Delete)
    }

    pub fn is_committed(&self) -> bool {
        self.owner.is_none()
    }

    /// Location of the body, `None` for tombstones
    pub fn location(&self) -> Option<DocLocation> {
        match self.op {
            WalOp::Put { loc, .. } => Some(loc),
            WalOp::Delete => None,
        }
    }

    /// Body size in bytes (0 for tombstones)
    pub fn size(&self) -> u64 {
        match self.op {
            WalOp::Put { size, .. } => size,
            WalOp::Delete => 0,
        }
    }

    /// Sequence number as reported to readers
    pub fn visible_seq(&self) -> SeqNum {
        if self.is_committed() {
            self.seq
        } else {
            UNCOMMITTED_SEQ
        }
    }
}
