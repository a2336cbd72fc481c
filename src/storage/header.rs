//! Database header
//!
//! The header is the unit of crash-consistent recovery: the newest valid
//! header names the index roots and counters the database reopens with.

use serde::{Deserialize, Serialize};

use super::block::BlockFile;
use crate::error::{CinderError, Result};
use crate::types::{BlockId, Revision, SeqNum};

/// Current header format version
pub const HEADER_VERSION: u16 = 1;

/// Persisted header record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u16,
    pub revision: Revision,
    /// Sequence counter at the time of the header
    pub seqnum: SeqNum,
    /// Highest sequence number merged into the referenced roots
    pub index_seq: SeqNum,
    pub key_root: Option<BlockId>,
    pub seq_root: Option<BlockId>,
    pub ndocs: u64,
    pub datasize: u64,
    pub prev_header: Option<BlockId>,
    pub last_wal_flush_header: Option<BlockId>,
}

impl Header {
    /// True when the roots alone reproduce the state at `seqnum`
    pub fn is_self_contained(&self) -> bool {
        self.index_seq == self.seqnum
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bid: BlockId, bytes: &[u8]) -> Result<Self> {
        let header: Header = bincode::deserialize(bytes).map_err(|e| {
            CinderError::CorruptHeader(format!("header at block {} does not decode: {}", bid, e))
        })?;
        if header.version != HEADER_VERSION {
            return Err(CinderError::CorruptHeader(format!(
                "header at block {} has version {}, expected {}",
                bid, header.version, HEADER_VERSION
            )));
        }
        if header.index_seq > header.seqnum {
            return Err(CinderError::CorruptHeader(format!(
                "header at block {} covers seq {} beyond its counter {}",
                bid, header.index_seq, header.seqnum
            )));
        }
        Ok(header)
    }

    /// Append this header to `file`
    pub fn write_to(&self, file: &dyn BlockFile) -> Result<BlockId> {
        file.write_header(&self.encode()?)
    }

    /// Read and validate the header at `bid`
    pub fn read_from(file: &dyn BlockFile, bid: BlockId) -> Result<Self> {
        let bytes = file.read_header(bid)?;
        Self::decode(bid, &bytes)
    }
}

/// In-memory summary of a retained header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRef {
    pub bid: BlockId,
    pub revision: Revision,
    pub seqnum: SeqNum,
    pub index_seq: SeqNum,
}

impl HeaderRef {
    pub fn new(bid: BlockId, header: &Header) -> Self {
        Self {
            bid,
            revision: header.revision,
            seqnum: header.seqnum,
            index_seq: header.index_seq,
        }
    }
}
