//! Ordered index
//!
//! Durable key → location and sequence → key trees. A root is immutable;
//! `insert_batch` derives a new root from an old one and persists it, so
//! readers holding an older root are never disturbed by a flush.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::block::{BlockFile, BlockKind};
use super::header::Header;
use crate::error::{CinderError, Result};
use crate::types::{BlockId, DocLocation, Direction, SeqNum};

/// What the key tree stores per key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexValue {
    pub seq: SeqNum,
    pub loc: DocLocation,
    /// Body size in bytes
    pub size: u64,
}

/// One mutation applied by `insert_batch`
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Put {
        key: Vec<u8>,
        seq: SeqNum,
        loc: DocLocation,
        size: u64,
    },
    Remove {
        key: Vec<u8>,
    },
}

/// An immutable index root
#[derive(Debug, Clone, Default)]
pub struct IndexRoot {
    keys: Arc<BTreeMap<Vec<u8>, IndexValue>>,
    seqs: Arc<BTreeMap<SeqNum, Vec<u8>>>,
    /// Highest sequence number merged into this root
    index_seq: SeqNum,
    key_root: Option<BlockId>,
    seq_root: Option<BlockId>,
}

/// True when `(lo, hi)` selects nothing. `BTreeMap::range` panics on
/// inverted or doubly-excluded equal bounds, so callers check first.
pub(crate) fn range_is_empty<T: Ord + ?Sized>(lo: Bound<&T>, hi: Bound<&T>) -> bool {
    match (lo, hi) {
        (Bound::Included(a), Bound::Included(b)) => a > b,
        (Bound::Included(a), Bound::Excluded(b))
        | (Bound::Excluded(a), Bound::Included(b)) => a >= b,
        (Bound::Excluded(a), Bound::Excluded(b)) => a >= b,
        _ => false,
    }
}

impl IndexRoot {
    /// Point lookup
    pub fn lookup(&self, key: &[u8]) -> Option<&IndexValue> {
        self.keys.get(key)
    }

    /// First key inside `range` in the given direction
    pub fn seek_key(
        &self,
        range: (Bound<&[u8]>, Bound<&[u8]>),
        dir: Direction,
    ) -> Option<(&[u8], &IndexValue)> {
        if range_is_empty(range.0, range.1) {
            return None;
        }
        let mut iter = self.keys.range::<[u8], _>(range);
        let found = match dir {
            Direction::Forward => iter.next(),
            Direction::Reverse => iter.next_back(),
        };
        found.map(|(k, v)| (k.as_slice(), v))
    }

    /// First sequence number inside `range` in the given direction
    pub fn seek_seq(
        &self,
        range: (Bound<SeqNum>, Bound<SeqNum>),
        dir: Direction,
    ) -> Option<(SeqNum, &[u8], &IndexValue)> {
        if range_is_empty(range.0.as_ref(), range.1.as_ref()) {
            return None;
        }
        let mut iter = self.seqs.range(range);
        let (seq, key) = match dir {
            Direction::Forward => iter.next()?,
            Direction::Reverse => iter.next_back()?,
        };
        let value = self.keys.get(key)?;
        Some((*seq, key.as_slice(), value))
    }

    /// Live key/value pairs in key order
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &IndexValue)> {
        self.keys.iter().map(|(k, v)| (k.as_slice(), v))
    }

    /// Number of live documents
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Sum of live body sizes
    pub fn datasize(&self) -> u64 {
        self.keys.values().map(|v| v.size).sum()
    }

    pub fn index_seq(&self) -> SeqNum {
        self.index_seq
    }

    pub fn key_root(&self) -> Option<BlockId> {
        self.key_root
    }

    pub fn seq_root(&self) -> Option<BlockId> {
        self.seq_root
    }
}

/// Index persistence for one generation
pub struct OrderedIndex {
    file: Arc<dyn BlockFile>,
}

impl OrderedIndex {
    pub fn new(file: Arc<dyn BlockFile>) -> Self {
        Self { file }
    }

    /// Apply `ops` on top of `base` and persist the resulting root.
    ///
    /// `index_seq` becomes the new root's coverage; it must not go backwards.
    pub fn insert_batch(
        &self,
        base: &IndexRoot,
        ops: Vec<BatchOp>,
        index_seq: SeqNum,
    ) -> Result<IndexRoot> {
        if index_seq < base.index_seq {
            return Err(CinderError::InvalidArgument(format!(
                "index seq {} precedes base root seq {}",
                index_seq, base.index_seq
            )));
        }

        let mut keys = (*base.keys).clone();
        let mut seqs = (*base.seqs).clone();

        for op in ops {
            match op {
                BatchOp::Put {
                    key,
                    seq,
                    loc,
                    size,
                } => {
                    if let Some(old) = keys.insert(key.clone(), IndexValue { seq, loc, size }) {
                        seqs.remove(&old.seq);
                    }
                    seqs.insert(seq, key);
                }
                BatchOp::Remove { key } => {
                    if let Some(old) = keys.remove(&key) {
                        seqs.remove(&old.seq);
                    }
                }
            }
        }

        let key_root = self
            .file
            .append(BlockKind::KeyRoot, &bincode::serialize(&keys)?)?;
        let seq_root = self
            .file
            .append(BlockKind::SeqRoot, &bincode::serialize(&seqs)?)?;

        Ok(IndexRoot {
            keys: Arc::new(keys),
            seqs: Arc::new(seqs),
            index_seq,
            key_root: Some(key_root),
            seq_root: Some(seq_root),
        })
    }

    /// Materialize a root from its persisted blocks
    pub fn load(
        &self,
        key_root: Option<BlockId>,
        seq_root: Option<BlockId>,
        index_seq: SeqNum,
    ) -> Result<IndexRoot> {
        let keys: BTreeMap<Vec<u8>, IndexValue> = match key_root {
            Some(bid) => bincode::deserialize(&self.read_root(bid, BlockKind::KeyRoot)?)?,
            None => BTreeMap::new(),
        };
        let seqs: BTreeMap<SeqNum, Vec<u8>> = match seq_root {
            Some(bid) => bincode::deserialize(&self.read_root(bid, BlockKind::SeqRoot)?)?,
            None => BTreeMap::new(),
        };
        if keys.len() != seqs.len() {
            return Err(CinderError::Storage(format!(
                "index roots disagree: {} keys, {} sequence entries",
                keys.len(),
                seqs.len()
            )));
        }
        Ok(IndexRoot {
            keys: Arc::new(keys),
            seqs: Arc::new(seqs),
            index_seq,
            key_root,
            seq_root,
        })
    }

    /// The root referenced by `header`
    pub fn root_at(&self, header: &Header) -> Result<IndexRoot> {
        self.load(header.key_root, header.seq_root, header.index_seq)
    }

    fn read_root(&self, bid: BlockId, expected: BlockKind) -> Result<Vec<u8>> {
        let (kind, payload) = self.file.read(bid)?;
        if kind != expected {
            return Err(CinderError::Storage(format!(
                "block {} is a {:?} block, expected {:?}",
                bid, kind, expected
            )));
        }
        Ok(payload)
    }
}
