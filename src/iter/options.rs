//! Iterator options
//!
//! ```text
//! IterOptions::keys()
//!     .start_key("a", true)    // "a" <= key
//!     .end_key("m", false)     //        key < "m"
//!     .reverse()               // walk from "m" down to "a"
//! ```
//! Bounds are always expressed in ascending order; the direction only
//! decides which end traversal starts from.

use std::ops::Bound;

use crate::error::{CinderError, Result};
use crate::types::{Direction, SeqNum};

/// Which ordering drives the iterator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterMode {
    /// Key order, one entry per live key
    Keys,
    /// Sequence-number order, one entry per live key at its latest seq
    Sequences,
}

/// A point in either ordering
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Position {
    Key(Vec<u8>),
    Seq(SeqNum),
}

/// Options for a merge iterator
#[derive(Debug, Clone)]
pub struct IterOptions {
    pub(crate) mode: IterMode,
    pub(crate) direction: Direction,
    pub(crate) start: Bound<Position>,
    pub(crate) end: Bound<Position>,
    pub(crate) include_deleted: bool,
    pub(crate) keys_only: bool,
}

impl Default for IterOptions {
    fn default() -> Self {
        Self::keys()
    }
}

impl IterOptions {
    /// Key-ordered iteration
    pub fn keys() -> Self {
        Self {
            mode: IterMode::Keys,
            direction: Direction::Forward,
            start: Bound::Unbounded,
            end: Bound::Unbounded,
            include_deleted: false,
            keys_only: false,
        }
    }

    /// Sequence-ordered iteration
    pub fn sequences() -> Self {
        Self {
            mode: IterMode::Sequences,
            ..Self::keys()
        }
    }

    pub fn forward(self) -> Self {
        self.direction(Direction::Forward)
    }

    pub fn reverse(self) -> Self {
        self.direction(Direction::Reverse)
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Lower key bound
    pub fn start_key(mut self, key: impl Into<Vec<u8>>, inclusive: bool) -> Self {
        self.start = bound(Position::Key(key.into()), inclusive);
        self
    }

    /// Upper key bound
    pub fn end_key(mut self, key: impl Into<Vec<u8>>, inclusive: bool) -> Self {
        self.end = bound(Position::Key(key.into()), inclusive);
        self
    }

    /// Lower sequence bound
    pub fn start_seq(mut self, seq: SeqNum, inclusive: bool) -> Self {
        self.start = bound(Position::Seq(seq), inclusive);
        self
    }

    /// Upper sequence bound
    pub fn end_seq(mut self, seq: SeqNum, inclusive: bool) -> Self {
        self.end = bound(Position::Seq(seq), inclusive);
        self
    }

    /// Emit tombstones as entries with `deleted == true`
    pub fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }

    /// Skip reading document bodies
    pub fn keys_only(mut self, keys_only: bool) -> Self {
        self.keys_only = keys_only;
        self
    }

    pub fn mode(&self) -> IterMode {
        self.mode
    }

    /// Reject bounds of the wrong kind
    pub(crate) fn validate(&self) -> Result<()> {
        for b in [&self.start, &self.end] {
            if let Bound::Included(p) | Bound::Excluded(p) = b {
                if !self.matches_mode(p) {
                    return Err(CinderError::InvalidArgument(format!(
                        "{:?} bound on a {:?} iterator",
                        p, self.mode
                    )));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn matches_mode(&self, position: &Position) -> bool {
        matches!(
            (self.mode, position),
            (IterMode::Keys, Position::Key(_)) | (IterMode::Sequences, Position::Seq(_))
        )
    }

    /// True when `position` lies inside both bounds
    pub(crate) fn contains(&self, position: &Position) -> bool {
        let above = match &self.start {
            Bound::Included(lo) => position >= lo,
            Bound::Excluded(lo) => position > lo,
            Bound::Unbounded => true,
        };
        let below = match &self.end {
            Bound::Included(hi) => position <= hi,
            Bound::Excluded(hi) => position < hi,
            Bound::Unbounded => true,
        };
        above && below
    }
}

fn bound(position: Position, inclusive: bool) -> Bound<Position> {
    if inclusive {
        Bound::Included(position)
    } else {
        Bound::Excluded(position)
    }
}
