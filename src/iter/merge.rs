//! Merge iterator over the WAL and an index root.
//!
//! Each step re-seeks both sources from the last returned position, so a
//! step never depends on cursor state that a concurrent WAL insert could
//! invalidate, and changing direction costs the same as moving forward.
//! The WAL is consulted under a short shared lock per step; the index root
//! is immutable and read without locking.

use std::cmp::Ordering;
use std::ops::Bound;

use super::options::{IterMode, IterOptions, Position};
use super::{Entry, Source};
use crate::db::Database;
use crate::error::{CinderError, Result};
use crate::snapshot::ReadView;
use crate::storage::IndexValue;
use crate::types::{DocLocation, Direction, SeqNum};
use crate::wal::WalEntry;

/// Where the iterator stands between steps
#[derive(Debug, Clone)]
enum Cursor {
    /// Past the end in the given direction
    Edge(Direction),
    /// On a returned position
    At(Position),
    /// Before a seek target; the next forward step may return it
    Seek(Position),
}

/// Resolved winner of one step, copied out from under the lock
#[derive(Debug)]
struct Candidate {
    key: Vec<u8>,
    seq: SeqNum,
    loc: Option<DocLocation>,
    deleted: bool,
    source: Source,
}

impl Candidate {
    fn wal(entry: &WalEntry) -> Self {
        Self {
            key: entry.key.clone(),
            seq: entry.visible_seq(),
            loc: entry.location(),
            deleted: entry.is_tombstone(),
            source: Source::Wal,
        }
    }

    fn index(key: &[u8], value: &IndexValue) -> Self {
        Self {
            key: key.to_vec(),
            seq: value.seq,
            loc: Some(value.loc),
            deleted: false,
            source: Source::Index,
        }
    }

    fn position(&self, mode: IterMode) -> Position {
        match mode {
            IterMode::Keys => Position::Key(self.key.clone()),
            IterMode::Sequences => Position::Seq(self.seq),
        }
    }
}

/// True when `a` comes strictly before `b` when walking in `dir`
fn before<T: Ord + ?Sized>(a: &T, b: &T, dir: Direction) -> bool {
    match (a.cmp(b), dir) {
        (Ordering::Less, Direction::Forward) | (Ordering::Greater, Direction::Reverse) => true,
        _ => false,
    }
}

fn key_bound(b: &Bound<Position>) -> Bound<&[u8]> {
    match b {
        Bound::Included(Position::Key(k)) => Bound::Included(k.as_slice()),
        Bound::Excluded(Position::Key(k)) => Bound::Excluded(k.as_slice()),
        _ => Bound::Unbounded,
    }
}

fn seq_bound(b: &Bound<Position>) -> Bound<SeqNum> {
    match b {
        Bound::Included(Position::Seq(s)) => Bound::Included(*s),
        Bound::Excluded(Position::Seq(s)) => Bound::Excluded(*s),
        _ => Bound::Unbounded,
    }
}

/// Ordered iterator combining WAL and index state
///
/// ## Usage
/// ```ignore
/// let mut iter = db.iter(IterOptions::keys().start_key("a", true))?;
/// while let Some(entry) = iter.next_entry()? {
///     println!("{:?} = {:?}", entry.key, entry.value);
/// }
/// ```
pub struct MergeIterator<'db> {
    db: &'db Database,
    view: ReadView,
    options: IterOptions,
    cursor: Cursor,
    last_source: Option<Source>,
}

impl<'db> MergeIterator<'db> {
    pub(crate) fn new(db: &'db Database, view: ReadView, options: IterOptions) -> Result<Self> {
        options.validate()?;
        let cursor = Cursor::Edge(options.direction.flip());
        Ok(Self {
            db,
            view,
            options,
            cursor,
            last_source: None,
        })
    }

    /// Next entry in the iterator's direction
    pub fn next_entry(&mut self) -> Result<Option<Entry>> {
        self.step(self.options.direction)
    }

    /// Previous entry (one step against the iterator's direction)
    pub fn prev_entry(&mut self) -> Result<Option<Entry>> {
        self.step(self.options.direction.flip())
    }

    /// Position so the next `next_entry` returns the first entry at or past
    /// `key` in the iterator's direction
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.seek_to(Position::Key(key.to_vec()))
    }

    /// Sequence-mode variant of [`MergeIterator::seek`]
    pub fn seek_seq(&mut self, seq: SeqNum) -> Result<()> {
        self.seek_to(Position::Seq(seq))
    }

    fn seek_to(&mut self, position: Position) -> Result<()> {
        if !self.options.matches_mode(&position) {
            return Err(CinderError::InvalidArgument(format!(
                "cannot seek a {:?} iterator to {:?}",
                self.options.mode, position
            )));
        }
        if !self.options.contains(&position) {
            return Err(CinderError::IteratorExhausted);
        }
        self.cursor = Cursor::Seek(position);
        self.last_source = None;
        Ok(())
    }

    /// Back to the start bound
    pub fn rewind(&mut self) {
        self.cursor = Cursor::Edge(self.options.direction.flip());
        self.last_source = None;
    }

    /// Source of the last returned entry
    pub fn last_source(&self) -> Option<Source> {
        self.last_source
    }

    pub fn options(&self) -> &IterOptions {
        &self.options
    }

    /// Release the iterator and its pin
    pub fn close(self) {}

    // =========================================================================
    // Stepping
    // =========================================================================

    fn step(&mut self, dir: Direction) -> Result<Option<Entry>> {
        let (lo, hi) = match &self.cursor {
            Cursor::Edge(edge) if *edge == dir => return Ok(None),
            Cursor::Edge(_) => (self.options.start.clone(), self.options.end.clone()),
            Cursor::At(p) => self.narrow(dir, Bound::Excluded(p.clone())),
            Cursor::Seek(p) if dir == self.options.direction => {
                self.narrow(dir, Bound::Included(p.clone()))
            }
            Cursor::Seek(p) => self.narrow(dir, Bound::Excluded(p.clone())),
        };

        let found = match self.options.mode {
            IterMode::Keys => self.resolve_key(lo, hi, dir)?,
            IterMode::Sequences => self.resolve_seq(lo, hi, dir)?,
        };

        let candidate = match found {
            Some(candidate) => candidate,
            None => {
                self.cursor = Cursor::Edge(dir);
                return Ok(None);
            }
        };

        self.cursor = Cursor::At(candidate.position(self.options.mode));
        self.last_source = Some(candidate.source);

        let value = match candidate.loc {
            Some(loc) if !self.options.keys_only => Some(self.db.read_body(&self.view.store, loc)?),
            _ => None,
        };
        Ok(Some(Entry {
            key: candidate.key,
            seq: candidate.seq,
            value,
            deleted: candidate.deleted,
            source: candidate.source,
        }))
    }

    /// Range for a step in `dir` starting from `from`
    fn narrow(&self, dir: Direction, from: Bound<Position>) -> (Bound<Position>, Bound<Position>) {
        match dir {
            Direction::Forward => (from, self.options.end.clone()),
            Direction::Reverse => (self.options.start.clone(), from),
        }
    }

    /// First visible key in `(lo, hi)`; WAL wins ties
    fn resolve_key(
        &self,
        mut lo: Bound<Position>,
        mut hi: Bound<Position>,
        dir: Direction,
    ) -> Result<Option<Candidate>> {
        loop {
            let state = self.db.state();
            self.view.check_epoch(state.epoch)?;

            let range = (key_bound(&lo), key_bound(&hi));
            let wal = state.wal.seek_key(range, dir, |e| self.view.visible(e));
            let index = self.view.root.seek_key(range, dir);

            let candidate = match (wal, index) {
                (None, None) => return Ok(None),
                (Some(w), Some((k, v))) if before(k, w.key.as_slice(), dir) => Candidate::index(k, v),
                (Some(w), _) => Candidate::wal(w),
                (None, Some((k, v))) => Candidate::index(k, v),
            };
            drop(state);

            if candidate.deleted && !self.options.include_deleted {
                let skip = Bound::Excluded(Position::Key(candidate.key));
                match dir {
                    Direction::Forward => lo = skip,
                    Direction::Reverse => hi = skip,
                }
                continue;
            }
            return Ok(Some(candidate));
        }
    }

    /// First visible sequence number in `(lo, hi)`.
    ///
    /// Every index seq is at or below the root's coverage and every visible
    /// WAL seq is above it, so the two sources never tie.
    fn resolve_seq(
        &self,
        mut lo: Bound<Position>,
        mut hi: Bound<Position>,
        dir: Direction,
    ) -> Result<Option<Candidate>> {
        loop {
            let state = self.db.state();
            self.view.check_epoch(state.epoch)?;

            let range = (seq_bound(&lo), seq_bound(&hi));
            let wal = state.wal.seek_seq(range, dir, |e| self.view.visible(e));
            let index = self.view.root.seek_seq(range, dir);

            let candidate = match (wal, index) {
                (None, None) => return Ok(None),
                (Some(w), Some((s, k, v))) if before(&s, &w.seq, dir) => Candidate::index(k, v),
                (Some(w), _) => Candidate::wal(w),
                (None, Some((_, k, v))) => Candidate::index(k, v),
            };
            // An index version is stale once the WAL holds a visible one
            let shadowed = candidate.source == Source::Index
                && state.wal.has_visible(&candidate.key, |e| self.view.visible(e));
            drop(state);

            if shadowed || (candidate.deleted && !self.options.include_deleted) {
                let skip = Bound::Excluded(Position::Seq(candidate.seq));
                match dir {
                    Direction::Forward => lo = skip,
                    Direction::Reverse => hi = skip,
                }
                continue;
            }
            return Ok(Some(candidate));
        }
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

impl std::fmt::Debug for MergeIterator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeIterator")
            .field("options", &self.options)
            .field("cursor", &self.cursor)
            .field("max_seq", &self.view.max_seq)
            .finish()
    }
}
