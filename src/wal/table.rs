//! WAL table implementation
//!
//! Arena of entries with a key view and a sequence view.
//!
//! ## Layout
//! - `arena`: every live entry, addressed by [`EntryId`]
//! - `by_key`: key → versions, committed ones by ascending seq, then
//!   uncommitted ones (at most one per transaction)
//! - `by_seq`: seq → entry, committed entries only
//!
//! The table itself is not synchronized; the database wraps it in its
//! state lock together with the index root it shadows.

use std::collections::BTreeMap;
use std::ops::Bound;

use super::entry::{EntryId, WalEntry, WalOp};
use crate::storage::{range_is_empty, BatchOp};
use crate::types::{DocLocation, Direction, SeqNum, TxnId};

/// Fixed per-entry overhead counted by `size_bytes`
const ENTRY_OVERHEAD: usize = 64;

/// The oldest state any reader may still observe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcHorizon {
    /// Lowest index root coverage among readers
    pub index_seq: SeqNum,
    /// Lowest visibility ceiling among readers
    pub max_seq: SeqNum,
}

/// In-memory write-ahead log
#[derive(Debug, Default)]
pub struct Wal {
    arena: Vec<Option<WalEntry>>,
    free: Vec<usize>,
    by_key: BTreeMap<Vec<u8>, Vec<EntryId>>,
    by_seq: BTreeMap<SeqNum, EntryId>,
    dirty: usize,
    pending: usize,
    bytes: usize,
    /// Highest seq garbage collection has removed
    pruned: SeqNum,
}

impl Wal {
    /// Create an empty WAL
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Insert a version of `key`.
    ///
    /// Committed versions (`owner == None`) must carry a sequence number
    /// above every committed version of the key. A transaction writing the
    /// same key twice overwrites its own uncommitted version in place.
    pub fn put(&mut self, key: Vec<u8>, seq: SeqNum, op: WalOp, owner: Option<TxnId>) -> EntryId {
        if let Some(txn) = owner {
            if let Some(id) = self.pending_version(&key, txn) {
                if let Some(entry) = self.arena[id.0].as_mut() {
                    entry.op = op;
                    entry.seq = seq;
                }
                return id;
            }
        }

        let committed = owner.is_none();
        self.bytes += key.len() + ENTRY_OVERHEAD;
        let id = self.alloc(WalEntry {
            key: key.clone(),
            seq,
            op,
            owner,
            dirty: committed,
        });

        if committed {
            debug_assert!(self.get(&key).map_or(true, |e| e.seq < seq));
            self.by_seq.insert(seq, id);
            self.dirty += 1;
            let split = self.committed_prefix(&key);
            self.by_key.entry(key).or_default().insert(split, id);
        } else {
            self.pending += 1;
            self.by_key.entry(key).or_default().push(id);
        }
        id
    }

    /// Make an uncommitted entry globally visible under `seq`
    pub fn commit(&mut self, id: EntryId, seq: SeqNum) {
        let key = match self.arena.get_mut(id.0).and_then(Option::as_mut) {
            Some(entry) if entry.owner.is_some() => {
                entry.owner = None;
                entry.seq = seq;
                entry.dirty = true;
                entry.key.clone()
            }
            _ => return,
        };
        self.pending -= 1;
        self.dirty += 1;
        self.by_seq.insert(seq, id);

        // Move the version from the uncommitted tail to the end of the
        // committed prefix.
        let split = self.committed_prefix(&key);
        if let Some(versions) = self.by_key.get_mut(&key) {
            if let Some(pos) = versions.iter().position(|v| *v == id) {
                versions.remove(pos);
                versions.insert(split.min(versions.len()), id);
            }
        }
    }

    /// Remove an entry entirely
    pub fn remove(&mut self, id: EntryId) -> Option<WalEntry> {
        let entry = self.arena.get_mut(id.0)?.take()?;
        self.free.push(id.0);
        self.bytes = self.bytes.saturating_sub(entry.key.len() + ENTRY_OVERHEAD);

        if entry.is_committed() {
            self.by_seq.remove(&entry.seq);
            if entry.dirty {
                self.dirty -= 1;
            }
        } else {
            self.pending -= 1;
        }

        if let Some(versions) = self.by_key.get_mut(&entry.key) {
            versions.retain(|v| *v != id);
            if versions.is_empty() {
                self.by_key.remove(&entry.key);
            }
        }
        Some(entry)
    }

    /// Point an entry at a new body location (used when rehoming bodies)
    pub fn set_location(&mut self, id: EntryId, loc: DocLocation) {
        if let Some(entry) = self.arena.get_mut(id.0).and_then(Option::as_mut) {
            if let WalOp::Put { loc: old, .. } = &mut entry.op {
                *old = loc;
            }
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Entry by id
    pub fn entry(&self, id: EntryId) -> Option<&WalEntry> {
        self.arena.get(id.0).and_then(Option::as_ref)
    }

    /// Id of the committed entry carrying `seq`
    pub fn id_at(&self, seq: SeqNum) -> Option<EntryId> {
        self.by_seq.get(&seq).copied()
    }

    /// Latest committed version of `key`
    pub fn get(&self, key: &[u8]) -> Option<&WalEntry> {
        self.by_key
            .get(key)?
            .iter()
            .rev()
            .filter_map(|id| self.entry(*id))
            .find(|e| e.is_committed())
    }

    /// Latest version of `key` accepted by `visible`
    pub fn lookup<F>(&self, key: &[u8], visible: F) -> Option<&WalEntry>
    where
        F: Fn(&WalEntry) -> bool,
    {
        self.latest_visible(self.by_key.get(key)?, &visible)
    }

    /// First key inside `range` (in `dir` order) that has a visible version
    pub fn seek_key<F>(
        &self,
        range: (Bound<&[u8]>, Bound<&[u8]>),
        dir: Direction,
        visible: F,
    ) -> Option<&WalEntry>
    where
        F: Fn(&WalEntry) -> bool,
    {
        if range_is_empty(range.0, range.1) {
            return None;
        }
        let iter = self.by_key.range::<[u8], _>(range);
        match dir {
            Direction::Forward => self.first_visible(iter, &visible),
            Direction::Reverse => self.first_visible(iter.rev(), &visible),
        }
    }

    /// First committed entry inside `range` (in `dir` order) that is visible
    /// and is the newest visible version of its key
    pub fn seek_seq<F>(
        &self,
        range: (Bound<SeqNum>, Bound<SeqNum>),
        dir: Direction,
        visible: F,
    ) -> Option<&WalEntry>
    where
        F: Fn(&WalEntry) -> bool,
    {
        if range_is_empty(range.0.as_ref(), range.1.as_ref()) {
            return None;
        }
        let mut iter = self.by_seq.range(range);
        loop {
            let (_, id) = match dir {
                Direction::Forward => iter.next()?,
                Direction::Reverse => iter.next_back()?,
            };
            let entry = match self.entry(*id) {
                Some(e) if visible(e) => e,
                _ => continue,
            };
            let newest = self.lookup(&entry.key, &visible);
            if newest.map_or(false, |n| n.is_committed() && n.seq == entry.seq) {
                return Some(entry);
            }
        }
    }

    /// True when `key` has a version accepted by `visible`
    pub fn has_visible<F>(&self, key: &[u8], visible: F) -> bool
    where
        F: Fn(&WalEntry) -> bool,
    {
        self.lookup(key, visible).is_some()
    }

    // =========================================================================
    // Flush Support
    // =========================================================================

    /// Index mutations that merge every committed version with
    /// `seq <= up_to`: the newest such version per key, if still dirty
    pub fn flush_batch(&self, up_to: SeqNum) -> Vec<BatchOp> {
        let mut ops = Vec::new();
        for (key, versions) in &self.by_key {
            let newest = versions
                .iter()
                .rev()
                .filter_map(|id| self.entry(*id))
                .find(|e| e.is_committed() && e.seq <= up_to);
            let entry = match newest {
                Some(e) if e.dirty => e,
                _ => continue,
            };
            ops.push(match entry.op {
                WalOp::Put { loc, size } => BatchOp::Put {
                    key: key.clone(),
                    seq: entry.seq,
                    loc,
                    size,
                },
                WalOp::Delete => BatchOp::Remove { key: key.clone() },
            });
        }
        ops
    }

    /// Clear the dirty flag of committed entries with `seq <= up_to`
    pub fn mark_flushed(&mut self, up_to: SeqNum) {
        let ids: Vec<EntryId> = self.by_seq.range(..=up_to).map(|(_, id)| *id).collect();
        for id in ids {
            if let Some(entry) = self.arena[id.0].as_mut() {
                if entry.dirty {
                    entry.dirty = false;
                    self.dirty -= 1;
                }
            }
        }
    }

    /// Set the dirty flag of committed entries with `seq > after`
    pub fn mark_dirty_after(&mut self, after: SeqNum) {
        let ids: Vec<EntryId> = self
            .by_seq
            .range((Bound::Excluded(after), Bound::Unbounded))
            .map(|(_, id)| *id)
            .collect();
        for id in ids {
            if let Some(entry) = self.arena[id.0].as_mut() {
                if !entry.dirty {
                    entry.dirty = true;
                    self.dirty += 1;
                }
            }
        }
    }

    /// Remove committed entries with `seq > after`, returning how many
    pub fn discard_after(&mut self, after: SeqNum) -> usize {
        let ids: Vec<EntryId> = self
            .by_seq
            .range((Bound::Excluded(after), Bound::Unbounded))
            .map(|(_, id)| *id)
            .collect();
        let count = ids.len();
        for id in ids {
            self.remove(id);
        }
        // Versions pruned past `after` belonged to the discarded history
        self.pruned = self.pruned.min(after);
        count
    }

    /// Committed entries with `after < seq <= up_to`, in seq order
    pub fn committed_between(&self, after: SeqNum, up_to: SeqNum) -> impl Iterator<Item = &WalEntry> + '_ {
        let range = if after < up_to {
            Some(self.by_seq.range((Bound::Excluded(after), Bound::Included(up_to))))
        } else {
            None
        };
        range
            .into_iter()
            .flatten()
            .filter_map(move |(_, id)| self.entry(*id))
    }

    /// Highest seq removed by garbage collection.
    ///
    /// Every committed version above it is still held, so the WAL can
    /// reproduce any state between a header and a later seq above it.
    pub fn pruned_seq(&self) -> SeqNum {
        self.pruned
    }

    // =========================================================================
    // Garbage Collection
    // =========================================================================

    /// Drop committed versions no reader can observe any more
    pub fn gc(&mut self, horizon: GcHorizon) -> usize {
        let keys: Vec<Vec<u8>> = self.by_key.keys().cloned().collect();
        keys.iter().map(|k| self.gc_key(k, horizon)).sum()
    }

    /// Per-key variant of [`Wal::gc`]
    pub fn gc_key(&mut self, key: &[u8], horizon: GcHorizon) -> usize {
        let victims: Vec<EntryId> = match self.by_key.get(key) {
            Some(versions) => {
                let committed: Vec<&WalEntry> = versions
                    .iter()
                    .filter_map(|id| self.entry(*id))
                    .filter(|e| e.is_committed())
                    .collect();
                let ids: Vec<EntryId> = versions
                    .iter()
                    .copied()
                    .filter(|id| self.entry(*id).map_or(false, |e| e.is_committed()))
                    .collect();
                ids.iter()
                    .zip(committed.iter())
                    .enumerate()
                    .filter(|(i, (_, e))| {
                        let flushed_for_all = !e.dirty && e.seq <= horizon.index_seq;
                        let superseded_for_all = committed[i + 1..]
                            .iter()
                            .any(|newer| newer.seq <= horizon.max_seq);
                        flushed_for_all || superseded_for_all
                    })
                    .map(|(_, (id, _))| *id)
                    .collect()
            }
            None => return 0,
        };
        let count = victims.len();
        for id in victims {
            if let Some(entry) = self.remove(id) {
                self.pruned = self.pruned.max(entry.seq);
            }
        }
        count
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Ids of every uncommitted entry
    pub fn pending_ids(&self) -> Vec<EntryId> {
        self.arena
            .iter()
            .enumerate()
            .filter_map(|(i, e)| match e {
                Some(entry) if !entry.is_committed() => Some(EntryId(i)),
                _ => None,
            })
            .collect()
    }

    /// Number of entries (all versions, committed or not)
    pub fn len(&self) -> usize {
        self.by_seq.len() + self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Committed entries not yet merged into the index
    pub fn dirty_count(&self) -> usize {
        self.dirty
    }

    /// Uncommitted entries
    pub fn pending_count(&self) -> usize {
        self.pending
    }

    /// Distinct keys with at least one version
    pub fn key_count(&self) -> usize {
        self.by_key.len()
    }

    /// Approximate memory footprint in bytes
    pub fn size_bytes(&self) -> usize {
        self.bytes
    }

    /// Highest committed sequence number held
    pub fn max_seq(&self) -> Option<SeqNum> {
        self.by_seq.keys().next_back().copied()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn alloc(&mut self, entry: WalEntry) -> EntryId {
        match self.free.pop() {
            Some(slot) => {
                self.arena[slot] = Some(entry);
                EntryId(slot)
            }
            None => {
                self.arena.push(Some(entry));
                EntryId(self.arena.len() - 1)
            }
        }
    }

    fn committed_prefix(&self, key: &[u8]) -> usize {
        self.by_key.get(key).map_or(0, |versions| {
            versions
                .iter()
                .filter(|id| self.entry(**id).map_or(false, |e| e.is_committed()))
                .count()
        })
    }

    fn pending_version(&self, key: &[u8], txn: TxnId) -> Option<EntryId> {
        self.by_key
            .get(key)?
            .iter()
            .copied()
            .find(|id| self.entry(*id).map_or(false, |e| e.owner == Some(txn)))
    }

    fn latest_visible<F>(&self, versions: &[EntryId], visible: &F) -> Option<&WalEntry>
    where
        F: Fn(&WalEntry) -> bool,
    {
        versions
            .iter()
            .rev()
            .filter_map(|id| self.entry(*id))
            .find(|e| visible(e))
    }

    fn first_visible<'a, I, F>(&'a self, iter: I, visible: &F) -> Option<&'a WalEntry>
    where
        I: Iterator<Item = (&'a Vec<u8>, &'a Vec<EntryId>)>,
        F: Fn(&WalEntry) -> bool,
    {
        for (_, versions) in iter {
            if let Some(entry) = self.latest_visible(versions, visible) {
                return Some(entry);
            }
        }
        None
    }
}
