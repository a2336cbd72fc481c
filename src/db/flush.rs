//! Flush, header commit and rollback
//!
//! Every operation here runs under `write_lock`. Flush and rollback do
//! their index and header I/O without holding the state lock, so readers
//! and writers keep going while a header is written.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{CommitMode, Database};
use crate::config::SyncStrategy;
use crate::error::{CinderError, Result};
use crate::storage::{Header, HeaderRef, IndexRoot, Store, HEADER_VERSION};
use crate::types::{BlockId, Revision, SeqNum};

impl Database {
    /// Flush the WAL into the index, write a header and sync
    ///
    /// Explicit durability request: returns once everything committed so
    /// far is on disk.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.flush_locked(None)?;
        self.sync_active()
    }

    /// Merge only the WAL entries with `seq <= up_to`, write a header and
    /// sync.
    ///
    /// Newer entries stay in the WAL; the header keeps the current counter,
    /// so it is backed by the WAL until the next full flush.
    pub fn flush_up_to(&self, up_to: SeqNum) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.flush_locked(Some(up_to))?;
        self.sync_active()
    }

    /// Write a header, returning its revision
    pub fn commit(&self, mode: CommitMode) -> Result<Revision> {
        let _guard = self.write_lock.lock();
        self.commit_locked(mode)
    }

    /// Flush triggered by the WAL threshold
    pub(super) fn auto_flush(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        // Another writer may have flushed while we waited
        if self.state.read().wal.dirty_count() < self.config.wal_threshold {
            return Ok(());
        }
        self.flush_locked(None)?;
        Ok(())
    }

    /// Header commit; caller holds `write_lock`
    pub(super) fn commit_locked(&self, mode: CommitMode) -> Result<Revision> {
        let flush = mode == CommitMode::FlushWal || self.config.wal_flush_before_commit;
        if !(flush && self.flush_locked(None)?) {
            self.write_header_locked()?;
        }
        Ok(self.state.read().revision)
    }

    /// Merge committed WAL entries up to `limit` (everything when `None`)
    /// into the index and write a header.
    ///
    /// Returns false when there was nothing to merge. Caller holds
    /// `write_lock`.
    pub(super) fn flush_locked(&self, limit: Option<SeqNum>) -> Result<bool> {
        // Phase 1: capture what to merge
        let (store, base, up_to, ops, mut header) = {
            let state = self.state.read();
            let up_to = limit.unwrap_or(state.seqnum);
            if up_to > state.seqnum {
                return Err(CinderError::InvalidArgument(format!(
                    "flush target {} is beyond current seq {}",
                    up_to, state.seqnum
                )));
            }
            if up_to < state.root.index_seq() {
                return Err(CinderError::InvalidArgument(format!(
                    "flush target {} is below the index at seq {}",
                    up_to,
                    state.root.index_seq()
                )));
            }
            if up_to == state.root.index_seq() {
                return Ok(false);
            }
            (
                Arc::clone(state.generation.active()),
                state.root.clone(),
                up_to,
                state.wal.flush_batch(up_to),
                state.next_header(),
            )
        };

        // Phase 2: persist roots and header without blocking writers
        let batch_len = ops.len();
        let root = store.index().insert_batch(&base, ops, up_to)?;
        header.index_seq = up_to;
        header.key_root = root.key_root();
        header.seq_root = root.seq_root();
        let bid = self.append_header(&store, &header)?;

        // Phase 3: publish
        let mut state = self.state.write();
        state.root = root;
        state.wal.mark_flushed(up_to);
        state.install_header(bid, &header);
        state.last_wal_flush_header = Some(bid);
        state.wal_barrier = bid;
        let horizon = self.gc_horizon(&state);
        let evicted = state.wal.gc(horizon);

        tracing::debug!(
            up_to,
            merged = batch_len,
            evicted,
            revision = header.revision,
            "flushed WAL"
        );
        Ok(true)
    }

    /// Write a header of the current state without merging the WAL.
    /// Caller holds `write_lock`.
    fn write_header_locked(&self) -> Result<BlockId> {
        let (store, header) = {
            let state = self.state.read();
            (Arc::clone(state.generation.active()), state.next_header())
        };
        let bid = self.append_header(&store, &header)?;
        self.state.write().install_header(bid, &header);
        tracing::debug!(revision = header.revision, seqnum = header.seqnum, "committed header");
        Ok(bid)
    }

    /// Append `header` and sync according to the configured strategy
    pub(super) fn append_header(&self, store: &Store, header: &Header) -> Result<BlockId> {
        let bid = header.write_to(store.file())?;
        let due = match self.config.sync_strategy {
            SyncStrategy::EveryHeader => true,
            SyncStrategy::EveryNHeaders { count } => {
                self.headers_since_sync.fetch_add(1, Ordering::SeqCst) + 1 >= count
            }
        };
        if due {
            store.file().sync()?;
            self.headers_since_sync.store(0, Ordering::SeqCst);
        }
        Ok(bid)
    }

    pub(super) fn sync_active(&self) -> Result<()> {
        let store = Arc::clone(self.state.read().generation.active());
        store.file().sync()?;
        self.headers_since_sync.store(0, Ordering::SeqCst);
        Ok(())
    }

    // =========================================================================
    // Rollback
    // =========================================================================

    /// Roll the live handle back to `target`.
    ///
    /// Restores the newest restorable header with `seqnum <= target`,
    /// keeps the WAL entries up to `target`, discards every newer one and
    /// resets the sequence counter to `target`. Views opened before the
    /// rollback become invalid.
    ///
    /// When garbage collection already dropped a version between the
    /// restored header and `target`, the state of the restored header is
    /// used as is.
    pub fn rollback(&self, target: SeqNum) -> Result<Revision> {
        let _guard = self.write_lock.lock();

        let (store, chosen) = {
            let mut state = self.state.write();
            if let Some(txn) = state.active_txn {
                return Err(CinderError::InvalidArgument(format!(
                    "cannot roll back while {} is active",
                    txn
                )));
            }
            if state.generation.is_compacting() {
                return Err(CinderError::InvalidArgument(
                    "cannot roll back during compaction".to_string(),
                ));
            }
            if target > state.seqnum {
                return Err(CinderError::InvalidArgument(format!(
                    "rollback target {} is beyond current seq {}",
                    target, state.seqnum
                )));
            }

            let chosen = state
                .headers
                .iter()
                .rev()
                .find(|h| h.seqnum <= target && state.is_restorable(h))
                .copied()
                .ok_or_else(|| {
                    CinderError::CorruptHeader(format!(
                        "no restorable header at or below seq {}",
                        target
                    ))
                })?;
            state.rollback_hold = Some(chosen.seqnum);
            (Arc::clone(state.generation.active()), chosen)
        };

        // Readers and writers keep going while the header is written
        let plan = match self.prepare_rollback(&store, chosen, target) {
            Ok(plan) => plan,
            Err(e) => {
                self.state.write().rollback_hold = None;
                return Err(e);
            }
        };

        let mut state = self.state.write();
        state.rollback_hold = None;
        let discarded = state.wal.discard_after(plan.kept);
        state.wal.mark_dirty_after(plan.header.index_seq);
        state.root = plan.root;
        state.seqnum = target;
        state.ndocs = plan.header.ndocs;
        state.datasize = plan.header.datasize;
        state.epoch += 1;
        state.install_header(plan.bid, &plan.header);
        state.wal_barrier = plan.bid;
        let horizon = self.gc_horizon(&state);
        state.wal.gc(horizon);

        tracing::info!(
            target_seq = target,
            restored_revision = plan.restored_revision,
            kept = plan.kept,
            discarded,
            revision = plan.header.revision,
            "rolled back"
        );
        Ok(plan.header.revision)
    }

    /// Load the restored root and append the rollback header.
    /// Caller holds `write_lock` and has set `rollback_hold`.
    fn prepare_rollback(&self, store: &Store, chosen: HeaderRef, target: SeqNum) -> Result<RollbackPlan> {
        let restored = Header::read_from(store.file(), chosen.bid)?;
        let root = store.index().root_at(&restored)?;

        let (kept, header) = {
            let state = self.state.read();
            let kept = if target == restored.seqnum || state.wal.pruned_seq() <= restored.seqnum {
                target
            } else {
                tracing::warn!(
                    target_seq = target,
                    restored_seqnum = restored.seqnum,
                    pruned_seq = state.wal.pruned_seq(),
                    "WAL no longer holds every version up to the target"
                );
                restored.seqnum
            };
            let (ndocs, datasize) = state.counts_at(&restored, &root, kept);
            let header = Header {
                version: HEADER_VERSION,
                revision: state.revision + 1,
                seqnum: target,
                index_seq: restored.index_seq,
                key_root: restored.key_root,
                seq_root: restored.seq_root,
                ndocs,
                datasize,
                prev_header: state.last_header,
                last_wal_flush_header: state.last_wal_flush_header,
            };
            (kept, header)
        };
        let bid = self.append_header(store, &header)?;

        Ok(RollbackPlan {
            restored_revision: restored.revision,
            root,
            header,
            bid,
            kept,
        })
    }
}

/// A rollback whose header is on disk, ready to publish
struct RollbackPlan {
    restored_revision: Revision,
    root: IndexRoot,
    header: Header,
    bid: BlockId,
    /// WAL entries above this seq are discarded
    kept: SeqNum,
}
