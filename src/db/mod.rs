//! Database Module
//!
//! The handle that coordinates the WAL, the active generation, headers,
//! transactions, snapshots and compaction.
//!
//! ## Responsibilities
//! - Absorb writes into the WAL and assign sequence numbers
//! - Resolve reads WAL-first, then against the index root
//! - Flush the WAL into the index and commit headers
//! - Recover from the newest valid header on open

mod compaction;
mod flush;
mod open;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

pub use compaction::{CompactionHandle, CompactionState, CompactionStatus};
pub(crate) use compaction::Mirror;

use crate::config::Config;
use crate::error::{CinderError, Result};
use crate::iter::{Entry, IterOptions, MergeIterator};
use crate::snapshot::{PinRegistry, ReadView, Snapshot};
use crate::storage::{Header, HeaderRef, IndexRoot, Store, HEADER_VERSION};
use crate::txn::Transaction;
use crate::types::{BlockId, DocLocation, Isolation, Revision, SeqNum, TxnId, UNCOMMITTED_SEQ};
use crate::wal::{EntryId, GcHorizon, Wal, WalEntry, WalOp};

/// How `commit` treats the WAL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Write a header; WAL entries stay in memory unless
    /// `wal_flush_before_commit` is set
    Normal,

    /// Merge the WAL into the index before writing the header
    FlushWal,
}

/// Point-in-time statistics of a database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbInfo {
    pub name: String,
    pub revision: Revision,
    pub seqnum: SeqNum,
    pub ndocs: u64,
    pub datasize: u64,
    pub wal_entries: usize,
    pub wal_dirty: usize,
    pub generation: u64,
    pub file_size: u64,
    pub last_header: Option<BlockId>,
    pub last_wal_flush_header: Option<BlockId>,
    pub compacting: bool,
}

/// A retained header as listed by [`Database::headers`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderInfo {
    pub bid: BlockId,
    pub revision: Revision,
    pub seqnum: SeqNum,
    pub index_seq: SeqNum,
    /// Usable as a snapshot or rollback target
    pub restorable: bool,
}

// =============================================================================
// Generation Descriptor
// =============================================================================

/// Which stores are authoritative
pub(crate) enum Generation {
    /// Normal operation: one store
    Primary(Arc<Store>),

    /// Compaction in progress: `old` stays authoritative, `new` is being built
    Compacting {
        old: Arc<Store>,
        new: Arc<Store>,
        mirror: Mirror,
    },
}

impl Generation {
    /// Store that receives writes and serves reads
    pub fn active(&self) -> &Arc<Store> {
        match self {
            Generation::Primary(store) => store,
            Generation::Compacting { old, .. } => old,
        }
    }

    pub fn is_compacting(&self) -> bool {
        matches!(self, Generation::Compacting { .. })
    }

    /// Store holding `generation`, if it is still attached
    pub fn find(&self, generation: u64) -> Option<Arc<Store>> {
        match self {
            Generation::Primary(store) if store.generation() == generation => Some(Arc::clone(store)),
            Generation::Compacting { old, new, .. } => [old, new]
                .into_iter()
                .find(|s| s.generation() == generation)
                .cloned(),
            _ => None,
        }
    }
}

// =============================================================================
// Mutable State
// =============================================================================

/// State shared by every reader and writer of one handle
pub(crate) struct State {
    pub wal: Wal,
    pub generation: Generation,
    /// Index root of the active generation
    pub root: IndexRoot,
    /// Last assigned committed sequence number
    pub seqnum: SeqNum,
    /// Revision of the last written header
    pub revision: Revision,
    pub last_header: Option<BlockId>,
    pub last_wal_flush_header: Option<BlockId>,
    pub ndocs: u64,
    pub datasize: u64,
    pub active_txn: Option<TxnId>,
    /// Bumped by rollback; views from an older epoch are stale
    pub epoch: u64,
    /// Headers retained in the active generation, oldest first
    pub headers: Vec<HeaderRef>,
    /// Headers before this block lost their WAL backing
    pub wal_barrier: BlockId,
    /// Most headers kept in `headers`
    pub header_limit: usize,
    /// Restored seqnum of a rollback that is writing its header. While set,
    /// `begin` is refused and GC keeps every version above it.
    pub rollback_hold: Option<SeqNum>,
}

/// Latest live version of a key
struct LiveVersion {
    loc: Option<DocLocation>,
    size: u64,
}

impl State {
    /// Newest committed version of `key` visible to the live handle
    fn live_lookup(&self, key: &[u8]) -> Option<LiveVersion> {
        let index_seq = self.root.index_seq();
        match self
            .wal
            .lookup(key, |e| e.is_committed() && e.seq > index_seq)
        {
            Some(entry) => Some(LiveVersion {
                loc: entry.location(),
                size: entry.size(),
            }),
            None => self.root.lookup(key).map(|v| LiveVersion {
                loc: Some(v.loc),
                size: v.size,
            }),
        }
    }

    /// Update document count and data size for a write about to commit
    fn account(&mut self, key: &[u8], op: WalOp) {
        let previous = self
            .live_lookup(key)
            .filter(|v| v.loc.is_some())
            .map(|v| v.size);
        if let Some(size) = previous {
            self.ndocs = self.ndocs.saturating_sub(1);
            self.datasize = self.datasize.saturating_sub(size);
        }
        if let WalOp::Put { size, .. } = op {
            self.ndocs += 1;
            self.datasize += size;
        }
    }

    /// Header describing the current state
    fn next_header(&self) -> Header {
        Header {
            version: HEADER_VERSION,
            revision: self.revision + 1,
            seqnum: self.seqnum,
            index_seq: self.root.index_seq(),
            key_root: self.root.key_root(),
            seq_root: self.root.seq_root(),
            ndocs: self.ndocs,
            datasize: self.datasize,
            prev_header: self.last_header,
            last_wal_flush_header: self.last_wal_flush_header,
        }
    }

    fn install_header(&mut self, bid: BlockId, header: &Header) {
        self.revision = header.revision;
        self.last_header = Some(bid);
        self.headers.push(HeaderRef::new(bid, header));
        self.trim_headers();
    }

    /// Forget the oldest headers beyond `header_limit`
    fn trim_headers(&mut self) {
        let excess = self.headers.len().saturating_sub(self.header_limit);
        if excess > 0 {
            self.headers.drain(..excess);
        }
    }

    fn is_restorable(&self, header: &HeaderRef) -> bool {
        header.index_seq == header.seqnum || header.bid >= self.wal_barrier
    }

    /// Document count and data size at `up_to`, carried forward from the
    /// counts of `restored` over the WAL versions committed after it
    fn counts_at(&self, restored: &Header, root: &IndexRoot, up_to: SeqNum) -> (u64, u64) {
        let mut newest: BTreeMap<&[u8], &WalEntry> = BTreeMap::new();
        for entry in self.wal.committed_between(restored.seqnum, up_to) {
            newest.insert(entry.key.as_slice(), entry);
        }

        let (mut ndocs, mut datasize) = (restored.ndocs, restored.datasize);
        for (key, entry) in newest {
            let previous = match self.wal.lookup(key, |e| {
                e.is_committed() && e.seq > restored.index_seq && e.seq <= restored.seqnum
            }) {
                Some(e) => e.location().map(|_| e.size()),
                None => root.lookup(key).map(|v| v.size),
            };
            if let Some(size) = previous {
                ndocs = ndocs.saturating_sub(1);
                datasize = datasize.saturating_sub(size);
            }
            if entry.location().is_some() {
                ndocs += 1;
                datasize += entry.size();
            }
        }
        (ndocs, datasize)
    }

    /// Oldest sequence number a WAL-backed header still needs reproduced
    fn rollback_floor(&self) -> Option<SeqNum> {
        self.headers
            .iter()
            .rev()
            .take_while(|h| h.bid >= self.wal_barrier)
            .filter(|h| h.index_seq != h.seqnum)
            .map(|h| h.seqnum)
            .min()
    }
}

// =============================================================================
// Database
// =============================================================================

/// An embedded key-value database handle
///
/// ## Concurrency Model
///
/// - **Readers** take the state lock shared for the duration of one lookup
///   or one iterator step; document bodies are read outside the lock.
/// - **Writers** take the state lock exclusively only for the WAL insert.
/// - **Flush, header commit, rollback and cutover** are serialized by
///   `write_lock`. Lock order: `write_lock`, then `state`, then pins.
pub struct Database {
    config: Config,

    /// Serializes flush, header commit, rollback and compaction cutover
    write_lock: Mutex<()>,

    state: RwLock<State>,

    pins: Arc<PinRegistry>,

    next_txn_id: AtomicU64,

    /// Next generation number handed to compaction
    next_generation: AtomicU64,

    headers_since_sync: AtomicUsize,
}

impl Database {
    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data directory
    pub fn open_path(path: &Path) -> Result<Self> {
        let config = Config::builder().data_dir(path).build();
        Self::open(config)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Put a key-value pair, returning its sequence number
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<SeqNum> {
        self.write(key, Some(value))
    }

    /// Delete a key, returning the tombstone's sequence number
    pub fn delete(&self, key: &[u8]) -> Result<SeqNum> {
        self.write(key, None)
    }

    fn write(&self, key: &[u8], value: Option<&[u8]>) -> Result<SeqNum> {
        self.check_key(key)?;

        let (seq, dirty) = loop {
            let store = Arc::clone(self.state.read().generation.active());
            let op = match value {
                Some(body) => WalOp::Put {
                    loc: store.docs().append(key, body)?,
                    size: body.len() as u64,
                },
                None => WalOp::Delete,
            };

            let mut state = self.state.write();
            // A cutover between append and insert moved the active store
            if state.generation.active().generation() != store.generation() {
                continue;
            }
            let seq = state.seqnum + 1;
            state.account(key, op);
            if let Generation::Compacting { old, new, mirror } = &mut state.generation {
                mirror.forward(old, new, key, seq, op, value);
            }
            state.wal.put(key.to_vec(), seq, op, None);
            state.seqnum = seq;

            let horizon = self.gc_horizon(&state);
            state.wal.gc_key(key, horizon);
            break (seq, state.wal.dirty_count());
        };

        if dirty >= self.config.wal_threshold {
            self.auto_flush()?;
        }
        Ok(seq)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get the live value of `key`
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let (store, loc) = {
            let state = self.state.read();
            let loc = state.live_lookup(key).and_then(|v| v.loc);
            (Arc::clone(state.generation.active()), loc)
        };
        match loc {
            Some(loc) => Ok(Some(self.read_body(&store, loc)?)),
            None => Ok(None),
        }
    }

    /// True when `key` has a live value
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        let state = self.state.read();
        Ok(state.live_lookup(key).map_or(false, |v| v.loc.is_some()))
    }

    /// The live document carrying sequence number `seq`
    ///
    /// Returns `KeyNotFound` if that version was overwritten, deleted or
    /// never existed.
    pub fn get_by_seq(&self, seq: SeqNum) -> Result<Entry> {
        if seq == UNCOMMITTED_SEQ {
            return Err(CinderError::KeyNotFound);
        }
        let options = IterOptions::sequences()
            .start_seq(seq, true)
            .end_seq(seq, true);
        let mut iter = self.iter(options)?;
        iter.next_entry()?.ok_or(CinderError::KeyNotFound)
    }

    /// Iterate the live database; the iterator pins the state it starts at
    pub fn iter(&self, options: IterOptions) -> Result<MergeIterator<'_>> {
        MergeIterator::new(self, self.pinned_view(), options)
    }

    // =========================================================================
    // Transactions & Snapshots
    // =========================================================================

    /// Begin a transaction; at most one may be active per handle
    pub fn begin(&self, isolation: Isolation) -> Result<Transaction<'_>> {
        let mut state = self.state.write();
        if let Some(active) = state.active_txn {
            return Err(CinderError::InvalidArgument(format!(
                "{} is still active on this handle",
                active
            )));
        }
        if state.rollback_hold.is_some() {
            return Err(CinderError::InvalidArgument(
                "a rollback is in progress".to_string(),
            ));
        }
        let id = TxnId(self.next_txn_id.fetch_add(1, Ordering::SeqCst));
        state.active_txn = Some(id);

        let view = match isolation {
            Isolation::RepeatableRead => Some(self.view_locked(&state).with_txn(id)),
            Isolation::ReadCommitted => None,
        };
        tracing::debug!(txn = %id, ?isolation, seqnum = state.seqnum, "transaction started");
        Ok(Transaction::new(
            self,
            id,
            isolation,
            state.last_header,
            Arc::clone(state.generation.active()),
            view,
        ))
    }

    /// Open a read-only snapshot of the current state, or of a retained
    /// header revision
    pub fn open_snapshot(&self, revision: Option<Revision>) -> Result<Snapshot<'_>> {
        let view = match revision {
            None => self.pinned_view(),
            Some(revision) => self.historical_view(revision)?,
        };
        Ok(Snapshot::new(self, view))
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn info(&self) -> DbInfo {
        let state = self.state.read();
        let store = state.generation.active();
        DbInfo {
            name: self.config.name.clone(),
            revision: state.revision,
            seqnum: state.seqnum,
            ndocs: state.ndocs,
            datasize: state.datasize,
            wal_entries: state.wal.len(),
            wal_dirty: state.wal.dirty_count(),
            generation: store.generation(),
            file_size: store.file().size(),
            last_header: state.last_header,
            last_wal_flush_header: state.last_wal_flush_header,
            compacting: state.generation.is_compacting(),
        }
    }

    /// Headers retained in the active generation, oldest first
    pub fn headers(&self) -> Vec<HeaderInfo> {
        let state = self.state.read();
        state
            .headers
            .iter()
            .map(|h| HeaderInfo {
                bid: h.bid,
                revision: h.revision,
                seqnum: h.seqnum,
                index_seq: h.index_seq,
                restorable: state.is_restorable(h),
            })
            .collect()
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Close the database gracefully
    ///
    /// Flushes the WAL, writes a final header and syncs
    pub fn close(self) -> Result<()> {
        self.commit(CommitMode::FlushWal)?;
        self.sync_active()?;
        tracing::info!(name = %self.config.name, "database closed");
        Ok(())
    }

    // =========================================================================
    // Crate-internal Helpers
    // =========================================================================

    pub(crate) fn state(&self) -> RwLockReadGuard<'_, State> {
        self.state.read()
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(CinderError::InvalidArgument("empty key".to_string()));
        }
        if key.len() > self.config.max_key_len {
            return Err(CinderError::InvalidArgument(format!(
                "key of {} bytes exceeds limit of {}",
                key.len(),
                self.config.max_key_len
            )));
        }
        Ok(())
    }

    /// A pinned view of the live state
    pub(crate) fn pinned_view(&self) -> ReadView {
        let state = self.state.read();
        self.view_locked(&state)
    }

    fn view_locked(&self, state: &State) -> ReadView {
        let pin = self.pins.pin(state.root.index_seq(), state.seqnum);
        ReadView::new(
            Arc::clone(state.generation.active()),
            state.root.clone(),
            state.seqnum,
            state.revision,
            state.epoch,
            Some(pin),
        )
    }

    fn historical_view(&self, revision: Revision) -> Result<ReadView> {
        let (store, href, epoch, pin) = {
            let state = self.state.read();
            let href = state
                .headers
                .iter()
                .find(|h| h.revision == revision)
                .copied()
                .ok_or_else(|| {
                    CinderError::InvalidSnapshot(format!("revision {} is not retained", revision))
                })?;
            if !state.is_restorable(&href) {
                return Err(CinderError::InvalidSnapshot(format!(
                    "revision {} can no longer be reconstructed",
                    revision
                )));
            }
            // Pinned under the lock so GC keeps the WAL tail it needs
            let pin = self.pins.pin(href.index_seq, href.seqnum);
            (Arc::clone(state.generation.active()), href, state.epoch, pin)
        };

        let header = Header::read_from(store.file(), href.bid)
            .map_err(|e| CinderError::InvalidSnapshot(e.to_string()))?;
        let root = store.index().root_at(&header)?;
        Ok(ReadView::new(
            store,
            root,
            header.seqnum,
            header.revision,
            epoch,
            Some(pin),
        ))
    }

    /// Point lookup through a view
    pub(crate) fn view_get(&self, view: &ReadView, key: &[u8]) -> Result<Option<Bytes>> {
        let loc = {
            let state = self.state.read();
            view.check_epoch(state.epoch)?;
            match state.wal.lookup(key, |e| view.visible(e)) {
                Some(entry) => entry.location(),
                None => view.root.lookup(key).map(|v| v.loc),
            }
        };
        match loc {
            Some(loc) => Ok(Some(self.read_body(&view.store, loc)?)),
            None => Ok(None),
        }
    }

    /// Read a body, falling back to other attached generations
    pub(crate) fn read_body(&self, store: &Arc<Store>, loc: DocLocation) -> Result<Bytes> {
        if loc.generation == store.generation() {
            return Ok(store.docs().read(loc)?.body);
        }
        let other = self.state.read().generation.find(loc.generation);
        match other {
            Some(other) => Ok(other.docs().read(loc)?.body),
            None => Err(CinderError::Storage(format!(
                "generation {} is no longer attached",
                loc.generation
            ))),
        }
    }

    /// Oldest state any reader or rollback target may still need
    pub(crate) fn gc_horizon(&self, state: &State) -> GcHorizon {
        let mut horizon = GcHorizon {
            index_seq: state.root.index_seq(),
            max_seq: state.seqnum,
        };
        if let Some(floor) = state.rollback_floor() {
            horizon.max_seq = horizon.max_seq.min(floor);
        }
        if let Some(hold) = state.rollback_hold {
            horizon.index_seq = horizon.index_seq.min(hold);
            horizon.max_seq = horizon.max_seq.min(hold);
        }
        self.pins.clamp(horizon)
    }

    // =========================================================================
    // Transaction Support
    // =========================================================================

    /// Insert an uncommitted write for `txn`
    pub(crate) fn txn_write(&self, txn: TxnId, key: &[u8], value: Option<&[u8]>) -> Result<EntryId> {
        self.check_key(key)?;
        loop {
            let store = Arc::clone(self.state.read().generation.active());
            let op = match value {
                Some(body) => WalOp::Put {
                    loc: store.docs().append(key, body)?,
                    size: body.len() as u64,
                },
                None => WalOp::Delete,
            };

            let mut state = self.state.write();
            if state.generation.active().generation() != store.generation() {
                continue;
            }
            if state.active_txn != Some(txn) {
                return Err(CinderError::TransactionAlreadyClosed);
            }
            return Ok(state.wal.put(key.to_vec(), UNCOMMITTED_SEQ, op, Some(txn)));
        }
    }

    /// Make `dirty` globally visible and write a header.
    ///
    /// With `snapshot_seq` set (repeatable read), fails with `Conflict` if
    /// any written key was committed by someone else after that seq.
    pub(crate) fn txn_commit(
        &self,
        txn: TxnId,
        dirty: &[EntryId],
        snapshot_seq: Option<SeqNum>,
    ) -> Result<Revision> {
        let _guard = self.write_lock.lock();
        {
            let mut state = self.state.write();
            if state.active_txn != Some(txn) {
                return Err(CinderError::TransactionAlreadyClosed);
            }

            if let Some(snapshot_seq) = snapshot_seq {
                for id in dirty {
                    let key = match state.wal.entry(*id) {
                        Some(entry) => &entry.key,
                        None => continue,
                    };
                    let latest = state
                        .wal
                        .get(key)
                        .map(|e| e.seq)
                        .or_else(|| state.root.lookup(key).map(|v| v.seq));
                    if let Some(committed_seq) = latest.filter(|seq| *seq > snapshot_seq) {
                        return Err(CinderError::Conflict {
                            key: key.clone(),
                            committed_seq,
                            snapshot_seq,
                        });
                    }
                }
            }

            let mut keys = Vec::with_capacity(dirty.len());
            for id in dirty {
                let (key, op) = match state.wal.entry(*id) {
                    Some(entry) => (entry.key.clone(), entry.op),
                    None => continue,
                };
                let seq = state.seqnum + 1;
                state.account(&key, op);
                if let Generation::Compacting { old, new, mirror } = &mut state.generation {
                    mirror.forward(old, new, &key, seq, op, None);
                }
                state.wal.commit(*id, seq);
                state.seqnum = seq;
                keys.push(key);
            }
            state.active_txn = None;

            let horizon = self.gc_horizon(&state);
            for key in &keys {
                state.wal.gc_key(key, horizon);
            }
            tracing::debug!(txn = %txn, writes = keys.len(), seqnum = state.seqnum, "transaction committed");
        }
        self.commit_locked(CommitMode::Normal)
    }

    /// Drop every uncommitted write of `txn`
    pub(crate) fn txn_abort(&self, txn: TxnId, dirty: &[EntryId]) {
        let mut state = self.state.write();
        for id in dirty {
            if state.wal.entry(*id).map_or(false, |e| e.owner == Some(txn)) {
                state.wal.remove(*id);
            }
        }
        if state.active_txn == Some(txn) {
            state.active_txn = None;
        }
        tracing::debug!(txn = %txn, discarded = dirty.len(), "transaction aborted");
    }

    /// View of the live state including `txn`'s own writes (read committed)
    pub(crate) fn txn_live_view(&self, txn: TxnId) -> ReadView {
        self.pinned_view().with_txn(txn)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Database")
            .field("name", &self.config.name)
            .field("revision", &state.revision)
            .field("seqnum", &state.seqnum)
            .field("generation", &state.generation.active().generation())
            .finish()
    }
}
