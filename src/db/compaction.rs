//! Online compaction
//!
//! Rewrites the live dataset into a fresh generation while the handle
//! keeps serving reads and writes, then cuts over atomically.
//!
//! ## Protocol
//! 1. Install `Compacting { old, new }` and pin a view at seq S0.
//! 2. Copy every live document of the pinned view into `new`, in key
//!    order, raising a high-water mark as keys are copied.
//! 3. Every write committed after S0 is forwarded to the copier over a
//!    channel. Keys below the mark are mirrored (body appended to `new`
//!    right away); the others are captured with their old location and
//!    copied during replay.
//! 4. Replay forwarded writes, newest sequence number per key wins.
//! 5. Cutover under `write_lock`: drain the channel, move bodies of
//!    uncommitted transaction writes and write the first header of `new`,
//!    all without the state lock. The state lock is taken only to check
//!    that no transaction write raced the copy (otherwise retry), relink
//!    writes committed after the header to their mirrored bodies and swap.
//!    `old` is deleted once its last reader lets go.
//!
//! Any failure before the swap restores `old` and discards `new`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use super::{Database, Generation, State};
use crate::error::{CinderError, Result};
use crate::iter::{IterOptions, MergeIterator};
use crate::snapshot::ReadView;
use crate::storage::{BatchOp, Header, HeaderRef, IndexRoot, Store, HEADER_VERSION};
use crate::types::{DocLocation, SeqNum};
use crate::wal::{EntryId, WalOp};

/// Keys copied between high-water mark updates
const HIGH_WATER_STRIDE: u64 = 256;

/// Replay rounds attempted before cutover
const MAX_REPLAY_ROUNDS: usize = 8;

/// Cutover attempts before racing transaction writes are copied under the
/// state lock
const MAX_CUTOVER_ROUNDS: usize = 4;

/// Lifecycle of one compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionState {
    Idle,
    Running,
    Committed,
    Aborted,
}

/// Progress snapshot of a compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStatus {
    pub state: CompactionState,
    /// Documents copied by the initial pass
    pub copied: u64,
    /// Live documents when the compaction started
    pub total: u64,
}

#[derive(Debug)]
struct Progress {
    state: Mutex<CompactionState>,
    copied: AtomicU64,
    total: AtomicU64,
    abort: AtomicBool,
}

impl Progress {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CompactionState::Idle),
            copied: AtomicU64::new(0),
            total: AtomicU64::new(0),
            abort: AtomicBool::new(false),
        })
    }

    fn set(&self, state: CompactionState) {
        *self.state.lock() = state;
    }

    fn status(&self) -> CompactionStatus {
        CompactionStatus {
            state: *self.state.lock(),
            copied: self.copied.load(Ordering::SeqCst),
            total: self.total.load(Ordering::SeqCst),
        }
    }

    fn check_abort(&self) -> Result<()> {
        if self.abort.load(Ordering::SeqCst) {
            return Err(CinderError::CompactionAborted("aborted by request".to_string()));
        }
        Ok(())
    }
}

/// Controls a compaction running on a background thread
pub struct CompactionHandle {
    progress: Arc<Progress>,
    thread: Option<JoinHandle<Result<CompactionStatus>>>,
}

impl CompactionHandle {
    pub fn progress(&self) -> CompactionStatus {
        self.progress.status()
    }

    /// Request an abort; takes effect before cutover only
    pub fn abort(&self) {
        self.progress.abort.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Block until the compaction commits or aborts
    pub fn wait(mut self) -> Result<CompactionStatus> {
        match self.thread.take() {
            Some(thread) => thread.join().unwrap_or_else(|_| {
                Err(CinderError::CompactionAborted(
                    "compaction thread panicked".to_string(),
                ))
            }),
            None => Ok(self.progress.status()),
        }
    }
}

// =============================================================================
// Write Forwarding
// =============================================================================

/// A committed write forwarded to the copier
#[derive(Debug, Clone)]
pub(crate) struct MirrorOp {
    key: Vec<u8>,
    seq: SeqNum,
    kind: MirrorKind,
}

#[derive(Debug, Clone, Copy)]
enum MirrorKind {
    /// Body lives at `loc`, in either generation
    Put { loc: DocLocation, size: u64 },
    Remove,
}

/// Writer side of the forwarding channel
pub(crate) struct Mirror {
    tx: Sender<MirrorOp>,
    /// Every key strictly below the mark has been copied
    high_water: Option<Vec<u8>>,
    /// The initial copy is done; every write is mirrored
    complete: bool,
    /// Set when forwarding failed; the compaction aborts at cutover
    broken: Option<String>,
}

impl Mirror {
    fn new(tx: Sender<MirrorOp>) -> Self {
        Self {
            tx,
            high_water: None,
            complete: false,
            broken: None,
        }
    }

    fn covers(&self, key: &[u8]) -> bool {
        self.complete || self.high_water.as_deref().map_or(false, |mark| key < mark)
    }

    /// Forward a write committed at `seq`. Never fails the write itself.
    pub(crate) fn forward(
        &mut self,
        old: &Store,
        new: &Store,
        key: &[u8],
        seq: SeqNum,
        op: WalOp,
        body: Option<&[u8]>,
    ) {
        if self.broken.is_some() {
            return;
        }
        let kind = match op {
            WalOp::Delete => MirrorKind::Remove,
            WalOp::Put { loc, size } if self.covers(key) => {
                let copied = match body {
                    Some(body) => new.docs().append(key, body),
                    None => old
                        .docs()
                        .read(loc)
                        .and_then(|doc| new.docs().append(key, &doc.body)),
                };
                match copied {
                    Ok(loc) => MirrorKind::Put { loc, size },
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to mirror write into new generation");
                        self.broken = Some(e.to_string());
                        return;
                    }
                }
            }
            WalOp::Put { loc, size } => MirrorKind::Put { loc, size },
        };
        let op = MirrorOp {
            key: key.to_vec(),
            seq,
            kind,
        };
        if self.tx.send(op).is_err() {
            self.broken = Some("copier stopped receiving".to_string());
        }
    }
}

/// Everything the copier owns for one compaction
struct Job {
    old: Arc<Store>,
    new: Arc<Store>,
    view: ReadView,
    rx: Receiver<MirrorOp>,
}

// =============================================================================
// Coordinator
// =============================================================================

impl Database {
    /// Compact on the calling thread
    pub fn compact(&self) -> Result<CompactionStatus> {
        let progress = Progress::new();
        let job = self.begin_compaction(&progress)?;
        self.run_compaction(job, &progress)
    }

    /// Compact on a background thread
    pub fn start_compaction(self: &Arc<Self>) -> Result<CompactionHandle> {
        let progress = Progress::new();
        let job = self.begin_compaction(&progress)?;
        let new = Arc::clone(&job.new);

        let db = Arc::clone(self);
        let worker_progress = Arc::clone(&progress);
        let spawned = thread::Builder::new()
            .name("cinderkv-compactor".to_string())
            .spawn(move || db.run_compaction(job, &worker_progress));

        match spawned {
            Ok(thread) => Ok(CompactionHandle {
                progress,
                thread: Some(thread),
            }),
            Err(e) => {
                self.restore_primary();
                new.retire();
                progress.set(CompactionState::Aborted);
                Err(CinderError::CompactionAborted(format!(
                    "failed to spawn compactor: {}",
                    e
                )))
            }
        }
    }

    /// Install the compacting generation and pin the copy source
    fn begin_compaction(&self, progress: &Progress) -> Result<Job> {
        let _guard = self.write_lock.lock();
        let mut state = self.state.write();
        if state.generation.is_compacting() {
            return Err(CinderError::InvalidArgument(
                "a compaction is already running".to_string(),
            ));
        }

        let old = Arc::clone(state.generation.active());
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let new = Store::create(&self.config, generation)?;
        let (tx, rx) = channel::unbounded();
        let view = self.view_locked(&state);

        progress.total.store(state.ndocs, Ordering::SeqCst);
        progress.set(CompactionState::Running);
        state.generation = Generation::Compacting {
            old: Arc::clone(&old),
            new: Arc::clone(&new),
            mirror: Mirror::new(tx),
        };

        tracing::info!(
            from = old.generation(),
            to = generation,
            seqnum = state.seqnum,
            ndocs = state.ndocs,
            "compaction started"
        );
        Ok(Job { old, new, view, rx })
    }

    fn run_compaction(&self, job: Job, progress: &Progress) -> Result<CompactionStatus> {
        match self.copy_and_cutover(&job, progress) {
            Ok(()) => {
                progress.set(CompactionState::Committed);
                Ok(progress.status())
            }
            Err(e) => {
                self.restore_primary();
                job.new.retire();
                progress.set(CompactionState::Aborted);
                tracing::warn!(generation = job.new.generation(), error = %e, "compaction aborted");
                Err(match e {
                    CinderError::CompactionAborted(_) => e,
                    other => CinderError::CompactionAborted(other.to_string()),
                })
            }
        }
    }

    /// Make the old generation the only one again
    fn restore_primary(&self) {
        let mut state = self.state.write();
        let old = match &state.generation {
            Generation::Compacting { old, .. } => Arc::clone(old),
            Generation::Primary(_) => return,
        };
        state.generation = Generation::Primary(old);
    }

    fn copy_and_cutover(&self, job: &Job, progress: &Progress) -> Result<()> {
        // Initial copy of the pinned view
        let mut ops = Vec::new();
        let mut iter = MergeIterator::new(self, job.view.clone(), IterOptions::keys())?;
        while let Some(entry) = iter.next_entry()? {
            progress.check_abort()?;
            let body = entry.value.unwrap_or_default();
            let loc = job.new.docs().append(&entry.key, &body)?;
            let copied = progress.copied.fetch_add(1, Ordering::SeqCst) + 1;
            if copied % HIGH_WATER_STRIDE == 0 {
                self.raise_high_water(job, Some(entry.key.clone()));
            }
            ops.push(BatchOp::Put {
                key: entry.key,
                seq: entry.seq,
                loc,
                size: body.len() as u64,
            });
        }
        iter.close();
        self.raise_high_water(job, None);

        let mut root = job
            .new
            .index()
            .insert_batch(&IndexRoot::default(), ops, job.view.max_seq)?;

        // Catch up on writes forwarded during the copy
        for _ in 0..MAX_REPLAY_ROUNDS {
            progress.check_abort()?;
            let forwarded: Vec<MirrorOp> = job.rx.try_iter().collect();
            if forwarded.is_empty() {
                break;
            }
            root = self.replay(job, root, forwarded, None)?;
        }

        // Cutover: header writers are excluded, readers and writers are not
        let _guard = self.write_lock.lock();
        let mut rehomed: HashMap<EntryId, (DocLocation, DocLocation)> = HashMap::new();
        let mut round = 0;
        loop {
            round += 1;
            progress.check_abort()?;
            let (seqnum, revision, pending) = {
                let state = self.state.read();
                Self::check_mirror(&state)?;
                (state.seqnum, state.revision, Self::pending_bodies(&state, job))
            };
            // Every write up to `seqnum` is already in the channel
            let forwarded: Vec<MirrorOp> = job.rx.try_iter().collect();
            let up_to = forwarded.iter().map(|op| op.seq).fold(seqnum, SeqNum::max);
            root = self.replay(job, root, forwarded, Some(up_to))?;

            // Bodies of uncommitted writes must survive the old generation
            for (id, key, loc) in pending {
                if !is_rehomed(&rehomed, id, loc) {
                    let doc = job.old.docs().read(loc)?;
                    rehomed.insert(id, (loc, job.new.docs().append(&key, &doc.body)?));
                }
            }

            let header = Header {
                version: HEADER_VERSION,
                revision: revision + 1,
                seqnum: up_to,
                index_seq: up_to,
                key_root: root.key_root(),
                seq_root: root.seq_root(),
                ndocs: root.len() as u64,
                datasize: root.datasize(),
                prev_header: None,
                last_wal_flush_header: None,
            };
            let bid = header.write_to(job.new.file())?;
            job.new.file().sync()?;

            let mut state = self.state.write();
            Self::check_mirror(&state)?;
            let stale: Vec<(EntryId, Vec<u8>, DocLocation)> = Self::pending_bodies(&state, job)
                .into_iter()
                .filter(|(id, _, loc)| !is_rehomed(&rehomed, *id, *loc))
                .collect();
            if !stale.is_empty() && round < MAX_CUTOVER_ROUNDS {
                continue;
            }
            for (id, key, loc) in stale {
                let doc = job.old.docs().read(loc)?;
                rehomed.insert(id, (loc, job.new.docs().append(&key, &doc.body)?));
            }

            // Writes committed after `up_to` stay in the WAL, pointed at
            // their mirrored bodies
            let mut relinked = Vec::new();
            for op in job.rx.try_iter() {
                let (id, loc) = match (op.kind, state.wal.id_at(op.seq)) {
                    (MirrorKind::Put { loc, .. }, Some(id)) => (id, loc),
                    _ => continue,
                };
                let loc = if loc.generation == job.new.generation() {
                    loc
                } else {
                    let doc = job.old.docs().read(loc)?;
                    job.new.docs().append(&op.key, &doc.body)?
                };
                relinked.push((id, loc));
            }

            // Point of no return
            for (id, (from, to)) in rehomed {
                if state.wal.entry(id).and_then(|e| e.location()) == Some(from) {
                    state.wal.set_location(id, to);
                }
            }
            let late = relinked.len();
            for (id, loc) in relinked {
                state.wal.set_location(id, loc);
            }
            state.generation = Generation::Primary(Arc::clone(&job.new));
            state.root = root;
            state.wal.mark_flushed(up_to);
            state.revision = header.revision;
            state.last_header = Some(bid);
            state.last_wal_flush_header = Some(bid);
            state.headers = vec![HeaderRef::new(bid, &header)];
            state.wal_barrier = bid;
            let horizon = self.gc_horizon(&state);
            state.wal.gc(horizon);
            job.old.retire();

            tracing::info!(
                generation = job.new.generation(),
                revision = header.revision,
                ndocs = header.ndocs,
                rounds = round,
                late,
                file_size = job.new.file().size(),
                "compaction committed"
            );
            return Ok(());
        }
    }

    /// Fail if forwarding into the new generation broke
    fn check_mirror(state: &State) -> Result<()> {
        if let Generation::Compacting { mirror, .. } = &state.generation {
            if let Some(reason) = &mirror.broken {
                return Err(CinderError::CompactionAborted(reason.clone()));
            }
        }
        Ok(())
    }

    /// Uncommitted writes whose bodies still live outside the new generation
    fn pending_bodies(state: &State, job: &Job) -> Vec<(EntryId, Vec<u8>, DocLocation)> {
        state
            .wal
            .pending_ids()
            .into_iter()
            .filter_map(|id| {
                let entry = state.wal.entry(id)?;
                let loc = entry.location()?;
                (loc.generation != job.new.generation()).then(|| (id, entry.key.clone(), loc))
            })
            .collect()
    }

    fn raise_high_water(&self, job: &Job, key: Option<Vec<u8>>) {
        let mut state = self.state.write();
        if let Generation::Compacting { new, mirror, .. } = &mut state.generation {
            if new.generation() != job.new.generation() {
                return;
            }
            match key {
                Some(key) => mirror.high_water = Some(key),
                None => mirror.complete = true,
            }
        }
    }

    /// Apply forwarded writes on top of `base`, newest seq per key winning
    fn replay(
        &self,
        job: &Job,
        base: IndexRoot,
        forwarded: Vec<MirrorOp>,
        index_seq: Option<SeqNum>,
    ) -> Result<IndexRoot> {
        if forwarded.is_empty() && index_seq.map_or(true, |s| s == base.index_seq()) {
            return Ok(base);
        }

        let mut max_seq = base.index_seq();
        let mut latest: BTreeMap<Vec<u8>, MirrorOp> = BTreeMap::new();
        for op in forwarded {
            max_seq = max_seq.max(op.seq);
            match latest.get(&op.key) {
                Some(existing) if existing.seq > op.seq => {}
                _ => {
                    latest.insert(op.key.clone(), op);
                }
            }
        }

        let mut batch = Vec::with_capacity(latest.len());
        for (key, op) in latest {
            batch.push(match op.kind {
                MirrorKind::Remove => BatchOp::Remove { key },
                MirrorKind::Put { loc, size } => {
                    let loc = if loc.generation == job.new.generation() {
                        loc
                    } else {
                        let doc = job.old.docs().read(loc)?;
                        job.new.docs().append(&key, &doc.body)?
                    };
                    BatchOp::Put {
                        key,
                        seq: op.seq,
                        loc,
                        size,
                    }
                }
            });
        }

        let batch_len = batch.len();
        let root = job
            .new
            .index()
            .insert_batch(&base, batch, index_seq.unwrap_or(max_seq).max(max_seq))?;
        tracing::debug!(replayed = batch_len, index_seq = root.index_seq(), "replayed forwarded writes");
        Ok(root)
    }
}

/// True when `id` was copied from `loc` and has not moved since
fn is_rehomed(rehomed: &HashMap<EntryId, (DocLocation, DocLocation)>, id: EntryId, loc: DocLocation) -> bool {
    rehomed.get(&id).map_or(false, |(from, _)| *from == loc)
}
