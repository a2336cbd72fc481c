//! Snapshot Module
//!
//! Read views, the pins that keep them valid, and the public `Snapshot`.
//!
//! ## Pins
//! Every long-lived reader (snapshot, iterator, repeatable-read
//! transaction) registers the `(index_seq, max_seq)` pair it reads at.
//! WAL garbage collection never drops a version some pin may still
//! resolve to. Dropping the last clone of a view releases its pin.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::db::Database;
use crate::error::{CinderError, Result};
use crate::iter::{IterOptions, MergeIterator};
use crate::storage::{IndexRoot, Store};
use crate::types::{Revision, SeqNum, TxnId};
use crate::wal::{GcHorizon, WalEntry};

// =============================================================================
// Pin Registry
// =============================================================================

/// Registry of active read pins
#[derive(Debug, Default)]
pub struct PinRegistry {
    inner: Mutex<PinTable>,
}

#[derive(Debug, Default)]
struct PinTable {
    next_id: u64,
    pins: BTreeMap<u64, (SeqNum, SeqNum)>,
}

impl PinRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a reader at `(index_seq, max_seq)`
    pub fn pin(self: &Arc<Self>, index_seq: SeqNum, max_seq: SeqNum) -> PinGuard {
        let mut table = self.inner.lock();
        let id = table.next_id;
        table.next_id += 1;
        table.pins.insert(id, (index_seq, max_seq));
        PinGuard {
            id,
            registry: Arc::clone(self),
        }
    }

    /// Number of registered pins
    pub fn len(&self) -> usize {
        self.inner.lock().pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lower `horizon` to cover every registered pin
    pub fn clamp(&self, mut horizon: GcHorizon) -> GcHorizon {
        for (index_seq, max_seq) in self.inner.lock().pins.values() {
            horizon.index_seq = horizon.index_seq.min(*index_seq);
            horizon.max_seq = horizon.max_seq.min(*max_seq);
        }
        horizon
    }

    fn release(&self, id: u64) {
        self.inner.lock().pins.remove(&id);
    }
}

/// Keeps a pin registered until dropped
#[derive(Debug)]
pub struct PinGuard {
    id: u64,
    registry: Arc<PinRegistry>,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

// =============================================================================
// Read View
// =============================================================================

/// Everything a reader needs to resolve keys at one point in time
#[derive(Clone)]
pub(crate) struct ReadView {
    /// Generation the root belongs to
    pub store: Arc<Store>,
    pub root: IndexRoot,
    /// Highest committed sequence number visible
    pub max_seq: SeqNum,
    /// Transaction whose uncommitted writes are visible
    pub txn: Option<TxnId>,
    /// Rollback epoch the view was taken in
    pub epoch: u64,
    pub revision: Revision,
    _pin: Option<Arc<PinGuard>>,
}

impl ReadView {
    pub fn new(
        store: Arc<Store>,
        root: IndexRoot,
        max_seq: SeqNum,
        revision: Revision,
        epoch: u64,
        pin: Option<PinGuard>,
    ) -> Self {
        Self {
            store,
            root,
            max_seq,
            txn: None,
            epoch,
            revision,
            _pin: pin.map(Arc::new),
        }
    }

    pub fn with_txn(mut self, txn: TxnId) -> Self {
        self.txn = Some(txn);
        self
    }

    /// A version is visible if it is this reader's own write, or committed
    /// after the root and no later than the ceiling.
    pub fn visible(&self, entry: &WalEntry) -> bool {
        match entry.owner {
            Some(owner) => self.txn == Some(owner),
            None => entry.seq > self.root.index_seq() && entry.seq <= self.max_seq,
        }
    }

    pub fn check_epoch(&self, current: u64) -> Result<()> {
        if self.epoch != current {
            return Err(CinderError::InvalidSnapshot(format!(
                "view at seq {} was invalidated by a rollback",
                self.max_seq
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// A read-only, point-in-time view of a database
pub struct Snapshot<'db> {
    db: &'db Database,
    view: ReadView,
}

impl<'db> Snapshot<'db> {
    pub(crate) fn new(db: &'db Database, view: ReadView) -> Self {
        Self { db, view }
    }

    /// Value of `key` as of the snapshot
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.db.view_get(&self.view, key)
    }

    /// True when `key` has a live value in the snapshot
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Iterate the snapshot
    pub fn iter(&self, options: IterOptions) -> Result<MergeIterator<'db>> {
        MergeIterator::new(self.db, self.view.clone(), options)
    }

    /// Header revision the snapshot was taken at
    pub fn revision(&self) -> Revision {
        self.view.revision
    }

    /// Highest sequence number visible through the snapshot
    pub fn seqnum(&self) -> SeqNum {
        self.view.max_seq
    }

    /// Release the snapshot's pin
    pub fn close(self) {}
}

impl std::fmt::Debug for Snapshot<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("revision", &self.view.revision)
            .field("seqnum", &self.view.max_seq)
            .finish()
    }
}
