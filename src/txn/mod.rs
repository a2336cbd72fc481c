//! Transaction Module
//!
//! Atomic multi-key writes layered on the WAL.
//!
//! ## Lifecycle
//! ```text
//!   begin() ──▶ Active ──commit()──▶ Committed
//!                  │
//!                  └────abort()───▶ Aborted
//! ```
//! Writes are inserted into the WAL tagged with the transaction id and
//! stay invisible to everyone else until commit, which assigns their
//! sequence numbers in write order and writes a header. Abort removes
//! them and leaves the handle's counters untouched.

use std::sync::Arc;

use bytes::Bytes;

use crate::db::Database;
use crate::error::{CinderError, Result};
use crate::iter::{IterOptions, MergeIterator};
use crate::snapshot::ReadView;
use crate::storage::Store;
use crate::types::{BlockId, Isolation, Revision, SeqNum, TxnId};
use crate::wal::EntryId;

/// State of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Transaction is active and can perform operations
    Active,
    /// Transaction has been committed
    Committed,
    /// Transaction has been aborted
    Aborted,
}

/// A transaction on a [`Database`]
///
/// Dropping an active transaction aborts it.
pub struct Transaction<'db> {
    db: &'db Database,
    id: TxnId,
    isolation: Isolation,
    state: TxnState,
    /// Last committed header when the transaction began
    prev_header: Option<BlockId>,
    /// WAL entries written, in first-write order
    dirty: Vec<EntryId>,
    /// Pinned view (repeatable read only)
    view: Option<ReadView>,
    /// Keeps the generation of `prev_header` alive
    _begin_store: Arc<Store>,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(
        db: &'db Database,
        id: TxnId,
        isolation: Isolation,
        prev_header: Option<BlockId>,
        begin_store: Arc<Store>,
        view: Option<ReadView>,
    ) -> Self {
        Self {
            db,
            id,
            isolation,
            state: TxnState::Active,
            prev_header,
            dirty: Vec::new(),
            view,
            _begin_store: begin_store,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Header block that was current at `begin()`
    pub fn prev_header(&self) -> Option<BlockId> {
        self.prev_header
    }

    /// Sequence number reads are pinned at (repeatable read only)
    pub fn snapshot_seq(&self) -> Option<SeqNum> {
        self.view.as_ref().map(|v| v.max_seq)
    }

    /// Number of distinct keys written
    pub fn write_count(&self) -> usize {
        self.dirty.len()
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(key, Some(value))
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.write(key, None)
    }

    fn write(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        self.ensure_active()?;
        let id = self.db.txn_write(self.id, key, value)?;
        if !self.dirty.contains(&id) {
            self.dirty.push(id);
        }
        Ok(())
    }

    /// Read `key`, seeing this transaction's own writes
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.ensure_active()?;
        let view = self.read_view();
        self.db.view_get(&view, key)
    }

    /// Iterate with this transaction's own writes merged in.
    ///
    /// Sequence-ordered iterators skip keys with uncommitted writes, which
    /// have no sequence number yet.
    pub fn iter(&self, options: IterOptions) -> Result<MergeIterator<'db>> {
        self.ensure_active()?;
        MergeIterator::new(self.db, self.read_view(), options)
    }

    /// Commit: make every write visible atomically and write a header
    ///
    /// Under repeatable read, fails with `Conflict` when another writer
    /// committed one of the same keys after this transaction began; the
    /// transaction is then aborted.
    pub fn commit(&mut self) -> Result<Revision> {
        self.ensure_active()?;
        let snapshot_seq = self.snapshot_seq();
        match self.db.txn_commit(self.id, &self.dirty, snapshot_seq) {
            Ok(revision) => {
                self.finish(TxnState::Committed);
                Ok(revision)
            }
            Err(e @ CinderError::Conflict { .. }) => {
                tracing::debug!(txn = %self.id, error = %e, "commit conflict");
                self.abort_inner();
                Err(e)
            }
            Err(e) => {
                // Writes are visible once retagged even if the header failed
                if self.db.state().active_txn != Some(self.id) {
                    self.finish(TxnState::Committed);
                }
                Err(e)
            }
        }
    }

    /// Abort: discard every write
    pub fn abort(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.abort_inner();
        Ok(())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            TxnState::Active => Ok(()),
            TxnState::Committed | TxnState::Aborted => Err(CinderError::TransactionAlreadyClosed),
        }
    }

    fn read_view(&self) -> ReadView {
        match &self.view {
            Some(view) => view.clone(),
            None => self.db.txn_live_view(self.id),
        }
    }

    fn abort_inner(&mut self) {
        self.db.txn_abort(self.id, &self.dirty);
        self.finish(TxnState::Aborted);
    }

    fn finish(&mut self, state: TxnState) {
        self.state = state;
        self.dirty.clear();
        self.view = None;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == TxnState::Active {
            self.abort_inner();
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("isolation", &self.isolation)
            .field("state", &self.state)
            .field("writes", &self.dirty.len())
            .finish()
    }
}
