//! # CinderKV
//!
//! An embedded key-value storage engine with:
//! - An in-memory write-ahead log (WAL) absorbing writes ahead of the index
//! - Key-ordered and sequence-ordered merge iteration
//! - Read-committed and repeatable-read transactions
//! - Point-in-time snapshots and rollback to a retained header
//! - Online compaction with an atomic cutover
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Database handle                        │
//! │        put / get / delete · begin · snapshot · rollback      │
//! └──────────────┬──────────────────────────────┬───────────────┘
//!                │                              │
//!                ▼                              ▼
//!         ┌─────────────┐               ┌───────────────┐
//!         │     WAL     │◀──────────────│ MergeIterator │
//!         │ (key + seq) │               │ (WAL ▸ index) │
//!         └──────┬──────┘               └───────┬───────┘
//!                │ flush                        │
//!                ▼                              ▼
//!         ┌─────────────────────────────────────────────┐
//!         │  Store (generation N)                        │
//!         │  OrderedIndex · DocStore · headers           │
//!         │  on BlockFile                                │
//!         └─────────────────────────────────────────────┘
//!                │ compaction
//!                ▼
//!         ┌─────────────────────────────────────────────┐
//!         │  Store (generation N+1)                      │
//!         └─────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use cinderkv::{Config, Database, IterOptions};
//!
//! # fn main() -> cinderkv::Result<()> {
//! let db = Database::open(Config::builder().data_dir("/tmp/cinder").build())?;
//! db.put(b"a", b"v1")?;
//! db.flush()?;
//! for entry in db.iter(IterOptions::keys())? {
//!     let entry = entry?;
//!     println!("{:?} @ {}", entry.key, entry.seq);
//! }
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod types;

pub mod storage;
pub mod wal;
pub mod iter;
pub mod snapshot;
pub mod txn;
pub mod db;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{CinderError, Result};
pub use config::{Backend, Config, SyncStrategy};
pub use types::{DocLocation, Direction, Isolation, Revision, SeqNum, TxnId};
pub use db::{
    CommitMode, CompactionHandle, CompactionState, CompactionStatus, Database, DbInfo, HeaderInfo,
};
pub use iter::{Entry, IterMode, IterOptions, MergeIterator, Source};
pub use snapshot::Snapshot;
pub use txn::{Transaction, TxnState};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of CinderKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
