//! Write-Ahead Log (WAL) Module
//!
//! In-memory buffer of recent mutations, absorbing writes before they are
//! merged into the ordered index.
//!
//! ## Responsibilities
//! - Hold every version a pinned reader may still observe
//! - Key view and sequence view over one arena of entries
//! - Track dirty (committed, unmerged) entries for flush
//! - Tag uncommitted writes with their owning transaction
//!
//! ## Layout
//! ```text
//!   by_key                     arena                    by_seq
//! ┌────────┬──────────┐     ┌──────────────────┐     ┌─────┬────┐
//! │ "a"    │ [0, 2]   │──┐  │ 0: a  seq 1  put │  ┌──│  1  │ 0  │
//! │ "b"    │ [1, 3]   │  ├─▶│ 1: b  seq 2  put │◀─┤  │  2  │ 1  │
//! └────────┴──────────┘  │  │ 2: a  seq 3  put │◀─┤  │  3  │ 2  │
//!                        └─▶│ 3: b  txn-4  del │  └──└─────┴────┘
//!                           └──────────────────┘
//! ```
//! The WAL is not durable by itself; recovery rebuilds state from the
//! newest header and starts with an empty WAL.

mod entry;
mod table;

pub use entry::{EntryId, WalEntry, WalOp};
pub use table::{GcHorizon, Wal};
