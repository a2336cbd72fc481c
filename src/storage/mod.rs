//! Storage Module
//!
//! Durable layer underneath the WAL.
//!
//! ## Responsibilities
//! - Frame and checksum blocks in an append-only file (`block`)
//! - Store document bodies and hand out location tokens (`docstore`)
//! - Keep copy-on-write key and sequence trees (`index`)
//! - Persist headers, the recovery anchor (`header`)
//! - Group all of the above into one generation (`store`)
//!
//! ## File Layout (one generation)
//! ```text
//! ┌────────────────────────────────────────┐
//! │ Doc block      (key + body)            │
//! │ Doc block                              │
//! │ KeyRoot block  (key → seq/location)    │
//! │ SeqRoot block  (seq → key)             │
//! │ Header block   (roots + counters)      │
//! │ Doc block                              │
//! │ ...                                    │
//! └────────────────────────────────────────┘
//! ```

mod block;
mod docstore;
mod header;
mod index;
mod store;

pub use block::{BlockFile, BlockKind, FileBlockFile, MemBlockFile, BLOCK_HEADER_SIZE};
pub use docstore::{DocStore, Document};
pub use header::{Header, HeaderRef, HEADER_VERSION};
pub use index::{BatchOp, IndexRoot, IndexValue, OrderedIndex};
pub(crate) use index::range_is_empty;
pub use store::Store;
