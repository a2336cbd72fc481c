//! Document store
//!
//! Append-only document bodies. A write returns a [`DocLocation`] token;
//! the token is all a reader needs to get the document back.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::block::{BlockFile, BlockKind};
use crate::error::{CinderError, Result};
use crate::types::DocLocation;

#[derive(Serialize, Deserialize)]
struct DocRecord {
    key: Vec<u8>,
    body: Vec<u8>,
}

/// A document read back from the store
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub key: Vec<u8>,
    pub body: Bytes,
}

/// Body storage for one generation
pub struct DocStore {
    generation: u64,
    file: Arc<dyn BlockFile>,
}

impl DocStore {
    pub fn new(generation: u64, file: Arc<dyn BlockFile>) -> Self {
        Self { generation, file }
    }

    /// Append a document, returning its location
    pub fn append(&self, key: &[u8], body: &[u8]) -> Result<DocLocation> {
        let record = DocRecord {
            key: key.to_vec(),
            body: body.to_vec(),
        };
        let payload = bincode::serialize(&record)?;
        let block = self.file.append(BlockKind::Doc, &payload)?;
        Ok(DocLocation {
            generation: self.generation,
            block,
        })
    }

    /// Read the document at `loc`
    pub fn read(&self, loc: DocLocation) -> Result<Document> {
        if loc.generation != self.generation {
            return Err(CinderError::Storage(format!(
                "location {:?} belongs to generation {}, store is generation {}",
                loc, loc.generation, self.generation
            )));
        }
        let (kind, payload) = self.file.read(loc.block)?;
        if kind != BlockKind::Doc {
            return Err(CinderError::Storage(format!(
                "block {} is a {:?} block, not a document",
                loc.block, kind
            )));
        }
        let record: DocRecord = bincode::deserialize(&payload)?;
        Ok(Document {
            key: record.key,
            body: Bytes::from(record.body),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}
