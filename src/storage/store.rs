//! Generation store
//!
//! One generation = one block file carrying the doc store, the index roots
//! and the headers. Compaction writes generation N+1 next to generation N
//! and retires N after cutover.
//!
//! ## Concurrency:
//! - All methods use `&self`; the block file locks internally
//! - Readers keep a generation alive by holding its `Arc<Store>`
//! - A retired store deletes its file when the last `Arc` drops

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::block::{BlockFile, FileBlockFile, MemBlockFile};
use super::docstore::DocStore;
use super::header::{Header, HeaderRef};
use super::index::OrderedIndex;
use crate::config::{Backend, Config};
use crate::error::Result;

/// Block file + doc store + index for one generation
pub struct Store {
    generation: u64,
    file: Arc<dyn BlockFile>,
    docs: DocStore,
    index: OrderedIndex,
    retired: AtomicBool,
}

impl Store {
    /// Create (or reopen) the store for `generation` according to `config`
    pub fn open(config: &Config, generation: u64) -> Result<Arc<Self>> {
        let file: Arc<dyn BlockFile> = match config.backend {
            Backend::File => {
                let path = Self::generation_path(&config.data_dir, &config.name, generation);
                Arc::new(FileBlockFile::open(&path)?)
            }
            Backend::Memory => Arc::new(MemBlockFile::new()),
        };
        Ok(Self::with_file(generation, file))
    }

    /// Create an empty store for `generation`, replacing any leftover file
    pub fn create(config: &Config, generation: u64) -> Result<Arc<Self>> {
        if config.backend == Backend::File {
            let path = Self::generation_path(&config.data_dir, &config.name, generation);
            if path.exists() {
                tracing::warn!(generation, path = %path.display(), "replacing leftover generation file");
                fs::remove_file(&path)?;
            }
        }
        Self::open(config, generation)
    }

    /// Wrap an existing block file
    pub fn with_file(generation: u64, file: Arc<dyn BlockFile>) -> Arc<Self> {
        Arc::new(Self {
            generation,
            docs: DocStore::new(generation, Arc::clone(&file)),
            index: OrderedIndex::new(Arc::clone(&file)),
            file,
            retired: AtomicBool::new(false),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn file(&self) -> &dyn BlockFile {
        self.file.as_ref()
    }

    pub fn docs(&self) -> &DocStore {
        &self.docs
    }

    pub fn index(&self) -> &OrderedIndex {
        &self.index
    }

    /// Every readable header, oldest first
    pub fn header_refs(&self) -> Vec<HeaderRef> {
        self.file
            .header_ids()
            .into_iter()
            .filter_map(|bid| {
                Header::read_from(self.file(), bid)
                    .ok()
                    .map(|h| HeaderRef::new(bid, &h))
            })
            .collect()
    }

    /// Mark the store as superseded; its file is removed once unreferenced
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Path Helpers
    // =========================================================================

    /// "{dir}/{name}.{generation}"
    pub fn generation_path(dir: &Path, name: &str, generation: u64) -> PathBuf {
        dir.join(format!("{}.{}", name, generation))
    }

    /// "cinder.42" → Some(42) when the prefix matches `name`
    pub fn parse_generation(path: &Path, name: &str) -> Option<u64> {
        let file_name = path.file_name()?.to_string_lossy();
        let suffix = file_name.strip_prefix(name)?.strip_prefix('.')?;
        suffix.parse().ok()
    }

    /// Generation files for `name` in `dir`, sorted newest first
    pub fn discover(dir: &Path, name: &str) -> Result<Vec<(u64, PathBuf)>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() {
                if let Some(generation) = Self::parse_generation(&path, name) {
                    found.push((generation, path));
                }
            }
        }
        found.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(found)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.is_retired() {
            return;
        }
        if let Some(path) = self.file.path() {
            match fs::remove_file(path) {
                Ok(()) => tracing::info!(generation = self.generation, path = %path.display(), "removed retired generation"),
                Err(e) => tracing::warn!(generation = self.generation, error = %e, "failed to remove retired generation"),
            }
        }
    }
}
