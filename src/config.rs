//! Configuration for CinderKV
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{CinderError, Result};

/// Main configuration for a CinderKV database
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for the database files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── {name}.0         (generation 0)
    ///     └── {name}.1         (written by the first compaction)
    pub data_dir: PathBuf,

    /// Database name, used as the file name prefix
    pub name: String,

    /// Where blocks live
    pub backend: Backend,

    /// How often headers are fsynced
    pub sync_strategy: SyncStrategy,

    /// Headers kept as snapshot and rollback targets; older ones are
    /// forgotten (their blocks stay in the file until compaction)
    pub max_headers: usize,

    // -------------------------------------------------------------------------
    // WAL Configuration
    // -------------------------------------------------------------------------
    /// Number of committed, unflushed WAL entries that triggers a flush
    pub wal_threshold: usize,

    /// Flush the WAL into the index before every header commit
    pub wal_flush_before_commit: bool,

    // -------------------------------------------------------------------------
    // Key Limits
    // -------------------------------------------------------------------------
    /// Maximum key length in bytes
    pub max_key_len: usize,
}

/// Block storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Append-only files under `data_dir`
    File,

    /// In-memory buffers (nothing survives the process)
    Memory,
}

/// Header sync strategy
#[derive(Debug, Clone, Copy)]
pub enum SyncStrategy {
    /// fsync after every header write (safest, slowest)
    EveryHeader,

    /// fsync after N header writes (balanced durability/performance)
    EveryNHeaders { count: usize },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./cinderkv_data"),
            name: "cinder".to_string(),
            backend: Backend::File,
            sync_strategy: SyncStrategy::EveryHeader,
            max_headers: 1024,
            wal_threshold: 4096,
            wal_flush_before_commit: true,
            max_key_len: 3840,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check the values for internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains(std::path::MAIN_SEPARATOR) {
            return Err(CinderError::Config(format!(
                "invalid database name: {:?}",
                self.name
            )));
        }
        if self.wal_threshold == 0 {
            return Err(CinderError::Config(
                "wal_threshold must be at least 1".to_string(),
            ));
        }
        if self.max_headers == 0 {
            return Err(CinderError::Config(
                "max_headers must be at least 1".to_string(),
            ));
        }
        if self.max_key_len == 0 {
            return Err(CinderError::Config(
                "max_key_len must be at least 1".to_string(),
            ));
        }
        if let SyncStrategy::EveryNHeaders { count: 0 } = self.sync_strategy {
            return Err(CinderError::Config(
                "sync_strategy count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the database name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the storage backend
    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    /// Use the in-memory backend
    pub fn in_memory(self) -> Self {
        self.backend(Backend::Memory)
    }

    /// Set the header sync strategy
    pub fn sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.config.sync_strategy = strategy;
        self
    }

    /// Set how many headers stay available as snapshot and rollback targets
    pub fn max_headers(mut self, count: usize) -> Self {
        self.config.max_headers = count;
        self
    }

    /// Set the WAL flush threshold (committed entries)
    pub fn wal_threshold(mut self, entries: usize) -> Self {
        self.config.wal_threshold = entries;
        self
    }

    /// Flush the WAL before every header commit
    pub fn wal_flush_before_commit(mut self, enabled: bool) -> Self {
        self.config.wal_flush_before_commit = enabled;
        self
    }

    /// Set the maximum key length (in bytes)
    pub fn max_key_len(mut self, len: usize) -> Self {
        self.config.max_key_len = len;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
