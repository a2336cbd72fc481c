//! Opening and recovery
//!
//! On open:
//! 1. Discover generation files, newest first
//! 2. The newest generation with a usable header wins
//! 3. Delete every other generation (superseded, or an interrupted compaction)
//! 4. Load the index root of the newest header that decodes, falling back
//!    to older headers on corruption
//!
//! The WAL is not durable: writes after the recovered header are gone.

use std::fs;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{Database, Generation, State};
use crate::config::{Backend, Config};
use crate::error::Result;
use crate::snapshot::PinRegistry;
use crate::storage::{Header, HeaderRef, IndexRoot, Store, HEADER_VERSION};
use crate::types::BlockId;
use crate::wal::Wal;

/// A header together with the root it references
struct Recovered {
    bid: BlockId,
    header: Header,
    root: IndexRoot,
}

impl Database {
    /// Open or create a database with the given config
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let (store, recovered) = match config.backend {
            Backend::Memory => (Store::open(&config, 0)?, None),
            Backend::File => {
                fs::create_dir_all(&config.data_dir)?;
                Self::recover_generation(&config)?
            }
        };

        let recovered = match recovered {
            Some(recovered) => recovered,
            None => Self::initialize(&store)?,
        };
        let Recovered { bid, header, root } = recovered;

        let headers: Vec<HeaderRef> = store
            .header_refs()
            .into_iter()
            .filter(|h| h.bid <= bid)
            .collect();
        let last_wal_flush_header = if header.is_self_contained() {
            Some(bid)
        } else {
            header.last_wal_flush_header
        };

        tracing::info!(
            name = %config.name,
            generation = store.generation(),
            revision = header.revision,
            seqnum = header.seqnum,
            ndocs = header.ndocs,
            "opened database"
        );

        let next_generation = store.generation() + 1;
        let mut state = State {
            wal: Wal::new(),
            generation: Generation::Primary(store),
            root,
            seqnum: header.seqnum,
            revision: header.revision,
            last_header: Some(bid),
            last_wal_flush_header,
            ndocs: header.ndocs,
            datasize: header.datasize,
            active_txn: None,
            epoch: 0,
            headers,
            wal_barrier: bid,
            header_limit: config.max_headers,
            rollback_hold: None,
        };
        state.trim_headers();

        Ok(Self {
            config,
            write_lock: Mutex::new(()),
            state: RwLock::new(state),
            pins: PinRegistry::new(),
            next_txn_id: AtomicU64::new(1),
            next_generation: AtomicU64::new(next_generation),
            headers_since_sync: AtomicUsize::new(0),
        })
    }

    /// Pick the generation to open and remove the rest
    fn recover_generation(config: &Config) -> Result<(Arc<Store>, Option<Recovered>)> {
        let found = Store::discover(&config.data_dir, &config.name)?;

        let mut chosen = None;
        for (generation, _) in &found {
            let store = Store::open(config, *generation)?;
            match Self::load_latest(&store) {
                Some(recovered) => {
                    chosen = Some((store, recovered));
                    break;
                }
                None => tracing::warn!(generation, "generation has no usable header"),
            }
        }

        let keep = chosen.as_ref().map(|(store, _)| store.generation());
        for (generation, path) in &found {
            if Some(*generation) != keep {
                tracing::info!(generation, path = %path.display(), "removing stale generation");
                fs::remove_file(path)?;
            }
        }

        match chosen {
            Some((store, recovered)) => Ok((store, Some(recovered))),
            None => Ok((Store::open(config, 0)?, None)),
        }
    }

    /// Newest header whose roots load, scanning backwards
    fn load_latest(store: &Store) -> Option<Recovered> {
        for bid in store.file().header_ids().into_iter().rev() {
            let loaded = Header::read_from(store.file(), bid)
                .and_then(|header| Ok((store.index().root_at(&header)?, header)));
            match loaded {
                Ok((root, header)) => return Some(Recovered { bid, header, root }),
                Err(e) => {
                    tracing::warn!(generation = store.generation(), bid, error = %e, "falling back past unusable header");
                }
            }
        }
        None
    }

    /// Write the first header of a fresh database
    fn initialize(store: &Store) -> Result<Recovered> {
        let header = Header {
            version: HEADER_VERSION,
            revision: 1,
            seqnum: 0,
            index_seq: 0,
            key_root: None,
            seq_root: None,
            ndocs: 0,
            datasize: 0,
            prev_header: None,
            last_wal_flush_header: None,
        };
        let bid = header.write_to(store.file())?;
        store.file().sync()?;
        tracing::info!(generation = store.generation(), "created database");
        Ok(Recovered {
            bid,
            header,
            root: IndexRoot::default(),
        })
    }
}
