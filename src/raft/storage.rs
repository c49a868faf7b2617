//! Persistent raft storage
//!
//! Two RocksDB instances under the node's data directory:
//!
//! - `raft/log`: log entries keyed by big-endian index
//! - `raft/stable`: hard state, configuration state, the truncation mark,
//!   and the peer address book
//!
//! Entries are written without per-write fsync; the consensus layer only
//! acknowledges entries that a quorum has accepted, so durability rides on
//! the engine WAL at the commit point.
//!
//! Snapshot data itself lives in the file ring (`SnapshotStore`); this
//! storage only serves its metadata through the `raft::Storage` trait.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use protobuf::Message as PbMessage;
use raft::prelude::*;
use raft::{GetEntriesContext, RaftState, StorageError};
use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use slog::{debug, Logger};

use crate::errors::KvsError;
use crate::raft::snapshot_store::SnapshotStore;
use crate::raft::Peer;

const KEY_HARD_STATE: &[u8] = b"hard_state";
const KEY_CONF_STATE: &[u8] = b"conf_state";
const KEY_TRUNCATED: &[u8] = b"truncated";
const KEY_PEERS: &[u8] = b"peers";

/// Log store + stable store, cheap to clone (shared handles).
#[derive(Clone)]
pub struct RaftStorage {
    log: Arc<DB>,
    stable: Arc<DB>,
    snapshots: Arc<SnapshotStore>,
    first_index: Arc<AtomicU64>,
    last_index: Arc<AtomicU64>,
    logger: Logger,
}

impl RaftStorage {
    /// Open (or create) both stores under `<data_dir>/raft`.
    pub fn open(
        data_dir: &Path,
        snapshots: Arc<SnapshotStore>,
        logger: Logger,
    ) -> Result<Self, KvsError> {
        let log_path = data_dir.join("raft").join("log");
        let stable_path = data_dir.join("raft").join("stable");
        std::fs::create_dir_all(&log_path)?;
        std::fs::create_dir_all(&stable_path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        let log = Arc::new(DB::open(&opts, &log_path)?);
        let stable = Arc::new(DB::open(&opts, &stable_path)?);

        let storage = RaftStorage {
            log,
            stable,
            snapshots,
            first_index: Arc::new(AtomicU64::new(0)),
            last_index: Arc::new(AtomicU64::new(0)),
            logger,
        };
        storage.reload_index_caches()?;
        Ok(storage)
    }

    /// Whether this directory already holds raft state from a previous
    /// start. Used to ignore the bootstrap flag on restarts.
    pub fn is_initialized(&self) -> Result<bool, KvsError> {
        Ok(self.stable.get(KEY_CONF_STATE)?.is_some()
            || self.stable.get(KEY_HARD_STATE)?.is_some())
    }

    /// Index below which the log has been discarded: the newer of the
    /// truncation mark and the latest complete snapshot.
    fn base(&self) -> Result<(u64, u64), KvsError> {
        let truncated = self.truncated()?;
        match self.snapshots.latest_meta()? {
            Some(meta) if meta.index > truncated.0 => Ok((meta.index, meta.term)),
            _ => Ok(truncated),
        }
    }

    fn reload_index_caches(&self) -> Result<(), KvsError> {
        let (base_index, _) = self.base()?;

        let log_min = self.boundary_index(IteratorMode::Start)?;
        let log_max = self.boundary_index(IteratorMode::End)?;

        let (first, last) = match (log_min, log_max) {
            (Some(min), Some(max)) if max > base_index => (min.max(base_index + 1), max),
            // Empty log, or only entries the snapshot already covers.
            _ => (base_index + 1, base_index),
        };

        self.first_index.store(first, Ordering::SeqCst);
        self.last_index.store(last, Ordering::SeqCst);
        debug!(self.logger, "raft storage opened";
            "first_index" => first, "last_index" => last);
        Ok(())
    }

    fn boundary_index(&self, mode: IteratorMode) -> Result<Option<u64>, KvsError> {
        match self.log.iterator(mode).next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(Some(decode_index(&key)?))
            }
            None => Ok(None),
        }
    }

    fn load_entry(&self, index: u64) -> Result<Option<Entry>, KvsError> {
        match self.log.get(index.to_be_bytes())? {
            Some(bytes) => Ok(Some(Entry::parse_from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Append entries to the log. A batch whose first index overlaps the
    /// existing suffix truncates it: the last index shrinks to the end of
    /// the batch and stale higher entries become unreachable.
    pub fn append(&self, entries: &[Entry]) -> Result<(), KvsError> {
        let (first, last) = match (entries.first(), entries.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Ok(()),
        };

        let mut batch = WriteBatch::default();
        for entry in entries {
            batch.put(entry.index.to_be_bytes(), entry.write_to_bytes()?);
        }
        self.log.write(batch)?;

        let current_first = self.first_index.load(Ordering::SeqCst);
        if first.index < current_first {
            self.first_index.store(first.index, Ordering::SeqCst);
        }
        self.last_index.store(last.index, Ordering::SeqCst);
        Ok(())
    }

    /// Discard entries up to and including `through`. The truncation mark
    /// is persisted before the deletes so a crash in between only leaves
    /// unreachable garbage below `first_index`.
    pub fn compact(&self, through: u64) -> Result<(), KvsError> {
        let first = self.first_index.load(Ordering::SeqCst);
        if through < first {
            return Ok(());
        }
        let term = match self.load_entry(through)? {
            Some(entry) => entry.term,
            None => {
                return Err(KvsError::Storage {
                    reason: format!("compaction point {} not in log", through),
                })
            }
        };
        self.set_truncated(through, term)?;

        let mut batch = WriteBatch::default();
        for item in self.log.iterator(IteratorMode::Start) {
            let (key, _) = item?;
            if decode_index(&key)? > through {
                break;
            }
            batch.delete(key);
        }
        self.log.write(batch)?;

        self.first_index.store(through + 1, Ordering::SeqCst);
        debug!(self.logger, "compacted log"; "through" => through);
        Ok(())
    }

    /// Record an installed snapshot: adopt its configuration, move the
    /// truncation mark, and drop covered log entries.
    pub fn apply_snapshot_meta(&self, meta: &SnapshotMetadata) -> Result<(), KvsError> {
        self.set_conf_state(meta.get_conf_state())?;
        self.set_truncated(meta.index, meta.term)?;

        let mut batch = WriteBatch::default();
        for item in self.log.iterator(IteratorMode::Start) {
            let (key, _) = item?;
            if decode_index(&key)? > meta.index {
                break;
            }
            batch.delete(key);
        }
        self.log.write(batch)?;

        let mut hs = self.hard_state()?;
        hs.commit = meta.index;
        hs.term = hs.term.max(meta.term);
        self.set_hard_state(&hs)?;

        self.first_index.store(meta.index + 1, Ordering::SeqCst);
        if self.last_index.load(Ordering::SeqCst) < meta.index {
            self.last_index.store(meta.index, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn hard_state(&self) -> Result<HardState, KvsError> {
        match self.stable.get(KEY_HARD_STATE)? {
            Some(bytes) => Ok(HardState::parse_from_bytes(&bytes)?),
            None => Ok(HardState::default()),
        }
    }

    pub fn set_hard_state(&self, hs: &HardState) -> Result<(), KvsError> {
        self.stable.put(KEY_HARD_STATE, hs.write_to_bytes()?)?;
        Ok(())
    }

    pub fn update_commit(&self, commit: u64) -> Result<(), KvsError> {
        let mut hs = self.hard_state()?;
        hs.set_commit(commit);
        self.set_hard_state(&hs)
    }

    pub fn conf_state(&self) -> Result<ConfState, KvsError> {
        match self.stable.get(KEY_CONF_STATE)? {
            Some(bytes) => Ok(ConfState::parse_from_bytes(&bytes)?),
            None => Ok(ConfState::default()),
        }
    }

    pub fn set_conf_state(&self, cs: &ConfState) -> Result<(), KvsError> {
        self.stable.put(KEY_CONF_STATE, cs.write_to_bytes()?)?;
        Ok(())
    }

    fn truncated(&self) -> Result<(u64, u64), KvsError> {
        match self.stable.get(KEY_TRUNCATED)? {
            Some(bytes) if bytes.len() == 16 => {
                let index = u64::from_be_bytes(bytes[..8].try_into().unwrap());
                let term = u64::from_be_bytes(bytes[8..].try_into().unwrap());
                Ok((index, term))
            }
            Some(_) => Err(KvsError::Storage { reason: "bad truncation record".to_string() }),
            None => Ok((0, 0)),
        }
    }

    fn set_truncated(&self, index: u64, term: u64) -> Result<(), KvsError> {
        let mut value = [0u8; 16];
        value[..8].copy_from_slice(&index.to_be_bytes());
        value[8..].copy_from_slice(&term.to_be_bytes());
        self.stable.put(KEY_TRUNCATED, value)?;
        Ok(())
    }

    pub fn save_peers(&self, peers: &[(u64, Peer)]) -> Result<(), KvsError> {
        self.stable.put(KEY_PEERS, serde_json::to_vec(peers)?)?;
        Ok(())
    }

    pub fn load_peers(&self) -> Result<Vec<(u64, Peer)>, KvsError> {
        match self.stable.get(KEY_PEERS)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }
}

fn decode_index(key: &[u8]) -> Result<u64, KvsError> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| KvsError::Storage { reason: "bad log key".to_string() })?;
    Ok(u64::from_be_bytes(bytes))
}

fn store_err(e: KvsError) -> raft::Error {
    raft::Error::Store(StorageError::Other(Box::new(e)))
}

impl raft::Storage for RaftStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let mut hard_state = self.hard_state().map_err(store_err)?;
        let conf_state = self.conf_state().map_err(store_err)?;

        // The stable store may remember a commit beyond the surviving log
        // (log directory wiped behind the snapshot ring). Clamp it to what
        // is locally available.
        let last = self.last_index.load(Ordering::SeqCst);
        if hard_state.commit > last {
            hard_state.commit = last;
        }

        Ok(RaftState { hard_state, conf_state })
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let max_size = max_size.into();
        if low >= high {
            return Ok(vec![]);
        }

        let first = self.first_index.load(Ordering::SeqCst);
        let last = self.last_index.load(Ordering::SeqCst);
        if low < first {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if high > last + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }

        let mut entries = Vec::new();
        let mut total_size = 0u64;
        for index in low..high {
            let entry = self
                .load_entry(index)
                .map_err(store_err)?
                .ok_or(raft::Error::Store(StorageError::Unavailable))?;
            let entry_size = u64::from(entry.compute_size());
            if let Some(max) = max_size {
                if !entries.is_empty() && total_size + entry_size > max {
                    break;
                }
            }
            total_size += entry_size;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        let (base_index, base_term) = self.base().map_err(store_err)?;
        if idx == base_index {
            return Ok(base_term);
        }

        let first = self.first_index.load(Ordering::SeqCst);
        let last = self.last_index.load(Ordering::SeqCst);
        if idx < first {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if idx > last {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }

        match self.load_entry(idx).map_err(store_err)? {
            Some(entry) => Ok(entry.term),
            None => Err(raft::Error::Store(StorageError::Unavailable)),
        }
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.first_index.load(Ordering::SeqCst))
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.last_index.load(Ordering::SeqCst))
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let latest = self.snapshots.latest().map_err(store_err)?;
        match latest {
            Some((meta, data)) if meta.index >= request_index => {
                let mut snapshot = Snapshot::default();
                snapshot.set_data(data.into());
                let snapshot_meta = snapshot.mut_metadata();
                snapshot_meta.index = meta.index;
                snapshot_meta.term = meta.term;
                snapshot_meta.set_conf_state(self.conf_state().map_err(store_err)?);
                Ok(snapshot)
            }
            _ => Err(raft::Error::Store(StorageError::SnapshotTemporarilyUnavailable)),
        }
    }
}
