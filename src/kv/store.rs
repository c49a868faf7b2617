//! Embedded persistent key-value engine
//!
//! One RocksDB database with two column families:
//!
//! - `user`: client keys and values
//! - `meta`: per-node metadata records, keyed by node id
//!
//! The engine is exclusively owned by the state machine. All mutations
//! arrive through the applier in commit order; reads may come from any
//! thread. Consistent point-in-time exports use RocksDB snapshots.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use slog::{debug, info, Logger};

use crate::errors::KvsError;

const CF_USER: &str = "user";
const CF_META: &str = "meta";

/// Key-value pairs in ascending key order.
pub type Pairs = Vec<(Vec<u8>, Vec<u8>)>;

pub struct KvStore {
    path: PathBuf,
    db: RwLock<Option<DB>>,
    logger: Logger,
}

impl KvStore {
    /// Open (or create) the engine at `path`.
    pub fn open(path: impl Into<PathBuf>, logger: Logger) -> Result<Self, KvsError> {
        let path = path.into();
        std::fs::create_dir_all(&path)?;
        let db = open_engine(&path)?;
        info!(logger, "opened kv store"; "path" => path.display().to_string());
        Ok(KvStore { path, db: RwLock::new(Some(db)), logger })
    }

    fn with_db<T>(&self, f: impl FnOnce(&DB) -> Result<T, KvsError>) -> Result<T, KvsError> {
        let guard = self.db.read().unwrap();
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(KvsError::Closed),
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvsError> {
        self.with_db(|db| {
            let cf = db.cf_handle(CF_USER).ok_or_else(missing_cf)?;
            Ok(db.get_cf(cf, key)?)
        })
    }

    /// Durable on return (written through the engine WAL).
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvsError> {
        self.with_db(|db| {
            let cf = db.cf_handle(CF_USER).ok_or_else(missing_cf)?;
            Ok(db.put_cf(cf, key, value)?)
        })
    }

    /// Idempotent; deleting an absent key is not an error.
    pub fn delete(&self, key: &[u8]) -> Result<(), KvsError> {
        self.with_db(|db| {
            let cf = db.cf_handle(CF_USER).ok_or_else(missing_cf)?;
            Ok(db.delete_cf(cf, key)?)
        })
    }

    pub fn get_meta(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvsError> {
        self.with_db(|db| {
            let cf = db.cf_handle(CF_META).ok_or_else(missing_cf)?;
            Ok(db.get_cf(cf, key)?)
        })
    }

    pub fn put_meta(&self, key: &[u8], value: &[u8]) -> Result<(), KvsError> {
        self.with_db(|db| {
            let cf = db.cf_handle(CF_META).ok_or_else(missing_cf)?;
            Ok(db.put_cf(cf, key, value)?)
        })
    }

    pub fn delete_meta(&self, key: &[u8]) -> Result<(), KvsError> {
        self.with_db(|db| {
            let cf = db.cf_handle(CF_META).ok_or_else(missing_cf)?;
            Ok(db.delete_cf(cf, key)?)
        })
    }

    /// All current user pairs in ascending key order, from a consistent
    /// read view taken at call time.
    pub fn scan(&self) -> Result<Pairs, KvsError> {
        self.with_db(|db| {
            let cf = db.cf_handle(CF_USER).ok_or_else(missing_cf)?;
            collect_pairs(db.snapshot().iterator_cf(cf, IteratorMode::Start))
        })
    }

    /// All current metadata pairs in ascending key order.
    pub fn scan_meta(&self) -> Result<Pairs, KvsError> {
        self.with_db(|db| {
            let cf = db.cf_handle(CF_META).ok_or_else(missing_cf)?;
            collect_pairs(db.snapshot().iterator_cf(cf, IteratorMode::Start))
        })
    }

    /// Both namespaces exported from a single consistent read view.
    pub fn export(&self) -> Result<(Pairs, Pairs), KvsError> {
        self.with_db(|db| {
            let user_cf = db.cf_handle(CF_USER).ok_or_else(missing_cf)?;
            let meta_cf = db.cf_handle(CF_META).ok_or_else(missing_cf)?;
            let snapshot = db.snapshot();
            let user = collect_pairs(snapshot.iterator_cf(user_cf, IteratorMode::Start))?;
            let meta = collect_pairs(snapshot.iterator_cf(meta_cf, IteratorMode::Start))?;
            Ok((user, meta))
        })
    }

    /// Replace the entire engine contents with the given pairs.
    ///
    /// The pairs are staged into a fresh engine directory which is then
    /// swapped into place, so a failure leaves either the prior contents
    /// or a fully re-initialized engine, never a mix.
    pub fn replace(&self, user: &Pairs, meta: &Pairs) -> Result<(), KvsError> {
        let staged_path = staging_path(&self.path)?;
        if staged_path.exists() {
            std::fs::remove_dir_all(&staged_path)?;
        }

        {
            let staged = open_engine(&staged_path)?;
            let user_cf = staged.cf_handle(CF_USER).ok_or_else(missing_cf)?;
            let meta_cf = staged.cf_handle(CF_META).ok_or_else(missing_cf)?;
            let mut batch = WriteBatch::default();
            for (k, v) in user {
                batch.put_cf(user_cf, k, v);
            }
            for (k, v) in meta {
                batch.put_cf(meta_cf, k, v);
            }
            staged.write(batch)?;
            staged.flush()?;
        }

        let mut guard = self.db.write().unwrap();
        // Close the live engine before touching its directory.
        drop(guard.take());
        std::fs::remove_dir_all(&self.path)?;
        std::fs::rename(&staged_path, &self.path)?;
        *guard = Some(open_engine(&self.path)?);

        debug!(self.logger, "replaced kv store contents";
            "user_pairs" => user.len(),
            "meta_pairs" => meta.len()
        );
        Ok(())
    }

    /// Flush and release the engine. Further operations fail with
    /// [`KvsError::Closed`]. Closing twice is a no-op.
    pub fn close(&self) -> Result<(), KvsError> {
        let mut guard = self.db.write().unwrap();
        if let Some(db) = guard.take() {
            db.flush()?;
            info!(self.logger, "closed kv store"; "path" => self.path.display().to_string());
        }
        Ok(())
    }
}

fn open_engine(path: &Path) -> Result<DB, KvsError> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);
    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_USER, Options::default()),
        ColumnFamilyDescriptor::new(CF_META, Options::default()),
    ];
    Ok(DB::open_cf_descriptors(&opts, path, cfs)?)
}

fn staging_path(path: &Path) -> Result<PathBuf, KvsError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| KvsError::Config { reason: format!("bad engine path {:?}", path) })?;
    Ok(path.with_file_name(format!("{}.restore", name)))
}

fn missing_cf() -> KvsError {
    KvsError::Storage { reason: "column family handle missing".to_string() }
}

fn collect_pairs<I>(iter: I) -> Result<Pairs, KvsError>
where
    I: Iterator<Item = Result<(Box<[u8]>, Box<[u8]>), rocksdb::Error>>,
{
    let mut pairs = Vec::new();
    for item in iter {
        let (k, v) = item?;
        pairs.push((k.to_vec(), v.to_vec()));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::Drain;

    fn test_logger() -> Logger {
        let decorator = slog_term::PlainDecorator::new(slog_term::TestStdoutWriter);
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        Logger::root(drain, slog::o!())
    }

    #[test]
    fn put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path().join("kvs"), test_logger()).unwrap();

        assert_eq!(store.get(b"a").unwrap(), None);
        store.put(b"a", b"1").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));

        store.delete(b"a").unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);

        // Deleting again is fine.
        store.delete(b"a").unwrap();
    }

    #[test]
    fn namespaces_are_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path().join("kvs"), test_logger()).unwrap();

        store.put(b"x", b"user").unwrap();
        store.put_meta(b"x", b"meta").unwrap();

        assert_eq!(store.get(b"x").unwrap(), Some(b"user".to_vec()));
        assert_eq!(store.get_meta(b"x").unwrap(), Some(b"meta".to_vec()));

        store.delete(b"x").unwrap();
        assert_eq!(store.get_meta(b"x").unwrap(), Some(b"meta".to_vec()));
    }

    #[test]
    fn scan_is_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path().join("kvs"), test_logger()).unwrap();

        store.put(b"b", b"2").unwrap();
        store.put(b"a", b"1").unwrap();
        store.put(b"c", b"3").unwrap();

        let pairs = store.scan().unwrap();
        let keys: Vec<_> = pairs.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvs");
        {
            let store = KvStore::open(&path, test_logger()).unwrap();
            store.put(b"k", b"persist").unwrap();
            store.close().unwrap();
        }
        let store = KvStore::open(&path, test_logger()).unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"persist".to_vec()));
    }

    #[test]
    fn operations_fail_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path().join("kvs"), test_logger()).unwrap();
        store.close().unwrap();
        store.close().unwrap();

        assert!(matches!(store.get(b"a"), Err(KvsError::Closed)));
        assert!(matches!(store.put(b"a", b"1"), Err(KvsError::Closed)));
        assert!(matches!(store.scan(), Err(KvsError::Closed)));
    }

    #[test]
    fn replace_swaps_contents_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path().join("kvs"), test_logger()).unwrap();

        store.put(b"old", b"1").unwrap();
        store.put_meta(b"n1", b"m1").unwrap();

        let user = vec![(b"new".to_vec(), b"2".to_vec())];
        let meta = vec![(b"n2".to_vec(), b"m2".to_vec())];
        store.replace(&user, &meta).unwrap();

        assert_eq!(store.get(b"old").unwrap(), None);
        assert_eq!(store.get(b"new").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.get_meta(b"n1").unwrap(), None);
        assert_eq!(store.get_meta(b"n2").unwrap(), Some(b"m2".to_vec()));
    }

    #[test]
    fn export_returns_both_namespaces() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path().join("kvs"), test_logger()).unwrap();

        store.put(b"a", b"1").unwrap();
        store.put_meta(b"n1", b"m1").unwrap();

        let (user, meta) = store.export().unwrap();
        assert_eq!(user, vec![(b"a".to_vec(), b"1".to_vec())]);
        assert_eq!(meta, vec![(b"n1".to_vec(), b"m1".to_vec())]);
    }
}
