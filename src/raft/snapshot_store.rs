//! Snapshot file ring
//!
//! Complete snapshot streams are kept as files under
//! `<dataDir>/snapshots`, newest two retained. A snapshot is written to a
//! `.tmp` file and renamed into place once complete, so a crash never
//! leaves a partial snapshot visible; leftover `.tmp` files are collected
//! on open.

use std::path::{Path, PathBuf};

use slog::{info, warn, Logger};
use uuid::Uuid;

use crate::errors::KvsError;

/// Number of complete snapshots retained.
const SNAPSHOT_RETAIN: usize = 2;

const SNAPSHOT_SUFFIX: &str = ".snap";
const STAGING_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub index: u64,
    pub term: u64,
}

pub struct SnapshotStore {
    dir: PathBuf,
    logger: Logger,
}

impl SnapshotStore {
    /// Open the store, creating the directory and collecting any staging
    /// files left behind by an interrupted snapshot.
    pub fn open(dir: impl Into<PathBuf>, logger: Logger) -> Result<Self, KvsError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let store = SnapshotStore { dir, logger };
        store.collect_staging()?;
        Ok(store)
    }

    /// Persist a complete snapshot stream, then drop ring entries beyond
    /// the retention bound.
    pub fn save(&self, index: u64, term: u64, data: &[u8]) -> Result<(), KvsError> {
        let file_name = format!("{:020}-{:020}-{}{}", index, term, Uuid::new_v4(), SNAPSHOT_SUFFIX);
        let final_path = self.dir.join(&file_name);
        let staging_path = self.dir.join(format!("{}{}", file_name, STAGING_SUFFIX));

        std::fs::write(&staging_path, data)?;
        std::fs::rename(&staging_path, &final_path)?;

        info!(self.logger, "saved snapshot";
            "index" => index,
            "term" => term,
            "size" => data.len()
        );

        self.reap()
    }

    /// Metadata of the newest complete snapshot, if any.
    pub fn latest_meta(&self) -> Result<Option<SnapshotMeta>, KvsError> {
        Ok(self.entries()?.into_iter().next_back().map(|(meta, _)| meta))
    }

    /// Newest complete snapshot with its stream contents.
    pub fn latest(&self) -> Result<Option<(SnapshotMeta, Vec<u8>)>, KvsError> {
        match self.entries()?.into_iter().next_back() {
            Some((meta, path)) => {
                let data = std::fs::read(path)?;
                Ok(Some((meta, data)))
            }
            None => Ok(None),
        }
    }

    /// Complete snapshots sorted ascending by (index, term).
    fn entries(&self) -> Result<Vec<(SnapshotMeta, PathBuf)>, KvsError> {
        let mut entries = Vec::new();
        for item in std::fs::read_dir(&self.dir)? {
            let path = item?.path();
            match parse_snapshot_name(&path) {
                Some(meta) => entries.push((meta, path)),
                None => continue,
            }
        }
        entries.sort_by_key(|(meta, _)| (meta.index, meta.term));
        Ok(entries)
    }

    fn reap(&self) -> Result<(), KvsError> {
        let entries = self.entries()?;
        if entries.len() <= SNAPSHOT_RETAIN {
            return Ok(());
        }
        let excess = entries.len() - SNAPSHOT_RETAIN;
        for (meta, path) in entries.into_iter().take(excess) {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(self.logger, "failed to remove old snapshot";
                    "index" => meta.index, "error" => %e);
            }
        }
        Ok(())
    }

    fn collect_staging(&self) -> Result<(), KvsError> {
        for item in std::fs::read_dir(&self.dir)? {
            let path = item?.path();
            let is_staging = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(STAGING_SUFFIX))
                .unwrap_or(false);
            if is_staging {
                warn!(self.logger, "removing partial snapshot";
                    "path" => path.display().to_string());
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

fn parse_snapshot_name(path: &Path) -> Option<SnapshotMeta> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(SNAPSHOT_SUFFIX)?;
    let mut parts = stem.splitn(3, '-');
    let index = parts.next()?.parse().ok()?;
    let term = parts.next()?.parse().ok()?;
    parts.next()?;
    Some(SnapshotMeta { index, term })
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
    fn empty_store_has_no_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().join("snapshots"), test_logger()).unwrap();
        assert!(store.latest().unwrap().is_none());
        assert!(store.latest_meta().unwrap().is_none());
    }

    #[test]
    fn save_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().join("snapshots"), test_logger()).unwrap();

        store.save(5, 1, b"stream-5").unwrap();
        store.save(9, 2, b"stream-9").unwrap();

        let (meta, data) = store.latest().unwrap().unwrap();
        assert_eq!(meta, SnapshotMeta { index: 9, term: 2 });
        assert_eq!(data, b"stream-9");
    }

    #[test]
    fn retains_only_the_newest_two() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().join("snapshots"), test_logger()).unwrap();

        for i in 1..=5u64 {
            store.save(i, 1, format!("stream-{}", i).as_bytes()).unwrap();
        }

        let files: Vec<_> = std::fs::read_dir(dir.path().join("snapshots"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(files.len(), SNAPSHOT_RETAIN);

        let (meta, _) = store.latest().unwrap().unwrap();
        assert_eq!(meta.index, 5);
    }

    #[test]
    fn partial_snapshots_are_collected_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let snap_dir = dir.path().join("snapshots");
        std::fs::create_dir_all(&snap_dir).unwrap();
        std::fs::write(snap_dir.join("00000000000000000003-x.snap.tmp"), b"partial").unwrap();

        let store = SnapshotStore::open(&snap_dir, test_logger()).unwrap();
        assert!(store.latest().unwrap().is_none());
        assert!(!snap_dir.join("00000000000000000003-x.snap.tmp").exists());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let snap_dir = dir.path().join("snapshots");
        {
            let store = SnapshotStore::open(&snap_dir, test_logger()).unwrap();
            store.save(7, 3, b"durable").unwrap();
        }
        let store = SnapshotStore::open(&snap_dir, test_logger()).unwrap();
        let (meta, data) = store.latest().unwrap().unwrap();
        assert_eq!(meta, SnapshotMeta { index: 7, term: 3 });
        assert_eq!(data, b"durable");
    }
}
