//! Fjall-based storage engine adapter for quarkdb.
//!
//! Everything above this crate speaks in terms of one byte-ordered,
//! sorted key space with atomic multi-key batches and point-in-time
//! snapshots. This crate maps that contract onto fjall, an LSM-tree
//! based embedded database.
//!
//! Both stores a node owns (the state machine and the raft journal) are
//! separate `KvEngine` instances over separate directories; they share
//! nothing but this code.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fjall::{Database, Keyspace, KeyspaceCreateOptions, OwnedWriteBatch, PersistMode, Readable};

pub mod checkpoint;

pub use checkpoint::{copy_directory, walk_files};

/// Default cache size in MB
const DEFAULT_CACHE_SIZE_MB: usize = 256;

/// Every key-value pair lives in a single keyspace; logical partitioning
/// happens through single-byte key prefixes one level up.
const MAIN_KEYSPACE: &str = "main";

/// A key-value pair copied out of the engine.
pub type KvPair = (Vec<u8>, Vec<u8>);

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store format mismatch: expected '{expected}', found '{found}'")]
    FormatMismatch { expected: String, found: String },
}

/// Handle to one open store.
#[derive(Clone)]
pub struct KvEngine {
    db: Arc<Database>,
    main: Keyspace,
    path: PathBuf,
}

impl KvEngine {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>, cache_size_mb: Option<usize>) -> Result<Self, EngineError> {
        let cache_size = cache_size_mb.unwrap_or(DEFAULT_CACHE_SIZE_MB);
        let cache_bytes = (cache_size * 1024 * 1024) as u64;

        let db = Database::builder(path.as_ref())
            .cache_size(cache_bytes)
            .open()?;

        let main = db.keyspace(MAIN_KEYSPACE, KeyspaceCreateOptions::default)?;

        Ok(KvEngine {
            db: Arc::new(db),
            main,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Verify a format marker, writing it on first open. Returns an
    /// error if the store carries an unknown format; callers treat that
    /// as fatal.
    pub fn ensure_format(&self, key: &[u8], expected: &str) -> Result<(), EngineError> {
        match self.snapshot().get(key)? {
            None => {
                let mut batch = self.batch();
                batch.insert(key, expected.as_bytes());
                batch.commit(true)?;
                Ok(())
            }
            Some(found) if found == expected.as_bytes() => Ok(()),
            Some(found) => Err(EngineError::FormatMismatch {
                expected: expected.to_string(),
                found: String::from_utf8_lossy(&found).into_owned(),
            }),
        }
    }

    /// Point-in-time view. All reads, including single-key gets, go
    /// through snapshots so transactions observe a frozen state.
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            snapshot: self.db.snapshot(),
            main: self.main.clone(),
        }
    }

    /// Start an atomic multi-key write batch.
    pub fn batch(&self) -> EngineBatch {
        EngineBatch {
            batch: Some(self.db.batch()),
            main: self.main.clone(),
        }
    }

    /// Force everything down to disk, fsync included.
    pub fn sync(&self) -> Result<(), EngineError> {
        self.db.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    /// Produce a self-contained on-disk copy of this store under
    /// `target`. The caller must guarantee no writes are in flight for
    /// the duration.
    pub fn checkpoint(&self, target: &Path) -> Result<(), EngineError> {
        self.db.persist(PersistMode::SyncAll)?;
        checkpoint::copy_directory(&self.path, target)?;
        Ok(())
    }

    /// Walk the whole store, forcing every block through the engine's
    /// checksum verification. Returns the number of pairs touched.
    pub fn verify_checksum(&self) -> Result<u64, EngineError> {
        let snapshot = self.snapshot();
        let mut count = 0u64;
        for pair in snapshot.iter_all() {
            pair?;
            count += 1;
        }
        Ok(count)
    }
}

/// Read-only, point-in-time view over the store.
pub struct EngineSnapshot {
    snapshot: fjall::Snapshot,
    main: Keyspace,
}

impl EngineSnapshot {
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let value = self.snapshot.get(&self.main, key)?;
        Ok(value.map(|slice| slice.as_ref().to_vec()))
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool, EngineError> {
        Ok(self.get(key)?.is_some())
    }

    /// All pairs whose key starts with `prefix`, in key order.
    pub fn prefix<'a>(
        &'a self,
        prefix: &[u8],
    ) -> impl Iterator<Item = Result<KvPair, EngineError>> + 'a {
        self.snapshot
            .prefix(&self.main, prefix.to_vec())
            .map(|guard| into_pair(guard.into_inner()))
    }

    /// All pairs with key >= `start`, in key order. The seek primitive
    /// behind cursors.
    pub fn range_from<'a>(
        &'a self,
        start: &[u8],
    ) -> impl Iterator<Item = Result<KvPair, EngineError>> + 'a {
        self.snapshot
            .range(&self.main, start.to_vec()..)
            .map(|guard| into_pair(guard.into_inner()))
    }

    /// Pairs in the half-open interval `[start, end)`.
    pub fn range<'a>(
        &'a self,
        start: &[u8],
        end: &[u8],
    ) -> impl Iterator<Item = Result<KvPair, EngineError>> + 'a {
        self.snapshot
            .range(&self.main, start.to_vec()..end.to_vec())
            .map(|guard| into_pair(guard.into_inner()))
    }

    pub fn iter_all(&self) -> impl Iterator<Item = Result<KvPair, EngineError>> + '_ {
        self.snapshot
            .iter(&self.main)
            .map(|guard| into_pair(guard.into_inner()))
    }
}

fn into_pair<K, V>(inner: Result<(K, V), fjall::Error>) -> Result<KvPair, EngineError>
where
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    let (key, value) = inner?;
    Ok((key.as_ref().to_vec(), value.as_ref().to_vec()))
}

/// An atomic multi-key write batch. Nothing is visible until `commit`.
pub struct EngineBatch {
    batch: Option<OwnedWriteBatch>,
    main: Keyspace,
}

impl EngineBatch {
    pub fn insert(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        if let Some(batch) = self.batch.as_mut() {
            batch.insert(&self.main, key.as_ref(), value.as_ref());
        }
    }

    pub fn remove(&mut self, key: impl AsRef<[u8]>) {
        if let Some(batch) = self.batch.as_mut() {
            batch.remove(&self.main, key.as_ref());
        }
    }

    /// Commit atomically. `durable` selects WAL-sync-before-return;
    /// bulkload turns it off.
    pub fn commit(mut self, durable: bool) -> Result<(), EngineError> {
        let mode = if durable {
            PersistMode::SyncAll
        } else {
            PersistMode::Buffer
        };
        let batch = self
            .batch
            .take()
            .expect("batch consumed twice")
            .durability(Some(mode));
        batch.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_scratch() -> (tempfile::TempDir, KvEngine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = KvEngine::open(dir.path().join("store"), Some(8)).unwrap();
        (dir, engine)
    }

    #[test]
    fn batch_is_atomic_and_ordered() {
        let (_dir, engine) = open_scratch();

        let mut batch = engine.batch();
        batch.insert(b"b", b"2");
        batch.insert(b"a", b"1");
        batch.insert(b"c", b"3");
        batch.commit(false).unwrap();

        let snapshot = engine.snapshot();
        let pairs: Vec<_> = snapshot
            .iter_all()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(
            pairs,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );
    }

    #[test]
    fn snapshot_does_not_see_later_writes() {
        let (_dir, engine) = open_scratch();

        let mut batch = engine.batch();
        batch.insert(b"k", b"before");
        batch.commit(false).unwrap();

        let snapshot = engine.snapshot();

        let mut batch = engine.batch();
        batch.insert(b"k", b"after");
        batch.commit(false).unwrap();

        assert_eq!(snapshot.get(b"k").unwrap().unwrap(), b"before");
        assert_eq!(engine.snapshot().get(b"k").unwrap().unwrap(), b"after");
    }

    #[test]
    fn prefix_and_range_iteration() {
        let (_dir, engine) = open_scratch();

        let mut batch = engine.batch();
        for key in ["aa", "ab", "b0", "b1", "c"] {
            batch.insert(key.as_bytes(), b"x");
        }
        batch.commit(false).unwrap();

        let snapshot = engine.snapshot();
        let under_b: Vec<_> = snapshot
            .prefix(b"b")
            .map(|pair| pair.unwrap().0)
            .collect();
        assert_eq!(under_b, vec![b"b0".to_vec(), b"b1".to_vec()]);

        let from_ab: Vec<_> = snapshot
            .range_from(b"ab")
            .map(|pair| pair.unwrap().0)
            .collect();
        assert_eq!(from_ab.first().unwrap(), b"ab");
        assert_eq!(from_ab.len(), 4);

        let bounded: Vec<_> = snapshot
            .range(b"ab", b"b1")
            .map(|pair| pair.unwrap().0)
            .collect();
        assert_eq!(bounded, vec![b"ab".to_vec(), b"b0".to_vec()]);
    }

    #[test]
    fn format_marker_checked_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");

        {
            let engine = KvEngine::open(&path, Some(8)).unwrap();
            engine.ensure_format(b"__format", "0").unwrap();
            engine.sync().unwrap();
        }

        let engine = KvEngine::open(&path, Some(8)).unwrap();
        engine.ensure_format(b"__format", "0").unwrap();
        assert!(matches!(
            engine.ensure_format(b"__format", "999"),
            Err(EngineError::FormatMismatch { .. })
        ));
    }
}
