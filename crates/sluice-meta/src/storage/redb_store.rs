//! redb-backed local cache store
//!
//! Pure Rust, ACID, zero C dependencies. All mutation happens inside a
//! scoped write transaction that commits only when the scope returns `Ok`;
//! any error raised inside the scope aborts the whole transaction.

use super::{decode_id, encode_id, Bucket, ScanOrder};
use crate::error::Result;
use redb::{AccessGuard, Database, ReadTransaction, ReadableTable, WriteTransaction};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const STORE_DIR: &str = "db";
const METADATA_FILE: &str = "metadata.redb";

/// Process-wide handle to the node's local store
///
/// Cheap to clone; every clone shares the same database. redb serializes
/// writers internally, so concurrent transactions from several tasks are
/// safe.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("path", &self.path)
            .finish()
    }
}

impl LocalStore {
    /// Open (or create) the store under `data_dir/db/metadata.redb`
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref().join(STORE_DIR);
        std::fs::create_dir_all(&dir)?;
        Self::open_file(dir.join(METADATA_FILE))
    }

    /// Open (or create) the store at an explicit file path
    pub fn open_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(&path)?;
        let store = Self {
            db: Arc::new(db),
            path,
        };
        store.bootstrap()?;

        info!(path = %store.path.display(), "Opened local metadata store");
        Ok(store)
    }

    /// Create every bucket that does not exist yet
    ///
    /// Safe to repeat; existing buckets and their records are untouched.
    pub fn bootstrap(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        for bucket in Bucket::ALL {
            txn.open_table(bucket.table())?;
        }
        txn.commit()?;
        debug!("Local store buckets ready");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` inside a write transaction
    ///
    /// Commits when `f` returns `Ok`, aborts otherwise.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&WriteTx<'_>) -> Result<T>,
    {
        let txn = self.db.begin_write()?;
        let result = f(&WriteTx { txn: &txn });
        match result {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort) = txn.abort() {
                    warn!(error = %abort, "Failed to abort local transaction");
                }
                Err(e)
            }
        }
    }

    /// Run `f` against a consistent read snapshot
    pub fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ReadTx) -> Result<T>,
    {
        let txn = self.db.begin_read()?;
        f(&ReadTx { txn })
    }

    pub fn put(&self, bucket: Bucket, id: u64, value: &[u8]) -> Result<()> {
        self.update(|tx| tx.put(bucket, id, value))
    }

    pub fn get(&self, bucket: Bucket, id: u64) -> Result<Option<Vec<u8>>> {
        self.view(|tx| tx.get(bucket, id))
    }

    /// Remove a record, returning whether it existed
    pub fn delete(&self, bucket: Bucket, id: u64) -> Result<bool> {
        self.update(|tx| tx.delete(bucket, id))
    }

    pub fn scan_all(&self, bucket: Bucket, order: ScanOrder) -> Result<Vec<(u64, Vec<u8>)>> {
        self.view(|tx| tx.scan_all(bucket, order))
    }

    /// Release the handle
    ///
    /// The database file closes once every clone has been dropped.
    pub fn close(self) {
        info!(path = %self.path.display(), "Closing local metadata store");
    }
}

/// Mutating view of the store inside [`LocalStore::update`]
pub struct WriteTx<'a> {
    txn: &'a WriteTransaction,
}

impl WriteTx<'_> {
    pub fn put(&self, bucket: Bucket, id: u64, value: &[u8]) -> Result<()> {
        let mut table = self.txn.open_table(bucket.table())?;
        table.insert(encode_id(id).as_slice(), value)?;
        Ok(())
    }

    pub fn get(&self, bucket: Bucket, id: u64) -> Result<Option<Vec<u8>>> {
        let table = self.txn.open_table(bucket.table())?;
        let value = table.get(encode_id(id).as_slice())?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    pub fn delete(&self, bucket: Bucket, id: u64) -> Result<bool> {
        let mut table = self.txn.open_table(bucket.table())?;
        let removed = table.remove(encode_id(id).as_slice())?;
        Ok(removed.is_some())
    }

    pub fn scan_all(&self, bucket: Bucket, order: ScanOrder) -> Result<Vec<(u64, Vec<u8>)>> {
        let table = self.txn.open_table(bucket.table())?;
        collect(&table, bucket, order)
    }
}

/// Read-only snapshot inside [`LocalStore::view`]
pub struct ReadTx {
    txn: ReadTransaction,
}

impl ReadTx {
    pub fn get(&self, bucket: Bucket, id: u64) -> Result<Option<Vec<u8>>> {
        let table = self.txn.open_table(bucket.table())?;
        let value = table.get(encode_id(id).as_slice())?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    pub fn scan_all(&self, bucket: Bucket, order: ScanOrder) -> Result<Vec<(u64, Vec<u8>)>> {
        let table = self.txn.open_table(bucket.table())?;
        collect(&table, bucket, order)
    }
}

fn collect<T>(table: &T, bucket: Bucket, order: ScanOrder) -> Result<Vec<(u64, Vec<u8>)>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let range = table.iter()?;
    match order {
        ScanOrder::Ascending => drain(range, bucket),
        ScanOrder::Descending => drain(range.rev(), bucket),
    }
}

type RawEntry<'a> = std::result::Result<
    (
        AccessGuard<'a, &'static [u8]>,
        AccessGuard<'a, &'static [u8]>,
    ),
    redb::StorageError,
>;

fn drain<'a, I>(entries: I, bucket: Bucket) -> Result<Vec<(u64, Vec<u8>)>>
where
    I: Iterator<Item = RawEntry<'a>>,
{
    let mut out = Vec::new();
    for entry in entries {
        let (key, value) = entry?;
        match decode_id(key.value()) {
            Ok(id) => out.push((id, value.value().to_vec())),
            Err(e) => warn!(%bucket, error = %e, "Skipping record with malformed key"),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MetaError;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, LocalStore) {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_get_delete() {
        let (_dir, store) = open_store();

        assert!(store.get(Bucket::Source, 1).unwrap().is_none());
        store.put(Bucket::Source, 1, b"alpha").unwrap();
        assert_eq!(store.get(Bucket::Source, 1).unwrap().unwrap(), b"alpha");

        // Buckets are independent
        assert!(store.get(Bucket::Endpoint, 1).unwrap().is_none());

        assert!(store.delete(Bucket::Source, 1).unwrap());
        assert!(!store.delete(Bucket::Source, 1).unwrap());
        assert!(store.get(Bucket::Source, 1).unwrap().is_none());
    }

    #[test]
    fn test_scan_is_numerically_ordered() {
        let (_dir, store) = open_store();
        for id in [300u64, 2, 70_000, 1] {
            store.put(Bucket::Pipeline, id, &id.to_le_bytes()).unwrap();
        }

        let ids: Vec<u64> = store
            .scan_all(Bucket::Pipeline, ScanOrder::Ascending)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec![1, 2, 300, 70_000]);

        let ids: Vec<u64> = store
            .scan_all(Bucket::Pipeline, ScanOrder::Descending)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec![70_000, 300, 2, 1]);
    }

    #[test]
    fn test_failed_scope_rolls_back() {
        let (_dir, store) = open_store();
        store.put(Bucket::Endpoint, 5, b"keep").unwrap();

        let result: Result<()> = store.update(|tx| {
            tx.delete(Bucket::Endpoint, 5)?;
            tx.put(Bucket::Endpoint, 6, b"new")?;
            Err(MetaError::CoordinatorUnavailable("refused".into()))
        });
        assert!(result.is_err());

        assert_eq!(store.get(Bucket::Endpoint, 5).unwrap().unwrap(), b"keep");
        assert!(store.get(Bucket::Endpoint, 6).unwrap().is_none());
    }

    #[test]
    fn test_bootstrap_is_idempotent() {
        let dir = TempDir::new().unwrap();
        {
            let store = LocalStore::open(dir.path()).unwrap();
            store.put(Bucket::State, 9, b"running").unwrap();
            store.bootstrap().unwrap();
            store.bootstrap().unwrap();
            assert_eq!(store.get(Bucket::State, 9).unwrap().unwrap(), b"running");
        }

        // Reopen runs bootstrap again
        let store = LocalStore::open(dir.path()).unwrap();
        assert_eq!(store.get(Bucket::State, 9).unwrap().unwrap(), b"running");
        assert!(store.path().ends_with("db/metadata.redb"));
    }
}
