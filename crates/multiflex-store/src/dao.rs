//! Data access layer over redb.
//!
//! [`Dao`] owns the database handle. All reads and writes go through a
//! [`Transaction`] guard obtained from [`Dao::begin`]; a write transaction
//! that is neither committed nor rolled back is aborted when the guard drops.

use crate::migration::{MigrationScript, Statement};
use crate::tables;
use bytes::Bytes;
use multiflex_common::{Error, ReservedMetaKey, Result, StoreConfig};
use redb::{Database, ReadTransaction, ReadableTable, TableHandle, WriteTransaction};
use std::path::Path;
use tracing::{debug, warn};

/// Error type for backing engine operations
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("redb error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transaction has already been finished")]
    Finished,
}

impl From<redb::TransactionError> for BackendError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Attach the attempted operation to a backend failure
fn wrap(op: &'static str) -> impl FnOnce(BackendError) -> Error {
    move |e| Error::backing(op, e)
}

/// Handle on an open container file
pub struct Dao {
    db: Database,
    writable: bool,
}

impl Dao {
    /// Open the database at `path`.
    ///
    /// Writable handles create the file (and, if configured, its parent
    /// directories). Read-only handles require an existing file.
    pub fn open(path: &Path, writable: bool, config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let db = Self::open_database(path, writable, config)
            .map_err(|e| Error::backing(format!("open {}", path.display()), e))?;
        debug!("Opened {} (writable: {})", path.display(), writable);
        Ok(Self { db, writable })
    }

    fn open_database(
        path: &Path,
        writable: bool,
        config: &StoreConfig,
    ) -> BackendResult<Database> {
        let mut builder = redb::Builder::new();
        builder.set_cache_size(config.cache_size_bytes);
        if !writable {
            return Ok(builder.open(path)?);
        }

        if config.create_parent_dirs
            && let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Ok(builder.create(path)?)
    }

    /// Check if write transactions can be started
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.writable
    }

    /// Begin a read or write transaction.
    pub fn begin(&self, write: bool) -> Result<Transaction> {
        let txn = if write {
            if !self.writable {
                return Err(Error::NotWritable);
            }
            let txn = self
                .db
                .begin_write()
                .map_err(|e| Error::backing("begin write transaction", BackendError::from(e)))?;
            Txn::Write(txn)
        } else {
            let txn = self
                .db
                .begin_read()
                .map_err(|e| Error::backing("begin read transaction", BackendError::from(e)))?;
            Txn::Read(txn)
        };
        Ok(Transaction { txn: Some(txn) })
    }
}

enum Txn {
    Read(ReadTransaction),
    Write(WriteTransaction),
}

/// Scoped transaction guard
pub struct Transaction {
    /// `None` once committed or rolled back
    txn: Option<Txn>,
}

fn table_exists(txn: &WriteTransaction, name: &str) -> BackendResult<bool> {
    Ok(txn.list_tables()?.any(|table| table.name() == name))
}

/// Evaluate `$body` with `$table` bound to the opened table. Evaluates to
/// `None` when a read transaction finds no such table.
macro_rules! with_table {
    ($self:ident, $def:expr, |$table:ident| $body:expr) => {
        match $self.inner()? {
            Txn::Read(txn) => match txn.open_table($def) {
                Ok($table) => Some($body),
                Err(redb::TableError::TableDoesNotExist(_)) => None,
                Err(e) => return Err(e.into()),
            },
            Txn::Write(txn) => {
                let $table = txn.open_table($def)?;
                Some($body)
            }
        }
    };
}

impl Transaction {
    fn inner(&self) -> BackendResult<&Txn> {
        self.txn.as_ref().ok_or(BackendError::Finished)
    }

    fn writer(&self, op: &'static str) -> Result<&WriteTransaction> {
        match self.inner().map_err(wrap(op))? {
            Txn::Write(txn) => Ok(txn),
            Txn::Read(_) => Err(Error::NotWritable),
        }
    }

    /// Check if this is a write transaction
    #[must_use]
    pub const fn is_write(&self) -> bool {
        matches!(self.txn, Some(Txn::Write(_)))
    }

    // ---- Metadata ----

    pub fn select_meta(&self, key: &str) -> Result<Option<String>> {
        self.try_select_meta(key).map_err(wrap("select meta"))
    }

    fn try_select_meta(&self, key: &str) -> BackendResult<Option<String>> {
        let value = with_table!(self, tables::META, |table| table
            .get(key)?
            .map(|value| value.value().to_string()));
        Ok(value.flatten())
    }

    pub fn insert_or_replace_meta(&self, key: &str, value: &str) -> Result<()> {
        let op = "insert meta";
        let txn = self.writer(op)?;
        (|| -> BackendResult<()> {
            let mut table = txn.open_table(tables::META)?;
            table.insert(key, value)?;
            Ok(())
        })()
        .map_err(wrap(op))
    }

    /// Persisted schema version, 0 if the metadata table doesn't exist or
    /// holds no readable version.
    pub fn select_schema_version(&self) -> Result<i32> {
        let op = "select schema version";
        if let Txn::Write(txn) = self.inner().map_err(wrap(op))? {
            // opening the table in a write transaction would create it
            if !table_exists(txn, tables::META.name()).map_err(wrap(op))? {
                return Ok(0);
            }
        }
        let version = self.select_meta(ReservedMetaKey::Version.as_str())?;
        Ok(version.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// Apply a migration script inside this write transaction.
    pub fn exec_migration(&self, script: &MigrationScript) -> Result<()> {
        let op = "execute migration";
        let txn = self.writer(op)?;
        for statement in script.statements {
            match statement {
                Statement::CreateTable(table) => {
                    table
                        .create(txn)
                        .map_err(|e| Error::backing(op, BackendError::from(e)))?;
                    debug!("Created table {} ({})", table.name(), script.name);
                }
            }
        }
        Ok(())
    }

    // ---- Descriptors ----

    /// Persist a descriptor encoding, or return the id it already has.
    pub fn insert_descriptor_or_get_id(&self, descriptor: &[u8]) -> Result<u64> {
        let op = "insert descriptor";
        let txn = self.writer(op)?;
        (|| -> BackendResult<u64> {
            let mut content = txn.open_table(tables::TRACK_DESCRIPTOR_CONTENT)?;
            let existing = content.get(descriptor)?.map(|id| id.value());
            if let Some(id) = existing {
                return Ok(id);
            }

            let mut descriptors = txn.open_table(tables::TRACK_DESCRIPTOR)?;
            let last = descriptors.last()?.map(|(id, _)| id.value());
            let id = last.map_or(1, |last| last + 1);
            descriptors.insert(id, descriptor)?;
            content.insert(descriptor, id)?;
            Ok(id)
        })()
        .map_err(wrap(op))
    }

    pub fn select_descriptor(&self, id: u64) -> Result<Option<Bytes>> {
        self.try_select_descriptor(id).map_err(wrap("select descriptor"))
    }

    fn try_select_descriptor(&self, id: u64) -> BackendResult<Option<Bytes>> {
        let value = with_table!(self, tables::TRACK_DESCRIPTOR, |table| table
            .get(id)?
            .map(|value| Bytes::copy_from_slice(value.value())));
        Ok(value.flatten())
    }

    // ---- Chunks ----

    pub fn insert_or_replace_chunk(
        &self,
        timestamp: i64,
        descriptor_id: u64,
        chunk: &[u8],
    ) -> Result<()> {
        let op = "insert chunk";
        let txn = self.writer(op)?;
        (|| -> BackendResult<()> {
            let mut table = txn.open_table(tables::TRACK)?;
            table.insert(timestamp, (descriptor_id, chunk))?;
            Ok(())
        })()
        .map_err(wrap(op))
    }

    /// Descriptor id and payload of the chunk at `timestamp`
    pub fn select_chunk_by_timestamp(&self, timestamp: i64) -> Result<Option<(u64, Bytes)>> {
        self.try_select_chunk(timestamp).map_err(wrap("select chunk"))
    }

    fn try_select_chunk(&self, timestamp: i64) -> BackendResult<Option<(u64, Bytes)>> {
        let row = with_table!(self, tables::TRACK, |table| table.get(timestamp)?.map(|value| {
            let (descriptor_id, chunk) = value.value();
            (descriptor_id, Bytes::copy_from_slice(chunk))
        }));
        Ok(row.flatten())
    }

    /// Chunks with `first <= timestamp <= last`, ascending by timestamp
    pub fn select_chunks_in_range(&self, first: i64, last: i64) -> Result<Vec<(i64, u64, Bytes)>> {
        if first > last {
            return Ok(Vec::new());
        }
        self.try_select_chunks_in_range(first, last)
            .map_err(wrap("select chunk range"))
    }

    fn try_select_chunks_in_range(
        &self,
        first: i64,
        last: i64,
    ) -> BackendResult<Vec<(i64, u64, Bytes)>> {
        let rows = with_table!(self, tables::TRACK, |table| {
            let mut rows = Vec::new();
            for entry in table.range(first..=last)? {
                let (timestamp, value) = entry?;
                let (descriptor_id, chunk) = value.value();
                rows.push((timestamp.value(), descriptor_id, Bytes::copy_from_slice(chunk)));
            }
            rows
        });
        Ok(rows.unwrap_or_default())
    }

    /// Largest chunk timestamp, -1 if there are no chunks
    pub fn select_max_timestamp(&self) -> Result<i64> {
        self.try_select_max_timestamp()
            .map_err(wrap("select max timestamp"))
    }

    fn try_select_max_timestamp(&self) -> BackendResult<i64> {
        let last = with_table!(self, tables::TRACK, |table| table
            .last()?
            .map(|(timestamp, _)| timestamp.value()));
        Ok(last.flatten().unwrap_or(-1))
    }

    // ---- Completion ----

    /// Make the changes of a write transaction durable.
    pub fn commit(mut self) -> Result<()> {
        match self.txn.take() {
            Some(Txn::Write(txn)) => txn
                .commit()
                .map_err(|e| Error::backing("commit", BackendError::from(e))),
            Some(Txn::Read(_)) | None => Ok(()),
        }
    }

    /// Discard the changes of a write transaction.
    pub fn rollback(mut self) -> Result<()> {
        match self.txn.take() {
            Some(Txn::Write(txn)) => txn
                .abort()
                .map_err(|e| Error::backing("roll back", BackendError::from(e))),
            Some(Txn::Read(_)) | None => Ok(()),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(Txn::Write(txn)) = self.txn.take()
            && let Err(e) = txn.abort()
        {
            warn!("Failed to roll back abandoned transaction: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration;
    use tempfile::tempdir;

    fn migrated(path: &Path) -> Dao {
        let dao = Dao::open(path, true, &StoreConfig::default()).unwrap();
        let txn = dao.begin(true).unwrap();
        for script in migration::migrations() {
            txn.exec_migration(script).unwrap();
        }
        txn.commit().unwrap();
        dao
    }

    #[test]
    fn test_schema_version_of_fresh_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fresh.mf");
        let dao = Dao::open(&path, true, &StoreConfig::default()).unwrap();

        let txn = dao.begin(true).unwrap();
        assert_eq!(txn.select_schema_version().unwrap(), 0);
        txn.commit().unwrap();

        // the check must not have created the metadata table
        let txn = dao.begin(false).unwrap();
        assert_eq!(txn.select_schema_version().unwrap(), 0);
        assert_eq!(txn.select_meta("ID").unwrap(), None);
    }

    #[test]
    fn test_meta_roundtrip() {
        let dir = tempdir().unwrap();
        let dao = migrated(&dir.path().join("meta.mf"));

        let txn = dao.begin(true).unwrap();
        txn.insert_or_replace_meta("VERSION", "2").unwrap();
        txn.insert_or_replace_meta("site", "north").unwrap();
        txn.insert_or_replace_meta("site", "south").unwrap();
        txn.commit().unwrap();

        let txn = dao.begin(false).unwrap();
        assert_eq!(txn.select_schema_version().unwrap(), 2);
        assert_eq!(txn.select_meta("site").unwrap().as_deref(), Some("south"));
        assert_eq!(txn.select_meta("missing").unwrap(), None);
    }

    #[test]
    fn test_unparsable_version_reads_as_zero() {
        let dir = tempdir().unwrap();
        let dao = migrated(&dir.path().join("version.mf"));
        let txn = dao.begin(true).unwrap();
        txn.insert_or_replace_meta("VERSION", "two").unwrap();
        assert_eq!(txn.select_schema_version().unwrap(), 0);
    }

    #[test]
    fn test_descriptor_ids_are_content_based() {
        let dir = tempdir().unwrap();
        let dao = migrated(&dir.path().join("descriptors.mf"));

        let txn = dao.begin(true).unwrap();
        let a = txn.insert_descriptor_or_get_id(b"first").unwrap();
        let b = txn.insert_descriptor_or_get_id(b"second").unwrap();
        let c = txn.insert_descriptor_or_get_id(b"first").unwrap();
        txn.commit().unwrap();

        assert_eq!((a, b, c), (1, 2, 1));
        let txn = dao.begin(false).unwrap();
        assert_eq!(&txn.select_descriptor(2).unwrap().unwrap()[..], b"second");
        assert!(txn.select_descriptor(3).unwrap().is_none());
    }

    #[test]
    fn test_chunk_rows() {
        let dir = tempdir().unwrap();
        let dao = migrated(&dir.path().join("chunks.mf"));

        let txn = dao.begin(false).unwrap();
        assert_eq!(txn.select_max_timestamp().unwrap(), -1);
        drop(txn);

        let txn = dao.begin(true).unwrap();
        for ts in [5, 1, 3] {
            txn.insert_or_replace_chunk(ts, 1, format!("chunk {ts}").as_bytes())
                .unwrap();
        }
        txn.insert_or_replace_chunk(3, 2, b"replaced").unwrap();
        txn.commit().unwrap();

        let txn = dao.begin(false).unwrap();
        assert_eq!(txn.select_max_timestamp().unwrap(), 5);
        let (descriptor_id, chunk) = txn.select_chunk_by_timestamp(3).unwrap().unwrap();
        assert_eq!(descriptor_id, 2);
        assert_eq!(&chunk[..], b"replaced");
        assert!(txn.select_chunk_by_timestamp(4).unwrap().is_none());

        let timestamps: Vec<i64> = txn
            .select_chunks_in_range(1, 3)
            .unwrap()
            .into_iter()
            .map(|(ts, _, _)| ts)
            .collect();
        assert_eq!(timestamps, [1, 3]);
        assert!(txn.select_chunks_in_range(6, 10).unwrap().is_empty());
        assert!(txn.select_chunks_in_range(5, 1).unwrap().is_empty());
    }

    #[test]
    fn test_dropped_write_is_rolled_back() {
        let dir = tempdir().unwrap();
        let dao = migrated(&dir.path().join("rollback.mf"));

        {
            let txn = dao.begin(true).unwrap();
            txn.insert_or_replace_meta("key", "value").unwrap();
        }
        let txn = dao.begin(true).unwrap();
        txn.insert_or_replace_meta("other", "value").unwrap();
        txn.rollback().unwrap();

        let txn = dao.begin(false).unwrap();
        assert_eq!(txn.select_meta("key").unwrap(), None);
        assert_eq!(txn.select_meta("other").unwrap(), None);
    }

    #[test]
    fn test_read_transactions_cannot_write() {
        let dir = tempdir().unwrap();
        let dao = migrated(&dir.path().join("readonly.mf"));
        let txn = dao.begin(false).unwrap();
        assert!(!txn.is_write());
        assert!(matches!(
            txn.insert_or_replace_meta("key", "value"),
            Err(Error::NotWritable)
        ));
    }

    #[test]
    fn test_read_only_dao() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ro.mf");
        assert!(Dao::open(&path, false, &StoreConfig::default()).is_err());
        assert!(!path.exists());

        drop(migrated(&path));
        let dao = Dao::open(&path, false, &StoreConfig::default()).unwrap();
        assert!(!dao.is_writable());
        assert!(matches!(dao.begin(true), Err(Error::NotWritable)));
    }

    #[test]
    fn test_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("nested.mf");
        Dao::open(&path, true, &StoreConfig::default()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_invalid_config_is_rejected_before_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.mf");
        let config = StoreConfig {
            cache_size_bytes: 0,
            ..StoreConfig::default()
        };
        assert!(matches!(
            Dao::open(&path, true, &config),
            Err(Error::Configuration(_))
        ));
        assert!(!path.exists());
    }
}
