//! Container store
//!
//! A [`Store`] owns one container file. It validates or upgrades the schema
//! on open, keeps the store identity, and runs every read and write inside
//! exactly one backing transaction. Mutating operations and state changes are
//! serialized by a per-store lock.

use crate::cache::DescriptorCache;
use crate::dao::{Dao, Transaction};
use crate::migration;
use multiflex_common::{Error, ReservedMetaKey, Result, StoreConfig, StoreId};
use multiflex_format::{Chunk, ChunkBuilder, Descriptor, DescriptorBuilder};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifecycle state of a store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreState {
    Initial,
    OpenReadOnly,
    OpenReadWrite,
    Closed,
}

impl StoreState {
    const fn is_open(self) -> bool {
        matches!(self, Self::OpenReadOnly | Self::OpenReadWrite)
    }
}

struct StoreInner {
    state: StoreState,
    dao: Option<Dao>,
    id: Option<StoreId>,
    schema_version: i32,
    cache: DescriptorCache,
    /// Descriptor of the most recently read or written chunk
    last_used: Option<Arc<Descriptor>>,
}

/// Open handles needed by an operation
struct Session<'a> {
    dao: &'a Dao,
    store_id: StoreId,
    cache: &'a mut DescriptorCache,
    last_used: &'a mut Option<Arc<Descriptor>>,
}

impl StoreInner {
    fn session(&mut self, write: bool) -> Result<Session<'_>> {
        match self.state {
            StoreState::OpenReadWrite => {}
            StoreState::OpenReadOnly if !write => {}
            StoreState::OpenReadOnly => return Err(Error::NotWritable),
            StoreState::Initial | StoreState::Closed => return Err(Error::StoreClosed),
        }
        let (Some(dao), Some(store_id)) = (self.dao.as_ref(), self.id) else {
            return Err(Error::StoreClosed);
        };
        Ok(Session {
            dao,
            store_id,
            cache: &mut self.cache,
            last_used: &mut self.last_used,
        })
    }

    fn close(&mut self) {
        if self.state.is_open() {
            self.last_used = None;
            self.cache.clear();
            // dropping the database releases the file lock
            self.dao = None;
            info!("Store closed");
        }
        self.state = StoreState::Closed;
    }
}

/// Run `task` inside one transaction, committing on success and rolling back
/// on failure.
fn transact<T>(
    dao: &Dao,
    write: bool,
    task: impl FnOnce(&Transaction) -> Result<T>,
) -> Result<T> {
    let txn = dao.begin(write)?;
    match task(&txn) {
        Ok(value) => {
            txn.commit()?;
            Ok(value)
        }
        Err(err) => match txn.rollback() {
            Ok(()) => Err(err),
            Err(rollback) => Err(err.with_suppressed(rollback)),
        },
    }
}

/// Resolve a descriptor id, reusing the last used descriptor when it matches.
fn resolve_descriptor(
    txn: &Transaction,
    session: &mut Session<'_>,
    descriptor_id: u64,
) -> Result<Arc<Descriptor>> {
    if let Some(last) = session.last_used.as_ref()
        && last.persisted_id() == descriptor_id
    {
        return Ok(Arc::clone(last));
    }
    let descriptor = session.cache.get(txn, session.store_id, descriptor_id)?;
    *session.last_used = Some(Arc::clone(&descriptor));
    Ok(descriptor)
}

/// Parse a persisted store identity
fn parse_identity(value: Option<String>) -> Result<StoreId> {
    let value = value.ok_or_else(|| Error::invalid_identity("store id not present"))?;
    StoreId::parse(&value)
}

/// Bring the schema up to date and load (or create) the store identity.
fn update_schema(txn: &Transaction) -> Result<(i32, StoreId)> {
    let mut version = txn.select_schema_version()?;
    let expected = migration::expected_version();
    let migrated = version < expected;

    for script in migration::pending(version) {
        let from_version = version;
        let apply = || -> Result<()> {
            txn.exec_migration(script)?;
            txn.insert_or_replace_meta(
                ReservedMetaKey::Version.as_str(),
                &(from_version + 1).to_string(),
            )
        };
        apply().map_err(|source| Error::MigrationFailed {
            from_version,
            script: script.name.to_string(),
            source: Box::new(source),
        })?;
        version += 1;
        info!("Migrated schema from version {} to {}", from_version, version);
    }

    let existing = txn.select_meta(ReservedMetaKey::Id.as_str())?;
    let id = if existing.is_none() && migrated {
        let id = StoreId::new();
        txn.insert_or_replace_meta(ReservedMetaKey::Id.as_str(), &id.to_string())?;
        info!("Created store identity {}", id);
        id
    } else {
        parse_identity(existing)?
    };
    Ok((version, id))
}

/// Check that the schema is current and load the store identity.
fn validate_schema(txn: &Transaction) -> Result<(i32, StoreId)> {
    let version = txn.select_schema_version()?;
    let expected = migration::expected_version();
    if version < expected {
        return Err(Error::SchemaTooOld { version, expected });
    }
    let id = parse_identity(txn.select_meta(ReservedMetaKey::Id.as_str())?)?;
    Ok((version, id))
}

/// Time-series chunk store backed by a single container file
pub struct Store {
    path: PathBuf,
    config: StoreConfig,
    inner: Mutex<StoreInner>,
}

impl Store {
    /// Create a store for the container at `path` with default settings.
    ///
    /// Nothing is touched on disk until [`Store::open`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_config(path, StoreConfig::default())
    }

    /// Create a store for the container at `path`
    pub fn with_config(path: impl Into<PathBuf>, config: StoreConfig) -> Self {
        let cache = DescriptorCache::new(config.descriptor_cache_capacity);
        Self {
            path: path.into(),
            config,
            inner: Mutex::new(StoreInner {
                state: StoreState::Initial,
                dao: None,
                id: None,
                schema_version: 0,
                cache,
                last_used: None,
            }),
        }
    }

    /// Open the container.
    ///
    /// A writable open creates the file if needed and migrates it to the
    /// current schema. A read-only open never writes and fails with
    /// [`Error::SchemaTooOld`] on containers that still need migration.
    /// A store can only be opened once; on failure it ends up closed.
    pub fn open(&self, writable: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != StoreState::Initial {
            return Err(Error::AlreadyOpened);
        }

        let dao = match Dao::open(&self.path, writable, &self.config) {
            Ok(dao) => dao,
            Err(err) => {
                inner.state = StoreState::Closed;
                return Err(err);
            }
        };

        let initialized = if writable {
            transact(&dao, true, update_schema)
        } else {
            transact(&dao, false, validate_schema)
        };
        inner.dao = Some(dao);
        inner.state = if writable {
            StoreState::OpenReadWrite
        } else {
            StoreState::OpenReadOnly
        };

        match initialized {
            Ok((version, id)) => {
                inner.schema_version = version;
                inner.id = Some(id);
                info!(
                    "Opened store {} at {} (schema version {}, writable: {})",
                    id,
                    self.path.display(),
                    version,
                    writable
                );
                Ok(())
            }
            Err(err) => {
                warn!("Failed to open store at {}: {}", self.path.display(), err);
                inner.close();
                Err(err)
            }
        }
    }

    /// Close the store. Further operations fail with [`Error::StoreClosed`].
    pub fn close(&self) {
        self.inner.lock().close();
    }

    /// Persist a chunk, replacing any chunk with the same timestamp.
    pub fn put(&self, chunk: &Chunk) -> Result<()> {
        let mut inner = self.inner.lock();
        let session = inner.session(true)?;
        let descriptor = chunk.descriptor().for_store(session.store_id);

        let Session {
            dao,
            store_id,
            cache,
            last_used,
        } = session;
        let result = transact(dao, true, |txn| {
            let descriptor = cache.intern(txn, store_id, &descriptor)?;
            txn.insert_or_replace_chunk(
                chunk.timestamp(),
                descriptor.persisted_id(),
                chunk.payload(),
            )?;
            Ok(descriptor)
        });

        match result {
            Ok(descriptor) => {
                debug!(
                    "Stored chunk {} with descriptor {}",
                    chunk.timestamp(),
                    descriptor.persisted_id()
                );
                *last_used = Some(descriptor);
                Ok(())
            }
            Err(err) => {
                // ids interned in the rolled back transaction are gone
                cache.clear();
                *last_used = None;
                Err(err)
            }
        }
    }

    /// Find the chunk stored at exactly `timestamp`
    pub fn find_by_timestamp(&self, timestamp: i64) -> Result<Option<Chunk>> {
        let mut inner = self.inner.lock();
        let mut session = inner.session(false)?;
        let dao = session.dao;
        transact(dao, false, |txn| {
            let Some((descriptor_id, payload)) = txn.select_chunk_by_timestamp(timestamp)? else {
                return Ok(None);
            };
            let descriptor = resolve_descriptor(txn, &mut session, descriptor_id)?;
            Ok(Some(Chunk::from_parts(descriptor, timestamp, payload)))
        })
    }

    /// Find all chunks with `first <= timestamp <= last`, ascending
    pub fn find_by_timestamp_range(&self, first: i64, last: i64) -> Result<Vec<Chunk>> {
        let mut inner = self.inner.lock();
        let mut session = inner.session(false)?;
        let dao = session.dao;
        transact(dao, false, |txn| {
            txn.select_chunks_in_range(first, last)?
                .into_iter()
                .map(|(timestamp, descriptor_id, payload)| {
                    let descriptor = resolve_descriptor(txn, &mut session, descriptor_id)?;
                    Ok(Chunk::from_parts(descriptor, timestamp, payload))
                })
                .collect()
        })
    }

    /// Largest stored timestamp, -1 if the store holds no chunks
    pub fn find_max_timestamp(&self) -> Result<i64> {
        let mut inner = self.inner.lock();
        let session = inner.session(false)?;
        transact(session.dao, false, Transaction::select_max_timestamp)
    }

    /// Store epoch in microseconds, -1 if it has not been set
    pub fn get_epoch(&self) -> Result<i64> {
        let mut inner = self.inner.lock();
        let session = inner.session(false)?;
        let value = transact(session.dao, false, |txn| {
            txn.select_meta(ReservedMetaKey::EpochMicros.as_str())
        })?;
        value.map_or(Ok(-1), |value| {
            value
                .parse()
                .map_err(|e| Error::corrupt(format!("invalid epoch \"{value}\": {e}")))
        })
    }

    /// Set the store epoch. The epoch can only be set once.
    pub fn set_epoch(&self, epoch_micros: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        let session = inner.session(true)?;
        if epoch_micros < 0 {
            return Err(Error::invalid_argument(format!(
                "negative epoch specified: {epoch_micros}"
            )));
        }
        transact(session.dao, true, |txn| {
            let key = ReservedMetaKey::EpochMicros.as_str();
            if txn.select_meta(key)?.is_some() {
                return Err(Error::EpochAlreadySet);
            }
            txn.insert_or_replace_meta(key, &epoch_micros.to_string())
        })?;
        info!("Set store epoch to {}", epoch_micros);
        Ok(())
    }

    /// Read a metadata value
    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock();
        let session = inner.session(false)?;
        transact(session.dao, false, |txn| txn.select_meta(key))
    }

    /// Write a metadata value. Reserved keys are rejected.
    pub fn put_meta(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let session = inner.session(true)?;
        if ReservedMetaKey::is_reserved(key) {
            return Err(Error::ReservedKey(key.to_string()));
        }
        transact(session.dao, true, |txn| txn.insert_or_replace_meta(key, value))
    }

    /// Descriptor builder scoped to this store
    pub fn descriptor_builder(&self) -> Result<DescriptorBuilder> {
        let id = self.id().ok_or(Error::StoreClosed)?;
        Ok(DescriptorBuilder::for_store(id))
    }

    /// Chunk builder for `descriptor`, re-scoped to this store
    pub fn chunk_builder(&self, descriptor: &Arc<Descriptor>) -> Result<ChunkBuilder> {
        let id = self.id().ok_or(Error::StoreClosed)?;
        Ok(Chunk::builder(descriptor.for_store(id)))
    }

    /// Store identity, known once the store is open
    pub fn id(&self) -> Option<StoreId> {
        let inner = self.inner.lock();
        if inner.state.is_open() { inner.id } else { None }
    }

    /// Schema version of the open container
    pub fn version(&self) -> i32 {
        self.inner.lock().schema_version
    }

    pub fn state(&self) -> StoreState {
        self.inner.lock().state
    }

    pub fn is_writable(&self) -> bool {
        self.state() == StoreState::OpenReadWrite
    }

    /// Path of the container file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.inner.get_mut().close();
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
