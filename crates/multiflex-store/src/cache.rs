//! Descriptor cache
//!
//! Maps persisted descriptor ids to decoded descriptors and descriptor
//! encodings to ids, so repeated puts and reads with the same descriptor
//! don't go back to the database. Every operation runs inside the caller's
//! transaction and never commits on its own.

use crate::dao::Transaction;
use bytes::Bytes;
use multiflex_common::{Error, Result, StoreId};
use multiflex_format::Descriptor;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Store-local descriptor cache
#[derive(Debug)]
pub struct DescriptorCache {
    /// Maximum number of entries (0 = unbounded)
    capacity: usize,
    by_id: HashMap<u64, Arc<Descriptor>>,
    by_content: HashMap<Bytes, u64>,
}

impl DescriptorCache {
    /// Create an empty cache holding at most `capacity` descriptors
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            by_id: HashMap::new(),
            by_content: HashMap::new(),
        }
    }

    /// Number of cached descriptors
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Look up a persisted descriptor, reading it from the database on a miss.
    pub fn get(
        &mut self,
        txn: &Transaction,
        store_id: StoreId,
        id: u64,
    ) -> Result<Arc<Descriptor>> {
        if let Some(descriptor) = self.by_id.get(&id) {
            return Ok(Arc::clone(descriptor));
        }

        debug!("Descriptor cache miss for id {}", id);
        let encoded = txn
            .select_descriptor(id)?
            .ok_or(Error::DescriptorNotFound(id))?;
        let descriptor = Arc::new(Descriptor::decode(&encoded, id, Some(store_id))?);
        self.insert(encoded, Arc::clone(&descriptor));
        Ok(descriptor)
    }

    /// Persist a descriptor unless it already has an id in this store.
    ///
    /// Returns the descriptor scoped to `store_id` and carrying its persisted
    /// id. Descriptors with identical tracks always receive the same id.
    pub fn intern(
        &mut self,
        txn: &Transaction,
        store_id: StoreId,
        descriptor: &Arc<Descriptor>,
    ) -> Result<Arc<Descriptor>> {
        let scoped = descriptor.for_store(store_id);
        if scoped.is_persisted() {
            return Ok(scoped);
        }

        let encoded = scoped.encode();
        if let Some(cached) = self
            .by_content
            .get(&encoded)
            .and_then(|id| self.by_id.get(id))
        {
            return Ok(Arc::clone(cached));
        }

        let id = txn.insert_descriptor_or_get_id(&encoded)?;
        debug!("Interned descriptor with {} tracks as id {}", scoped.len(), id);
        let persisted = Arc::new(scoped.with_persisted_id(id));
        self.insert(encoded, Arc::clone(&persisted));
        Ok(persisted)
    }

    /// Drop all entries
    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_content.clear();
    }

    fn insert(&mut self, encoded: Bytes, descriptor: Arc<Descriptor>) {
        if self.capacity != 0 && self.by_id.len() >= self.capacity {
            debug!("Descriptor cache full ({} entries), clearing", self.by_id.len());
            self.clear();
        }
        let id = descriptor.persisted_id();
        self.by_content.insert(encoded, id);
        self.by_id.insert(id, descriptor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::Dao;
    use crate::migration;
    use multiflex_common::{Encoding, StoreConfig};
    use tempfile::tempdir;

    fn migrated(path: &std::path::Path) -> Dao {
        let dao = Dao::open(path, true, &StoreConfig::default()).unwrap();
        let txn = dao.begin(true).unwrap();
        for script in migration::migrations() {
            txn.exec_migration(script).unwrap();
        }
        txn.commit().unwrap();
        dao
    }

    fn descriptor(tracks: &[(i32, Encoding)]) -> Arc<Descriptor> {
        let mut builder = Descriptor::builder();
        for &(id, encoding) in tracks {
            builder.add_track(id, encoding);
        }
        Arc::new(builder.build().unwrap())
    }

    #[test]
    fn test_intern_is_idempotent() {
        let dir = tempdir().unwrap();
        let dao = migrated(&dir.path().join("intern.mf"));
        let store = StoreId::new();
        let mut cache = DescriptorCache::new(0);

        let txn = dao.begin(true).unwrap();
        let a = descriptor(&[(1, Encoding::Binary), (2, Encoding::Int32VarByte)]);
        let b = descriptor(&[(2, Encoding::Int32VarByte), (1, Encoding::Binary)]);
        let c = descriptor(&[(1, Encoding::Utf8String)]);

        let first = cache.intern(&txn, store, &a).unwrap();
        let second = cache.intern(&txn, store, &b).unwrap();
        let third = cache.intern(&txn, store, &c).unwrap();
        txn.commit().unwrap();

        assert_eq!(first.persisted_id(), 1);
        assert_eq!(second.persisted_id(), 1);
        assert_eq!(third.persisted_id(), 2);
        assert_eq!(first.store_id(), Some(store));
        // the caller's descriptor is left untouched
        assert!(!a.is_persisted());

        // a fresh cache must find the same id in the database
        let mut cache = DescriptorCache::new(0);
        let txn = dao.begin(true).unwrap();
        assert_eq!(cache.intern(&txn, store, &b).unwrap().persisted_id(), 1);
    }

    #[test]
    fn test_persisted_descriptor_is_returned_as_is() {
        let dir = tempdir().unwrap();
        let dao = migrated(&dir.path().join("persisted.mf"));
        let store = StoreId::new();
        let mut cache = DescriptorCache::new(0);

        let txn = dao.begin(true).unwrap();
        let persisted = cache
            .intern(&txn, store, &descriptor(&[(3, Encoding::Binary)]))
            .unwrap();
        let again = cache.intern(&txn, store, &persisted).unwrap();
        assert!(Arc::ptr_eq(&persisted, &again));

        // a descriptor of another store has to be interned again
        let foreign = Arc::new(persisted.for_store(StoreId::new()).with_persisted_id(77));
        let interned = cache.intern(&txn, store, &foreign).unwrap();
        assert_eq!(interned.persisted_id(), 1);
    }

    #[test]
    fn test_get_reads_through() {
        let dir = tempdir().unwrap();
        let dao = migrated(&dir.path().join("get.mf"));
        let store = StoreId::new();

        let txn = dao.begin(true).unwrap();
        let original = descriptor(&[
            (7, Encoding::Int32DeltaVarByte),
            (9, Encoding::Utf8String),
        ]);
        let id = DescriptorCache::new(0)
            .intern(&txn, store, &original)
            .unwrap()
            .persisted_id();
        txn.commit().unwrap();

        let mut cache = DescriptorCache::new(0);
        let txn = dao.begin(false).unwrap();
        let loaded = cache.get(&txn, store, id).unwrap();
        assert_eq!(loaded.tracks(), original.tracks());
        assert_eq!(loaded.store_id(), Some(store));
        assert_eq!(cache.len(), 1);

        let cached = cache.get(&txn, store, id).unwrap();
        assert!(Arc::ptr_eq(&loaded, &cached));

        assert!(cache.get(&txn, store, 99).unwrap_err().is_not_found());
    }

    #[test]
    fn test_capacity_bounds_entries() {
        let dir = tempdir().unwrap();
        let dao = migrated(&dir.path().join("capacity.mf"));
        let store = StoreId::new();
        let mut cache = DescriptorCache::new(2);

        let txn = dao.begin(true).unwrap();
        for id in 0..5 {
            cache
                .intern(&txn, store, &descriptor(&[(id, Encoding::Binary)]))
                .unwrap();
            assert!(cache.len() <= 2);
        }
        // evicted entries are found again by content
        let first = cache
            .intern(&txn, store, &descriptor(&[(0, Encoding::Binary)]))
            .unwrap();
        assert_eq!(first.persisted_id(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }
}
