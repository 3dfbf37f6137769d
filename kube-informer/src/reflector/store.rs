use super::ObjectRef;
use ahash::AHashMap;
use parking_lot::RwLock;
use std::{fmt, sync::Arc};

type Cache<K> = Arc<RwLock<AHashMap<ObjectRef, Arc<K>>>>;

/// A writable Store handle
///
/// This is exclusive since it's not safe to share a single `Store` between multiple writers.
/// The informer's drain loop owns the only `Writer`; everything else reads through [`Store`].
pub struct Writer<K: 'static> {
    store: Cache<K>,
}

impl<K: 'static> Default for Writer<K> {
    fn default() -> Self {
        Self {
            store: Arc::default(),
        }
    }
}

impl<K: 'static> fmt::Debug for Writer<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer").field("len", &self.store.read().len()).finish()
    }
}

impl<K: 'static> Writer<K> {
    /// Return a read handle to the store
    ///
    /// Multiple read handles may be obtained, by either calling `as_reader` multiple times,
    /// or by calling `Store::clone()` afterwards.
    #[must_use]
    pub fn as_reader(&self) -> Store<K> {
        Store {
            store: self.store.clone(),
        }
    }

    /// Insert or overwrite the entry for `key`, returning the entry it replaced
    pub fn update(&mut self, key: ObjectRef, obj: Arc<K>) -> Option<Arc<K>> {
        self.store.write().insert(key, obj)
    }

    /// Remove the entry for `key`, returning the last known object
    pub fn delete(&mut self, key: &ObjectRef) -> Option<Arc<K>> {
        self.store.write().remove(key)
    }
}

/// A readable cache of objects of kind `K`
///
/// Cloning will produce a new reference to the same backing store.
///
/// Cannot be constructed directly since one writer handle is required,
/// use `Writer::as_reader()` instead.
pub struct Store<K: 'static> {
    store: Cache<K>,
}

impl<K: 'static> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<K: 'static> fmt::Debug for Store<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("len", &self.len()).finish()
    }
}

impl<K: 'static> Store<K> {
    /// Retrieve the latest known entry referred to by `key`, if it is in the cache.
    ///
    /// `key.namespace` is ignored for cluster-scoped resources.
    ///
    /// Note that this is a cache and may be stale. Deleted objects may still exist in the cache
    /// despite having been deleted in the cluster, and new objects may not yet exist in the cache.
    /// Wait for [`has_synced`](crate::InformerHandle::has_synced) before relying on completeness.
    #[must_use]
    pub fn get(&self, key: &ObjectRef) -> Option<Arc<K>> {
        let store = self.store.read();
        store
            .get(key)
            // Try to erase the namespace and try again, in case the object is cluster-scoped
            .or_else(|| {
                store.get(&{
                    let mut cluster_key = key.clone();
                    cluster_key.namespace = None;
                    cluster_key
                })
            })
            .cloned()
    }

    /// Return a full snapshot of the current values
    ///
    /// The snapshot is a point-in-time copy: later writes are not reflected in it.
    #[must_use]
    pub fn state(&self) -> Vec<Arc<K>> {
        self.store.read().values().cloned().collect()
    }

    /// Return the identities of every cached object
    #[must_use]
    pub fn keys(&self) -> Vec<ObjectRef> {
        self.store.read().keys().cloned().collect()
    }

    /// Whether an entry exists for exactly `key`
    #[must_use]
    pub fn contains(&self, key: &ObjectRef) -> bool {
        self.store.read().contains_key(key)
    }

    /// Return the number of elements in the store
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    /// Return whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }
}
