//! The [ResourceCache] is the shareable face of a [SizedCache]: it puts the cache behind a lock so that one writer
//! (usually a [RetrievalCoordinator]) and any number of readers on the render path can use it at once, and it accepts
//! any [ResourceKey] in place of a raw string.
//!
//! Lookups only take the read half of the lock.  Marking an entry as used is done with atomics, so readers never
//! contend with each other.
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::*;

/// A handle naming an image which can be fetched and decoded, e.g. a map tile.
///
/// Only the key matters to the cache; two sources with the same key are the same resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageSource {
    key: Arc<str>,
}

impl ImageSource {
    pub fn new(key: impl Into<Arc<str>>) -> ImageSource {
        ImageSource { key: key.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl ResourceKey for ImageSource {
    fn cache_key(&self) -> &str {
        &self.key
    }
}

pub struct ResourceCache<R> {
    inner: RwLock<SizedCache<R>>,
}

impl<R> ResourceCache<R> {
    pub fn new(config: &CacheConfig) -> ResourceCache<R> {
        ResourceCache {
            inner: RwLock::new(SizedCache::new(config)),
        }
    }

    pub fn with_clock(config: &CacheConfig, clock: Arc<dyn Clock>) -> ResourceCache<R> {
        ResourceCache {
            inner: RwLock::new(SizedCache::with_clock(config, clock)),
        }
    }

    // Nothing panics while holding these locks, but a caller's `Drop` impl might; the bookkeeping is still consistent
    // in that case.
    fn read(&self) -> RwLockReadGuard<'_, SizedCache<R>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SizedCache<R>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a resource, evicting as needed.  Returns whatever was previously cached under this key.
    pub fn put<K: ResourceKey + ?Sized>(
        &self,
        key: &K,
        resource: R,
        size: u64,
        is_volatile: bool,
    ) -> Result<Option<Arc<R>>, CacheError> {
        self.write().put(key.cache_key(), resource, size, is_volatile)
    }

    /// Insert a resource which knows its own size.
    pub fn put_estimated<K: ResourceKey + ?Sized>(
        &self,
        key: &K,
        resource: R,
        is_volatile: bool,
    ) -> Result<Option<Arc<R>>, CacheError>
    where
        R: EstimateCost,
    {
        let size = resource.estimate_cost();
        self.put(key, resource, size, is_volatile)
    }

    pub fn get<K: ResourceKey + ?Sized>(&self, key: &K) -> Option<Arc<R>> {
        self.read().get(key.cache_key())
    }

    /// Get a resource, or build and insert it if it isn't cached.
    ///
    /// `make` runs without any lock held and returns the resource along with its size.  Two threads missing at the
    /// same time may both build; the later insertion wins.
    pub fn get_or_insert_with<K, F>(
        &self,
        key: &K,
        is_volatile: bool,
        make: F,
    ) -> Result<Arc<R>, CacheError>
    where
        K: ResourceKey + ?Sized,
        F: FnOnce() -> (R, u64),
    {
        if let Some(x) = self.get(key) {
            return Ok(x);
        }

        let (resource, size) = make();
        let resource = Arc::new(resource);
        self.write()
            .put_shared(key.cache_key(), resource.clone(), size, is_volatile)?;
        Ok(resource)
    }

    pub fn contains<K: ResourceKey + ?Sized>(&self, key: &K) -> bool {
        self.read().contains(key.cache_key())
    }

    pub fn remove<K: ResourceKey + ?Sized>(&self, key: &K) -> Option<Arc<R>> {
        self.write().remove(key.cache_key())
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn resize(&self, capacity: u64, low_water: u64) -> Result<(), CacheError> {
        self.write().resize(capacity, low_water)
    }

    pub fn capacity(&self) -> u64 {
        self.read().capacity()
    }

    pub fn low_water(&self) -> u64 {
        self.read().low_water()
    }

    pub fn used_capacity(&self) -> u64 {
        self.read().used_capacity()
    }

    pub fn free_capacity(&self) -> u64 {
        self.read().free_capacity()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn retrieved_count<K: ResourceKey + ?Sized>(&self, key: &K) -> Option<u64> {
        self.read().retrieved_count(key.cache_key())
    }
}

impl<R> std::fmt::Debug for ResourceCache<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ResourceCache").field(&*self.read()).finish()
    }
}
