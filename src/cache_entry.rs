//! An internal cache cell, which holds an item and records when it was last used.
//!
//! The timestamp and the retrieval counter are atomics so that lookups can refresh them while the cache is only
//! borrowed immutably, e.g. from behind the read half of a lock.
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::Timestamp;

pub(crate) struct CacheEntry<V> {
    item: Arc<V>,
    size: u64,
    is_volatile: bool,
    last_used: AtomicI64,
    retrieved_count: AtomicU64,
}

impl<V> CacheEntry<V> {
    /// Build an entry whose `stamp` has already had any volatile bias applied.
    pub(crate) fn new(
        item: Arc<V>,
        size: u64,
        is_volatile: bool,
        stamp: Timestamp,
    ) -> CacheEntry<V> {
        CacheEntry {
            item,
            size,
            is_volatile,
            last_used: AtomicI64::new(stamp),
            retrieved_count: AtomicU64::new(0),
        }
    }

    /// read the item, marking it used at `stamp` and returning a reference to the contents.
    pub(crate) fn touch(&self, stamp: Timestamp) -> Arc<V> {
        self.last_used.store(stamp, Ordering::Relaxed);
        self.retrieved_count.fetch_add(1, Ordering::Relaxed);
        self.item.clone()
    }

    pub(crate) fn item(&self) -> &Arc<V> {
        &self.item
    }

    pub(crate) fn into_item(self) -> Arc<V> {
        self.item
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn is_volatile(&self) -> bool {
        self.is_volatile
    }

    pub(crate) fn last_used(&self) -> Timestamp {
        self.last_used.load(Ordering::Relaxed)
    }

    pub(crate) fn retrieved_count(&self) -> u64 {
        self.retrieved_count.load(Ordering::Relaxed)
    }
}

impl<V: std::fmt::Debug> std::fmt::Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("item", &self.item)
            .field("size", &self.size)
            .field("is_volatile", &self.is_volatile)
            .field("last_used", &self.last_used())
            .field("retrieved_count", &self.retrieved_count())
            .finish()
    }
}
