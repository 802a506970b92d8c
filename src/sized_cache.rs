//! a [SizedCache] is a keyed store which charges every item a size against a fixed capacity, and evicts the least
//! recently used items when an insertion would go over it.
//!
//! Recency is tracked with timestamps from a [Clock] rather than a linked list, because volatile items are stamped in
//! the past: an item which is cheap to regenerate is always considered older than a durable item touched at the same
//! moment, and so goes first.
//!
//! Eviction doesn't stop at the capacity.  It keeps going until usage drops to the low-water mark, so that a cache
//! running near full doesn't have to evict on every insertion.
use std::collections::HashMap;
use std::sync::Arc;

use ahash::RandomState;

use crate::cache_entry::CacheEntry;
use crate::*;

type EntryMap<V> = HashMap<Arc<str>, CacheEntry<V>, RandomState>;

pub struct SizedCache<V> {
    entries: EntryMap<V>,
    /// Past this much we evict.
    capacity: u64,
    /// And we evict down to this much.
    low_water: u64,
    /// Sum of the sizes of everything in `entries`.
    used_capacity: u64,
    volatile_bias: Timestamp,
    clock: Arc<dyn Clock>,
}

impl<V> SizedCache<V> {
    pub fn new(config: &CacheConfig) -> SizedCache<V> {
        SizedCache::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(config: &CacheConfig, clock: Arc<dyn Clock>) -> SizedCache<V> {
        SizedCache {
            entries: Default::default(),
            capacity: config.capacity(),
            low_water: config.low_water(),
            used_capacity: 0,
            volatile_bias: config.volatile_bias_millis(),
            clock,
        }
    }

    /// The timestamp an item with the given volatility gets if it is used right now.
    fn stamp(&self, is_volatile: bool) -> Timestamp {
        let now = self.clock.now();
        if is_volatile {
            now.saturating_sub(self.volatile_bias)
        } else {
            now
        }
    }

    /// Add an entry to the cache.  Return the old item if this key was already present.
    ///
    /// If there isn't room for `size` more bytes, older entries are evicted first; the new entry itself is never a
    /// candidate.  An entry larger than the whole capacity empties the cache and is then stored anyway.
    pub fn put(
        &mut self,
        key: &str,
        value: V,
        size: u64,
        is_volatile: bool,
    ) -> Result<Option<Arc<V>>, CacheError> {
        self.put_shared(key, Arc::new(value), size, is_volatile)
    }

    /// Like [SizedCache::put], for an item the caller already holds behind an `Arc`.
    pub fn put_shared(
        &mut self,
        key: &str,
        value: Arc<V>,
        size: u64,
        is_volatile: bool,
    ) -> Result<Option<Arc<V>>, CacheError> {
        if key.is_empty() {
            return Err(CacheError::MissingKey);
        }
        if size < 1 {
            return Err(CacheError::InvalidSize { size });
        }

        let ret = self.remove(key);
        if self.used_capacity.saturating_add(size) > self.capacity {
            self.make_space(size);
        }

        let entry = CacheEntry::new(value, size, is_volatile, self.stamp(is_volatile));
        self.entries.insert(Arc::from(key), entry);
        self.used_capacity += size;
        Ok(ret)
    }

    /// Get an item, marking it as used.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        let entry = self.entries.get(key)?;
        Some(entry.touch(self.stamp(entry.is_volatile())))
    }

    /// Is this key present?  Unlike [SizedCache::get], this doesn't count as a use.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Arc<V>> {
        let old = self.entries.remove(key)?;
        self.used_capacity -= old.size();
        Some(old.into_item())
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.used_capacity = 0;
    }

    /// Evict entries, oldest first, until usage is at or under the low-water mark and at least `required` bytes are
    /// free.
    ///
    /// Never fails: if that can't be achieved the cache just ends up empty.
    fn make_space(&mut self, required: u64) {
        let mut candidates = self
            .entries
            .iter()
            .map(|(k, e)| (e.last_used(), k.clone()))
            .collect::<Vec<_>>();
        candidates.sort_by_key(|(t, _)| *t);

        let size_at_start = self.used_capacity;
        let mut evicted = 0usize;
        for (_, key) in candidates {
            if self.used_capacity <= self.low_water && self.free_capacity() >= required {
                break;
            }
            self.remove(&key);
            evicted += 1;
        }

        tracing::debug!(
            required,
            capacity = self.capacity,
            low_water = self.low_water,
            size_at_start,
            size_at_end = self.used_capacity,
            evicted,
            "made space in sized cache"
        );
    }

    /// Change the capacity and low-water mark, evicting immediately if usage is now over the capacity.
    pub fn resize(&mut self, capacity: u64, low_water: u64) -> Result<(), CacheError> {
        if capacity == 0 || low_water > capacity {
            return Err(CacheError::InvalidCapacity {
                capacity,
                low_water,
            });
        }

        self.capacity = capacity;
        self.low_water = low_water;
        if self.used_capacity > self.capacity {
            self.make_space(0);
        }
        Ok(())
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn low_water(&self) -> u64 {
        self.low_water
    }

    pub fn used_capacity(&self) -> u64 {
        self.used_capacity
    }

    pub fn free_capacity(&self) -> u64 {
        self.capacity.saturating_sub(self.used_capacity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// How many times has this key been read via [SizedCache::get]?
    pub fn retrieved_count(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|e| e.retrieved_count())
    }

    pub fn is_volatile(&self, key: &str) -> Option<bool> {
        self.entries.get(key).map(|e| e.is_volatile())
    }

    /// Iterator visiting entries in eviction order, i.e. least recently used first.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        let mut sorted = self.entries.iter().collect::<Vec<_>>();
        sorted.sort_by_key(|(_, e)| e.last_used());
        sorted.into_iter().map(|(k, e)| (&**k, &**e.item()))
    }
}

impl<V> std::fmt::Debug for SizedCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizedCache")
            .field("entries", &self.entries.len())
            .field("capacity", &self.capacity)
            .field("low_water", &self.low_water)
            .field("used_capacity", &self.used_capacity)
            .field("volatile_bias", &self.volatile_bias)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use lru::LruCache;
    use proptest::prelude::*;

    use crate::clock::ManualClock;

    fn config(capacity: u64, low_water: u64) -> CacheConfig {
        CacheConfigBuilder::default()
            .capacity(capacity)
            .low_water(low_water)
            .build()
            .expect("Should build")
    }

    fn manual_cache(capacity: u64, low_water: u64) -> (Arc<ManualClock>, SizedCache<u64>) {
        let clock = Arc::new(ManualClock::default());
        let cache = SizedCache::with_clock(&config(capacity, low_water), clock.clone());
        (clock, cache)
    }

    fn keys(cache: &SizedCache<u64>) -> Vec<String> {
        let mut ret = cache
            .iter()
            .map(|(k, _)| k.to_string())
            .collect::<Vec<_>>();
        ret.sort();
        ret
    }

    /// Simple helper to build proptest strategies so that we can test the unit-size case against [LruCache].
    #[derive(Copy, Clone, Debug, Ord, Eq, PartialOrd, PartialEq)]
    enum CacheCommand {
        Put(u64, u64),
        Get(u64),
        Delete(u64),
    }

    fn cache_command_strat(
        max_key: std::ops::Range<u64>,
        max_value: std::ops::Range<u64>,
    ) -> prop::strategy::BoxedStrategy<CacheCommand> {
        proptest::prop_oneof![
            max_key.clone().prop_map(CacheCommand::Get),
            (max_key.clone(), max_value).prop_map(|(x, y)| CacheCommand::Put(x, y)),
            max_key.prop_map(CacheCommand::Delete),
        ]
        .boxed()
    }

    #[derive(Clone, Debug)]
    enum SizedCommand {
        Put(u64, u64, bool),
        Delete(u64),
    }

    fn sized_command_strat() -> prop::strategy::BoxedStrategy<SizedCommand> {
        proptest::prop_oneof![
            (0..20u64, 1..=40u64, any::<bool>())
                .prop_map(|(k, s, v)| SizedCommand::Put(k, s, v)),
            (0..20u64).prop_map(SizedCommand::Delete),
        ]
        .boxed()
    }

    // When the low-water mark equals the capacity and every item costs 1, eviction removes exactly one item per
    // insertion into a full cache, which is exactly what a bounded `[LruCache]` does.
    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            max_shrink_iters: 100000,
            ..Default::default()
        })]
        #[test]
        fn test_against_lru_cache_bounded(
            bound in 1..200u64,
            commands in prop::collection::vec(cache_command_strat(0..100, 0..10000), 0..2000)
        ) {
            let mut known_good = LruCache::<u64, u64>::new(bound as usize);
            let mut ours = SizedCache::<u64>::with_clock(&config(bound, bound), Arc::new(LogicalClock::new()));

            for c in commands {
                use CacheCommand::*;

                let key = format!("{}", match c { Get(k) | Put(k, _) | Delete(k) => k });
                match c {
                    Get(k) => {
                        let left: Option<u64> = known_good.get(&k).cloned();
                        let right: Option<u64> = ours.get(&key).as_deref().cloned();
                        prop_assert_eq!(left, right);
                    },
                    Put(k, v) => {
                        let right = ours.put(&key, v, 1, false).unwrap().as_deref().cloned();
                        prop_assert_eq!(known_good.put(k, v), right);
                    },
                    Delete(k) => prop_assert_eq!(known_good.pop(&k), ours.remove(&key).as_deref().cloned()),
                }

                prop_assert_eq!(known_good.len(), ours.len());
            }
        }

        #[test]
        fn test_used_capacity_is_sum_of_sizes(
            low_water in 0..=100u64,
            commands in prop::collection::vec(sized_command_strat(), 0..500)
        ) {
            let mut cache = SizedCache::<u64>::with_clock(&config(100, low_water), Arc::new(LogicalClock::new()));

            for c in commands {
                match c {
                    SizedCommand::Put(k, size, volatile) => {
                        cache.put(&format!("{}", k), k, size, volatile).unwrap();
                        prop_assert!(cache.used_capacity() <= cache.capacity());
                    }
                    SizedCommand::Delete(k) => {
                        cache.remove(&format!("{}", k));
                    }
                }

                let sum = cache.entries.values().map(|e| e.size()).sum::<u64>();
                prop_assert_eq!(sum, cache.used_capacity());
                prop_assert_eq!(cache.free_capacity(), cache.capacity() - sum);
            }
        }
    }

    #[test]
    fn test_rejects_invalid_arguments() {
        let (_, mut cache) = manual_cache(100, 80);
        assert_eq!(cache.put("", 1, 10, false), Err(CacheError::MissingKey));
        assert_eq!(
            cache.put("a", 1, 0, false),
            Err(CacheError::InvalidSize { size: 0 })
        );
        assert!(cache.is_empty());
        assert_eq!(cache.used_capacity(), 0);
        assert!(cache.get("").is_none());
    }

    #[test]
    fn test_replace_credits_old_size() {
        let (_, mut cache) = manual_cache(100, 80);
        assert!(cache.put("a", 1, 60, false).unwrap().is_none());
        // Replacing with an entry which only fits once the old one is gone must not evict anything else.
        cache.put("b", 2, 30, false).unwrap();
        let old = cache.put("a", 3, 70, false).unwrap();
        assert_eq!(old.as_deref(), Some(&1));
        assert_eq!(cache.used_capacity(), 100);
        assert_eq!(keys(&cache), vec!["a", "b"]);
        assert_eq!(cache.get("a").as_deref(), Some(&3));
    }

    #[test]
    fn test_remove() {
        let (_, mut cache) = manual_cache(100, 80);
        cache.put("a", 1, 10, false).unwrap();
        assert!(cache.remove("missing").is_none());
        assert_eq!(cache.remove("a").as_deref(), Some(&1));
        assert_eq!(cache.used_capacity(), 0);
        assert!(!cache.contains("a"));
    }

    #[test]
    fn test_scenario_low_water() {
        let (clock, mut cache) = manual_cache(100, 80);
        clock.set(1);
        cache.put("A", 1, 50, false).unwrap();
        clock.set(2);
        cache.put("B", 2, 50, false).unwrap();
        assert_eq!(cache.used_capacity(), 100);

        clock.set(3);
        cache.put("C", 3, 30, true).unwrap();
        assert_eq!(keys(&cache), vec!["B", "C"]);
        assert_eq!(cache.used_capacity(), 80);
        assert_eq!(cache.free_capacity(), 20);
    }

    // Evicting goes oldest-first, and past the capacity down to the low-water mark.
    #[test]
    fn test_eviction_order() {
        let mut cache =
            SizedCache::<u64>::with_clock(&config(10, 6), Arc::new(LogicalClock::new()));
        for (i, k) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            cache.put(k, i as u64, 2, false).unwrap();
        }
        assert_eq!(cache.used_capacity(), 10);

        // Makes "a" the most recent.
        cache.get("a").unwrap();
        let order = cache.iter().map(|(k, _)| k.to_string()).collect::<Vec<_>>();
        assert_eq!(order, vec!["b", "c", "d", "e", "a"]);

        cache.put("f", 5, 2, false).unwrap();
        assert_eq!(keys(&cache), vec!["a", "d", "e", "f"]);
        assert_eq!(cache.used_capacity(), 8);
    }

    #[test]
    fn test_eviction_frees_required_space() {
        let mut cache =
            SizedCache::<u64>::with_clock(&config(100, 90), Arc::new(LogicalClock::new()));
        for i in 0..10u64 {
            cache.put(&format!("{}", i), i, 10, false).unwrap();
        }

        // Getting under the low-water mark only needs one eviction, but we need room for 35.
        cache.put("big", 99, 35, false).unwrap();
        assert_eq!(
            keys(&cache),
            vec!["4", "5", "6", "7", "8", "9", "big"]
        );
        assert_eq!(cache.used_capacity(), 95);
    }

    #[test]
    fn test_volatile_evicted_before_durable() {
        let (clock, mut cache) = manual_cache(100, 100);
        clock.set(10);
        cache.put("durable", 1, 50, false).unwrap();
        cache.put("volatile", 2, 50, true).unwrap();

        clock.set(11);
        cache.put("new", 3, 10, false).unwrap();
        assert_eq!(keys(&cache), vec!["durable", "new"]);
    }

    // Touching a volatile entry keeps it backdated, so it can't overtake a durable one that was used at the same time.
    #[test]
    fn test_volatile_touch_keeps_bias() {
        let (clock, mut cache) = manual_cache(100, 100);
        clock.set(100_000);
        cache.put("volatile", 1, 50, true).unwrap();
        cache.put("durable", 2, 50, false).unwrap();

        clock.set(100_500);
        assert_eq!(cache.get("volatile").as_deref(), Some(&1));
        assert_eq!(cache.retrieved_count("volatile"), Some(1));
        assert_eq!(cache.is_volatile("volatile"), Some(true));

        clock.set(101_000);
        cache.put("new", 3, 10, false).unwrap();
        assert_eq!(keys(&cache), vec!["durable", "new"]);
    }

    #[test]
    fn test_contains_does_not_touch() {
        let (clock, mut cache) = manual_cache(20, 20);
        clock.set(1);
        cache.put("a", 1, 10, false).unwrap();
        clock.set(2);
        cache.put("b", 2, 10, false).unwrap();

        clock.set(3);
        assert!(cache.contains("a"));
        assert_eq!(cache.retrieved_count("a"), Some(0));

        clock.set(4);
        cache.put("c", 3, 10, false).unwrap();
        assert_eq!(keys(&cache), vec!["b", "c"]);
    }

    #[test]
    fn test_oversized_entry_empties_cache() {
        let (_, mut cache) = manual_cache(100, 80);
        cache.put("a", 1, 40, false).unwrap();
        cache.put("b", 2, 40, false).unwrap();
        cache.put("huge", 3, 150, false).unwrap();
        assert_eq!(keys(&cache), vec!["huge"]);
        assert_eq!(cache.used_capacity(), 150);
        assert_eq!(cache.free_capacity(), 0);
    }

    #[test]
    fn test_resize() {
        let mut cache =
            SizedCache::<u64>::with_clock(&config(100, 100), Arc::new(LogicalClock::new()));
        for i in 0..10u64 {
            cache.put(&format!("{}", i), i, 10, false).unwrap();
        }

        assert_eq!(
            cache.resize(10, 20),
            Err(CacheError::InvalidCapacity {
                capacity: 10,
                low_water: 20
            })
        );
        assert_eq!(cache.capacity(), 100);

        cache.resize(50, 30).unwrap();
        assert_eq!(cache.low_water(), 30);
        assert_eq!(keys(&cache), vec!["7", "8", "9"]);

        // Growing never evicts.
        cache.resize(1000, 900).unwrap();
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_clear() {
        let (_, mut cache) = manual_cache(100, 80);
        cache.put("a", 1, 10, false).unwrap();
        cache.put("b", 2, 10, true).unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.used_capacity(), 0);
        assert_eq!(cache.free_capacity(), 100);
    }
}
