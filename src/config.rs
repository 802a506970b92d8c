//! Construction-time configuration shared by the cache and the retrieval coordinator.
use std::time::Duration;

use crate::clock::Timestamp;

/// Default hard capacity of a cache, in bytes.
pub const DEFAULT_CAPACITY: u64 = 4_000_000;
/// Default eviction target, in bytes.
pub const DEFAULT_LOW_WATER: u64 = 3_500_000;
/// Default number of fetches allowed to be outstanding at once.
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 8;
/// Default amount by which volatile entries are backdated.
pub const DEFAULT_VOLATILE_BIAS: Duration = Duration::from_secs(60);

/// Build one with [CacheConfigBuilder] or take [CacheConfig::default]; fields are read-only outside the crate so that
/// every config has passed validation.
#[derive(Clone, Debug, derive_builder::Builder)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct CacheConfig {
    /// Hard limit on the summed size of resident entries, in bytes.
    #[builder(default = "DEFAULT_CAPACITY")]
    pub(crate) capacity: u64,
    /// Eviction keeps going until usage is at or below this mark.
    ///
    /// Setting it below `capacity` leaves headroom so that not every insertion has to evict.
    #[builder(default = "DEFAULT_LOW_WATER")]
    pub(crate) low_water: u64,
    /// Upper bound on fetches started by a coordinator and not yet completed.
    #[builder(default = "DEFAULT_MAX_CONCURRENT_FETCHES")]
    pub(crate) max_concurrent_fetches: usize,
    /// How far into the past volatile entries are stamped on insertion and on every lookup.
    #[builder(default = "DEFAULT_VOLATILE_BIAS")]
    pub(crate) volatile_bias: Duration,
}

impl CacheConfig {
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn low_water(&self) -> u64 {
        self.low_water
    }

    pub fn max_concurrent_fetches(&self) -> usize {
        self.max_concurrent_fetches
    }

    pub fn volatile_bias(&self) -> Duration {
        self.volatile_bias
    }

    /// The volatile bias expressed in clock units.
    pub fn volatile_bias_millis(&self) -> Timestamp {
        self.volatile_bias.as_millis().min(Timestamp::MAX as u128) as Timestamp
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            capacity: DEFAULT_CAPACITY,
            low_water: DEFAULT_LOW_WATER,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            volatile_bias: DEFAULT_VOLATILE_BIAS,
        }
    }
}

impl CacheConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        let capacity = self.capacity.unwrap_or(DEFAULT_CAPACITY);
        let low_water = self.low_water.unwrap_or(DEFAULT_LOW_WATER);
        if capacity == 0 {
            return Err("capacity must be at least 1 byte".into());
        }
        if low_water > capacity {
            return Err(format!(
                "low-water mark {} exceeds capacity {}",
                low_water, capacity
            ));
        }
        if self.max_concurrent_fetches == Some(0) {
            return Err("max_concurrent_fetches must be at least 1".into());
        }
        Ok(())
    }
}
