use std::error::Error as StdError;

/// Contract violations reported synchronously by the cache and the coordinator.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache keys must not be empty")]
    MissingKey,
    #[error("resource size must be at least 1, got {size}")]
    InvalidSize { size: u64 },
    #[error("invalid capacity {capacity} with low-water mark {low_water}")]
    InvalidCapacity { capacity: u64, low_water: u64 },
}

/// An opaque failure reported by a fetch.
///
/// The coordinator never hands this back to whoever called `ensure`; it only records the key as absent and logs it.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct FetchError(Box<dyn StdError + Send + Sync + 'static>);

impl FetchError {
    pub fn new<E: StdError + Send + Sync + 'static>(error: E) -> FetchError {
        FetchError(Box::new(error))
    }

    /// Build an error out of a plain message.
    pub fn msg(message: impl Into<String>) -> FetchError {
        let message: String = message.into();
        FetchError(message.into())
    }
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        FetchError::new(e)
    }
}
