//! A memory-bounded cache for expensive resources such as decoded images and rendered textures, plus a coordinator
//! which fetches missing resources into it without duplicating or flooding requests.
//!
//! Rendering code tends to ask for the same handful of large objects every frame.  Fetching or decoding them each time
//! is costly, and a plain map of keys to objects grows forever.  This crate provides:
//!
//! [SizedCache] is the low-level building block.  Each item is charged a size; when an insertion would go over the
//! capacity, the least recently used items are evicted until usage is down to a lower low-water mark.  Items can be
//! inserted as *volatile*, meaning they are cheap to regenerate (a rendered text label, say).  Volatile items are
//! always stamped as if they were last used a fixed bias in the past, so under pressure they are evicted before durable
//! items which were actually used at the same time.
//!
//! [ResourceCache] wraps a [SizedCache] behind a read-write lock so it can be shared between a writer and the render
//! path, and accepts any [ResourceKey], such as an [ImageSource], in place of a raw string key.
//!
//! [RetrievalCoordinator] fetches into a [ResourceCache] on a tokio runtime.  It runs at most one fetch per key, at
//! most a configured number of fetches overall, and remembers which keys failed so that they aren't fetched again
//! until cleared.
//!
//! Everything is configured through one [CacheConfig].
mod cache_entry;
mod clock;
mod config;
mod error;
mod resource_cache;
mod retrieval;
mod sized_cache;
mod traits;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use resource_cache::*;
pub use retrieval::*;
pub use sized_cache::*;
pub use traits::*;
