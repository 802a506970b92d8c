//! The seams between the cache and the code around it.
//!
//! [ResourceKey] turns whatever the caller identifies a resource by into the string the cache is keyed on,
//! [EstimateCost] lets a resource report its own size, and [UpdateNotifier] is how the coordinator tells the outside
//! world that something new landed in the cache.
use std::sync::Arc;

/// Anything which can name a cached resource.
pub trait ResourceKey {
    /// The canonical string key.
    fn cache_key(&self) -> &str;
}

impl ResourceKey for str {
    fn cache_key(&self) -> &str {
        self
    }
}

impl ResourceKey for String {
    fn cache_key(&self) -> &str {
        self.as_str()
    }
}

impl ResourceKey for Arc<str> {
    fn cache_key(&self) -> &str {
        self
    }
}

///Estimate the cost of an item.  This is usually in bytes.
///
/// The caches in this crate will cache up to a specified total cost, then begin evicting entries which are least
/// recently used.
pub trait EstimateCost {
    fn estimate_cost(&self) -> u64;
}

/// Receives a signal every time a fetch lands in the cache and asked to be announced, typically to schedule a redraw.
///
/// Called from the fetch task with no locks held.  It must not block.
pub trait UpdateNotifier: Send + Sync + 'static {
    fn notify_updated(&self);
}

impl<F: Fn() + Send + Sync + 'static> UpdateNotifier for F {
    fn notify_updated(&self) {
        self()
    }
}
