//! The [RetrievalCoordinator] decides whether a resource should be fetched, runs the fetch on a tokio runtime, and
//! stores the result in a [ResourceCache].
//!
//! It keeps two pieces of bookkeeping behind a single mutex:
//!
//! - the keys with a fetch in flight, so that asking for the same key again while it's being fetched does nothing, and
//!   so that no more than `max_concurrent_fetches` fetches run at once;
//! - the keys whose fetch failed.  These are *absent*: they are not retried until someone calls
//!   [RetrievalCoordinator::clear_absent], so a source which can't serve a key isn't asked over and over.
//!
//! [RetrievalCoordinator::ensure] never waits on a fetch.  It is meant to be called from a render loop every frame for
//! every resource that frame wants, and simply returns an [Admission] saying what it did.  The outcome of a started
//! fetch is reported as a [Completion] through the returned `JoinHandle`, which callers are free to drop.
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ahash::RandomState;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinHandle};

use crate::*;

/// What a successful fetch produced.
#[derive(Debug)]
pub struct Fetched<R> {
    pub resource: R,
    /// Cost charged against the cache's capacity.
    pub size: u64,
    /// Whether to call the coordinator's [UpdateNotifier] once this is cached.
    pub notify: bool,
}

impl<R> Fetched<R> {
    pub fn new(resource: R, size: u64) -> Fetched<R> {
        Fetched {
            resource,
            size,
            notify: true,
        }
    }

    /// Cache the resource without announcing it, e.g. when prefetching.
    pub fn quietly(self) -> Fetched<R> {
        Fetched {
            notify: false,
            ..self
        }
    }
}

/// What [RetrievalCoordinator::ensure] did with a request.
#[derive(Debug)]
pub enum Admission {
    /// A fetch was started.
    Started(JoinHandle<Completion>),
    /// The resource is already cached.
    Cached,
    /// A fetch for this key is already running.
    InFlight,
    /// The last fetch for this key failed.
    Absent,
    /// Too many fetches are running; ask again later.
    Throttled,
}

impl Admission {
    pub fn is_started(&self) -> bool {
        matches!(self, Admission::Started(_))
    }
}

/// How a started fetch ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    /// The resource is now in the cache.
    Cached,
    /// The fetch succeeded but the cache refused the resource.  The key is not marked absent.
    Dropped,
    /// The fetch failed or panicked, and the key is now absent.
    Failed,
    /// The key was force-failed while this fetch was running, so its result was thrown away.
    Superseded,
}

struct InFlightFetch {
    /// Distinguishes this fetch from later ones for the same key.
    ticket: u64,
    abort: Option<AbortHandle>,
}

#[derive(Default)]
struct RetrievalState {
    in_flight: HashMap<Arc<str>, InFlightFetch, RandomState>,
    absent: HashSet<Arc<str>, RandomState>,
    next_ticket: u64,
}

struct Shared<R> {
    cache: Arc<ResourceCache<R>>,
    notifier: Box<dyn UpdateNotifier>,
    state: Mutex<RetrievalState>,
    max_concurrent_fetches: usize,
    runtime: Handle,
}

pub struct RetrievalCoordinator<R> {
    shared: Arc<Shared<R>>,
}

impl<R> Clone for RetrievalCoordinator<R> {
    fn clone(&self) -> Self {
        RetrievalCoordinator {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R> std::fmt::Debug for RetrievalCoordinator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (in_flight, absent) = self
            .shared
            .state
            .try_lock()
            .map(|s| (s.in_flight.len(), s.absent.len()))
            .unwrap_or_default();
        f.debug_struct("RetrievalCoordinator")
            .field("cache", &self.shared.cache)
            .field("in_flight", &in_flight)
            .field("absent", &absent)
            .field("max_concurrent_fetches", &self.shared.max_concurrent_fetches)
            .finish()
    }
}

/// Holds a fetch's slot in the in-flight map until the fetch completes.
///
/// If the fetch never gets to complete because its task was dropped, e.g. by runtime shutdown, the slot is released on
/// drop.  The key is not marked absent in that case.
struct InFlightSlot<R: Send + Sync + 'static> {
    coordinator: Option<RetrievalCoordinator<R>>,
    key: Arc<str>,
    ticket: u64,
}

impl<R: Send + Sync + 'static> InFlightSlot<R> {
    fn complete(
        mut self,
        outcome: Result<Result<Fetched<R>, FetchError>, Box<dyn Any + Send>>,
    ) -> Completion {
        match self.coordinator.take() {
            Some(c) => c.complete(&self.key, self.ticket, outcome),
            None => Completion::Superseded,
        }
    }
}

impl<R: Send + Sync + 'static> Drop for InFlightSlot<R> {
    fn drop(&mut self) {
        if let Some(c) = self.coordinator.take() {
            c.release(&self.key, self.ticket);
        }
    }
}

impl<R: Send + Sync + 'static> RetrievalCoordinator<R> {
    /// Build a coordinator which stores into `cache` and spawns its fetches on `runtime`.
    ///
    /// Only `max_concurrent_fetches` is read from `config`; the cache was configured when it was built.
    pub fn new(
        cache: Arc<ResourceCache<R>>,
        notifier: impl UpdateNotifier,
        config: &CacheConfig,
        runtime: Handle,
    ) -> RetrievalCoordinator<R> {
        RetrievalCoordinator {
            shared: Arc::new(Shared {
                cache,
                notifier: Box::new(notifier),
                state: Default::default(),
                max_concurrent_fetches: config.max_concurrent_fetches(),
                runtime,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RetrievalState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Make sure the resource for `key` is cached or on its way, starting a fetch with `produce` if warranted.
    ///
    /// `produce` is only called when a fetch is actually started.  Its future runs on the coordinator's runtime.
    /// Everything the fetch does after that is reported through the [Completion] of the returned handle; the only
    /// error returned here is for an empty key.
    pub fn ensure<K, F, Fut>(&self, key: &K, produce: F) -> Result<Admission, CacheError>
    where
        K: ResourceKey + ?Sized,
        F: FnOnce(Arc<str>) -> Fut,
        Fut: Future<Output = Result<Fetched<R>, FetchError>> + Send + 'static,
    {
        let key = key.cache_key();
        if key.is_empty() {
            return Err(CacheError::MissingKey);
        }

        // Checked under the state lock: a completion removes its key from `in_flight` and caches it while holding
        // the same lock, so the key is always seen as one or the other.
        let mut state = self.state();
        if self.shared.cache.contains(key) {
            return Ok(Admission::Cached);
        }
        if state.in_flight.contains_key(key) {
            return Ok(Admission::InFlight);
        }
        if state.absent.contains(key) {
            return Ok(Admission::Absent);
        }
        if state.in_flight.len() >= self.shared.max_concurrent_fetches {
            tracing::trace!(key, in_flight = state.in_flight.len(), "fetch throttled");
            return Ok(Admission::Throttled);
        }

        let key: Arc<str> = Arc::from(key);
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state
            .in_flight
            .insert(key.clone(), InFlightFetch { ticket, abort: None });
        drop(state);

        tracing::trace!(key = &*key, ticket, "spawning fetch");
        let slot = InFlightSlot {
            coordinator: Some(self.clone()),
            key: key.clone(),
            ticket,
        };
        // A panic while building the future counts as a failed fetch, same as one while polling it.
        let fetch: BoxFuture<'static, _> =
            match std::panic::catch_unwind(AssertUnwindSafe(|| produce(key.clone()))) {
                Ok(fetch) => AssertUnwindSafe(fetch).catch_unwind().boxed(),
                Err(panic) => future::ready(Err(panic)).boxed(),
            };
        let task = async move {
            let outcome = fetch.await;
            slot.complete(outcome)
        };
        let handle = self.shared.runtime.spawn(task);

        // The fetch may already have finished, or been force-failed, in which case there's nothing to attach to.
        if let Some(f) = self.state().in_flight.get_mut(&key) {
            if f.ticket == ticket {
                f.abort = Some(handle.abort_handle());
            }
        }

        Ok(Admission::Started(handle))
    }

    /// Record the outcome of the fetch holding `ticket`.
    fn complete(
        &self,
        key: &Arc<str>,
        ticket: u64,
        outcome: Result<Result<Fetched<R>, FetchError>, Box<dyn Any + Send>>,
    ) -> Completion {
        let mut state = self.state();
        match state.in_flight.get(key) {
            Some(f) if f.ticket == ticket => {}
            _ => {
                tracing::debug!(key = &**key, ticket, "discarding superseded fetch");
                return Completion::Superseded;
            }
        }
        state.in_flight.remove(key);

        match outcome {
            Ok(Ok(Fetched {
                resource,
                size,
                notify,
            })) => {
                // Stored while the state is still locked, so nobody can observe the key as neither in flight nor
                // cached and start a second fetch.
                if let Err(e) = self.shared.cache.put(key, resource, size, false) {
                    drop(state);
                    tracing::error!(key = &**key, error = %e, "fetched resource rejected by cache");
                    return Completion::Dropped;
                }
                state.absent.remove(key);
                drop(state);

                tracing::info!(key = &**key, size, "resource retrieval succeeded");
                if notify {
                    self.shared.notifier.notify_updated();
                }
                Completion::Cached
            }
            Ok(Err(e)) => {
                state.absent.insert(key.clone());
                drop(state);
                tracing::warn!(key = &**key, error = %e, "resource retrieval failed");
                Completion::Failed
            }
            Err(_) => {
                state.absent.insert(key.clone());
                drop(state);
                tracing::warn!(key = &**key, "resource retrieval panicked");
                Completion::Failed
            }
        }
    }

    /// Give up a fetch slot that was never completed.
    fn release(&self, key: &Arc<str>, ticket: u64) {
        let mut state = self.state();
        if matches!(state.in_flight.get(key), Some(f) if f.ticket == ticket) {
            state.in_flight.remove(key);
            tracing::debug!(key = &**key, ticket, "fetch cancelled before completing");
        }
    }

    /// Treat the fetch in flight for `key` as failed: abort it, free its slot, and mark the key absent.
    ///
    /// Returns `false` if nothing was in flight for the key.
    pub fn force_fail<K: ResourceKey + ?Sized>(&self, key: &K) -> bool {
        let key = key.cache_key();
        let mut state = self.state();
        let fetch = match state.in_flight.remove(key) {
            Some(f) => f,
            None => return false,
        };
        if let Some(abort) = fetch.abort {
            abort.abort();
        }
        state.absent.insert(Arc::from(key));
        drop(state);

        tracing::warn!(key, "resource retrieval forced to fail");
        true
    }

    /// Allow `key` to be fetched again.  Returns whether it was absent.
    pub fn clear_absent<K: ResourceKey + ?Sized>(&self, key: &K) -> bool {
        self.state().absent.remove(key.cache_key())
    }

    pub fn clear_all_absent(&self) {
        self.state().absent.clear();
    }

    pub fn is_absent<K: ResourceKey + ?Sized>(&self, key: &K) -> bool {
        self.state().absent.contains(key.cache_key())
    }

    pub fn is_in_flight<K: ResourceKey + ?Sized>(&self, key: &K) -> bool {
        self.state().in_flight.contains_key(key.cache_key())
    }

    pub fn in_flight_count(&self) -> usize {
        self.state().in_flight.len()
    }

    pub fn absent_count(&self) -> usize {
        self.state().absent.len()
    }

    pub fn max_concurrent_fetches(&self) -> usize {
        self.shared.max_concurrent_fetches
    }

    /// The cache fetched resources are stored in.
    pub fn cache(&self) -> &Arc<ResourceCache<R>> {
        &self.shared.cache
    }
}
