use std::collections::hash_map::Entry;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use rustc_hash::FxHashMap;

use crate::config::FailurePolicy;
use crate::error::ComputeError;
use crate::slot::Slot;
use crate::CacheResult;

/// The driver of a [`ComputationCache`].
///
/// The driver provides the actual computation that is supposed to be cached.
/// It is treated as an opaque black box: it may do I/O, network calls or CPU
/// work, and it may fail with a domain error of its choosing.
pub trait ComputationDriver {
    /// Cache key for the computation.
    type Key: Eq + Hash + Clone + Send + Sync + 'static;
    /// The resulting output of the computation.
    type Output: Send + Sync + 'static;
    /// The error the computation can fail with.
    ///
    /// Errors are shared between all coalesced callers, hence the `Clone`
    /// requirement.
    type Error: Clone + Send + Sync + 'static;

    /// Computes a new value for `key`.
    ///
    /// For any given key this is invoked at most once per epoch, regardless of
    /// how many callers are asking for the key concurrently.
    fn compute(&self, key: Self::Key) -> BoxFuture<'_, Result<Self::Output, Self::Error>>;
}

/// An in-memory cache for async computations, with request coalescing.
///
/// For any given key, the driver's computation runs at most once at a time:
/// the first caller (the *owner*) runs it, everyone else arriving while it is
/// in flight suspends and receives the shared outcome. Distinct keys never
/// block each other; the only cross-key serialization is the momentary
/// slot-map lookup.
///
/// Successful outcomes are memoized until [`invalidate`](Self::invalidate)d.
/// Failed outcomes follow the configured [`FailurePolicy`].
pub struct ComputationCache<D: ComputationDriver> {
    driver: D,
    failure_policy: FailurePolicy,
    slots: Mutex<FxHashMap<D::Key, Arc<Slot<D::Output, D::Error>>>>,
}

impl<D: ComputationDriver> ComputationCache<D> {
    /// Creates a new cache around the given driver.
    pub fn new(driver: D) -> Self {
        ComputationCache {
            driver,
            failure_policy: FailurePolicy::default(),
            slots: Mutex::new(FxHashMap::default()),
        }
    }

    /// Sets the [`FailurePolicy`] for this cache.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Gets the memoized outcome for `key`, computing it if necessary.
    ///
    /// The computation is deduplicated between concurrent calls: whichever
    /// caller registers the slot first runs it, with no lock held, and all
    /// others suspend until the outcome is published. Every caller of the same
    /// epoch observes the identical `Arc`'d value or the identical error.
    ///
    /// # Errors
    ///
    /// Relays the driver's own error as [`ComputeError::Computation`], or
    /// returns [`ComputeError::Cancelled`] if the owning caller was cancelled
    /// mid-computation.
    pub async fn get(&self, key: D::Key) -> CacheResult<D::Output, D::Error> {
        let (slot, is_owner) = {
            let mut slots = self.slots.lock().unwrap();
            match slots.entry(key.clone()) {
                Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
                Entry::Vacant(entry) => {
                    let slot = Arc::new(Slot::new());
                    entry.insert(Arc::clone(&slot));
                    (slot, true)
                }
            }
        };

        if is_owner {
            return self.compute(key, &slot).await;
        }

        match slot.peek() {
            Some(outcome) => outcome,
            None => {
                tracing::trace!("coalescing onto an in-flight computation");
                slot.wait().await
            }
        }
    }

    /// Runs the driver's computation as the owner of `slot` and publishes the
    /// outcome.
    async fn compute(
        &self,
        key: D::Key,
        slot: &Arc<Slot<D::Output, D::Error>>,
    ) -> CacheResult<D::Output, D::Error> {
        // Make sure the slot resolves on *every* exit path. If this future is
        // dropped mid-computation, the guard fails the slot and evicts it, so
        // waiters are released instead of hanging on an abandoned slot.
        let _guard = ResolveGuard {
            cache: self,
            key: &key,
            slot,
        };

        let outcome = match self.driver.compute(key.clone()).await {
            Ok(value) => Ok(Arc::new(value)),
            Err(err) => Err(ComputeError::Computation(err)),
        };

        slot.resolve(outcome.clone());

        if outcome.is_err() && self.failure_policy == FailurePolicy::Evict {
            tracing::debug!("computation failed; evicting the slot");
            self.evict(&key, slot);
        }

        outcome
    }

    /// Removes `slot` from the map, unless a newer epoch replaced it already.
    fn evict(&self, key: &D::Key, slot: &Arc<Slot<D::Output, D::Error>>) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(current) = slots.get(key) {
            if Arc::ptr_eq(current, slot) {
                slots.remove(key);
            }
        }
    }

    /// Removes the memoized outcome for `key`, so the next [`get`](Self::get)
    /// starts a fresh computation.
    ///
    /// An in-flight computation is left untouched: its waiters still observe
    /// the original outcome, and the single-flight guarantee for the running
    /// epoch is preserved. Returns whether an entry was removed.
    pub fn invalidate(&self, key: &D::Key) -> bool {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get(key) {
            if slot.is_resolved() {
                slots.remove(key);
                return true;
            }
        }
        false
    }

    /// Removes all memoized outcomes, keeping in-flight computations intact.
    pub fn clear(&self) {
        let mut slots = self.slots.lock().unwrap();
        slots.retain(|_key, slot| !slot.is_resolved());
    }

    /// A reference to the driver this cache was constructed with.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// The number of slots currently registered, including in-flight ones.
    pub fn entry_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    /// Whether the cache currently holds no slots at all.
    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }
}

impl<D: ComputationDriver> fmt::Debug for ComputationCache<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (entries, in_flight) = self
            .slots
            .try_lock()
            .map(|slots| {
                let in_flight = slots.values().filter(|slot| !slot.is_resolved()).count();
                (slots.len(), in_flight)
            })
            .unwrap_or_default();
        f.debug_struct("ComputationCache")
            .field("entries", &entries)
            .field("in-flight", &in_flight)
            .field("failure_policy", &self.failure_policy)
            .finish()
    }
}

/// Fails and evicts the slot on drop, unless a real outcome was published
/// first.
///
/// This is what turns owner cancellation into [`ComputeError::Cancelled`] for
/// the waiters: dropping the owning `get` future mid-computation drops this
/// guard, which resolves the slot. Resolution is first-write-wins, so on the
/// normal completion path the guard is a no-op.
struct ResolveGuard<'a, D: ComputationDriver> {
    cache: &'a ComputationCache<D>,
    key: &'a D::Key,
    slot: &'a Arc<Slot<D::Output, D::Error>>,
}

impl<D: ComputationDriver> Drop for ResolveGuard<'_, D> {
    fn drop(&mut self) {
        if self.slot.resolve(Err(ComputeError::Cancelled)) {
            tracing::debug!("computation cancelled; releasing its waiters");
            self.cache.evict(self.key, self.slot);
        }
    }
}

/// A [`ComputationDriver`] made from a plain function.
///
/// This is the driver behind [`ComputationCache::from_fn`]; it derives the
/// cache key directly from the function's argument.
pub struct FnDriver<K, V, E, F> {
    compute: F,
    _marker: PhantomData<fn(K) -> Result<V, E>>,
}

impl<K, V, E, F> ComputationDriver for FnDriver<K, V, E, F>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    F: Fn(K) -> BoxFuture<'static, Result<V, E>>,
{
    type Key = K;
    type Output = V;
    type Error = E;

    fn compute(&self, key: K) -> BoxFuture<'_, Result<V, E>> {
        (self.compute)(key)
    }
}

impl<K, V, E, F> ComputationCache<FnDriver<K, V, E, F>>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    F: Fn(K) -> BoxFuture<'static, Result<V, E>>,
{
    /// Creates a cache that computes values with the given function.
    ///
    /// The function receives the key and returns a boxed future resolving to
    /// the value or a domain error; see the crate-level example.
    pub fn from_fn(compute: F) -> Self {
        ComputationCache::new(FnDriver {
            compute,
            _marker: PhantomData,
        })
    }
}
