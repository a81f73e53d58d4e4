use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tokio::sync::{Barrier, Notify};
use tokio::time::{Instant, sleep, timeout};

use crate::{ComputationCache, ComputationDriver, ComputeError, FailurePolicy};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("compute failed: {0}")]
struct TestError(&'static str);

fn hash(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Sleeps for a bit, then hashes the key. Keys starting with `bad` fail.
struct HashDriver {
    calls: AtomicUsize,
    delay: Duration,
}

impl HashDriver {
    fn new(delay: Duration) -> Self {
        HashDriver {
            calls: AtomicUsize::new(0),
            delay,
        }
    }
}

impl ComputationDriver for HashDriver {
    type Key = String;
    type Output = u64;
    type Error = TestError;

    fn compute(&self, key: String) -> BoxFuture<'_, Result<u64, TestError>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let delay = self.delay;
        async move {
            sleep(delay).await;
            if key.starts_with("bad") {
                return Err(TestError("boom"));
            }
            Ok(hash(&key))
        }
        .boxed()
    }
}

#[tokio::test(start_paused = true)]
async fn test_single_flight() {
    let cache = ComputationCache::new(HashDriver::new(Duration::from_millis(100)));

    let start = Instant::now();
    let results = join_all((0..50).map(|_| cache.get("X".to_owned()))).await;

    // 50 concurrent callers, one computation, one shared result instance.
    assert_eq!(cache.driver().calls.load(Ordering::Relaxed), 1);
    let first = results[0].as_ref().unwrap();
    assert_eq!(**first, hash("X"));
    for result in &results {
        assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
    }

    // All callers were served by the single 100ms computation, not 50 of them
    // back to back.
    assert!(start.elapsed() < Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn test_idempotent_read() {
    let cache = ComputationCache::new(HashDriver::new(Duration::from_millis(10)));

    let first = cache.get("X".to_owned()).await.unwrap();
    let second = cache.get("X".to_owned()).await.unwrap();

    assert_eq!(cache.driver().calls.load(Ordering::Relaxed), 1);
    assert!(Arc::ptr_eq(&first, &second));
}

/// Both computations rendezvous on a two-party barrier, so the test only
/// completes if they are in flight at the same time.
struct RendezvousDriver {
    barrier: Barrier,
}

impl ComputationDriver for RendezvousDriver {
    type Key = String;
    type Output = String;
    type Error = TestError;

    fn compute(&self, key: String) -> BoxFuture<'_, Result<String, TestError>> {
        async move {
            self.barrier.wait().await;
            Ok(key)
        }
        .boxed()
    }
}

#[tokio::test(start_paused = true)]
async fn test_cross_key_parallelism() {
    let cache = ComputationCache::new(RendezvousDriver {
        barrier: Barrier::new(2),
    });

    let results = timeout(
        Duration::from_secs(5),
        futures::future::join(cache.get("foo".to_owned()), cache.get("bar".to_owned())),
    )
    .await
    .expect("computations for distinct keys did not overlap");

    assert_eq!(*results.0.unwrap(), "foo");
    assert_eq!(*results.1.unwrap(), "bar");
}

#[tokio::test(start_paused = true)]
async fn test_failure_sharing() {
    let cache = ComputationCache::new(HashDriver::new(Duration::from_millis(100)));

    let results = join_all((0..10).map(|_| cache.get("bad".to_owned()))).await;

    // One failing computation, and every caller of the burst observes it.
    assert_eq!(cache.driver().calls.load(Ordering::Relaxed), 1);
    for result in results {
        assert_eq!(
            result.unwrap_err(),
            ComputeError::Computation(TestError("boom"))
        );
    }

    // The failed slot was evicted, so the next burst retries.
    let result = cache.get("bad".to_owned()).await;
    assert_eq!(cache.driver().calls.load(Ordering::Relaxed), 2);
    assert_eq!(
        result.unwrap_err(),
        ComputeError::Computation(TestError("boom"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_failures_retained() {
    let cache = ComputationCache::new(HashDriver::new(Duration::from_millis(100)))
        .with_failure_policy(FailurePolicy::Retain);

    let results = join_all((0..10).map(|_| cache.get("bad".to_owned()))).await;
    for result in results {
        assert_eq!(
            result.unwrap_err(),
            ComputeError::Computation(TestError("boom"))
        );
    }

    // The error is memoized: later calls observe it without re-computation.
    let result = cache.get("bad".to_owned()).await;
    assert_eq!(cache.driver().calls.load(Ordering::Relaxed), 1);
    assert_eq!(
        result.unwrap_err(),
        ComputeError::Computation(TestError("boom"))
    );

    // Until the entry is explicitly invalidated.
    assert!(cache.invalidate(&"bad".to_owned()));
    let _result = cache.get("bad".to_owned()).await;
    assert_eq!(cache.driver().calls.load(Ordering::Relaxed), 2);
}

/// Stalls forever on the first call, succeeds immediately afterwards.
struct StallingDriver {
    calls: AtomicUsize,
    started: Notify,
}

impl ComputationDriver for StallingDriver {
    type Key = String;
    type Output = u64;
    type Error = TestError;

    fn compute(&self, _key: String) -> BoxFuture<'_, Result<u64, TestError>> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        async move {
            self.started.notify_one();
            if call == 0 {
                std::future::pending().await
            } else {
                Ok(42)
            }
        }
        .boxed()
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_releases_waiters() {
    let cache = Arc::new(ComputationCache::new(StallingDriver {
        calls: AtomicUsize::new(0),
        started: Notify::new(),
    }));

    let owner = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.get("k".to_owned()).await })
    };
    cache.driver().started.notified().await;

    let waiter = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.get("k".to_owned()).await })
    };
    // Give the waiter a chance to park on the pending slot.
    sleep(Duration::from_millis(10)).await;

    // Aborting the owner drops its computation mid-flight. The waiter must be
    // released with a cancellation error, not hang forever.
    owner.abort();
    let outcome = timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter was not released after owner cancellation")
        .unwrap();
    let err = outcome.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err, ComputeError::Cancelled);

    // The abandoned slot was evicted, so the next call computes afresh.
    let result = cache.get("k".to_owned()).await.unwrap();
    assert_eq!(*result, 42);
    assert_eq!(cache.driver().calls.load(Ordering::Relaxed), 2);
}

/// Blocks each computation until the test releases the gate.
struct GatedDriver {
    calls: AtomicUsize,
    started: Notify,
    gate: Notify,
}

impl GatedDriver {
    fn new() -> Self {
        GatedDriver {
            calls: AtomicUsize::new(0),
            started: Notify::new(),
            gate: Notify::new(),
        }
    }
}

impl ComputationDriver for GatedDriver {
    type Key = String;
    type Output = u64;
    type Error = TestError;

    fn compute(&self, _key: String) -> BoxFuture<'_, Result<u64, TestError>> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        async move {
            self.started.notify_one();
            self.gate.notified().await;
            Ok(call as u64)
        }
        .boxed()
    }
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_ignores_in_flight_slots() {
    let cache = Arc::new(ComputationCache::new(GatedDriver::new()));

    let owner = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.get("k".to_owned()).await })
    };
    cache.driver().started.notified().await;

    // Invalidating mid-flight is a no-op: the running epoch keeps its slot.
    assert!(!cache.invalidate(&"k".to_owned()));
    assert_eq!(cache.entry_count(), 1);

    cache.driver().gate.notify_one();
    let result = owner.await.unwrap().unwrap();
    assert_eq!(*result, 0);

    // Once the slot is resolved, invalidation removes it and the next call
    // starts a new epoch.
    assert!(cache.invalidate(&"k".to_owned()));
    cache.driver().gate.notify_one();
    let result = cache.get("k".to_owned()).await.unwrap();
    assert_eq!(*result, 1);
    assert_eq!(cache.driver().calls.load(Ordering::Relaxed), 2);
}

#[tokio::test(start_paused = true)]
async fn test_clear() {
    let cache = ComputationCache::new(HashDriver::new(Duration::from_millis(1)));

    cache.get("a".to_owned()).await.unwrap();
    cache.get("b".to_owned()).await.unwrap();
    assert_eq!(cache.entry_count(), 2);

    cache.clear();
    assert!(cache.is_empty());

    cache.get("a".to_owned()).await.unwrap();
    assert_eq!(cache.driver().calls.load(Ordering::Relaxed), 3);
}

#[tokio::test]
async fn test_from_fn() {
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = {
        let calls = Arc::clone(&calls);
        ComputationCache::from_fn(move |key: String| {
            calls.fetch_add(1, Ordering::Relaxed);
            async move { Ok::<_, TestError>(key.len()) }.boxed()
        })
    };

    let results = join_all((0..8).map(|_| cache.get("hello".to_owned()))).await;
    for result in results {
        assert_eq!(*result.unwrap(), 5);
    }
    assert_eq!(calls.load(Ordering::Relaxed), 1);
}
