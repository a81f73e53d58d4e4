//! Stress test for the request-coalescing cache.
//!
//! Hammers a single [`ComputationCache`] from a configurable number of
//! concurrent callers over a bounded key space, with a simulated computation
//! latency and optional failure injection and key churn. At the end it reports
//! throughput and how many calls were coalesced per underlying computation.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use coalesce::{ComputationCache, ComputationDriver, FailurePolicy};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Semaphore;

/// Command line interface parser.
#[derive(Debug, Parser)]
struct Cli {
    /// Number of concurrent callers hammering the cache.
    #[arg(long, short = 'c', default_value_t = 256)]
    concurrency: usize,

    /// Number of distinct keys in the workload.
    #[arg(long, short = 'k', default_value_t = 64)]
    keys: u64,

    /// Duration of the stresstest.
    #[arg(long, short = 'd', value_parser = humantime::parse_duration, default_value = "10s")]
    duration: Duration,

    /// Simulated latency of a single computation.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "25ms")]
    compute_time: Duration,

    /// Fail every n-th computation (0 disables failure injection).
    #[arg(long, default_value_t = 0)]
    fail_every: usize,

    /// Invalidate the key after every n-th completed call (0 disables churn).
    #[arg(long, default_value_t = 0)]
    invalidate_every: usize,

    /// Memoize failures instead of evicting them.
    #[arg(long)]
    retain_failures: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("computation {0} was injected to fail")]
struct InjectedFailure(usize);

/// Simulates an expensive computation: sleeps for a while, then mixes the key
/// bits into a result value.
struct StressDriver {
    computations: AtomicUsize,
    compute_time: Duration,
    fail_every: usize,
}

impl ComputationDriver for StressDriver {
    type Key = u64;
    type Output = u64;
    type Error = InjectedFailure;

    fn compute(&self, key: u64) -> BoxFuture<'_, Result<u64, InjectedFailure>> {
        let run = self.computations.fetch_add(1, Ordering::Relaxed);
        let compute_time = self.compute_time;
        let fail_every = self.fail_every;
        async move {
            tokio::time::sleep(compute_time).await;
            if fail_every > 0 && run % fail_every == fail_every - 1 {
                return Err(InjectedFailure(run));
            }
            Ok(key.wrapping_mul(0x9E37_79B9_7F4A_7C15))
        }
        .boxed()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let failure_policy = if cli.retain_failures {
        FailurePolicy::Retain
    } else {
        FailurePolicy::Evict
    };
    let cache = Arc::new(
        ComputationCache::new(StressDriver {
            computations: AtomicUsize::new(0),
            compute_time: cli.compute_time,
            fail_every: cli.fail_every,
        })
        .with_failure_policy(failure_policy),
    );

    let completed = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let semaphore = Arc::new(Semaphore::new(cli.concurrency));

    let start = Instant::now();
    let deadline = tokio::time::Instant::from_std(start + cli.duration);

    // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    let mut dispatched: u64 = 0;
    loop {
        tokio::select! {
            permit = semaphore.clone().acquire_owned() => {
                let permit = permit.expect("the semaphore is never closed");
                let key = dispatched % cli.keys;
                dispatched += 1;

                let cache = Arc::clone(&cache);
                let completed = Arc::clone(&completed);
                let failed = Arc::clone(&failed);
                let invalidate_every = cli.invalidate_every;

                tokio::spawn(async move {
                    if let Err(err) = cache.get(key).await {
                        failed.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(%err, key, "call observed a failure");
                    }

                    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    if invalidate_every > 0 && done % invalidate_every == 0 {
                        cache.invalidate(&key);
                    }

                    drop(permit);
                });
            }
            _ = &mut sleep => {
                break;
            }
        }
    }

    // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
    let _permits = semaphore.acquire_many(cli.concurrency as u32).await?;

    let elapsed = start.elapsed();
    let calls = completed.load(Ordering::Relaxed);
    let failures = failed.load(Ordering::Relaxed);
    let computations = cache.driver().computations.load(Ordering::Relaxed);

    let calls_ps = calls as f64 / elapsed.as_secs_f64();
    println!("{calls} calls in {elapsed:.2?} ({calls_ps:.1} calls/s)");
    if computations > 0 {
        let ratio = calls as f64 / computations as f64;
        println!("{computations} underlying computations ({ratio:.1} calls per computation)");
    }
    println!("{failures} calls observed a failure");

    Ok(())
}
