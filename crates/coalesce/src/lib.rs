//! # Request-coalescing computation cache
//!
//! This crate provides [`ComputationCache`], an in-memory cache for expensive,
//! possibly failing async computations. Its central guarantee is *single-flight*
//! execution: for any given key, the computation runs at most once no matter how
//! many callers ask for it concurrently. All coalesced callers observe the same
//! result (or the same error), and computations for distinct keys proceed fully
//! in parallel.
//!
//! ## How a request flows
//!
//! A call to [`ComputationCache::get`] goes through the following steps:
//! - It atomically looks up or creates the *slot* for the key. The lookup and
//!   the insert are a single operation under the map lock, which is the only
//!   serialization point shared between keys.
//! - The caller that created the slot (the *owner*) runs the computation with
//!   no lock held, then publishes the outcome into the slot exactly once.
//! - Every other caller (a *waiter*) suspends on the slot until the outcome is
//!   published, then reads it. Waiters never run the computation themselves.
//!
//! Successful outcomes stay in the cache and are served without re-computation
//! until [`ComputationCache::invalidate`] removes them. What happens to failed
//! outcomes is controlled by [`FailurePolicy`].
//!
//! ## Cancellation
//!
//! If the owning `get` future is dropped before the computation finishes (task
//! aborted, wrapped in a timeout, ...), the slot is resolved to
//! [`ComputeError::Cancelled`] and removed, so waiters are released promptly
//! instead of hanging on a slot that nobody will ever resolve. The next call
//! for that key starts a fresh computation.
//!
//! ## Example
//!
//! ```
//! use std::convert::Infallible;
//!
//! use coalesce::ComputationCache;
//! use futures::FutureExt;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let cache = ComputationCache::from_fn(|key: String| {
//!     async move { Ok::<_, Infallible>(key.len()) }.boxed()
//! });
//!
//! let len = cache.get("hello".to_string()).await.unwrap();
//! assert_eq!(*len, 5);
//! # }
//! ```

#![warn(missing_docs)]

mod cache;
mod config;
mod error;
mod slot;

#[cfg(test)]
mod tests;

pub use cache::{ComputationCache, ComputationDriver, FnDriver};
pub use config::FailurePolicy;
pub use error::ComputeError;

use std::sync::Arc;

/// The outcome of a cached computation, as observed by every coalesced caller.
pub type CacheResult<V, E> = Result<Arc<V>, ComputeError<E>>;
