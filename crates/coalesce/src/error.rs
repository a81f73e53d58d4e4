use thiserror::Error;

/// An error returned from [`ComputationCache::get`](crate::ComputationCache::get).
///
/// The cache itself never invents failures: either the underlying computation
/// failed, or the caller that was running it went away before publishing a
/// result. In both cases every coalesced caller for that key observes the
/// identical error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComputeError<E> {
    /// The computation itself failed.
    ///
    /// The driver's error is relayed verbatim, once per epoch, to the owner
    /// and all of its waiters alike.
    #[error(transparent)]
    Computation(E),

    /// The owning computation was cancelled before it produced a result.
    ///
    /// This happens when the `get` future that was running the computation is
    /// dropped, for example because its task was aborted or it was raced
    /// against a timeout. The slot is evicted alongside, so a subsequent call
    /// starts a fresh computation.
    #[error("computation was cancelled before it produced a result")]
    Cancelled,
}

impl<E> ComputeError<E> {
    /// Returns the underlying computation error, if there is one.
    pub fn into_computation(self) -> Option<E> {
        match self {
            ComputeError::Computation(e) => Some(e),
            ComputeError::Cancelled => None,
        }
    }

    /// Whether this error was caused by cancellation of the owning computation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ComputeError::Cancelled)
    }
}
