/// Controls what happens to a slot whose computation failed.
///
/// Callers that were already coalesced onto the failing computation always
/// share its error; the policy only decides what *later* calls for the same
/// key observe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Evict a failed slot as soon as it resolves.
    ///
    /// Failures are not memoized: the next call after the failing burst starts
    /// a fresh computation. This is the default, since transient failures
    /// (timeouts, connection loss) would otherwise poison the key until it is
    /// explicitly invalidated.
    #[default]
    Evict,

    /// Keep a failed slot around, memoizing the error like a success.
    ///
    /// Every later call for the key observes the recorded error without
    /// re-running the computation, until the entry is invalidated.
    Retain,
}
