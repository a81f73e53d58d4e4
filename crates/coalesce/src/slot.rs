use tokio::sync::watch;

use crate::{CacheResult, ComputeError};

/// The lifecycle of a slot.
///
/// A slot starts out pending and transitions to done exactly once; the
/// terminal outcome never changes afterwards.
enum SlotState<V, E> {
    Pending,
    Done(CacheResult<V, E>),
}

/// The coordination point for a single key's computation.
///
/// The slot is shared between the one caller running the computation and any
/// number of waiters. It is backed by a `watch` channel specifically because
/// that is level-triggered: a waiter subscribing after the terminal outcome
/// was published still observes it and cannot miss the wakeup.
pub(crate) struct Slot<V, E> {
    tx: watch::Sender<SlotState<V, E>>,
}

impl<V, E> Slot<V, E>
where
    E: Clone,
{
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(SlotState::Pending);
        Slot { tx }
    }

    /// Publishes the terminal outcome of this slot.
    ///
    /// Only the first call has any effect; the slot then wakes all current and
    /// future waiters. Returns whether this call was the one that resolved the
    /// slot.
    pub(crate) fn resolve(&self, outcome: CacheResult<V, E>) -> bool {
        let mut outcome = Some(outcome);
        let mut resolved = false;
        self.tx.send_if_modified(|state| {
            if let SlotState::Pending = state {
                *state = SlotState::Done(outcome.take().unwrap());
                resolved = true;
            }
            resolved
        });
        resolved
    }

    /// Returns the terminal outcome if the slot has already resolved.
    pub(crate) fn peek(&self) -> Option<CacheResult<V, E>> {
        match &*self.tx.borrow() {
            SlotState::Pending => None,
            SlotState::Done(outcome) => Some(outcome.clone()),
        }
    }

    /// Whether the slot has reached its terminal state.
    pub(crate) fn is_resolved(&self) -> bool {
        !matches!(&*self.tx.borrow(), SlotState::Pending)
    }

    /// Suspends until the slot resolves, then returns the shared outcome.
    ///
    /// This holds no lock while suspended, so computations for other keys are
    /// entirely unaffected by parked waiters.
    pub(crate) async fn wait(&self) -> CacheResult<V, E> {
        let mut rx = self.tx.subscribe();
        loop {
            {
                let state = rx.borrow_and_update();
                if let SlotState::Done(outcome) = &*state {
                    return outcome.clone();
                }
            }
            // The sender lives inside this slot, so as long as the slot itself
            // is alive this cannot fail. Treat a closed channel as
            // cancellation rather than hanging or panicking.
            if rx.changed().await.is_err() {
                return Err(ComputeError::Cancelled);
            }
        }
    }
}
