//! The ordered queue of lease requests waiting for a channel.
use std::collections::VecDeque;

use tokio::sync::oneshot;

/// Pending requests, in arrival order.
///
/// A request whose receiver has been dropped (its caller gave up, e.g. after a cancellation)
/// is skipped without disturbing the others.
pub(crate) struct RequestQueue<T> {
    pending: VecDeque<oneshot::Sender<T>>,
}

impl<T> Default for RequestQueue<T> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }
}

impl<T> RequestQueue<T> {
    /// Enqueue a request.
    ///
    /// Returns `true` if the queue went from empty to non-empty: the caller is expected to
    /// start serving it.
    pub(crate) fn push(&mut self, request: oneshot::Sender<T>) -> bool {
        self.prune();
        let became_non_empty = self.pending.is_empty();
        self.pending.push_back(request);
        became_non_empty
    }

    /// The oldest request that is still waiting.
    pub(crate) fn pop(&mut self) -> Option<oneshot::Sender<T>> {
        self.prune();
        self.pending.pop_front()
    }

    pub(crate) fn len(&mut self) -> usize {
        self.pending.retain(|request| !request.is_closed());
        self.pending.len()
    }

    pub(crate) fn is_empty(&mut self) -> bool {
        self.prune();
        self.pending.is_empty()
    }

    /// Resolve every waiting request with the outcome produced by `outcome`.
    pub(crate) fn resolve_all(&mut self, mut outcome: impl FnMut() -> T) {
        for request in self.pending.drain(..) {
            // The caller may have given up in the meantime.
            let _ = request.send(outcome());
        }
    }

    fn prune(&mut self) {
        while self
            .pending
            .front()
            .map_or(false, oneshot::Sender::is_closed)
        {
            self.pending.pop_front();
        }
    }
}
