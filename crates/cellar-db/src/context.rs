//! Cancellation and deadlines for blocking lease waits.
//!
//! A [`LeaseContext`] bounds how long [`Database::lease`](crate::Database::lease)
//! may block. It can carry a deadline, a cancellation signal, or both.
//! Cancellation is delivered by disconnecting a channel, so a waiting
//! `select!` wakes immediately when the [`CancelHandle`] is used or dropped.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use crate::error::{Error, Unavailable};

/// Bounds a blocking lease wait.
#[derive(Debug, Clone, Default)]
pub struct LeaseContext {
    deadline: Option<Instant>,
    cancel: Option<Receiver<()>>,
}

/// Cancels every [`LeaseContext`] derived from the same `with_cancel` call.
///
/// Dropping the handle cancels as well.
#[derive(Debug)]
pub struct CancelHandle {
    _tx: Sender<()>,
}

impl CancelHandle {
    /// Cancels the associated contexts.
    pub fn cancel(self) {}
}

impl LeaseContext {
    /// A context that never expires and cannot be cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Adds a deadline `timeout` from now, keeping the earlier deadline if
    /// one is already set.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(far_future);
        self.with_deadline(deadline)
    }

    /// Adds an absolute deadline, keeping the earlier one if already set.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Returns a cancellable copy of this context and its cancel handle.
    ///
    /// Only the most recent cancel handle governs the returned context.
    pub fn with_cancel(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = crossbeam_channel::bounded(0);
        self.cancel = Some(rx);
        (self, CancelHandle { _tx: tx })
    }

    /// The deadline, if one is set.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the error this context would report right now, if it is
    /// already done.
    pub fn err(&self, started: Instant) -> Option<Error> {
        if self.is_cancelled() {
            return Some(Error::ConnectionUnavailable(Unavailable::Cancelled));
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Some(Error::ConnectionUnavailable(Unavailable::TimedOut {
                    waited: started.elapsed(),
                }))
            }
            _ => None,
        }
    }

    /// Returns `true` once the cancel handle has been used or dropped.
    pub fn is_cancelled(&self) -> bool {
        match &self.cancel {
            Some(rx) => matches!(
                rx.try_recv(),
                Err(crossbeam_channel::TryRecvError::Disconnected)
            ),
            None => false,
        }
    }

    /// Channel that becomes ready when the context is cancelled.
    pub(crate) fn cancelled(&self) -> Receiver<()> {
        match &self.cancel {
            Some(rx) => rx.clone(),
            None => crossbeam_channel::never(),
        }
    }

    /// Channel that becomes ready when the deadline passes.
    pub(crate) fn expired(&self) -> Receiver<Instant> {
        match self.deadline {
            Some(deadline) => crossbeam_channel::at(deadline),
            None => crossbeam_channel::never(),
        }
    }
}

fn far_future() -> Instant {
    // Roughly thirty years; `Instant` has no MAX.
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365 * 30)
}
