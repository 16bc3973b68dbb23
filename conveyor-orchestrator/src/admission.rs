//! Admission Queue
//!
//! Bounds how many expensive dispatch evaluations run at once. Up to `limit`
//! callers run, up to `queue_limit` more wait for a free slot, and anyone
//! beyond that is turned away immediately.
//!
//! Waiters park on a [`Notify`] and race it against their deadline; a released
//! permit wakes every waiter and whichever re-checks first takes the slot.
//! Admission is not FIFO-fair.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Why a caller was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("too many requests")]
    TooManyRequests,

    #[error("timed out waiting for admission")]
    Timeout,
}

#[derive(Debug, Default)]
struct Counters {
    /// Callers currently holding a permit
    accepted: usize,
    /// Callers admitted to the gate, running or waiting
    waiting: usize,
}

#[derive(Debug)]
pub struct AdmissionQueue {
    limit: usize,
    capacity: usize,
    timeout: Duration,
    counters: Mutex<Counters>,
    released: Notify,
}

impl AdmissionQueue {
    pub fn new(limit: usize, queue_limit: usize, timeout: Duration) -> Self {
        Self {
            limit,
            capacity: limit + queue_limit,
            timeout,
            counters: Mutex::new(Counters::default()),
            released: Notify::new(),
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn accepted(&self) -> usize {
        self.counters().accepted
    }

    pub fn waiting(&self) -> usize {
        self.counters().waiting
    }

    /// Wait for a slot.
    ///
    /// The returned permit releases the slot when dropped. A failed acquire
    /// leaves no trace in the counters, so there is nothing to release.
    pub async fn acquire(&self) -> Result<AdmissionPermit<'_>, AdmissionError> {
        {
            let mut counters = self.counters();
            if counters.waiting >= self.capacity {
                return Err(AdmissionError::TooManyRequests);
            }
            counters.waiting += 1;
            if counters.accepted < self.limit {
                counters.accepted += 1;
                return Ok(AdmissionPermit { queue: self });
            }
        }

        let pending = PendingWaiter {
            queue: self,
            armed: true,
        };
        let deadline = Instant::now() + self.timeout;

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and
            // the await still wakes us.
            notified.as_mut().enable();

            if self.try_accept() {
                return Ok(pending.into_permit());
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::debug!("Admission wait timed out after {:?}", self.timeout);
                    return Err(AdmissionError::Timeout);
                }
            }
        }
    }

    /// Run `fut` inside a permit.
    ///
    /// The permit is released whatever `fut` returns. Admission failures are
    /// returned unchanged and `fut` is never polled.
    pub async fn enqueue<F>(&self, fut: F) -> Result<F::Output, AdmissionError>
    where
        F: Future,
    {
        let _permit = self.acquire().await?;
        Ok(fut.await)
    }

    fn try_accept(&self) -> bool {
        let mut counters = self.counters();
        if counters.accepted < self.limit {
            counters.accepted += 1;
            true
        } else {
            false
        }
    }

    fn release(&self) {
        {
            let mut counters = self.counters();
            counters.waiting = counters.waiting.saturating_sub(1);
            counters.accepted = counters.accepted.saturating_sub(1);
        }
        self.released.notify_waiters();
    }
}

/// A held admission slot
#[derive(Debug)]
pub struct AdmissionPermit<'a> {
    queue: &'a AdmissionQueue,
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        self.queue.release();
    }
}

/// Owns the `waiting` increment of a caller that has not been accepted yet.
///
/// Dropping it (timeout, or the caller's future being dropped) gives the
/// waiting slot back.
struct PendingWaiter<'a> {
    queue: &'a AdmissionQueue,
    armed: bool,
}

impl<'a> PendingWaiter<'a> {
    fn into_permit(mut self) -> AdmissionPermit<'a> {
        self.armed = false;
        AdmissionPermit { queue: self.queue }
    }
}

impl Drop for PendingWaiter<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut counters = self.queue.counters();
            counters.waiting = counters.waiting.saturating_sub(1);
        }
    }
}
