use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ExecError, Result};

/// Bounds the number of untrusted programs running at once.
///
/// Requests that find no free slot wait in FIFO order, up to `queue_capacity`
/// of them; anything beyond that is rejected straight away.
pub struct Gate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    queue_capacity: usize,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    in_flight: AtomicUsize,
    waiting: AtomicUsize,
    peak_in_flight: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateStats {
    pub capacity: usize,
    pub in_flight: usize,
    pub waiting: usize,
    pub peak_in_flight: usize,
    pub acquired: u64,
    pub released: u64,
    pub rejected: u64,
}

/// Capacity token. Dropping it gives the capacity back.
#[derive(Debug)]
pub struct Slot {
    counters: Arc<Counters>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for Counters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counters")
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        // Runs before the permit field is dropped, so `in_flight` can never
        // observe more holders than there are permits.
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Keeps the waiting counter honest when an acquire future is dropped.
struct WaitTicket<'a>(&'a AtomicUsize);

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Gate {
    pub fn new(capacity: usize, queue_capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            queue_capacity,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Waits for a slot until `deadline`, giving up early if `cancel` fires
    pub async fn acquire(&self, deadline: Instant, cancel: &CancellationToken) -> Result<Slot> {
        if cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }

        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => return Ok(self.issue(permit)),
            Err(TryAcquireError::Closed) => return Err(self.reject()),
            Err(TryAcquireError::NoPermits) => {}
        }

        let reserved = self.counters.waiting.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |waiting| (waiting < self.queue_capacity).then_some(waiting + 1),
        );
        if reserved.is_err() {
            log::debug!("Wait queue full ({}), rejecting request", self.queue_capacity);
            return Err(self.reject());
        }
        let _ticket = WaitTicket(&self.counters.waiting);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecError::Cancelled),
            res = tokio::time::timeout_at(deadline, self.semaphore.clone().acquire_owned()) => {
                match res {
                    Ok(Ok(permit)) => Ok(self.issue(permit)),
                    // Closed semaphore or elapsed deadline
                    Ok(Err(_)) | Err(_) => Err(self.reject()),
                }
            }
        }
    }

    /// Stops admitting work. Queued and future requests fail with `Overloaded`.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> GateStats {
        let c = &self.counters;
        GateStats {
            capacity: self.capacity,
            in_flight: c.in_flight.load(Ordering::SeqCst),
            waiting: c.waiting.load(Ordering::SeqCst),
            peak_in_flight: c.peak_in_flight.load(Ordering::SeqCst),
            acquired: c.acquired.load(Ordering::SeqCst),
            released: c.released.load(Ordering::SeqCst),
            rejected: c.rejected.load(Ordering::SeqCst),
        }
    }

    fn issue(&self, permit: OwnedSemaphorePermit) -> Slot {
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        Slot {
            counters: self.counters.clone(),
            _permit: permit,
        }
    }

    fn reject(&self) -> ExecError {
        self.counters.rejected.fetch_add(1, Ordering::SeqCst);
        ExecError::Overloaded
    }
}
