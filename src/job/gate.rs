//! Admission control for backend jobs.
//!
//! At most `max_in_flight` tickets exist at once. Further callers wait in
//! arrival order (the underlying semaphore is FIFO-fair) up to
//! `max_waiting` of them; a caller that gives up, times out or is cancelled
//! leaves the queue without taking a slot with it.
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("wait queue is full ({capacity} waiting)")]
    QueueFull { capacity: usize },

    #[error("no slot freed up within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("gave up waiting for a slot")]
    Cancelled,

    #[error("gate is closed")]
    Closed,
}

/// One admitted job. The slot is released when the ticket is dropped.
#[derive(Debug)]
pub struct Ticket {
    _permit: OwnedSemaphorePermit,
    sequence: u64,
    arrived_at: Instant,
    granted_at: Instant,
}

impl Ticket {
    /// Arrival number; tickets are granted in increasing order.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn arrived_at(&self) -> Instant {
        self.arrived_at
    }

    pub fn granted_at(&self) -> Instant {
        self.granted_at
    }

    pub fn waited(&self) -> Duration {
        self.granted_at - self.arrived_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateStats {
    pub in_flight: usize,
    pub max_in_flight: usize,
    pub waiting: usize,
    pub max_waiting: usize,
}

pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    max_in_flight: usize,
    max_waiting: usize,
    wait_timeout: Option<Duration>,
    waiting: Arc<AtomicUsize>,
    arrivals: AtomicU64,
}

impl ConcurrencyGate {
    pub fn new(max_in_flight: usize, max_waiting: usize, wait_timeout: Option<Duration>) -> Self {
        ConcurrencyGate {
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            max_waiting,
            wait_timeout,
            waiting: Arc::new(AtomicUsize::new(0)),
            arrivals: AtomicU64::new(0),
        }
    }

    pub async fn acquire(&self) -> Result<Ticket, GateError> {
        self.acquire_cancellable(&CancellationToken::new()).await
    }

    pub async fn acquire_cancellable(&self, cancel: &CancellationToken) -> Result<Ticket, GateError> {
        let arrived_at = Instant::now();
        let sequence = self.arrivals.fetch_add(1, Ordering::SeqCst);

        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(GateError::Closed),
            Err(TryAcquireError::NoPermits) => {
                let _slot = WaitSlot::enter(&self.waiting, self.max_waiting).ok_or(GateError::QueueFull {
                    capacity: self.max_waiting,
                })?;
                tracing::debug!(sequence, waiting = self.waiting(), "Waiting for a job slot");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(GateError::Cancelled),
                    permit = self.wait_for_permit() => permit?,
                }
            }
        };

        Ok(Ticket {
            _permit: permit,
            sequence,
            arrived_at,
            granted_at: Instant::now(),
        })
    }

    async fn wait_for_permit(&self) -> Result<OwnedSemaphorePermit, GateError> {
        let acquire = self.semaphore.clone().acquire_owned();
        match self.wait_timeout {
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .map_err(|_| GateError::Timeout(limit))?
                .map_err(|_| GateError::Closed),
            None => acquire.await.map_err(|_| GateError::Closed),
        }
    }

    /// Refuse new tickets and wake every waiter with [`GateError::Closed`].
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn in_flight(&self) -> usize {
        self.max_in_flight
            .saturating_sub(self.semaphore.available_permits())
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            in_flight: self.in_flight(),
            max_in_flight: self.max_in_flight,
            waiting: self.waiting(),
            max_waiting: self.max_waiting,
        }
    }
}

/// Counts one waiter for as long as it lives.
struct WaitSlot(Arc<AtomicUsize>);

impl WaitSlot {
    fn enter(waiting: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| WaitSlot(waiting.clone()))
    }
}

impl Drop for WaitSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn grants_up_to_capacity_then_rejects_when_queue_full() {
        let gate = ConcurrencyGate::new(1, 0, None);
        let _held = gate.acquire().await.unwrap();
        assert_matches!(gate.acquire().await, Err(GateError::QueueFull { capacity: 0 }));
        assert_eq!(gate.stats().in_flight, 1);
    }

    #[tokio::test]
    async fn waiting_times_out() {
        let gate = ConcurrencyGate::new(1, 4, Some(Duration::from_millis(30)));
        let _held = gate.acquire().await.unwrap();
        let err = gate.acquire().await.unwrap_err();
        assert_eq!(err, GateError::Timeout(Duration::from_millis(30)));
        assert_eq!(gate.waiting(), 0);
    }

    #[tokio::test]
    async fn closing_wakes_waiters() {
        let gate = Arc::new(ConcurrencyGate::new(1, 4, None));
        let _held = gate.acquire().await.unwrap();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(|t| t.sequence()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.close();
        assert_eq!(waiter.await.unwrap(), Err(GateError::Closed));
    }
}
