//! Bounded concurrency for outbound generation calls
//!
//! [`ConcurrencyGate`] is a counting semaphore with instrumentation. A
//! [`GatePermit`] releases its slot when dropped, whichever way the holder
//! exits.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Gate statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateStats {
    /// Configured capacity
    pub capacity: usize,
    /// Permits currently held
    pub in_flight: usize,
    /// Highest number of permits held at once
    pub peak: usize,
    /// Permits granted in total
    pub granted: usize,
}

/// Gate errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    /// The gate was closed while waiting
    #[error("concurrency gate closed")]
    Closed,
}

/// Counting permit gate shared by all dispatches of a run
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    granted: Arc<AtomicUsize>,
}

impl ConcurrencyGate {
    /// Create a gate; a capacity of zero is raised to one
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            granted: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Wait for a permit
    ///
    /// No fairness is promised between waiters.
    ///
    /// # Errors
    /// [`GateError::Closed`] if [`Self::close`] was called
    pub async fn acquire(&self) -> Result<GatePermit, GateError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| GateError::Closed)?;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.granted.fetch_add(1, Ordering::Relaxed);

        Ok(GatePermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Run `future` while holding a permit
    ///
    /// # Errors
    /// [`GateError::Closed`] if no permit could be obtained
    pub async fn run<F: Future>(&self, future: F) -> Result<F::Output, GateError> {
        let _permit = self.acquire().await?;
        Ok(future.await)
    }

    /// Refuse all further acquisitions
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Configured capacity
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> GateStats {
        GateStats {
            capacity: self.capacity,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak: self.peak.load(Ordering::SeqCst),
            granted: self.granted.load(Ordering::Relaxed),
        }
    }
}

/// Held slot of a [`ConcurrencyGate`]
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn zero_capacity_becomes_one() {
        let gate = ConcurrencyGate::new(0);
        assert_eq!(gate.capacity(), 1);
        let permit = gate.acquire().await.unwrap();
        assert_eq!(gate.stats().in_flight, 1);
        drop(permit);
        assert_eq!(gate.stats().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_capacity() {
        let gate = ConcurrencyGate::new(3);
        let tasks: Vec<_> = (0..12)
            .map(|i| {
                let gate = gate.clone();
                tokio::spawn(async move {
                    gate.run(async move {
                        tokio::time::sleep(Duration::from_millis(10 + i)).await;
                    })
                    .await
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        let stats = gate.stats();
        assert_eq!(stats.peak, 3);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.granted, 12);
    }

    #[tokio::test]
    async fn permit_released_on_panic() {
        let gate = ConcurrencyGate::new(1);
        let inner = gate.clone();
        let handle = tokio::spawn(async move {
            let _permit = inner.acquire().await.unwrap();
            panic!("work unit blew up");
        });
        assert!(handle.await.is_err());
        assert_eq!(gate.stats().in_flight, 0);
        assert!(gate.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn closed_gate_refuses() {
        let gate = ConcurrencyGate::new(2);
        gate.close();
        assert_eq!(gate.acquire().await.unwrap_err(), GateError::Closed);
    }
}
