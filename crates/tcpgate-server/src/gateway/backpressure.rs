//! Per-direction backpressure gate with high/low-water hysteresis.
//!
//! A producer reserves credit for each chunk before queueing it and gets a
//! [`GatePermit`] back; the consumer drops the permit once the chunk has
//! been written out. Reservations stop once the outstanding count reaches
//! the high-water mark and resume only after it falls below the low-water
//! mark, or drains to zero.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tcpgate_core::{GateError, GateResult};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct GateState {
    outstanding: usize,
    suspended: bool,
    peak: usize,
}

/// Credit counter for one pump direction.
#[derive(Debug)]
pub struct BackpressureGate {
    state: Mutex<GateState>,
    notify: Notify,
    high_water: usize,
    low_water: usize,
}

impl BackpressureGate {
    /// `low_water` is clamped below `high_water`.
    pub fn new(high_water: usize, low_water: usize) -> Arc<Self> {
        let high_water = high_water.max(1);
        Arc::new(Self {
            state: Mutex::new(GateState::default()),
            notify: Notify::new(),
            high_water,
            low_water: low_water.min(high_water - 1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for room for `n` bytes and reserve it.
    ///
    /// # Errors
    ///
    /// [`GateError::Internal`] if `n` alone exceeds the high-water mark;
    /// callers chunk below it, so this means a chunking bug.
    pub async fn reserve(self: &Arc<Self>, n: usize) -> GateResult<GatePermit> {
        if n > self.high_water {
            return Err(GateError::internal(format!(
                "chunk of {n} bytes exceeds high-water mark {}",
                self.high_water
            )));
        }
        loop {
            let notified = {
                let mut st = self.lock();
                if !st.suspended && st.outstanding + n <= self.high_water {
                    st.outstanding += n;
                    st.peak = st.peak.max(st.outstanding);
                    if st.outstanding >= self.high_water {
                        st.suspended = true;
                    }
                    return Ok(GatePermit {
                        gate: Arc::clone(self),
                        bytes: n,
                    });
                }
                // Registered while the lock is held, so a release between
                // here and the await below still wakes us.
                self.notify.notified()
            };
            notified.await;
        }
    }

    fn release(&self, n: usize) {
        let wake = {
            let mut st = self.lock();
            st.outstanding = st.outstanding.saturating_sub(n);
            if st.suspended && (st.outstanding < self.low_water || st.outstanding == 0) {
                st.suspended = false;
            }
            !st.suspended
        };
        if wake {
            self.notify.notify_waiters();
        }
    }

    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    /// Highest outstanding count ever observed.
    pub fn peak(&self) -> usize {
        self.lock().peak
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }
}

/// Credit for one queued chunk; returned to the gate on drop.
#[derive(Debug)]
pub struct GatePermit {
    gate: Arc<BackpressureGate>,
    bytes: usize,
}

impl GatePermit {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.gate.release(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_suspends_at_high_and_resumes_below_low() {
        let gate = BackpressureGate::new(100, 50);
        let a = gate.reserve(60).await.unwrap();
        let b = gate.reserve(40).await.unwrap();
        assert!(gate.is_suspended());

        // Even a one-byte reservation waits while suspended.
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.reserve(1).await.map(|p| p.bytes()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // 60 outstanding: below high but not below low, still suspended.
        drop(b);
        assert_eq!(gate.outstanding(), 60);
        assert!(gate.is_suspended());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(a);
        assert_eq!(waiter.await.unwrap().unwrap(), 1);
        assert_eq!(gate.outstanding(), 0);
        assert!(!gate.is_suspended());
    }

    #[tokio::test]
    async fn test_zero_low_water_resumes_when_drained() {
        let gate = BackpressureGate::new(100, 0);
        let full = gate.reserve(100).await.unwrap();
        assert!(gate.is_suspended());
        drop(full);
        assert_eq!(gate.outstanding(), 0);
        assert!(!gate.is_suspended());
        let next = tokio::time::timeout(Duration::from_millis(200), gate.reserve(1)).await;
        assert_eq!(next.unwrap().unwrap().bytes(), 1);
    }

    #[tokio::test]
    async fn test_oversized_reservation_rejected() {
        let gate = BackpressureGate::new(10, 5);
        assert!(gate.reserve(11).await.is_err());
        assert!(gate.reserve(10).await.is_ok());
    }

    #[tokio::test]
    async fn test_slow_consumer_never_exceeds_high_water() {
        let gate = BackpressureGate::new(4096, 2048);
        let (tx, mut rx) = mpsc::channel::<(Vec<u8>, GatePermit)>(1024);

        let producer = {
            let gate = gate.clone();
            tokio::spawn(async move {
                for i in 0..200u32 {
                    let chunk = vec![0u8; 100 + (i as usize % 7) * 50];
                    let permit = gate.reserve(chunk.len()).await.unwrap();
                    tx.send((chunk, permit)).await.unwrap();
                }
            })
        };

        let mut received = 0;
        while let Some((chunk, permit)) = rx.recv().await {
            assert!(gate.outstanding() <= gate.high_water());
            tokio::time::sleep(Duration::from_millis(1)).await;
            received += chunk.len();
            drop(permit);
        }
        producer.await.unwrap();
        assert!(received > 4096);
        assert!(gate.peak() <= 4096, "peak {}", gate.peak());
        assert_eq!(gate.outstanding(), 0);
    }
}
