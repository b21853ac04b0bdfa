use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::WaitError;

/// Bounds the number of concurrently running jobs.
///
/// Each running job holds a [Slot]. Which waiter gets the next free slot is unspecified.
#[derive(Debug)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Permission to run one job, obtained from an [AdmissionGate].
///
/// The slot is returned to the gate when dropped.
#[derive(Debug)]
#[must_use = "the slot is released as soon as it is dropped"]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    /// Create a gate admitting up to `capacity` jobs at once.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be positive");
        assert!(
            capacity <= Semaphore::MAX_PERMITS,
            "capacity exceeds the semaphore maximum"
        );

        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot.
    ///
    /// Returns [WaitError::Cancelled] if `cancel` fires first, or [WaitError::Closed] once the
    /// gate is closed.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Slot, WaitError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WaitError::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                Ok(permit) => Ok(Slot { _permit: permit }),
                Err(_) => Err(WaitError::Closed),
            },
        }
    }

    /// Stop admitting jobs. Current and future waiters fail with [WaitError::Closed].
    ///
    /// Slots already handed out stay valid until dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Whether [close](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// The number of free slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// The maximum number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
