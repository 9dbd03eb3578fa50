use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 100;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LimiterError {
    #[error("cancelled while waiting for an inference slot")]
    Cancelled,
    #[error("inference slots are no longer available")]
    Closed,
}

/// Counting gate bounding in-flight inference calls of one batch.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Held for the duration of one inference call. Dropping it frees the slot.
#[derive(Debug)]
pub struct InferenceSlot {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Waits for a free slot. Cancellation wins over a slot that is free at the same time.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<InferenceSlot, LimiterError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LimiterError::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit
                .map(|permit| InferenceSlot { _permit: permit })
                .map_err(|_| LimiterError::Closed),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT_REQUESTS)
    }
}
