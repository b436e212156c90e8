use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::executor::TaskError;
use crate::executor::cancel::CancelToken;

/// Counted resource with acquire/release semantics. Capacity 1 serializes use.
#[derive(Clone)]
pub struct ResourcePool {
    name: &'static str,
    capacity: usize,
    semaphore: Arc<Semaphore>,
}

/// Held while the resource is in use; dropping it releases the slot.
#[derive(Debug)]
pub struct ResourcePermit {
    _permit: OwnedSemaphorePermit,
}

impl ResourcePool {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a slot, giving up as soon as `cancel` fires.
    pub async fn acquire(&self, cancel: &CancelToken) -> Result<ResourcePermit, TaskError> {
        if cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => {
                let permit = permit.map_err(|_| TaskError::Cancelled)?;
                Ok(ResourcePermit { _permit: permit })
            }
            _ = cancel.cancelled() => Err(TaskError::Cancelled),
        }
    }
}
