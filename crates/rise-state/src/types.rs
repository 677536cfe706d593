use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::error::LockError;
use crate::traits::LockOps;

/// Identifier of a queued message or published event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message received from a queue.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented on each redelivery.
    pub attempt: u32,
    pub enqueued_at: SystemTime,
}

/// An event captured by the in-memory bus, for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedEvent {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
}

/// Ownership of an acquired advisory lock.
///
/// The guard releases the lock when explicitly asked or on drop; a
/// dropped guard spawns the release so cleanup also happens on panics
/// and early returns.
pub struct LockGuard {
    resource: String,
    token: String,
    ops: Arc<dyn LockOps>,
    released: AtomicBool,
}

impl LockGuard {
    pub fn new(resource: String, token: String, ops: Arc<dyn LockOps>) -> Self {
        Self {
            resource,
            token,
            ops,
            released: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Extend the lock's lifetime on backends with expiring locks.
    pub async fn refresh(&self, ttl: Duration) -> Result<(), LockError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(LockError::NotHeld);
        }
        self.ops.refresh(&self.resource, &self.token, ttl).await
    }

    /// Release the lock now.
    pub async fn release(self) -> Result<(), LockError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.ops.release(&self.resource, &self.token).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            let ops = self.ops.clone();
            let resource = std::mem::take(&mut self.resource);
            let token = std::mem::take(&mut self.token);

            tokio::spawn(async move {
                if let Err(e) = ops.release(&resource, &token).await {
                    tracing::warn!(resource = %resource, error = %e, "failed to release lock on drop");
                }
            });
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.resource)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}
