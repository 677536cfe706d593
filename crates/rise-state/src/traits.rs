use std::time::Duration;

use async_trait::async_trait;

use crate::error::{BusError, LockError};
use crate::types::{LockGuard, Message, MessageId};

/// Transport for queue jobs and fan-out events.
///
/// Queues give at-least-once delivery: a received message stays invisible
/// for the caller's visibility timeout and reappears unless acked.
/// Publishes go to a named exchange with a routing key and are consumed
/// by services outside this codebase; callers must tolerate duplicate
/// delivery of the events they publish.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish an event to an exchange with a routing key.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<MessageId, BusError>;

    /// Enqueue a work item for delivery to exactly one consumer.
    async fn enqueue(&self, queue: &str, payload: &[u8]) -> Result<MessageId, BusError>;

    /// Receive the next visible message, hiding it for
    /// `visibility_timeout`. Returns `None` when the queue is empty.
    async fn receive(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Message>, BusError>;

    /// Acknowledge and remove a received message.
    async fn ack(&self, queue: &str, id: &MessageId) -> Result<(), BusError>;

    /// Return a received message to the queue for immediate redelivery.
    async fn nack(&self, queue: &str, id: &MessageId) -> Result<(), BusError>;
}

/// Non-blocking advisory locks bound to a named resource.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Acquire the lock, waiting until it becomes free.
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockGuard, LockError>;

    /// Try to acquire the lock without waiting.
    ///
    /// Returns `None` when another holder currently owns the resource.
    async fn try_acquire(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, LockError>;
}

/// Release operations used by [`LockGuard`].
#[async_trait]
pub trait LockOps: Send + Sync {
    async fn release(&self, resource: &str, token: &str) -> Result<(), LockError>;

    async fn refresh(&self, resource: &str, token: &str, ttl: Duration) -> Result<(), LockError>;
}
