//! In-memory bus and lock backends for tests and local development.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BusError, LockError};
use crate::traits::{LockBackend, LockOps, MessageBus};
use crate::types::{LockGuard, Message, MessageId, PublishedEvent};

#[derive(Debug, Clone)]
struct QueueEntry {
    message: Message,
    visible_at: Instant,
}

/// In-memory [`MessageBus`].
///
/// Queues behave like the production backend (visibility timeout,
/// redelivery counting). Published events are retained and exposed
/// through [`MemoryBus::published`] so tests can assert on them.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    queues: Arc<Mutex<HashMap<String, VecDeque<QueueEntry>>>>,
    events: Arc<Mutex<Vec<PublishedEvent>>>,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events published so far, in publish order.
    pub async fn published(&self) -> Vec<PublishedEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<MessageId, BusError> {
        let mut events = self.events.lock().await;
        events.push(PublishedEvent {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: payload.to_vec(),
        });
        Ok(MessageId::new(Uuid::new_v4().to_string()))
    }

    async fn enqueue(&self, queue: &str, payload: &[u8]) -> Result<MessageId, BusError> {
        let mut queues = self.queues.lock().await;
        let entries = queues.entry(queue.to_owned()).or_default();

        let id = MessageId::new(Uuid::new_v4().to_string());
        entries.push_back(QueueEntry {
            message: Message {
                id: id.clone(),
                payload: payload.to_vec(),
                attempt: 0,
                enqueued_at: SystemTime::now(),
            },
            visible_at: Instant::now(),
        });

        Ok(id)
    }

    async fn receive(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Message>, BusError> {
        let mut queues = self.queues.lock().await;
        let Some(entries) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let now = Instant::now();
        for entry in entries.iter_mut() {
            if entry.visible_at <= now {
                entry.visible_at = now + visibility_timeout;
                entry.message.attempt += 1;
                return Ok(Some(entry.message.clone()));
            }
        }

        Ok(None)
    }

    async fn ack(&self, queue: &str, id: &MessageId) -> Result<(), BusError> {
        let mut queues = self.queues.lock().await;
        let entries = queues
            .get_mut(queue)
            .ok_or_else(|| BusError::QueueNotFound(queue.to_owned()))?;

        let before = entries.len();
        entries.retain(|entry| entry.message.id != *id);

        if entries.len() == before {
            return Err(BusError::MessageNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn nack(&self, queue: &str, id: &MessageId) -> Result<(), BusError> {
        let mut queues = self.queues.lock().await;
        let entries = queues
            .get_mut(queue)
            .ok_or_else(|| BusError::QueueNotFound(queue.to_owned()))?;

        for entry in entries.iter_mut() {
            if entry.message.id == *id {
                entry.visible_at = Instant::now();
                return Ok(());
            }
        }

        Err(BusError::MessageNotFound(id.to_string()))
    }
}

#[derive(Debug, Clone)]
struct HeldLock {
    token: String,
    expires_at: Instant,
}

/// In-memory [`LockBackend`] with TTL-based expiry.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockProvider {
    locks: Arc<Mutex<HashMap<String, HeldLock>>>,
}

impl MemoryLockProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockOps for MemoryLockProvider {
    async fn release(&self, resource: &str, token: &str) -> Result<(), LockError> {
        let mut locks = self.locks.lock().await;
        match locks.get(resource) {
            Some(held) if held.token == token => {
                locks.remove(resource);
                Ok(())
            }
            Some(_) => Err(LockError::NotHeld),
            None => Ok(()),
        }
    }

    async fn refresh(&self, resource: &str, token: &str, ttl: Duration) -> Result<(), LockError> {
        let mut locks = self.locks.lock().await;
        match locks.get_mut(resource) {
            Some(held) if held.token == token => {
                held.expires_at = Instant::now() + ttl;
                Ok(())
            }
            _ => Err(LockError::NotHeld),
        }
    }
}

#[async_trait]
impl LockBackend for MemoryLockProvider {
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        loop {
            match self.try_acquire(resource, ttl).await? {
                Some(guard) => return Ok(guard),
                None => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    }

    async fn try_acquire(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, LockError> {
        let mut locks = self.locks.lock().await;
        let now = Instant::now();

        if let Some(held) = locks.get(resource) {
            if held.expires_at > now {
                return Ok(None);
            }
        }

        let token = Uuid::new_v4().to_string();
        locks.insert(
            resource.to_owned(),
            HeldLock {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        drop(locks);

        Ok(Some(LockGuard::new(
            resource.to_owned(),
            token,
            Arc::new(self.clone()),
        )))
    }
}
