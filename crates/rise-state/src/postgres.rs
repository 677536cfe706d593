//! Postgres-backed bus and advisory lock adapters.
//!
//! The queue uses `SELECT ... FOR UPDATE SKIP LOCKED` over a jobs table,
//! giving at-least-once delivery with a visibility timeout. Published
//! events land in an events table drained by the edge services. The lock
//! backend maps resources onto Postgres advisory locks, holding a
//! dedicated pool connection for the lifetime of each guard (advisory
//! locks are session-scoped).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::Row;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BusError, LockError};
use crate::traits::{LockBackend, LockOps, MessageBus};
use crate::types::{LockGuard, Message, MessageId};

/// Postgres [`MessageBus`].
#[derive(Clone)]
pub struct PostgresBus {
    pool: PgPool,
}

impl PostgresBus {
    /// Connect and create the backing tables if they don't exist.
    pub async fn new(url: &str) -> Result<Self, BusError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        Self::from_pool(pool).await
    }

    /// Create a bus from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> Result<Self, BusError> {
        let bus = Self { pool };
        bus.ensure_schema().await?;
        Ok(bus)
    }

    async fn ensure_schema(&self) -> Result<(), BusError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bus_jobs (
                id UUID PRIMARY KEY,
                queue_name TEXT NOT NULL,
                payload BYTEA NOT NULL,
                attempt INT NOT NULL DEFAULT 0,
                enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                visible_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| BusError::Backend(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_bus_jobs_receive
            ON bus_jobs (queue_name, visible_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| BusError::Backend(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bus_events (
                id UUID PRIMARY KEY,
                exchange TEXT NOT NULL,
                routing_key TEXT NOT NULL,
                payload BYTEA NOT NULL,
                published_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| BusError::Backend(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_bus_events_route
            ON bus_events (exchange, routing_key, published_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| BusError::Backend(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl MessageBus for PostgresBus {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<MessageId, BusError> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO bus_events (id, exchange, routing_key, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(id)
        .bind(exchange)
        .bind(routing_key)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(|e| BusError::Publish(e.to_string()))?;

        Ok(MessageId::new(id.to_string()))
    }

    async fn enqueue(&self, queue: &str, payload: &[u8]) -> Result<MessageId, BusError> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO bus_jobs (id, queue_name, payload)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(id)
        .bind(queue)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(|e| BusError::Backend(e.to_string()))?;

        Ok(MessageId::new(id.to_string()))
    }

    async fn receive(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Message>, BusError> {
        let visibility_secs = visibility_timeout.as_secs_f64();

        let row = sqlx::query(
            r#"
            UPDATE bus_jobs
            SET visible_at = NOW() + ($2 * INTERVAL '1 second'),
                attempt = attempt + 1
            WHERE id = (
                SELECT id FROM bus_jobs
                WHERE queue_name = $1 AND visible_at <= NOW()
                ORDER BY enqueued_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, payload, attempt
            "#,
        )
        .bind(queue)
        .bind(visibility_secs)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BusError::Backend(e.to_string()))?;

        Ok(row.map(|r| {
            let id: Uuid = r.get("id");
            let payload: Vec<u8> = r.get("payload");
            let attempt: i32 = r.get("attempt");
            Message {
                id: MessageId::new(id.to_string()),
                payload,
                attempt: attempt.max(0) as u32,
                enqueued_at: SystemTime::now(),
            }
        }))
    }

    async fn ack(&self, queue: &str, id: &MessageId) -> Result<(), BusError> {
        let uuid = parse_message_id(id)?;

        let result = sqlx::query("DELETE FROM bus_jobs WHERE id = $1 AND queue_name = $2")
            .bind(uuid)
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(|e| BusError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(BusError::MessageNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn nack(&self, queue: &str, id: &MessageId) -> Result<(), BusError> {
        let uuid = parse_message_id(id)?;

        let result = sqlx::query(
            "UPDATE bus_jobs SET visible_at = NOW() WHERE id = $1 AND queue_name = $2",
        )
        .bind(uuid)
        .bind(queue)
        .execute(&self.pool)
        .await
        .map_err(|e| BusError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(BusError::MessageNotFound(id.to_string()));
        }
        Ok(())
    }
}

fn parse_message_id(id: &MessageId) -> Result<Uuid, BusError> {
    id.as_str()
        .parse()
        .map_err(|_| BusError::MessageNotFound(id.to_string()))
}

impl std::fmt::Debug for PostgresBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBus").finish_non_exhaustive()
    }
}

/// Postgres advisory lock backend.
///
/// `try_acquire` takes `pg_try_advisory_lock` on a connection checked out
/// of the pool; the connection is parked until release so the session
/// (and with it the lock) stays alive. The TTL parameter is ignored:
/// session locks are held until released or the connection dies.
#[derive(Clone)]
pub struct PostgresLock {
    pool: PgPool,
    held: Arc<Mutex<HashMap<String, PoolConnection<Postgres>>>>,
}

impl PostgresLock {
    /// Connect to Postgres.
    pub async fn new(url: &str) -> Result<Self, LockError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| LockError::Connection(e.to_string()))?;
        Ok(Self::from_pool(pool))
    }

    /// Create a lock backend from an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            held: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Stable 64-bit key for an advisory lock resource.
///
/// FNV-1a; must not depend on process-local hasher state, or two workers
/// would lock different keys for the same resource.
fn advisory_key(resource: &str) -> i64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for byte in resource.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash as i64
}

#[async_trait]
impl LockOps for PostgresLock {
    async fn release(&self, resource: &str, token: &str) -> Result<(), LockError> {
        let mut held = self.held.lock().await;
        let Some(mut conn) = held.remove(token) else {
            return Ok(());
        };
        drop(held);

        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(advisory_key(resource))
            .execute(&mut *conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn refresh(&self, _resource: &str, token: &str, _ttl: Duration) -> Result<(), LockError> {
        // Session locks don't expire; just confirm the guard still holds.
        let held = self.held.lock().await;
        if held.contains_key(token) {
            Ok(())
        } else {
            Err(LockError::NotHeld)
        }
    }
}

#[async_trait]
impl LockBackend for PostgresLock {
    async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        loop {
            match self.try_acquire(resource, ttl).await? {
                Some(guard) => return Ok(guard),
                None => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    }

    async fn try_acquire(
        &self,
        resource: &str,
        _ttl: Duration,
    ) -> Result<Option<LockGuard>, LockError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| LockError::Connection(e.to_string()))?;

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(advisory_key(resource))
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        if !acquired {
            return Ok(None);
        }

        let token = Uuid::new_v4().to_string();
        self.held.lock().await.insert(token.clone(), conn);

        Ok(Some(LockGuard::new(
            resource.to_owned(),
            token,
            Arc::new(self.clone()),
        )))
    }
}

impl std::fmt::Debug for PostgresLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresLock").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database_url() -> Option<String> {
        std::env::var("DATABASE_URL").ok()
    }

    #[test]
    fn advisory_key_is_stable() {
        assert_eq!(advisory_key("project:1"), advisory_key("project:1"));
        assert_ne!(advisory_key("project:1"), advisory_key("project:2"));
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn queue_roundtrip() {
        let url = database_url().expect("DATABASE_URL not set");
        let bus = PostgresBus::new(&url).await.expect("failed to connect");

        let id = bus.enqueue("test-queue", b"payload").await.unwrap();
        let msg = bus
            .receive("test-queue", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("message should be delivered");

        assert_eq!(msg.id, id);
        assert_eq!(msg.payload, b"payload");

        bus.ack("test-queue", &id).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL)"]
    async fn advisory_lock_is_exclusive() {
        let url = database_url().expect("DATABASE_URL not set");
        let locks = PostgresLock::new(&url).await.expect("failed to connect");

        let guard = locks
            .try_acquire("test:lock", Duration::from_secs(10))
            .await
            .unwrap()
            .expect("first acquisition should succeed");

        // A second backend over a fresh pool simulates another worker.
        let other = PostgresLock::new(&url).await.expect("failed to connect");
        assert!(other
            .try_acquire("test:lock", Duration::from_secs(10))
            .await
            .unwrap()
            .is_none());

        guard.release().await.unwrap();

        assert!(other
            .try_acquire("test:lock", Duration::from_secs(10))
            .await
            .unwrap()
            .is_some());
    }
}
