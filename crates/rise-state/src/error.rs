use thiserror::Error;

/// Errors from message bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors from advisory lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("lock not held or expired")]
    NotHeld,

    #[error("backend error: {0}")]
    Backend(String),
}
