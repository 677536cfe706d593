//! Error types for the deploy worker.

use rise_state::{BusError, LockError};
use rise_store::TransferError;

use crate::state::DeploymentState;

/// Result type alias using [`DeployError`].
pub type DeployResult<T> = Result<T, DeployError>;

/// Errors that can occur while deploying.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Object storage error.
    #[error("object storage error: {0}")]
    Transfer(#[from] TransferError),

    /// Message bus error.
    #[error("message bus error: {0}")]
    Bus(#[from] BusError),

    /// Lock backend error.
    #[error("lock backend error: {0}")]
    Lock(#[from] LockError),

    /// Another worker holds the project lock.
    #[error("project is locked")]
    ProjectLocked,

    /// The deployment is in a state the job cannot act on.
    #[error("deployment is in unexpected state: {0}")]
    UnexpectedState(DeploymentState),

    /// Illegal state transition rejected at the store boundary.
    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: &'static str,
        /// Attempted target state.
        to: &'static str,
    },

    /// The per-entry upload phase exceeded its deadline.
    #[error("failed to upload files due to timeout")]
    Timeout,

    /// Deployment not found.
    #[error("deployment not found: {0}")]
    DeploymentNotFound(i64),

    /// Project not found.
    #[error("project not found: {0}")]
    ProjectNotFound(i64),

    /// The bundle archive could not be read.
    #[error("archive error: {0}")]
    Archive(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployError {
    /// Whether the job should be returned to the queue for redelivery.
    ///
    /// Transport failures and lock contention are transient; a later
    /// delivery can succeed. A timeout has already moved the deployment
    /// to `deploy_failed`, and state-machine or payload problems will
    /// fail the same way on every delivery.
    #[must_use]
    pub fn is_redeliverable(&self) -> bool {
        !matches!(
            self,
            Self::Timeout
                | Self::UnexpectedState(_)
                | Self::InvalidStateTransition { .. }
                | Self::DeploymentNotFound(_)
                | Self::ProjectNotFound(_)
                | Self::Serialisation(_)
                | Self::Config(_)
        )
    }
}
