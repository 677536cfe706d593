//! Deployment persistence backends.
//!
//! The primary implementation is PostgreSQL; an in-memory implementation
//! backs the test suites. Both enforce the deployment state machine: an
//! update along an edge that [`DeploymentState::can_transition`] does not
//! allow is rejected, whoever asks.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DeployResult;
use crate::state::DeploymentState;
use crate::types::{Deployment, NewDeployment, Project, RawBundle, User};

/// Suffix for the default subdomain every project gets.
pub const DEFAULT_DOMAIN_SUFFIX: &str = ".rise.cloud";

/// Persisted deployments, projects, and raw bundles.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Find a deployment by id. Soft-deleted rows are not returned.
    async fn find_deployment(&self, id: i64) -> DeployResult<Option<Deployment>>;

    /// Find a project by id.
    async fn find_project(&self, id: i64) -> DeployResult<Option<Project>>;

    /// Find a project by name.
    async fn find_project_by_name(&self, name: &str) -> DeployResult<Option<Project>>;

    /// Find a user by id.
    async fn find_user(&self, id: i64) -> DeployResult<Option<User>>;

    /// Find a raw bundle by id.
    async fn find_raw_bundle(&self, id: i64) -> DeployResult<Option<RawBundle>>;

    /// Insert a deployment in the `pending_deploy` state, assigning a
    /// fresh prefix and the project's next version number.
    async fn insert_deployment(&self, new: NewDeployment) -> DeployResult<Deployment>;

    /// Record an uploaded archive.
    async fn insert_raw_bundle(&self, project_id: i64, uploaded_path: &str)
        -> DeployResult<RawBundle>;

    /// Point a deployment at the raw bundle it was uploaded with.
    async fn attach_raw_bundle(&self, deployment_id: i64, raw_bundle_id: i64) -> DeployResult<()>;

    /// Move a deployment to `state`, optionally setting its error
    /// message. Illegal transitions are rejected.
    async fn update_state(
        &self,
        id: i64,
        state: DeploymentState,
        error_message: Option<&str>,
    ) -> DeployResult<()>;

    /// Domain names serving this project: the default
    /// `<name>.rise.cloud` subdomain followed by any custom domains.
    async fn domain_names(&self, project: &Project) -> DeployResult<Vec<String>>;

    /// Commit a successful deploy in one transaction: deployment state →
    /// `deployed` with `deployed_at` set, project
    /// `active_deployment_id` → this deployment, and — when
    /// `max_deploys_kept > 0` — soft-deletion of deployed rows older
    /// than the newest `max_deploys_kept`. Rolls back entirely on any
    /// error. Returns the commit timestamp.
    async fn finalize_deploy(
        &self,
        deployment_id: i64,
        project_id: i64,
        max_deploys_kept: i64,
    ) -> DeployResult<DateTime<Utc>>;
}
