//! Record types for projects, deployments, and raw bundles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::DeploymentState;

/// A named container for deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    /// Unique human name; also the default subdomain label.
    pub name: String,
    /// Owning user.
    pub user_id: i64,
    /// Inject the hosting watermark into eligible HTML pages.
    pub watermark: bool,
    /// Edge servers redirect HTTP to HTTPS.
    pub force_https: bool,
    /// Basic auth username, when the site is protected.
    pub basic_auth_username: Option<String>,
    /// Encrypted basic auth password; never the plaintext.
    pub encrypted_basic_auth_password: Option<String>,
    /// Keep at most this many deployed versions; 0 keeps all.
    pub max_deploys_kept: i64,
    /// The deployment currently served for this project.
    pub active_deployment_id: Option<i64>,
}

impl Project {
    /// Lock resource name for this project's advisory lock.
    #[must_use]
    pub fn lock_resource(&self) -> String {
        format!("project:{}", self.id)
    }
}

/// A single attempt to publish a site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: i64,
    pub project_id: i64,
    pub user_id: i64,
    /// Short random token; stable for the deployment's life.
    pub prefix: String,
    /// Monotonic per project.
    pub version: i64,
    pub state: DeploymentState,
    /// JSON object exposed to the site as `JSENV`.
    pub js_env_vars: String,
    /// Raw bundle reused from a previous upload, when set.
    pub raw_bundle_id: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set when the deployment first reaches the deployed state.
    pub deployed_at: Option<DateTime<Utc>>,
    /// Soft-deletion marker.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Deployment {
    /// The unique path segment for this deployment's objects:
    /// `<prefix>-<id>`.
    #[must_use]
    pub fn prefix_id(&self) -> String {
        format!("{}-{}", self.prefix, self.id)
    }
}

/// Input for creating a deployment row at the ingress.
#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub project_id: i64,
    pub user_id: i64,
    /// JSON object text; defaults to `{}`.
    pub js_env_vars: String,
}

impl NewDeployment {
    #[must_use]
    pub fn new(project_id: i64, user_id: i64) -> Self {
        Self {
            project_id,
            user_id,
            js_env_vars: "{}".to_owned(),
        }
    }
}

/// An immutable pointer to a previously uploaded archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBundle {
    pub id: i64,
    pub project_id: i64,
    /// Object store key the archive was uploaded to.
    pub uploaded_path: String,
}

/// A platform user, as far as the worker needs to know.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
}

/// Generate a fresh deployment prefix.
pub fn generate_prefix() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_deployment() -> Deployment {
        Deployment {
            id: 7,
            project_id: 1,
            user_id: 1,
            prefix: "a1b2c3".to_owned(),
            version: 1,
            state: DeploymentState::PendingDeploy,
            js_env_vars: "{}".to_owned(),
            raw_bundle_id: None,
            error_message: None,
            created_at: Utc::now(),
            deployed_at: None,
            deleted_at: None,
        }
    }

    #[test]
    fn prefix_id_joins_prefix_and_id() {
        assert_eq!(test_deployment().prefix_id(), "a1b2c3-7");
    }

    #[test]
    fn generated_prefixes_are_short_and_unique() {
        let a = generate_prefix();
        let b = generate_prefix();

        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn lock_resource_is_scoped_to_project() {
        let project = Project {
            id: 42,
            name: "foo-bar-express".to_owned(),
            user_id: 1,
            watermark: false,
            force_https: false,
            basic_auth_username: None,
            encrypted_basic_auth_password: None,
            max_deploys_kept: 0,
            active_deployment_id: None,
        };

        assert_eq!(project.lock_resource(), "project:42");
    }
}
