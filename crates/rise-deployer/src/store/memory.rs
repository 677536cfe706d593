//! In-memory deployment store for tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{DeployError, DeployResult};
use crate::state::DeploymentState;
use crate::types::{generate_prefix, Deployment, NewDeployment, Project, RawBundle, User};

use super::{DeploymentStore, DEFAULT_DOMAIN_SUFFIX};

#[derive(Debug, Default)]
struct Inner {
    projects: HashMap<i64, Project>,
    deployments: HashMap<i64, Deployment>,
    raw_bundles: HashMap<i64, RawBundle>,
    users: HashMap<i64, User>,
    domains: HashMap<i64, Vec<String>>,
    next_deployment_id: i64,
    next_raw_bundle_id: i64,
}

/// In-memory [`DeploymentStore`].
///
/// The seeding helpers stand in for the out-of-scope CRUD that creates
/// projects, users, and custom domains in production.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_project(&self, project: Project) {
        self.inner.lock().await.projects.insert(project.id, project);
    }

    pub async fn insert_user(&self, user: User) {
        self.inner.lock().await.users.insert(user.id, user);
    }

    pub async fn add_domain(&self, project_id: i64, name: &str) {
        self.inner
            .lock()
            .await
            .domains
            .entry(project_id)
            .or_default()
            .push(name.to_owned());
    }

    /// Seed a deployment row directly, bypassing version assignment.
    pub async fn seed_deployment(&self, deployment: Deployment) {
        let mut inner = self.inner.lock().await;
        inner.next_deployment_id = inner.next_deployment_id.max(deployment.id);
        inner.deployments.insert(deployment.id, deployment);
    }

    /// Current state of a deployment, for assertions.
    pub async fn deployment(&self, id: i64) -> Option<Deployment> {
        self.inner.lock().await.deployments.get(&id).cloned()
    }

    /// Current state of a project, for assertions.
    pub async fn project(&self, id: i64) -> Option<Project> {
        self.inner.lock().await.projects.get(&id).cloned()
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn find_deployment(&self, id: i64) -> DeployResult<Option<Deployment>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .deployments
            .get(&id)
            .filter(|d| d.deleted_at.is_none())
            .cloned())
    }

    async fn find_project(&self, id: i64) -> DeployResult<Option<Project>> {
        Ok(self.inner.lock().await.projects.get(&id).cloned())
    }

    async fn find_project_by_name(&self, name: &str) -> DeployResult<Option<Project>> {
        let inner = self.inner.lock().await;
        Ok(inner.projects.values().find(|p| p.name == name).cloned())
    }

    async fn find_user(&self, id: i64) -> DeployResult<Option<User>> {
        Ok(self.inner.lock().await.users.get(&id).cloned())
    }

    async fn find_raw_bundle(&self, id: i64) -> DeployResult<Option<RawBundle>> {
        Ok(self.inner.lock().await.raw_bundles.get(&id).cloned())
    }

    async fn insert_deployment(&self, new: NewDeployment) -> DeployResult<Deployment> {
        let mut inner = self.inner.lock().await;

        inner.next_deployment_id += 1;
        let id = inner.next_deployment_id;

        let version = inner
            .deployments
            .values()
            .filter(|d| d.project_id == new.project_id)
            .map(|d| d.version)
            .max()
            .unwrap_or(0)
            + 1;

        let deployment = Deployment {
            id,
            project_id: new.project_id,
            user_id: new.user_id,
            prefix: generate_prefix(),
            version,
            state: DeploymentState::PendingDeploy,
            js_env_vars: new.js_env_vars,
            raw_bundle_id: None,
            error_message: None,
            created_at: Utc::now(),
            deployed_at: None,
            deleted_at: None,
        };

        inner.deployments.insert(id, deployment.clone());
        Ok(deployment)
    }

    async fn insert_raw_bundle(
        &self,
        project_id: i64,
        uploaded_path: &str,
    ) -> DeployResult<RawBundle> {
        let mut inner = self.inner.lock().await;

        inner.next_raw_bundle_id += 1;
        let bundle = RawBundle {
            id: inner.next_raw_bundle_id,
            project_id,
            uploaded_path: uploaded_path.to_owned(),
        };

        inner.raw_bundles.insert(bundle.id, bundle.clone());
        Ok(bundle)
    }

    async fn attach_raw_bundle(&self, deployment_id: i64, raw_bundle_id: i64) -> DeployResult<()> {
        let mut inner = self.inner.lock().await;
        let deployment = inner
            .deployments
            .get_mut(&deployment_id)
            .ok_or(DeployError::DeploymentNotFound(deployment_id))?;
        deployment.raw_bundle_id = Some(raw_bundle_id);
        Ok(())
    }

    async fn update_state(
        &self,
        id: i64,
        state: DeploymentState,
        error_message: Option<&str>,
    ) -> DeployResult<()> {
        let mut inner = self.inner.lock().await;
        let deployment = inner
            .deployments
            .get_mut(&id)
            .ok_or(DeployError::DeploymentNotFound(id))?;

        if !deployment.state.can_transition(state) {
            return Err(DeployError::InvalidStateTransition {
                from: deployment.state.as_str(),
                to: state.as_str(),
            });
        }

        deployment.state = state;
        deployment.error_message = error_message.map(str::to_owned);
        Ok(())
    }

    async fn domain_names(&self, project: &Project) -> DeployResult<Vec<String>> {
        let inner = self.inner.lock().await;
        let mut names = vec![format!("{}{DEFAULT_DOMAIN_SUFFIX}", project.name)];
        if let Some(custom) = inner.domains.get(&project.id) {
            names.extend(custom.iter().cloned());
        }
        Ok(names)
    }

    async fn finalize_deploy(
        &self,
        deployment_id: i64,
        project_id: i64,
        max_deploys_kept: i64,
    ) -> DeployResult<DateTime<Utc>> {
        let mut inner = self.inner.lock().await;
        let deployed_at = Utc::now();

        let deployment = inner
            .deployments
            .get_mut(&deployment_id)
            .ok_or(DeployError::DeploymentNotFound(deployment_id))?;

        if !deployment.state.can_transition(DeploymentState::Deployed) {
            return Err(DeployError::InvalidStateTransition {
                from: deployment.state.as_str(),
                to: DeploymentState::Deployed.as_str(),
            });
        }

        deployment.state = DeploymentState::Deployed;
        deployment.error_message = None;
        if deployment.deployed_at.is_none() {
            deployment.deployed_at = Some(deployed_at);
        }

        let project = inner
            .projects
            .get_mut(&project_id)
            .ok_or(DeployError::ProjectNotFound(project_id))?;
        project.active_deployment_id = Some(deployment_id);

        if max_deploys_kept > 0 {
            let mut deployed: Vec<i64> = inner
                .deployments
                .values()
                .filter(|d| {
                    d.project_id == project_id
                        && d.state == DeploymentState::Deployed
                        && d.deleted_at.is_none()
                })
                .map(|d| d.id)
                .collect();
            deployed.sort_unstable_by(|a, b| b.cmp(a));

            for stale_id in deployed.into_iter().skip(max_deploys_kept as usize) {
                if let Some(stale) = inner.deployments.get_mut(&stale_id) {
                    stale.deleted_at = Some(deployed_at);
                }
            }
        }

        Ok(deployed_at)
    }
}
