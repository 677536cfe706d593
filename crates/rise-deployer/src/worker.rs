//! The deploy worker.
//!
//! Consumes deploy jobs, publishes a deployment's files to the public
//! webroot, writes per-domain metadata, announces a cache invalidation,
//! and commits the state change — all under the project's advisory lock.
//! The lock guard, the scratch file, and the commit transaction release
//! on every exit path.

use std::io::Seek;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use rise_core::messages::{
    DeployJobData, V1InvalidationMessageData, DEPLOY_QUEUE, EDGES_EXCHANGE, ROUTE_V1_INVALIDATION,
};
use rise_state::{LockBackend, MessageBus};
use rise_store::{Acl, BucketConfig, FileTransfer};

use crate::config::LimitsConfig;
use crate::error::{DeployError, DeployResult};
use crate::extract::{self, ArchiveEntry};
use crate::state::DeploymentState;
use crate::store::DeploymentStore;
use crate::tracker::Tracker;
use crate::types::{Deployment, Project};
use crate::watermark;

/// Error message recorded on a deployment when the upload phase times
/// out.
pub const TIMEOUT_ERROR_MESSAGE: &str = "Timed out due to too many files";

/// How long the advisory lock may outlive a crashed worker on backends
/// with expiring locks.
const LOCK_TTL: Duration = Duration::from_secs(600);

/// Orchestrates the deploy pipeline for one job at a time.
pub struct DeployWorker {
    store: Arc<dyn DeploymentStore>,
    locks: Arc<dyn LockBackend>,
    transfer: Arc<dyn FileTransfer>,
    bus: Arc<dyn MessageBus>,
    tracker: Arc<dyn Tracker>,
    bucket: BucketConfig,
    limits: LimitsConfig,
    upload_timeout: Duration,
}

impl DeployWorker {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        locks: Arc<dyn LockBackend>,
        transfer: Arc<dyn FileTransfer>,
        bus: Arc<dyn MessageBus>,
        tracker: Arc<dyn Tracker>,
        bucket: BucketConfig,
        limits: LimitsConfig,
    ) -> Self {
        let upload_timeout = Duration::from_secs(limits.upload_timeout_secs);
        Self {
            store,
            locks,
            transfer,
            bus,
            tracker,
            bucket,
            limits,
            upload_timeout,
        }
    }

    /// Override the upload deadline. Used by tests to force timeouts.
    #[must_use]
    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = timeout;
        self
    }

    /// Execute one deploy job.
    ///
    /// Returns [`DeployError::ProjectLocked`] without touching any state
    /// when another worker holds the project; the queue redelivers the
    /// job. Any error before the commit leaves the deployment state
    /// untouched, except a timeout, which records `deploy_failed`.
    pub async fn work(&self, payload: &[u8]) -> DeployResult<()> {
        let job: DeployJobData = serde_json::from_slice(payload)
            .map_err(|e| DeployError::Serialisation(format!("invalid job payload: {e}")))?;

        let deployment = self
            .store
            .find_deployment(job.deployment_id)
            .await?
            .ok_or(DeployError::DeploymentNotFound(job.deployment_id))?;

        let project = self
            .store
            .find_project(deployment.project_id)
            .await?
            .ok_or(DeployError::ProjectNotFound(deployment.project_id))?;

        // Held until return; drop releases on every path, panics
        // included.
        let _lock = self
            .locks
            .try_acquire(&project.lock_resource(), LOCK_TTL)
            .await?
            .ok_or(DeployError::ProjectLocked)?;

        // The bundle is either missing or not prepared for deploying.
        if matches!(
            deployment.state,
            DeploymentState::Uploaded | DeploymentState::PendingUpload
        ) {
            return Err(DeployError::UnexpectedState(deployment.state));
        }

        let prefix_id = deployment.prefix_id();
        info!(
            deployment_id = deployment.id,
            project = %project.name,
            prefix_id = %prefix_id,
            "starting deploy"
        );

        // A job for a failed deployment is a retry: move it back to
        // pending_deploy (clearing the old error) so the commit below
        // is a legal transition.
        if deployment.state == DeploymentState::DeployFailed {
            self.store
                .update_state(deployment.id, DeploymentState::PendingDeploy, None)
                .await?;
        }

        if !job.skip_webroot_upload {
            // A deployed deployment can only be republished
            // metadata-only.
            if deployment.state == DeploymentState::Deployed {
                return Err(DeployError::UnexpectedState(deployment.state));
            }

            self.upload_webroot(&deployment, &project, &job, &prefix_id)
                .await?;
        }

        let meta = domain_meta_json(&prefix_id, &project)?;
        let domains = self.store.domain_names(&project).await?;

        for domain in &domains {
            self.transfer
                .upload(
                    &self.bucket.region,
                    &self.bucket.name,
                    &format!("domains/{domain}/meta.json"),
                    meta.clone(),
                    "application/json",
                    Acl::PublicRead,
                )
                .await?;
        }

        if !job.skip_invalidation {
            let message = serde_json::to_vec(&V1InvalidationMessageData {
                domains: domains.clone(),
            })
            .map_err(|e| DeployError::Serialisation(e.to_string()))?;

            self.bus
                .publish(EDGES_EXCHANGE, ROUTE_V1_INVALIDATION, &message)
                .await?;
        }

        let deployed_at = self
            .store
            .finalize_deploy(deployment.id, project.id, project.max_deploys_kept)
            .await?;

        info!(
            deployment_id = deployment.id,
            project = %project.name,
            "deploy committed"
        );

        self.emit_deployed_event(&deployment, &project, deployed_at)
            .await;

        Ok(())
    }

    /// Download the bundle and publish its files under the webroot.
    async fn upload_webroot(
        &self,
        deployment: &Deployment,
        project: &Project,
        job: &DeployJobData,
        prefix_id: &str,
    ) -> DeployResult<()> {
        let bundle_key = self.resolve_bundle_key(deployment, job, prefix_id).await?;

        // Anonymous scratch file: already unlinked, so it disappears on
        // every exit path.
        let mut file = tempfile::tempfile()?;
        {
            let mut sink = tokio::fs::File::from_std(file.try_clone()?);
            self.transfer
                .download(&self.bucket.region, &self.bucket.name, &bundle_key, &mut sink)
                .await?;
            sink.flush().await?;
        }
        file.seek(std::io::SeekFrom::Start(0))?;

        debug!(bundle_key = %bundle_key, "bundle downloaded, extracting");

        let entries = extract::stream_entries(file, self.limits.extract_buffer);
        let webroot = format!("deployments/{prefix_id}/webroot");

        let loop_task = tokio::spawn(run_upload_loop(
            Arc::clone(&self.transfer),
            self.bucket.clone(),
            webroot.clone(),
            project.watermark,
            self.limits.max_file_size_to_watermark,
            entries,
        ));

        match tokio::time::timeout(self.upload_timeout, loop_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => return Err(err),
            Ok(Err(join_err)) => {
                return Err(DeployError::Archive(format!(
                    "upload loop failed: {join_err}"
                )))
            }
            Err(_elapsed) => {
                // The abandoned loop may upload a few more files; that
                // is tolerated, uploads are idempotent by key.
                if let Err(e) = self
                    .store
                    .update_state(
                        deployment.id,
                        DeploymentState::DeployFailed,
                        Some(TIMEOUT_ERROR_MESSAGE),
                    )
                    .await
                {
                    error!(
                        deployment_id = deployment.id,
                        error = %e,
                        "failed to record deploy timeout"
                    );
                }
                return Err(DeployError::Timeout);
            }
        }

        // js_env_vars was validated as a JSON object at ingress; check
        // again before splicing it into executable output.
        let parsed: serde_json::Value = serde_json::from_str(&deployment.js_env_vars)
            .map_err(|e| DeployError::Serialisation(format!("js_env_vars is not valid JSON: {e}")))?;
        if !parsed.is_object() {
            return Err(DeployError::Serialisation(
                "js_env_vars is not a JSON object".to_owned(),
            ));
        }

        self.transfer
            .upload(
                &self.bucket.region,
                &self.bucket.name,
                &format!("{webroot}/jsenv.js"),
                Bytes::from(jsenv_body(&deployment.js_env_vars)),
                "application/javascript",
                Acl::PublicRead,
            )
            .await?;

        Ok(())
    }

    /// Which archive to deploy from.
    ///
    /// The optimized bundle by default; with `use_raw_bundle`, the raw
    /// bundle the deployment was uploaded with (falling back to the
    /// conventional raw-bundle key when the deployment predates bundle
    /// records).
    async fn resolve_bundle_key(
        &self,
        deployment: &Deployment,
        job: &DeployJobData,
        prefix_id: &str,
    ) -> DeployResult<String> {
        let optimized = format!("deployments/{prefix_id}/optimized-bundle.tar.gz");

        if !job.use_raw_bundle {
            return Ok(optimized);
        }

        match deployment.raw_bundle_id {
            Some(bundle_id) => match self.store.find_raw_bundle(bundle_id).await? {
                Some(bundle) => Ok(bundle.uploaded_path),
                None => Ok(optimized),
            },
            None => Ok(format!("deployments/{prefix_id}/raw-bundle.tar.gz")),
        }
    }

    /// Post-commit analytics; failures are logged and swallowed.
    async fn emit_deployed_event(
        &self,
        deployment: &Deployment,
        project: &Project,
        deployed_at: chrono::DateTime<chrono::Utc>,
    ) {
        let user = match self.store.find_user(deployment.user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => return,
            Err(e) => {
                warn!(user_id = deployment.user_id, error = %e, "failed to load user for tracking");
                return;
            }
        };

        let properties = serde_json::json!({
            "projectName": project.name,
            "deploymentId": deployment.id,
            "deploymentPrefix": deployment.prefix,
            "deploymentVersion": deployment.version,
            "timeTakenInSeconds": (deployed_at - deployment.created_at).num_seconds(),
        });

        if let Err(e) = self
            .tracker
            .track(&user.id.to_string(), "Project Deployed", properties)
            .await
        {
            warn!(user_id = user.id, error = %e, "failed to track deploy event");
        }
    }

    /// Consume the deploy queue until the bus fails.
    ///
    /// Transient failures return the job for redelivery; terminal ones
    /// (timeout, state-machine violations, malformed payloads) are
    /// acked so they don't loop forever.
    pub async fn run(&self) -> DeployResult<()> {
        let visibility = Duration::from_secs(self.limits.job_visibility_secs);

        loop {
            let Some(message) = self.bus.receive(DEPLOY_QUEUE, visibility).await? else {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            };

            match self.work(&message.payload).await {
                Ok(()) => {
                    self.bus.ack(DEPLOY_QUEUE, &message.id).await?;
                }
                Err(err) if err.is_redeliverable() => {
                    warn!(error = %err, attempt = message.attempt, "deploy job failed, returning to queue");
                    self.bus.nack(DEPLOY_QUEUE, &message.id).await?;
                }
                Err(err) => {
                    error!(error = %err, "deploy job failed permanently");
                    self.bus.ack(DEPLOY_QUEUE, &message.id).await?;
                }
            }
        }
    }
}

impl std::fmt::Debug for DeployWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployWorker")
            .field("bucket", &self.bucket.name)
            .finish_non_exhaustive()
    }
}

/// Upload every eligible archive entry to the webroot.
///
/// Runs detached from the orchestrator so the deadline can abandon it.
async fn run_upload_loop(
    transfer: Arc<dyn FileTransfer>,
    bucket: BucketConfig,
    webroot: String,
    watermark_enabled: bool,
    max_file_size_to_watermark: u64,
    mut entries: mpsc::Receiver<std::io::Result<ArchiveEntry>>,
) -> DeployResult<()> {
    while let Some(item) = entries.recv().await {
        let entry = item.map_err(|e| DeployError::Archive(e.to_string()))?;
        if entry.is_dir {
            continue;
        }

        let cleaned = clean_path(&entry.path);
        if !is_valid_object_path(&cleaned) {
            warn!(path = %entry.path, "file name contains invalid characters, skipping entry");
            continue;
        }

        let content_type = content_type_for(&cleaned);

        let mut data = entry.data;
        if watermark_enabled
            && content_type == "text/html"
            && entry.size <= max_file_size_to_watermark
        {
            match watermark::inject(&data) {
                Ok(injected) => data = injected,
                Err(e) => {
                    warn!(path = %cleaned, error = %e, "failed to inject watermark, skipping entry");
                    continue;
                }
            }
        }

        transfer
            .upload(
                &bucket.region,
                &bucket.name,
                &format!("{webroot}/{cleaned}"),
                data,
                &content_type,
                Acl::PublicRead,
            )
            .await?;
    }

    Ok(())
}

/// Normalise an archive path: strip `.` segments, collapse separators,
/// and resolve `..` without escaping the root.
fn clean_path(raw: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Whether every path component sticks to the object-key safe set
/// `[0-9A-Za-z,!_'().*-]`.
fn is_valid_object_path(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    path.split('/')
        .all(|component| !component.is_empty() && component.chars().all(is_safe_key_char))
}

const fn is_safe_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ',' | '!' | '_' | '\'' | '(' | ')' | '.' | '*' | '-')
}

/// Content type for a file, derived from its extension with any
/// parameters stripped. Empty when unknown.
fn content_type_for(path: &str) -> String {
    match mime_guess::from_path(path).first() {
        Some(mime) => mime.essence_str().to_owned(),
        None => String::new(),
    }
}

/// The `jsenv.js` body: a UMD-style wrapper around the deployment's
/// environment object.
fn jsenv_body(js_env_vars: &str) -> String {
    format!(
        "(function(global, env) {{\n  if (typeof module === \"object\" && typeof module.exports === \"object\") {{\n    module.exports = env;\n  }} else {{\n    global.JSENV = env;\n  }}\n}}(this, {js_env_vars}));\n"
    )
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Serialize)]
struct DomainMeta<'a> {
    prefix: &'a str,
    #[serde(skip_serializing_if = "is_false")]
    force_https: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    basic_auth_username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    basic_auth_password: Option<&'a str>,
}

/// The per-domain metadata document. Publicly readable; carries no
/// plaintext secrets.
fn domain_meta_json(prefix_id: &str, project: &Project) -> DeployResult<Bytes> {
    let meta = DomainMeta {
        prefix: prefix_id,
        force_https: project.force_https,
        basic_auth_username: project.basic_auth_username.as_deref(),
        basic_auth_password: project.encrypted_basic_auth_password.as_deref(),
    };

    serde_json::to_vec(&meta)
        .map(Bytes::from)
        .map_err(|e| DeployError::Serialisation(e.to_string()))
}
