//! Deployment endpoints.
//!
//! `POST /projects/{name}/deployments` accepts a multipart upload of a
//! site bundle, stores it privately, records a deployment in
//! `pending_deploy`, and enqueues a deploy job.
//! `GET /projects/{name}/deployments/{id}` reports a deployment's state.

use axum::extract::multipart::MultipartRejection;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tracing::info;

use rise_core::messages::{DeployJobData, DEPLOY_QUEUE};
use rise_deployer::{Deployment, DeploymentStore, NewDeployment, Project};
use rise_state::MessageBus;
use rise_store::{Acl, FileTransfer};

use crate::auth::CurrentUser;
use crate::error::ApiError;
use crate::AppState;

/// Response envelope for a single deployment.
#[derive(Debug, Serialize)]
pub struct DeploymentEnvelope {
    deployment: DeploymentSummary,
}

#[derive(Debug, Serialize)]
struct DeploymentSummary {
    id: i64,
    state: &'static str,
}

impl From<&Deployment> for DeploymentEnvelope {
    fn from(deployment: &Deployment) -> Self {
        Self {
            deployment: DeploymentSummary {
                id: deployment.id,
                state: deployment.state.as_str(),
            },
        }
    }
}

/// Accept a site bundle and queue it for deployment.
pub async fn create_deployment(
    State(state): State<AppState>,
    Path(name): Path<String>,
    user: CurrentUser,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<DeploymentEnvelope>), ApiError> {
    let mut multipart = multipart.map_err(|_| {
        ApiError::InvalidRequest("the request should be encoded in multipart/form-data format")
    })?;

    let project = authorized_project(&state, &name, user).await?;

    let payload = read_payload_part(&mut multipart, state.config.uploads.max_upload_size).await?;
    let Some(payload) = payload else {
        return Err(ApiError::InvalidParams("payload", "is required"));
    };

    let deployment = state
        .store
        .insert_deployment(NewDeployment::new(project.id, user.0))
        .await?;

    let bundle_key = format!(
        "deployments/{}/raw-bundle.tar.gz",
        deployment.prefix_id()
    );
    state
        .transfer
        .upload(
            &state.config.bucket.region,
            &state.config.bucket.name,
            &bundle_key,
            payload,
            "",
            Acl::Private,
        )
        .await?;

    let bundle = state.store.insert_raw_bundle(project.id, &bundle_key).await?;
    state
        .store
        .attach_raw_bundle(deployment.id, bundle.id)
        .await?;

    let job = DeployJobData {
        deployment_id: deployment.id,
        skip_webroot_upload: false,
        use_raw_bundle: true,
        skip_invalidation: false,
    };
    let job_payload = serde_json::to_vec(&job)
        .map_err(|e| ApiError::Internal(format!("failed to encode deploy job: {e}")))?;
    state.bus.enqueue(DEPLOY_QUEUE, &job_payload).await?;

    info!(
        project = %project.name,
        deployment_id = deployment.id,
        bundle_key = %bundle_key,
        "deployment accepted"
    );

    Ok((StatusCode::ACCEPTED, Json((&deployment).into())))
}

/// Report a deployment's current state.
pub async fn get_deployment(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, i64)>,
    user: CurrentUser,
) -> Result<Json<DeploymentEnvelope>, ApiError> {
    let project = authorized_project(&state, &name, user).await?;

    let deployment = state
        .store
        .find_deployment(id)
        .await?
        .filter(|d| d.project_id == project.id)
        .ok_or(ApiError::NotFound("deployment could not be found"))?;

    Ok(Json((&deployment).into()))
}

/// Resolve the project and confirm the caller owns it.
async fn authorized_project(
    state: &AppState,
    name: &str,
    user: CurrentUser,
) -> Result<Project, ApiError> {
    state
        .store
        .find_project_by_name(name)
        .await?
        .filter(|project| project.user_id == user.0)
        .ok_or(ApiError::NotFound("project could not be found"))
}

/// Stream the `payload` part into memory.
///
/// Every field's bytes count toward the upload limit, so an oversized
/// request fails fast whichever part carries the bulk.
async fn read_payload_part(
    multipart: &mut Multipart,
    max_upload_size: usize,
) -> Result<Option<Bytes>, ApiError> {
    let mut total = 0usize;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::InvalidRequest("invalid multipart body"))?
    {
        let is_payload = field.name() == Some("payload");
        let mut buffer = is_payload.then(BytesMut::new);

        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|_| ApiError::InvalidRequest("invalid multipart body"))?
        {
            total += chunk.len();
            if total > max_upload_size {
                return Err(ApiError::InvalidRequest("request body is too large"));
            }
            if let Some(buffer) = &mut buffer {
                buffer.extend_from_slice(&chunk);
            }
        }

        if let Some(buffer) = buffer {
            return Ok(Some(buffer.freeze()));
        }
    }

    Ok(None)
}
