//! API error envelope.
//!
//! Every error response uses the shape
//! `{"error": <slug>, "error_description": <human string>}`, except
//! validation failures, which use
//! `{"error": "invalid_params", "errors": {<field>: <reason>}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use rise_deployer::DeployError;
use rise_state::BusError;
use rise_store::TransferError;

/// Errors surfaced by the ingress handlers.
#[derive(Debug)]
pub enum ApiError {
    /// 400 `invalid_request`.
    InvalidRequest(&'static str),
    /// 422 `invalid_params` with a per-field reason.
    InvalidParams(&'static str, &'static str),
    /// 404 `not_found`.
    NotFound(&'static str),
    /// 401 `invalid_token`.
    Unauthorized,
    /// 500 `internal_server_error`; the detail is logged, not returned.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::InvalidRequest(description) => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "invalid_request",
                    "error_description": description,
                })),
            )
                .into_response(),
            Self::InvalidParams(field, reason) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({
                    "error": "invalid_params",
                    "errors": { field: reason },
                })),
            )
                .into_response(),
            Self::NotFound(description) => (
                StatusCode::NOT_FOUND,
                Json(json!({
                    "error": "not_found",
                    "error_description": description,
                })),
            )
                .into_response(),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": "invalid_token",
                    "error_description": "access token is invalid",
                })),
            )
                .into_response(),
            Self::Internal(detail) => {
                tracing::error!(error = %detail, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal_server_error" })),
                )
                    .into_response()
            }
        }
    }
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<TransferError> for ApiError {
    fn from(err: TransferError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<BusError> for ApiError {
    fn from(err: BusError) -> Self {
        Self::Internal(err.to_string())
    }
}
