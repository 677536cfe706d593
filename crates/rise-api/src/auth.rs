//! Authenticated user identity.
//!
//! Authentication itself lives in the platform gateway, which verifies
//! the bearer token and forwards the user id in a trusted header. This
//! module only carries that identity to the handlers: the middleware
//! turns the header into a request extension, and the extractor rejects
//! requests that arrive without one.

use axum::extract::{FromRequestParts, Request};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::ApiError;

/// Header set by the authenticating gateway.
pub const USER_ID_HEADER: &str = "x-rise-user-id";

/// The authenticated user's id, as asserted by the gateway.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub i64);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .copied()
            .ok_or(ApiError::Unauthorized)
    }
}

/// Middleware translating the gateway identity header into a
/// [`CurrentUser`] extension.
pub async fn gateway_identity(mut request: Request, next: Next) -> Response {
    let user_id = request
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<i64>().ok());

    if let Some(id) = user_id {
        request.extensions_mut().insert(CurrentUser(id));
    }

    next.run(request).await
}
