//! Wire formats shared between the ingress API and the deploy worker.

use serde::{Deserialize, Serialize};

/// Exchange that edge caches subscribe to for invalidation events.
pub const EDGES_EXCHANGE: &str = "edges";

/// Routing key for version 1 invalidation messages.
pub const ROUTE_V1_INVALIDATION: &str = "v1.invalidation";

/// Queue consumed by the deploy worker.
pub const DEPLOY_QUEUE: &str = "deploy";

/// Payload of a deploy job on the [`DEPLOY_QUEUE`].
///
/// All flags default to `false` so older producers that omit them keep
/// working.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployJobData {
    /// Deployment to publish.
    pub deployment_id: i64,

    /// Skip the webroot upload phase and only refresh per-domain
    /// metadata. Used to republish an already-deployed deployment.
    #[serde(default)]
    pub skip_webroot_upload: bool,

    /// Deploy from the raw uploaded bundle instead of the optimized one.
    #[serde(default)]
    pub use_raw_bundle: bool,

    /// Do not publish a cache invalidation after uploading.
    #[serde(default)]
    pub skip_invalidation: bool,
}

impl DeployJobData {
    /// Job data for a fresh deployment: full webroot upload and
    /// invalidation.
    #[must_use]
    pub const fn new(deployment_id: i64) -> Self {
        Self {
            deployment_id,
            skip_webroot_upload: false,
            use_raw_bundle: false,
            skip_invalidation: false,
        }
    }
}

/// Body published to [`EDGES_EXCHANGE`] with routing key
/// [`ROUTE_V1_INVALIDATION`].
///
/// Consumers drop cached pages for every listed domain. Delivery is
/// at-least-once; the message is idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct V1InvalidationMessageData {
    /// Domains whose cached content must be dropped.
    pub domains: Vec<String>,
}
