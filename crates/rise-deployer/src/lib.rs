//! Rise Deploy Worker
//!
//! This crate publishes uploaded site bundles: it consumes deploy jobs,
//! streams a bundle's files out of object storage into the public
//! webroot, writes per-domain metadata, announces a cache invalidation,
//! and advances the deployment's state — all while holding the project's
//! advisory lock.
//!
//! # State machine
//!
//! Deployments move along a fixed set of edges, enforced at the store
//! boundary:
//!
//! ```text
//! pending_upload ──▶ uploaded ──▶ pending_deploy ──▶ deployed
//!                                      │    ▲
//!                                      ▼    │
//!                                  deploy_failed
//! ```
//!
//! Only the worker writes `deployed` and `deploy_failed`; the ingress
//! path owns the earlier states.
//!
//! # Cleanup discipline
//!
//! The project lock, the scratch bundle file, and the commit transaction
//! are scoped acquisitions: each is released by drop on every exit path,
//! panics and timeouts included.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod extract;
pub mod state;
pub mod store;
pub mod tracker;
pub mod types;
pub mod watermark;
pub mod worker;

pub use config::{DeployerConfig, LimitsConfig};
pub use error::{DeployError, DeployResult};
pub use state::DeploymentState;
pub use store::{DeploymentStore, MemoryStore, PostgresStore, DEFAULT_DOMAIN_SUFFIX};
pub use tracker::{HttpTracker, NoopTracker, RecordingTracker, Tracker};
pub use types::{Deployment, NewDeployment, Project, RawBundle, User};
pub use worker::{DeployWorker, TIMEOUT_ERROR_MESSAGE};
