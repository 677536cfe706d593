//! Shared contracts for the Rise static-site hosting platform.
//!
//! This crate holds the pieces every Rise service agrees on: the wire
//! format of queue jobs and bus events, the well-known exchange and queue
//! names, and process environment handling (`RISE_ENV`, log level, mailer
//! address).

#![forbid(unsafe_code)]

pub mod env;
pub mod messages;

pub use env::RiseEnv;
pub use messages::{DeployJobData, V1InvalidationMessageData};
pub use messages::{DEPLOY_QUEUE, EDGES_EXCHANGE, ROUTE_V1_INVALIDATION};
