//! Object storage client for Rise services.
//!
//! Everything a deployment touches in object storage goes through the
//! [`FileTransfer`] trait: the raw and optimized bundles, every webroot
//! file, and per-domain metadata. The production implementation
//! ([`ObjectTransfer`]) is built on the `object_store` crate and supports
//! local filesystem, in-memory, and S3 backends; uploads switch to
//! multipart once the body exceeds the configured part size.
//! [`RecordingTransfer`] is the test double: it records every call and
//! can inject latency and failures.

#![forbid(unsafe_code)]

mod object;
mod recording;
mod transfer;

pub use object::{ObjectTransfer, StoreConfig};
pub use recording::{RecordingTransfer, UploadCall};
pub use transfer::{Acl, BucketConfig, FileTransfer, TransferError};
