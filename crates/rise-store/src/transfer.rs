use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWrite;

/// Canned access control for uploaded objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acl {
    /// Only the platform can read the object.
    Private,
    /// The object is served directly to visitors.
    PublicRead,
}

impl Acl {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::PublicRead => "public-read",
        }
    }
}

impl fmt::Display for Acl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors from object storage operations.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The bucket a service reads and writes.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketConfig {
    /// Bucket region.
    #[serde(default = "default_region")]
    pub region: String,

    /// Bucket name.
    #[serde(default = "default_bucket")]
    pub name: String,
}

fn default_region() -> String {
    "us-east-1".to_owned()
}

fn default_bucket() -> String {
    "rise-deployments".to_owned()
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            name: default_bucket(),
        }
    }
}

/// Streaming download and upload of blobs.
///
/// Implementations must be safe to share across concurrent jobs. Callers
/// pass the region and bucket on every call so one client can serve any
/// bucket the platform uses.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Download an object, streaming its bytes into `sink`.
    async fn download(
        &self,
        region: &str,
        bucket: &str,
        key: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), TransferError>;

    /// Upload an object.
    ///
    /// An empty `content_type` leaves the content type unset. Uploads
    /// larger than the implementation's part size use multipart upload.
    async fn upload(
        &self,
        region: &str,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
        acl: Acl,
    ) -> Result<(), TransferError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acl_names() {
        assert_eq!(Acl::Private.as_str(), "private");
        assert_eq!(Acl::PublicRead.as_str(), "public-read");
    }
}
