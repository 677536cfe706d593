//! `object_store`-backed [`FileTransfer`] implementation.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, Attributes, ObjectStore, PutMultipartOpts, PutOptions, WriteMultipart,
};
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::debug;

use crate::transfer::{Acl, FileTransfer, TransferError};

const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// Configuration for [`ObjectTransfer`].
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Storage type: "local", "memory", or "s3".
    #[serde(default = "default_storage_type")]
    pub storage_type: String,

    /// Base directory for the local backend; buckets become
    /// subdirectories. Ignored for other backends.
    #[serde(default = "default_root")]
    pub root: String,

    /// S3 endpoint URL (for S3-compatible stores).
    pub endpoint: Option<String>,

    /// S3 access key ID; falls back to the AWS environment.
    pub access_key_id: Option<String>,

    /// S3 secret access key; falls back to the AWS environment.
    pub secret_access_key: Option<String>,

    /// Uploads larger than this switch to multipart, in bytes.
    #[serde(default = "default_part_size")]
    pub part_size: usize,
}

fn default_storage_type() -> String {
    "local".to_owned()
}

fn default_root() -> String {
    "/var/lib/rise/objects".to_owned()
}

const fn default_part_size() -> usize {
    DEFAULT_PART_SIZE
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage_type: default_storage_type(),
            root: default_root(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            part_size: default_part_size(),
        }
    }
}

/// Production [`FileTransfer`] over the `object_store` crate.
///
/// Backends are created lazily per (region, bucket) pair and cached for
/// the life of the client.
pub struct ObjectTransfer {
    config: StoreConfig,
    stores: RwLock<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl ObjectTransfer {
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            stores: RwLock::new(HashMap::new()),
        }
    }

    async fn store_for(
        &self,
        region: &str,
        bucket: &str,
    ) -> Result<Arc<dyn ObjectStore>, TransferError> {
        let cache_key = format!("{region}/{bucket}");

        if let Some(store) = self.stores.read().await.get(&cache_key) {
            return Ok(Arc::clone(store));
        }

        let store = self.build_store(region, bucket)?;
        self.stores
            .write()
            .await
            .insert(cache_key, Arc::clone(&store));
        Ok(store)
    }

    fn build_store(&self, region: &str, bucket: &str) -> Result<Arc<dyn ObjectStore>, TransferError> {
        match self.config.storage_type.as_str() {
            "memory" => Ok(Arc::new(object_store::memory::InMemory::new())),
            "local" => {
                let prefix = std::path::Path::new(&self.config.root).join(bucket);
                std::fs::create_dir_all(&prefix)?;
                let store = object_store::local::LocalFileSystem::new_with_prefix(&prefix)
                    .map_err(|e| TransferError::Backend(e.to_string()))?;
                Ok(Arc::new(store))
            }
            "s3" => {
                use object_store::aws::AmazonS3Builder;

                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_region(region);

                if let Some(endpoint) = &self.config.endpoint {
                    builder = builder.with_endpoint(endpoint.as_str()).with_allow_http(true);
                }
                if let Some(key_id) = &self.config.access_key_id {
                    builder = builder.with_access_key_id(key_id.as_str());
                }
                if let Some(secret) = &self.config.secret_access_key {
                    builder = builder.with_secret_access_key(secret.as_str());
                }

                let store = builder
                    .build()
                    .map_err(|e| TransferError::Backend(e.to_string()))?;
                Ok(Arc::new(store))
            }
            other => Err(TransferError::Backend(format!(
                "unsupported storage type: {other}"
            ))),
        }
    }
}

fn upload_attributes(content_type: &str, acl: Acl) -> Attributes {
    let mut attributes = Attributes::new();
    if !content_type.is_empty() {
        attributes.insert(Attribute::ContentType, content_type.to_owned().into());
    }
    attributes.insert(
        Attribute::Metadata(Cow::Borrowed("acl")),
        acl.as_str().into(),
    );
    attributes
}

fn map_store_error(err: object_store::Error) -> TransferError {
    match err {
        object_store::Error::NotFound { path, .. } => TransferError::NotFound(path),
        object_store::Error::PermissionDenied { path, .. }
        | object_store::Error::Unauthenticated { path, .. } => TransferError::Permission(path),
        other => TransferError::Network(other.to_string()),
    }
}

#[async_trait]
impl FileTransfer for ObjectTransfer {
    async fn download(
        &self,
        region: &str,
        bucket: &str,
        key: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), TransferError> {
        let store = self.store_for(region, bucket).await?;
        let path = ObjectPath::from(key);

        let result = store.get(&path).await.map_err(map_store_error)?;
        let mut stream = result.into_stream();

        let mut written = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_store_error)?;
            written += chunk.len();
            sink.write_all(&chunk).await?;
        }
        sink.flush().await?;

        debug!(bucket, key, bytes = written, "downloaded object");
        Ok(())
    }

    async fn upload(
        &self,
        region: &str,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
        acl: Acl,
    ) -> Result<(), TransferError> {
        let store = self.store_for(region, bucket).await?;
        let path = ObjectPath::from(key);
        // The local filesystem backend has nowhere to store attributes
        // and rejects them.
        let attributes = if self.config.storage_type == "local" {
            Attributes::new()
        } else {
            upload_attributes(content_type, acl)
        };
        let size = body.len();

        if size > self.config.part_size {
            let opts = PutMultipartOpts {
                attributes,
                ..Default::default()
            };
            let upload = store
                .put_multipart_opts(&path, opts)
                .await
                .map_err(map_store_error)?;

            let mut writer = WriteMultipart::new_with_chunk_size(upload, self.config.part_size);
            writer.write(&body);
            writer.finish().await.map_err(map_store_error)?;
        } else {
            let opts = PutOptions {
                attributes,
                ..Default::default()
            };
            store
                .put_opts(&path, body.into(), opts)
                .await
                .map_err(map_store_error)?;
        }

        debug!(bucket, key, bytes = size, acl = %acl, "uploaded object");
        Ok(())
    }
}

impl std::fmt::Debug for ObjectTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectTransfer")
            .field("storage_type", &self.config.storage_type)
            .finish_non_exhaustive()
    }
}
