//! Recording test double for [`FileTransfer`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::transfer::{Acl, FileTransfer, TransferError};

/// A recorded upload with all call arguments and the uploaded body.
#[derive(Debug, Clone)]
pub struct UploadCall {
    pub region: String,
    pub bucket: String,
    pub key: String,
    pub body: Bytes,
    pub content_type: String,
    pub acl: Acl,
}

#[derive(Debug, Default)]
struct Inner {
    objects: HashMap<String, Bytes>,
    uploads: Vec<UploadCall>,
    downloads: Vec<String>,
}

/// [`FileTransfer`] double that records calls and serves seeded objects.
///
/// Uploads also land in the object map, so a download after an upload
/// observes the uploaded bytes. Optional per-upload latency and injected
/// failures drive the timeout and error-path tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransfer {
    inner: Arc<Mutex<Inner>>,
    upload_delay: Option<Duration>,
    upload_error: Option<&'static str>,
}

impl RecordingTransfer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before every upload completes.
    #[must_use]
    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = Some(delay);
        self
    }

    /// Fail every upload with a network error.
    #[must_use]
    pub fn with_upload_error(mut self, message: &'static str) -> Self {
        self.upload_error = Some(message);
        self
    }

    /// Seed an object so a later download finds it.
    pub fn put_object(&self, key: &str, body: Bytes) {
        self.inner
            .lock()
            .expect("recording transfer lock poisoned")
            .objects
            .insert(key.to_owned(), body);
    }

    /// All recorded uploads, in call order.
    #[must_use]
    pub fn uploads(&self) -> Vec<UploadCall> {
        self.inner
            .lock()
            .expect("recording transfer lock poisoned")
            .uploads
            .clone()
    }

    #[must_use]
    pub fn upload_count(&self) -> usize {
        self.inner
            .lock()
            .expect("recording transfer lock poisoned")
            .uploads
            .len()
    }

    /// Body last uploaded to `key`, if any.
    #[must_use]
    pub fn uploaded(&self, key: &str) -> Option<Bytes> {
        self.inner
            .lock()
            .expect("recording transfer lock poisoned")
            .objects
            .get(key)
            .cloned()
    }

    /// Keys downloaded so far, in call order.
    #[must_use]
    pub fn downloads(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("recording transfer lock poisoned")
            .downloads
            .clone()
    }
}

#[async_trait]
impl FileTransfer for RecordingTransfer {
    async fn download(
        &self,
        _region: &str,
        _bucket: &str,
        key: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), TransferError> {
        let body = {
            let mut inner = self.inner.lock().expect("recording transfer lock poisoned");
            inner.downloads.push(key.to_owned());
            inner.objects.get(key).cloned()
        };

        let body = body.ok_or_else(|| TransferError::NotFound(key.to_owned()))?;
        sink.write_all(&body).await?;
        sink.flush().await?;
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
        if let Some(delay) = self.upload_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.upload_error {
            return Err(TransferError::Network(message.to_owned()));
        }

        let mut inner = self.inner.lock().expect("recording transfer lock poisoned");
        inner.objects.insert(key.to_owned(), body.clone());
        inner.uploads.push(UploadCall {
            region: region.to_owned(),
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            body,
            content_type: content_type.to_owned(),
            acl,
        });
        Ok(())
    }
}
