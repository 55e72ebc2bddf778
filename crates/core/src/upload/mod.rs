//! Object upload
//!
//! [`Uploader`] picks a strategy by size: objects below the multipart
//! threshold go up in one `put_object` call, larger ones through the
//! [`MultipartUploadCoordinator`].

mod multipart;

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::traits::ObjectStore;

pub use multipart::{MultipartUploadCoordinator, PartSpec, UploadSession, effective_part_size, plan_parts};

/// Random-access byte source for uploads
#[async_trait]
pub trait PartSource: Send + Sync {
    /// Read exactly `len` bytes starting at `offset`
    async fn read_range(&self, offset: u64, len: u64) -> Result<Bytes>;
}

#[async_trait]
impl PartSource for Bytes {
    async fn read_range(&self, offset: u64, len: u64) -> Result<Bytes> {
        let start = usize::try_from(offset)
            .map_err(|_| Error::General(format!("offset {offset} out of range")))?;
        let end = start
            .checked_add(usize::try_from(len).unwrap_or(usize::MAX))
            .filter(|&end| end <= self.len())
            .ok_or_else(|| {
                Error::General(format!(
                    "range {offset}+{len} exceeds buffer of {} bytes",
                    self.len()
                ))
            })?;
        Ok(self.slice(start..end))
    }
}

/// A local file read with positional reads
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the file
    pub async fn size(&self) -> Result<u64> {
        Ok(tokio::fs::metadata(&self.path).await?.len())
    }
}

#[async_trait]
impl PartSource for FileSource {
    async fn read_range(&self, offset: u64, len: u64) -> Result<Bytes> {
        let len = usize::try_from(len)
            .map_err(|_| Error::General(format!("part of {len} bytes is too large")))?;

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/// How an object was uploaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStrategy {
    Simple,
    Multipart,
}

/// Outcome of a successful upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    pub parts: usize,
    pub strategy: UploadStrategy,
}

/// Size-based upload facade
#[derive(Clone)]
pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    multipart: MultipartUploadCoordinator,
    threshold: u64,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, config: &TransferConfig) -> Self {
        Self {
            multipart: MultipartUploadCoordinator::new(
                store.clone(),
                config.part_size,
                config.upload_concurrency,
            ),
            store,
            threshold: config.multipart_threshold,
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Upload `size` bytes from `source` to `bucket/key`
    pub async fn upload(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        key: &str,
        source: Arc<dyn PartSource>,
        size: u64,
    ) -> Result<UploadResult> {
        if size >= self.threshold {
            return self
                .multipart
                .upload(cancel, bucket, key, source, size)
                .await;
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let data = source.read_range(0, size).await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        // An already-sent put runs to completion
        let etag = self.store.put_object(bucket, key, data).await?;

        tracing::debug!(bucket, key, size, "Uploaded object");
        Ok(UploadResult {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size,
            etag,
            parts: 1,
            strategy: UploadStrategy::Simple,
        })
    }

    /// Upload a local file
    pub async fn upload_file(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        key: &str,
        path: &Path,
    ) -> Result<UploadResult> {
        let source = FileSource::new(path);
        let size = source.size().await?;
        self.upload(cancel, bucket, key, Arc::new(source), size).await
    }
}
