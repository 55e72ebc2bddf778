//! Storage capability trait
//!
//! The engine talks to object storage only through [`ObjectStore`]. The
//! production implementation lives in `objsync-s3`; [`crate::MemoryStore`]
//! implements the same contract in memory for tests and dry runs.

use async_trait::async_trait;
use bytes::Bytes;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Metadata for one listed object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl ObjectInfo {
    pub fn new(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
            last_modified: None,
            etag: None,
        }
    }
}

/// Parameters for a single list-page call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPageRequest {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub continuation_token: Option<String>,
    pub max_keys: usize,
}

/// One page of list results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListPage {
    pub objects: Vec<ObjectInfo>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    /// Only meaningful when `is_truncated` is true
    pub continuation_token: Option<String>,
}

/// A key the backend refused to delete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyError {
    pub key: String,
    pub code: String,
    pub message: String,
}

impl KeyError {
    pub fn new(key: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Response of one delete-batch call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteBatchOutput {
    pub deleted: Vec<String>,
    pub errors: Vec<KeyError>,
}

/// A finished part, as passed to complete-multipart
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Object storage capability set
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an object in a single call, returning its ETag when known
    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<Option<String>>;

    /// Fetch an object's content
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes>;

    /// Delete one object
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    /// Delete up to 1000 objects in one call
    ///
    /// `Err` means the call itself failed; per-key refusals are reported in
    /// [`DeleteBatchOutput::errors`].
    async fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> Result<DeleteBatchOutput>;

    /// Fetch one page of a listing
    async fn list_page(&self, bucket: &str, request: &ListPageRequest) -> Result<ListPage>;

    /// Start a multipart upload, returning its upload ID
    async fn create_multipart(&self, bucket: &str, key: &str) -> Result<String>;

    /// Upload one part, returning its ETag
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String>;

    /// Assemble uploaded parts into the final object
    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<Option<String>>;

    /// Discard a multipart upload and its parts
    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()>;
}
