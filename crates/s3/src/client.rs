//! S3 client implementation
//!
//! Wraps aws-sdk-s3 and implements the ObjectStore trait from objsync-core.

use async_trait::async_trait;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, Delete, ObjectIdentifier};
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use bytes::Bytes;
use jiff::Timestamp;
use objsync_core::{
    Alias, CancellationToken, CompletedPart, DeleteBatchOutput, Error, KeyError, ListPage, ListPageRequest,
    ObjectInfo, ObjectStore, Result, RetryConfig, is_retryable_error, retry_with_backoff,
};

/// S3 client wrapper
pub struct S3Client {
    inner: aws_sdk_s3::Client,
    alias: Alias,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl S3Client {
    /// Create a new S3 client from an alias configuration
    pub async fn new(alias: Alias, retry: RetryConfig) -> Result<Self> {
        alias.validate()?;

        let credentials = aws_credential_types::Credentials::new(
            alias.access_key.clone(),
            alias.secret_key.clone(),
            None, // session token
            None, // expiry
            "objsync-static-credentials",
        );

        // The SDK has its own retry layer; ours covers idempotent calls only
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(aws_config::Region::new(alias.region.clone()))
            .endpoint_url(&alias.endpoint)
            .retry_config(aws_config::retry::RetryConfig::disabled())
            .load()
            .await;

        // Path-style addressing unless the alias asks for virtual hosts
        let s3_config = aws_sdk_s3::config::Builder::from(&config)
            .force_path_style(alias.bucket_lookup == "path" || alias.bucket_lookup == "auto")
            .build();

        tracing::debug!(alias = %alias.name, endpoint = %alias.endpoint, "Created S3 client");

        Ok(Self {
            inner: aws_sdk_s3::Client::from_conf(s3_config),
            alias,
            retry,
            cancel: CancellationToken::new(),
        })
    }

    /// Stop waiting between retries once `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Get the underlying aws-sdk-s3 client
    pub fn inner(&self) -> &aws_sdk_s3::Client {
        &self.inner
    }

    pub fn alias(&self) -> &Alias {
        &self.alias
    }

    /// Format AWS SDK error into a detailed error message
    fn format_sdk_error<E: std::fmt::Display>(error: &SdkError<E, HttpResponse>) -> String {
        match error {
            SdkError::ServiceError(service_err) => {
                let err = service_err.err();
                let meta = service_err.raw();
                let mut msg = format!("Service error: {err} (status {})", meta.status().as_u16());
                if let Some(code) = meta.headers().get("x-amz-error-code") {
                    msg.push_str(&format!(" (code: {code})"));
                }
                msg
            }
            SdkError::ConstructionFailure(err) => {
                format!("Request construction failed: {err:?}")
            }
            SdkError::TimeoutError(_) => "Request timeout".to_string(),
            SdkError::DispatchFailure(err) => {
                format!("Network dispatch error: {err:?}")
            }
            SdkError::ResponseError(err) => {
                format!("Response error: {err:?}")
            }
            _ => error.to_string(),
        }
    }

    /// Map an SDK failure onto the engine's error taxonomy
    fn sdk_error<E>(error: SdkError<E, HttpResponse>, context: &str) -> Error
    where
        E: ProvideErrorMetadata + std::fmt::Display,
    {
        let status = match &error {
            SdkError::ServiceError(service_err) => Some(service_err.raw().status().as_u16()),
            _ => None,
        };
        classify(
            error.code(),
            status,
            format!("{context}: {}", Self::format_sdk_error(&error)),
        )
    }
}

/// Pick an error variant from an S3 error code and HTTP status
fn classify(code: Option<&str>, status: Option<u16>, message: String) -> Error {
    match (code, status) {
        (
            Some(
                "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken"
                | "InvalidToken",
            ),
            _,
        )
        | (_, Some(401 | 403)) => Error::Auth(message),
        (Some("NoSuchKey" | "NoSuchBucket" | "NoSuchUpload" | "NotFound"), _) | (_, Some(404)) => {
            Error::NotFound(message)
        }
        (Some("InvalidPart" | "InvalidPartOrder" | "EntityTooSmall"), _) => Error::Multipart(message),
        _ => Error::Network(message),
    }
}

fn to_timestamp(dt: &aws_smithy_types::DateTime) -> Option<Timestamp> {
    Timestamp::new(dt.secs(), dt.subsec_nanos() as i32).ok()
}

fn content_type_for(key: &str) -> String {
    mime_guess::from_path(key)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

fn trim_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<Option<String>> {
        let size = data.len();
        let response = self
            .inner
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type_for(key))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| Self::sdk_error(e, &format!("put {bucket}/{key}")))?;

        tracing::debug!(bucket, key, size, "Put object");
        Ok(response.e_tag().map(trim_etag))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        retry_with_backoff(
            &self.retry,
            &self.cancel,
            "get_object",
            || {
                let call = self.inner.get_object().bucket(bucket).key(key);
                async move {
                    let response = call
                        .send()
                        .await
                        .map_err(|e| Self::sdk_error(e, &format!("get {bucket}/{key}")))?;
                    let body = response
                        .body
                        .collect()
                        .await
                        .map_err(|e| Error::Network(format!("reading {bucket}/{key}: {e}")))?;
                    Ok(body.into_bytes())
                }
            },
            is_retryable_error,
        )
        .await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.inner
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::sdk_error(e, &format!("delete {bucket}/{key}")))?;
        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> Result<DeleteBatchOutput> {
        if keys.is_empty() {
            return Ok(DeleteBatchOutput::default());
        }

        let objects = keys
            .iter()
            .map(|k| ObjectIdentifier::builder().key(k).build())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::General(e.to_string()))?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(false)
            .build()
            .map_err(|e| Error::General(e.to_string()))?;

        let response = retry_with_backoff(
            &self.retry,
            &self.cancel,
            "delete_objects",
            || {
                let call = self
                    .inner
                    .delete_objects()
                    .bucket(bucket)
                    .delete(delete.clone());
                async move {
                    call.send()
                        .await
                        .map_err(|e| Self::sdk_error(e, &format!("delete batch in {bucket}")))
                }
            },
            is_retryable_error,
        )
        .await?;

        let output = DeleteBatchOutput {
            deleted: response
                .deleted()
                .iter()
                .filter_map(|d| d.key().map(str::to_string))
                .collect(),
            errors: response
                .errors()
                .iter()
                .filter_map(|e| {
                    e.key().map(|key| {
                        KeyError::new(
                            key,
                            e.code().unwrap_or("Unknown"),
                            e.message().unwrap_or_default(),
                        )
                    })
                })
                .collect(),
        };

        tracing::debug!(
            bucket,
            sent = keys.len(),
            deleted = output.deleted.len(),
            errors = output.errors.len(),
            "Delete batch answered"
        );
        Ok(output)
    }

    async fn list_page(&self, bucket: &str, request: &ListPageRequest) -> Result<ListPage> {
        let max_keys = i32::try_from(request.max_keys).unwrap_or(i32::MAX);

        let response = retry_with_backoff(
            &self.retry,
            &self.cancel,
            "list_page",
            || {
                let call = self
                    .inner
                    .list_objects_v2()
                    .bucket(bucket)
                    .set_prefix(request.prefix.clone())
                    .set_delimiter(request.delimiter.clone())
                    .set_continuation_token(request.continuation_token.clone())
                    .max_keys(max_keys);
                async move {
                    call.send()
                        .await
                        .map_err(|e| Self::sdk_error(e, &format!("list {bucket}")))
                }
            },
            is_retryable_error,
        )
        .await?;

        let objects = response
            .contents()
            .iter()
            .filter_map(|object| {
                let key = object.key()?;
                Some(ObjectInfo {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: object.last_modified().and_then(to_timestamp),
                    etag: object.e_tag().map(trim_etag),
                })
            })
            .collect();

        let common_prefixes = response
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix().map(str::to_string))
            .collect();

        let is_truncated = response.is_truncated().unwrap_or(false);
        Ok(ListPage {
            objects,
            common_prefixes,
            is_truncated,
            continuation_token: if is_truncated {
                response.next_continuation_token().map(str::to_string)
            } else {
                None
            },
        })
    }

    async fn create_multipart(&self, bucket: &str, key: &str) -> Result<String> {
        let response = self
            .inner
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type(content_type_for(key))
            .send()
            .await
            .map_err(|e| Self::sdk_error(e, &format!("create upload for {bucket}/{key}")))?;

        response
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| Error::Multipart(format!("no upload ID returned for {bucket}/{key}")))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        let number = i32::try_from(part_number)
            .map_err(|_| Error::Multipart(format!("part number {part_number} out of range")))?;

        let response = retry_with_backoff(
            &self.retry,
            &self.cancel,
            "upload_part",
            || {
                let call = self
                    .inner
                    .upload_part()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(number)
                    .body(ByteStream::from(data.clone()));
                async move {
                    call.send().await.map_err(|e| {
                        Self::sdk_error(e, &format!("upload part {part_number} of {bucket}/{key}"))
                    })
                }
            },
            is_retryable_error,
        )
        .await?;

        response
            .e_tag()
            .map(trim_etag)
            .ok_or_else(|| Error::Multipart(format!("no ETag returned for part {part_number}")))
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<Option<String>> {
        let parts = parts
            .iter()
            .map(|p| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();

        let response = self
            .inner
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| Self::sdk_error(e, &format!("complete upload for {bucket}/{key}")))?;

        Ok(response.e_tag().map(trim_etag))
    }

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        self.inner
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| Self::sdk_error(e, &format!("abort upload for {bucket}/{key}")))?;
        Ok(())
    }
}
