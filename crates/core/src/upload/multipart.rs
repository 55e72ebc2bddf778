//! Multipart upload
//!
//! An object is split into fixed-size parts by offset arithmetic before any
//! part is sent. Parts are uploaded through a bounded pool and assembled in
//! ascending order. Every failure after the upload was created, cancellation
//! included, ends in exactly one abort.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{PartSource, UploadResult, UploadStrategy};
use crate::config::{MAX_PARTS, parallelism_or_default};
use crate::error::{Error, Result};
use crate::pool::BoundedPool;
use crate::traits::{CompletedPart, ObjectStore};

/// Byte range of one part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSpec {
    /// 1-based part number
    pub number: u32,
    pub offset: u64,
    pub size: u64,
}

/// Part size to use for an object of `size` bytes
///
/// `part_size` is raised when the object would otherwise need more than
/// [`MAX_PARTS`] parts.
pub fn effective_part_size(size: u64, part_size: u64) -> u64 {
    let part_size = part_size.max(1);
    if size.div_ceil(part_size) > MAX_PARTS {
        size.div_ceil(MAX_PARTS)
    } else {
        part_size
    }
}

/// Split `size` bytes into parts; an empty object yields one empty part
pub fn plan_parts(size: u64, part_size: u64) -> Vec<PartSpec> {
    if size == 0 {
        return vec![PartSpec {
            number: 1,
            offset: 0,
            size: 0,
        }];
    }

    let part_size = effective_part_size(size, part_size);
    (1..=size.div_ceil(part_size))
        .map(|n| {
            let offset = (n - 1) * part_size;
            PartSpec {
                // Bounded by MAX_PARTS
                number: n as u32,
                offset,
                size: part_size.min(size - offset),
            }
        })
        .collect()
}

/// An open multipart upload
///
/// Ends with either [`UploadSession::complete`] or [`UploadSession::abort`];
/// both consume the session.
pub struct UploadSession {
    store: Arc<dyn ObjectStore>,
    upload_id: String,
    bucket: String,
    key: String,
    parts: Vec<PartSpec>,
    total_size: u64,
}

impl UploadSession {
    /// Create the upload on the backend and plan its parts
    pub async fn begin(
        store: Arc<dyn ObjectStore>,
        bucket: &str,
        key: &str,
        total_size: u64,
        part_size: u64,
    ) -> Result<Self> {
        let parts = plan_parts(total_size, part_size);
        let upload_id = store.create_multipart(bucket, key).await?;

        tracing::debug!(
            bucket,
            key,
            upload_id = %upload_id,
            parts = parts.len(),
            total_size,
            "Created multipart upload"
        );

        Ok(Self {
            store,
            upload_id,
            bucket: bucket.to_string(),
            key: key.to_string(),
            parts,
            total_size,
        })
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn parts(&self) -> &[PartSpec] {
        &self.parts
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Assemble the object from `completed`
    ///
    /// Parts are sorted by number and must cover `1..=N` exactly. If they do
    /// not, or the backend rejects the call, the upload is aborted and the
    /// original error returned.
    pub async fn complete(self, mut completed: Vec<CompletedPart>) -> Result<Option<String>> {
        completed.sort_by_key(|p| p.part_number);

        let contiguous = completed.len() == self.parts.len()
            && completed
                .iter()
                .zip(1u32..)
                .all(|(part, expected)| part.part_number == expected);
        if !contiguous {
            let error = Error::Multipart(format!(
                "upload {} has {} of {} parts",
                self.upload_id,
                completed.len(),
                self.parts.len()
            ));
            self.abort().await;
            return Err(error);
        }

        match self
            .store
            .complete_multipart(&self.bucket, &self.key, &self.upload_id, &completed)
            .await
        {
            Ok(etag) => {
                tracing::debug!(
                    bucket = %self.bucket,
                    key = %self.key,
                    upload_id = %self.upload_id,
                    "Completed multipart upload"
                );
                Ok(etag)
            }
            Err(error) => {
                self.abort().await;
                Err(error)
            }
        }
    }

    /// Discard the upload; failures are logged, not returned
    pub async fn abort(self) {
        if let Err(e) = self
            .store
            .abort_multipart(&self.bucket, &self.key, &self.upload_id)
            .await
        {
            tracing::warn!(
                bucket = %self.bucket,
                key = %self.key,
                upload_id = %self.upload_id,
                error = %e,
                "Failed to abort multipart upload"
            );
        } else {
            tracing::debug!(upload_id = %self.upload_id, "Aborted multipart upload");
        }
    }
}

/// Uploads large objects as concurrently uploaded parts
#[derive(Clone)]
pub struct MultipartUploadCoordinator {
    store: Arc<dyn ObjectStore>,
    part_size: u64,
    concurrency: usize,
}

impl MultipartUploadCoordinator {
    pub fn new(store: Arc<dyn ObjectStore>, part_size: u64, concurrency: usize) -> Self {
        Self {
            store,
            part_size: part_size.max(1),
            concurrency: parallelism_or_default(concurrency),
        }
    }

    /// Upload `size` bytes from `source` as a multipart upload
    pub async fn upload(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        key: &str,
        source: Arc<dyn PartSource>,
        size: u64,
    ) -> Result<UploadResult> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let session =
            UploadSession::begin(self.store.clone(), bucket, key, size, self.part_size).await?;
        let part_count = session.parts().len();

        let completed = match self.upload_parts(cancel, &session, source).await {
            Ok(completed) => completed,
            Err(error) => {
                tracing::debug!(bucket, key, error = %error, "Multipart upload failed, aborting");
                session.abort().await;
                return Err(error);
            }
        };

        let etag = session.complete(completed).await?;

        tracing::info!(bucket, key, size, parts = part_count, "Multipart upload complete");
        Ok(UploadResult {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size,
            etag,
            parts: part_count,
            strategy: UploadStrategy::Multipart,
        })
    }

    async fn upload_parts(
        &self,
        cancel: &CancellationToken,
        session: &UploadSession,
        source: Arc<dyn PartSource>,
    ) -> Result<Vec<CompletedPart>> {
        let mut pool: BoundedPool<Result<CompletedPart>> = BoundedPool::new(self.concurrency);
        let admission = pool.admission();
        let mut completed = Vec::with_capacity(session.parts().len());
        let mut failure: Option<Error> = None;

        for planned in session.parts().iter().copied() {
            while let Some(done) = pool.try_join_next() {
                gather(&mut completed, &mut failure, done);
            }
            if failure.is_some() {
                break;
            }

            let permit = match admission.acquire(cancel).await {
                Ok(permit) => permit,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };

            let store = self.store.clone();
            let source = source.clone();
            let bucket = session.bucket.clone();
            let key = session.key.clone();
            let upload_id = session.upload_id.clone();

            pool.dispatch(permit, async move {
                let data = source.read_range(planned.offset, planned.size).await?;
                tracing::debug!(part = planned.number, size = planned.size, "Uploading part");
                let etag = store
                    .upload_part(&bucket, &key, &upload_id, planned.number, data)
                    .await?;
                Ok(CompletedPart {
                    part_number: planned.number,
                    etag,
                })
            });
        }

        while let Some(done) = pool.join_next().await {
            gather(&mut completed, &mut failure, done);
        }

        if failure.is_none() && cancel.is_cancelled() {
            failure = Some(Error::Cancelled);
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(completed),
        }
    }
}

fn gather(
    completed: &mut Vec<CompletedPart>,
    failure: &mut Option<Error>,
    done: Result<Result<CompletedPart>>,
) {
    match done.and_then(|part| part) {
        Ok(part) => completed.push(part),
        Err(error) => {
            if failure.is_none() {
                *failure = Some(error);
            }
        }
    }
}
