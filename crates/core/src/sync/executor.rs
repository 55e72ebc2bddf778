//! Plan execution
//!
//! Uploads and deletes run concurrently. Failures are recorded per
//! operation in [`SyncResult::errors`] rather than returned.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::Id;
use tokio_util::sync::CancellationToken;

use super::{Operation, OperationKind, SyncError, SyncResult};
use crate::config::{TransferConfig, parallelism_or_default};
use crate::delete::{BatchDeleter, DeleteResult, ParallelDeleteCoordinator};
use crate::error::{Error, Result};
use crate::pool::BoundedPool;
use crate::traits::ObjectStore;
use crate::upload::{UploadResult, Uploader};

/// Carries out a sync plan against one bucket
#[derive(Clone)]
pub struct Executor {
    uploader: Uploader,
    deleter: ParallelDeleteCoordinator,
    upload_parallelism: usize,
    delete_parallelism: usize,
}

struct UploadJob {
    key: String,
    path: PathBuf,
}

impl Executor {
    pub fn new(store: Arc<dyn ObjectStore>, config: &TransferConfig) -> Self {
        Self {
            uploader: Uploader::new(store.clone(), config),
            deleter: ParallelDeleteCoordinator::new(BatchDeleter::with_batch_size(
                store,
                config.batch_size(),
            )),
            upload_parallelism: config.sync_parallelism,
            delete_parallelism: config.delete_parallelism,
        }
    }

    /// Override the number of concurrent file uploads; zero keeps the default
    pub fn with_upload_parallelism(mut self, parallelism: usize) -> Self {
        if parallelism > 0 {
            self.upload_parallelism = parallelism;
        }
        self
    }

    /// Run every upload and delete in `operations`
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        operations: &[Operation],
    ) -> SyncResult {
        let mut uploads = Vec::new();
        let mut deletes = Vec::new();
        let mut result = SyncResult::default();

        for op in operations {
            match op.kind {
                OperationKind::Upload => match &op.local_path {
                    Some(path) => uploads.push(UploadJob {
                        key: op.remote_key.clone(),
                        path: path.clone(),
                    }),
                    None => result.errors.push(SyncError {
                        key: op.remote_key.clone(),
                        operation: OperationKind::Upload,
                        code: "invalid_state".to_string(),
                        message: "upload without a local path".to_string(),
                    }),
                },
                OperationKind::Delete => deletes.push(op.remote_key.clone()),
                OperationKind::Skip => result.files_skipped += 1,
            }
        }

        tracing::debug!(
            bucket,
            uploads = uploads.len(),
            deletes = deletes.len(),
            skipped = result.files_skipped,
            "Executing plan"
        );

        let (uploaded, deleted) = tokio::join!(
            self.run_uploads(cancel, bucket, uploads),
            self.run_deletes(cancel, bucket, deletes),
        );

        for outcome in uploaded {
            match outcome {
                (_, Ok(upload)) => {
                    result.files_uploaded += 1;
                    result.bytes_uploaded += upload.size;
                }
                (key, Err(e)) => {
                    tracing::warn!(key = %key, error = %e, "Upload failed");
                    result.errors.push(sync_error(key, OperationKind::Upload, &e));
                }
            }
        }

        result.files_deleted = deleted.deleted.len();
        result.errors.extend(deleted.errors);
        result
    }

    async fn run_uploads(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        jobs: Vec<UploadJob>,
    ) -> Vec<(String, Result<UploadResult>)> {
        let mut pool: BoundedPool<(String, Result<UploadResult>)> =
            BoundedPool::new(parallelism_or_default(self.upload_parallelism));
        let admission = pool.admission();
        let mut outcomes = Vec::with_capacity(jobs.len());
        let mut in_flight: HashMap<Id, String> = HashMap::new();
        let mut jobs = jobs.into_iter();

        while let Some(job) = jobs.next() {
            while let Some(done) = pool.try_join_next_with_id() {
                outcomes.push(joined(&mut in_flight, done));
            }

            let permit = match admission.acquire(cancel).await {
                Ok(permit) => permit,
                Err(e) => {
                    outcomes.push((job.key, Err(e)));
                    outcomes.extend(jobs.by_ref().map(|j| (j.key, Err(Error::Cancelled))));
                    break;
                }
            };

            let uploader = self.uploader.clone();
            let cancel = cancel.clone();
            let bucket = bucket.to_string();
            let key = job.key.clone();
            let id = pool.dispatch(permit, async move {
                let outcome = uploader
                    .upload_file(&cancel, &bucket, &job.key, &job.path)
                    .await;
                (job.key, outcome)
            });
            in_flight.insert(id, key);
        }

        while let Some(done) = pool.join_next_with_id().await {
            outcomes.push(joined(&mut in_flight, done));
        }
        outcomes
    }

    async fn run_deletes(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        keys: Vec<String>,
    ) -> DeleteSummary {
        if keys.is_empty() {
            return DeleteSummary::default();
        }

        match self
            .deleter
            .delete_parallel(cancel, bucket, keys, self.delete_parallelism)
            .await
        {
            Ok(result) => DeleteSummary::from_result(result, None),
            Err(failure) => {
                tracing::warn!(bucket, error = %failure.error, "Delete phase stopped early");
                DeleteSummary::from_result(failure.partial, Some(&failure.error))
            }
        }
    }
}

/// Unwrap a joined upload task; a panicked task's key comes from `in_flight`
fn joined(
    in_flight: &mut HashMap<Id, String>,
    (id, done): (Id, Result<(String, Result<UploadResult>)>),
) -> (String, Result<UploadResult>) {
    let key = in_flight.remove(&id).unwrap_or_default();
    match done {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Upload task failed");
            (key, Err(e))
        }
    }
}

#[derive(Default)]
struct DeleteSummary {
    deleted: Vec<String>,
    errors: Vec<SyncError>,
}

impl DeleteSummary {
    fn from_result(result: DeleteResult, fatal: Option<&Error>) -> Self {
        let mut errors: Vec<SyncError> = result
            .errors
            .into_iter()
            .map(|e| SyncError {
                key: e.key,
                operation: OperationKind::Delete,
                code: e.code,
                message: e.message,
            })
            .collect();

        if let Some(error) = fatal {
            errors.extend(
                result
                    .unknown
                    .into_iter()
                    .chain(result.pending)
                    .map(|key| sync_error(key, OperationKind::Delete, error)),
            );
        }

        Self {
            deleted: result.deleted,
            errors,
        }
    }
}

fn sync_error(key: String, operation: OperationKind, error: &Error) -> SyncError {
    SyncError {
        key,
        operation,
        code: error.code().to_string(),
        message: error.to_string(),
    }
}
