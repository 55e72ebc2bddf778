//! Sequential batch deletion

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{BatchOutcome, DeleteFailure, DeleteOutcome, DeleteResult};
use crate::config::{MAX_BATCH_SIZE, clamp_batch};
use crate::error::Error;
use crate::traits::ObjectStore;

/// Split keys into consecutive batches of `batch_size`
///
/// Yields `ceil(N / B)` batches, all of length `B` except possibly the last;
/// concatenating them gives back the input in order.
pub fn split_into_batches(keys: Vec<String>, batch_size: usize) -> Vec<Vec<String>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(keys.len().div_ceil(batch_size));
    let mut iter = keys.into_iter().peekable();

    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(batch_size).collect());
    }

    batches
}

/// Run one delete-batch call and pair the answer with the keys sent
pub(crate) async fn send_batch(
    store: Arc<dyn ObjectStore>,
    bucket: String,
    keys: Vec<String>,
) -> BatchOutcome {
    tracing::debug!(bucket = %bucket, keys = keys.len(), "Sending delete batch");
    let output = store.delete_objects(&bucket, keys.clone()).await;
    BatchOutcome { keys, output }
}

/// Deletes keys in fixed-size batches, one call at a time
#[derive(Clone)]
pub struct BatchDeleter {
    store: Arc<dyn ObjectStore>,
    batch_size: usize,
}

impl BatchDeleter {
    /// Deleter using the backend's maximum batch size
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self::with_batch_size(store, MAX_BATCH_SIZE)
    }

    /// Deleter with a custom batch size, clamped to `1..=1000`
    pub fn with_batch_size(store: Arc<dyn ObjectStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: clamp_batch(batch_size),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub(crate) fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    /// Delete `keys`, one batch call after another
    ///
    /// Per-key refusals are recorded in the result. A transport failure stops
    /// the operation: the failed batch's keys become `unknown`, the rest
    /// `pending`.
    pub async fn delete_batch(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        keys: Vec<String>,
    ) -> DeleteOutcome {
        let total = keys.len();
        let mut result = DeleteResult::default();
        let mut batches = split_into_batches(keys, self.batch_size).into_iter();

        while let Some(batch) = batches.next() {
            if cancel.is_cancelled() {
                result.pending.extend(batch);
                result.pending.extend(batches.flatten());
                return Err(DeleteFailure::new(Error::Cancelled, result));
            }

            let outcome = send_batch(self.store.clone(), bucket.to_string(), batch).await;
            if let Some(error) = result.absorb(outcome) {
                result.pending.extend(batches.flatten());
                return Err(DeleteFailure::new(error, result));
            }
        }

        tracing::debug!(
            bucket,
            total,
            deleted = result.deleted.len(),
            errors = result.errors.len(),
            "Batch delete complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delete::test_support::{assert_exact_accounting, keys};
    use crate::memory::MemoryStore;
    use crate::traits::{DeleteBatchOutput, KeyError, MockObjectStore};

    fn seeded(n: usize) -> (Arc<MemoryStore>, Vec<String>) {
        let store = Arc::new(MemoryStore::new());
        let keys = keys(n);
        for key in &keys {
            store.insert("bucket", key, "data");
        }
        (store, keys)
    }

    #[test]
    fn test_split_into_batches_counts() {
        for (n, b) in [(0, 10), (1, 10), (10, 10), (11, 10), (2500, 1000), (7, 3)] {
            let input = keys(n);
            let batches = split_into_batches(input.clone(), b);

            assert_eq!(batches.len(), n.div_ceil(b), "n={n} b={b}");
            for (i, batch) in batches.iter().enumerate() {
                if i + 1 < batches.len() {
                    assert_eq!(batch.len(), b);
                } else {
                    assert!(!batch.is_empty() && batch.len() <= b);
                }
            }
            assert_eq!(batches.concat(), input);
        }
    }

    #[test]
    fn test_split_zero_batch_size_treated_as_one() {
        assert_eq!(split_into_batches(keys(3), 0).len(), 3);
    }

    #[test]
    fn test_batch_size_clamped() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        assert_eq!(BatchDeleter::with_batch_size(store.clone(), 5000).batch_size(), 1000);
        assert_eq!(BatchDeleter::with_batch_size(store, 0).batch_size(), 1);
    }

    #[tokio::test]
    async fn test_delete_batch_all_keys() {
        let (store, keys) = seeded(2500);
        let deleter = BatchDeleter::new(store.clone());

        let result = deleter
            .delete_batch(&CancellationToken::new(), "bucket", keys.clone())
            .await
            .unwrap();

        assert_eq!(result.deleted.len(), 2500);
        assert!(result.errors.is_empty());
        assert_exact_accounting(&result, &keys);
        assert_eq!(store.delete_batch_sizes(), vec![1000, 1000, 500]);
        assert!(store.is_empty("bucket"));
    }

    #[tokio::test]
    async fn test_per_key_errors_do_not_stop() {
        let (store, keys) = seeded(25);
        store.refuse_delete(&keys[3]);
        store.refuse_delete(&keys[17]);
        let deleter = BatchDeleter::with_batch_size(store.clone(), 10);

        let result = deleter
            .delete_batch(&CancellationToken::new(), "bucket", keys.clone())
            .await
            .unwrap();

        assert_eq!(result.deleted.len(), 23);
        assert_eq!(result.errors.len(), 2);
        assert_exact_accounting(&result, &keys);
        assert_eq!(store.delete_batch_sizes(), vec![10, 10, 5]);
    }

    #[tokio::test]
    async fn test_transport_failure_fails_fast() {
        let (store, keys) = seeded(30);
        store.fail_delete_batch(2);
        let deleter = BatchDeleter::with_batch_size(store.clone(), 10);

        let failure = deleter
            .delete_batch(&CancellationToken::new(), "bucket", keys.clone())
            .await
            .unwrap_err();

        assert!(matches!(failure.error, Error::Network(_)));
        assert_eq!(failure.partial.deleted.len(), 10);
        assert_eq!(failure.partial.unknown, keys[10..20].to_vec());
        assert_eq!(failure.partial.pending, keys[20..].to_vec());
        assert_exact_accounting(&failure.partial, &keys);
        assert_eq!(store.calls().delete_objects.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (store, keys) = seeded(5);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let failure = BatchDeleter::new(store.clone())
            .delete_batch(&cancel, "bucket", keys.clone())
            .await
            .unwrap_err();

        assert!(failure.is_cancellation());
        assert_eq!(failure.partial.pending.len(), 5);
        assert_eq!(store.mutations(), 0);
    }

    #[tokio::test]
    async fn test_unreported_keys_are_unconfirmed() {
        let mut mock = MockObjectStore::new();
        mock.expect_delete_objects().times(1).returning(|_, keys| {
            Ok(DeleteBatchOutput {
                deleted: vec![keys[0].clone()],
                errors: vec![KeyError::new(keys[1].clone(), "InternalError", "oops")],
            })
        });
        let store: Arc<dyn ObjectStore> = Arc::new(mock);
        let submitted = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        let result = BatchDeleter::new(store)
            .delete_batch(&CancellationToken::new(), "bucket", submitted.clone())
            .await
            .unwrap();

        assert_eq!(result.deleted, vec!["a"]);
        assert_eq!(result.errors[1].code, crate::delete::UNCONFIRMED_CODE);
        assert_exact_accounting(&result, &submitted);
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_calls() {
        let mut mock = MockObjectStore::new();
        mock.expect_delete_objects().never();
        let store: Arc<dyn ObjectStore> = Arc::new(mock);

        let result = BatchDeleter::new(store)
            .delete_batch(&CancellationToken::new(), "bucket", Vec::new())
            .await
            .unwrap();
        assert!(result.is_empty());
    }
}
