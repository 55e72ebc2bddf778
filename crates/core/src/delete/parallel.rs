//! Parallel batch deletion through a bounded worker pool

use std::collections::HashMap;

use tokio::task::Id;
use tokio_util::sync::CancellationToken;

use super::batch::{BatchDeleter, send_batch, split_into_batches};
use super::{BatchOutcome, DeleteFailure, DeleteOutcome, DeleteResult};
use crate::config::parallelism_or_default;
use crate::error::Error;
use crate::pool::BoundedPool;

/// Runs delete batches concurrently, at most `parallelism` calls at a time
#[derive(Clone)]
pub struct ParallelDeleteCoordinator {
    deleter: BatchDeleter,
}

impl ParallelDeleteCoordinator {
    pub fn new(deleter: BatchDeleter) -> Self {
        Self { deleter }
    }

    /// Delete `keys` with up to `parallelism` batch calls in flight
    ///
    /// A `parallelism` of zero uses the default of 5. The first transport
    /// error stops further dispatch; batches already in flight are allowed
    /// to finish and are accounted before the error is returned.
    pub async fn delete_parallel(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        keys: Vec<String>,
        parallelism: usize,
    ) -> DeleteOutcome {
        let parallelism = parallelism_or_default(parallelism);
        let total = keys.len();
        let batches = split_into_batches(keys, self.deleter.batch_size());
        let batch_count = batches.len();

        tracing::debug!(bucket, total, batch_count, parallelism, "Starting parallel delete");

        let mut pool: BoundedPool<BatchOutcome> = BoundedPool::new(parallelism);
        let admission = pool.admission();
        let mut result = DeleteResult::default();
        let mut failure: Option<Error> = None;
        let mut in_flight = InFlight::default();
        let mut batches = batches.into_iter();

        loop {
            while let Some(done) = pool.try_join_next_with_id() {
                collect(&mut result, &mut failure, &mut in_flight, done);
            }
            if failure.is_some() {
                break;
            }

            let Some(batch) = batches.next() else {
                break;
            };

            match admission.acquire(cancel).await {
                Ok(permit) => {
                    let task = send_batch(self.deleter.store(), bucket.to_string(), batch.clone());
                    in_flight.track(pool.dispatch(permit, task), batch);
                }
                Err(e) => {
                    result.pending.extend(batch);
                    failure = Some(e);
                    break;
                }
            }
        }

        result.pending.extend(batches.flatten());

        while let Some(done) = pool.join_next_with_id().await {
            collect(&mut result, &mut failure, &mut in_flight, done);
        }

        match failure {
            Some(error) => {
                tracing::warn!(
                    bucket,
                    error = %error,
                    deleted = result.deleted.len(),
                    unknown = result.unknown.len(),
                    pending = result.pending.len(),
                    "Parallel delete stopped"
                );
                Err(DeleteFailure::new(error, result))
            }
            None => {
                tracing::info!(
                    bucket,
                    deleted = result.deleted.len(),
                    errors = result.errors.len(),
                    "Parallel delete complete"
                );
                Ok(result)
            }
        }
    }
}

/// Keys held by dispatched batch tasks, by task id
#[derive(Default)]
pub(super) struct InFlight {
    batches: HashMap<Id, Vec<String>>,
}

impl InFlight {
    pub(super) fn track(&mut self, id: Id, keys: Vec<String>) {
        self.batches.insert(id, keys);
    }

    fn release(&mut self, id: Id) -> Vec<String> {
        self.batches.remove(&id).unwrap_or_default()
    }
}

/// Fold a joined worker outcome into the aggregate, keeping the first error
///
/// A task that panicked never reports its keys; they are taken from
/// `in_flight` and recorded as unknown.
pub(super) fn collect(
    result: &mut DeleteResult,
    failure: &mut Option<Error>,
    in_flight: &mut InFlight,
    (id, done): (Id, crate::error::Result<BatchOutcome>),
) {
    let keys = in_flight.release(id);
    let error = match done {
        Ok(outcome) => result.absorb(outcome),
        Err(join_error) => {
            tracing::warn!(keys = keys.len(), error = %join_error, "Delete batch task failed");
            result.unknown.extend(keys);
            Some(join_error)
        }
    };

    if let Some(error) = error
        && failure.is_none()
    {
        *failure = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::delete::test_support::{assert_exact_accounting, keys};
    use crate::memory::MemoryStore;

    fn seeded(n: usize, latency: Option<Duration>) -> (Arc<MemoryStore>, Vec<String>) {
        let mut store = MemoryStore::new();
        if let Some(latency) = latency {
            store = store.with_latency(latency);
        }
        let store = Arc::new(store);
        let keys = keys(n);
        for key in &keys {
            store.insert("bucket", key, "x");
        }
        (store, keys)
    }

    fn coordinator(store: Arc<MemoryStore>, batch_size: usize) -> ParallelDeleteCoordinator {
        ParallelDeleteCoordinator::new(BatchDeleter::with_batch_size(store, batch_size))
    }

    #[tokio::test]
    async fn test_parallel_accounts_every_key() {
        let (store, keys) = seeded(1234, None);
        store.refuse_delete(&keys[500]);

        let result = coordinator(store.clone(), 100)
            .delete_parallel(&CancellationToken::new(), "bucket", keys.clone(), 4)
            .await
            .unwrap();

        assert_eq!(result.deleted.len() + result.errors.len(), 1234);
        assert_eq!(result.errors.len(), 1);
        assert_exact_accounting(&result, &keys);
        assert_eq!(store.delete_batch_sizes().len(), 13);
        assert_eq!(store.len("bucket"), 1);
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let (store, keys) = seeded(200, Some(Duration::from_millis(10)));

        coordinator(store.clone(), 10)
            .delete_parallel(&CancellationToken::new(), "bucket", keys, 3)
            .await
            .unwrap();

        assert!(store.peak_delete_in_flight() <= 3);
        assert!(store.peak_delete_in_flight() >= 2);
    }

    #[tokio::test]
    async fn test_zero_parallelism_uses_default() {
        let (store, keys) = seeded(100, Some(Duration::from_millis(5)));

        coordinator(store.clone(), 5)
            .delete_parallel(&CancellationToken::new(), "bucket", keys, 0)
            .await
            .unwrap();

        assert!(store.peak_delete_in_flight() <= 5);
    }

    #[tokio::test]
    async fn test_transport_error_drains_and_returns() {
        let (store, keys) = seeded(100, Some(Duration::from_millis(5)));
        store.fail_delete_batch(3);

        let failure = coordinator(store.clone(), 10)
            .delete_parallel(&CancellationToken::new(), "bucket", keys.clone(), 2)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, Error::Network(_)));
        assert_eq!(failure.partial.unknown.len(), 10);
        assert!(!failure.partial.pending.is_empty());
        assert_exact_accounting(&failure.partial, &keys);
    }

    #[tokio::test]
    async fn test_cancellation_stops_dispatch() {
        let (store, keys) = seeded(500, Some(Duration::from_millis(20)));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let failure = coordinator(store.clone(), 10)
            .delete_parallel(&cancel, "bucket", keys.clone(), 2)
            .await
            .unwrap_err();

        assert!(failure.is_cancellation());
        assert!(!failure.partial.pending.is_empty());
        assert!(failure.partial.unknown.is_empty());
        assert_exact_accounting(&failure.partial, &keys);
    }

    #[tokio::test]
    async fn test_panicked_batch_keys_become_unknown() {
        let (store, keys) = seeded(40, None);
        store.panic_delete_batch(2);

        let failure = coordinator(store.clone(), 10)
            .delete_parallel(&CancellationToken::new(), "bucket", keys.clone(), 1)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, Error::General(_)));
        assert_eq!(failure.partial.unknown, keys[10..20].to_vec());
        assert_exact_accounting(&failure.partial, &keys);
    }
}
