//! Streaming deletion from a producer-fed channel
//!
//! Keys are grouped into batches on the fly: a batch is handed to the pool
//! when it is full, or earlier when a worker is idle and nothing more is
//! immediately available. At most `parallelism` batches wait for a worker;
//! beyond that the consumer stops receiving and the bounded channel pushes
//! back on the producer.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use super::batch::{BatchDeleter, send_batch};
use super::parallel::{InFlight, collect};
use super::{BatchOutcome, DeleteFailure, DeleteOutcome, DeleteResult};
use crate::config::parallelism_or_default;
use crate::error::Error;
use crate::pool::BoundedPool;

/// Deletes keys received over a channel until the channel closes
#[derive(Clone)]
pub struct StreamingDeleteConsumer {
    deleter: BatchDeleter,
}

impl StreamingDeleteConsumer {
    pub fn new(deleter: BatchDeleter) -> Self {
        Self { deleter }
    }

    /// Drain `keys` and delete them with up to `parallelism` batch calls in flight
    ///
    /// Returns once the sender side is dropped and every dispatched batch has
    /// finished. On cancellation or a transport error the receiver is closed,
    /// keys already queued in the channel are reported as `pending`, and
    /// in-flight batches are drained before returning.
    pub async fn delete_stream(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        mut keys: mpsc::Receiver<String>,
        parallelism: usize,
    ) -> DeleteOutcome {
        let parallelism = parallelism_or_default(parallelism);
        let batch_size = self.deleter.batch_size();

        let mut pool: BoundedPool<BatchOutcome> = BoundedPool::new(parallelism);
        let admission = pool.admission();
        let mut result = DeleteResult::default();
        let mut failure: Option<Error> = None;
        let mut in_flight = InFlight::default();
        let mut current: Vec<String> = Vec::with_capacity(batch_size);
        let mut ready: VecDeque<Vec<String>> = VecDeque::new();
        let mut open = true;
        let mut received = 0usize;

        while failure.is_none() && (open || !current.is_empty() || !ready.is_empty()) {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    failure = Some(Error::Cancelled);
                }

                Some(done) = pool.join_next_with_id(), if !pool.is_empty() => {
                    collect(&mut result, &mut failure, &mut in_flight, done);
                }

                permit = admission.acquire(cancel), if !ready.is_empty() => {
                    match permit {
                        Ok(permit) => {
                            if let Some(batch) = ready.pop_front() {
                                let task = send_batch(self.deleter.store(), bucket.to_string(), batch.clone());
                                in_flight.track(pool.dispatch(permit, task), batch);
                            }
                        }
                        Err(e) => failure = Some(e),
                    }
                }

                key = keys.recv(), if open && ready.len() < parallelism => {
                    match key {
                        Some(key) => {
                            received += 1;
                            current.push(key);
                            // Take whatever else is already queued, up to a full batch
                            while current.len() < batch_size {
                                match keys.try_recv() {
                                    Ok(key) => {
                                        received += 1;
                                        current.push(key);
                                    }
                                    Err(TryRecvError::Empty) => break,
                                    Err(TryRecvError::Disconnected) => {
                                        open = false;
                                        break;
                                    }
                                }
                            }
                        }
                        None => open = false,
                    }
                }
            }

            if current.len() >= batch_size
                || (!current.is_empty()
                    && (!open || (ready.is_empty() && admission.has_capacity())))
            {
                ready.push_back(std::mem::replace(
                    &mut current,
                    Vec::with_capacity(batch_size),
                ));
            }
        }

        if failure.is_some() {
            keys.close();
            while let Ok(key) = keys.try_recv() {
                received += 1;
                result.pending.push(key);
            }
            result.pending.extend(ready.into_iter().flatten());
            result.pending.extend(current);
        }

        while let Some(done) = pool.join_next_with_id().await {
            collect(&mut result, &mut failure, &mut in_flight, done);
        }

        match failure {
            Some(error) => {
                tracing::warn!(bucket, received, error = %error, "Streaming delete stopped");
                Err(DeleteFailure::new(error, result))
            }
            None => {
                tracing::info!(
                    bucket,
                    received,
                    deleted = result.deleted.len(),
                    errors = result.errors.len(),
                    "Streaming delete complete"
                );
                Ok(result)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::delete::test_support::{assert_exact_accounting, keys};
    use crate::memory::MemoryStore;

    fn consumer(store: Arc<MemoryStore>, batch_size: usize) -> StreamingDeleteConsumer {
        StreamingDeleteConsumer::new(BatchDeleter::with_batch_size(store, batch_size))
    }

    fn seeded(n: usize) -> (Arc<MemoryStore>, Vec<String>) {
        let store = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(2)));
        let keys = keys(n);
        for key in &keys {
            store.insert("bucket", key, "x");
        }
        (store, keys)
    }

    #[tokio::test]
    async fn test_stream_deletes_everything() {
        let (store, keys) = seeded(3000);
        let (tx, rx) = mpsc::channel(64);

        let producer_keys = keys.clone();
        let producer = tokio::spawn(async move {
            for key in producer_keys {
                tx.send(key).await.unwrap();
            }
        });

        let result = consumer(store.clone(), 1000)
            .delete_stream(&CancellationToken::new(), "bucket", rx, 4)
            .await
            .unwrap();
        producer.await.unwrap();

        assert_eq!(result.deleted.len(), 3000);
        assert_exact_accounting(&result, &keys);
        assert!(store.is_empty("bucket"));
        assert!(store.delete_batch_sizes().iter().all(|&n| n <= 1000));
        assert!(store.peak_delete_in_flight() <= 4);
    }

    #[tokio::test]
    async fn test_slow_producer_does_not_block() {
        let (store, keys) = seeded(5);
        let (tx, rx) = mpsc::channel(1);

        let producer_keys = keys.clone();
        tokio::spawn(async move {
            for key in producer_keys {
                tokio::time::sleep(Duration::from_millis(15)).await;
                tx.send(key).await.unwrap();
            }
        });

        let result = consumer(store.clone(), 1000)
            .delete_stream(&CancellationToken::new(), "bucket", rx, 2)
            .await
            .unwrap();

        assert_exact_accounting(&result, &keys);
        // Partial batches go out while the producer is idle
        assert!(store.delete_batch_sizes().len() > 1);
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let (store, _) = seeded(0);
        let (tx, rx) = mpsc::channel::<String>(1);
        drop(tx);

        let result = consumer(store.clone(), 100)
            .delete_stream(&CancellationToken::new(), "bucket", rx, 2)
            .await
            .unwrap();

        assert!(result.is_empty());
        assert_eq!(store.mutations(), 0);
    }

    #[tokio::test]
    async fn test_cancel_with_infinite_producer() {
        let (store, _) = seeded(0);
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let producer = tokio::spawn(async move {
            let mut sent = 0usize;
            while tx.send(format!("endless/{sent}")).await.is_ok() {
                sent += 1;
            }
            sent
        });

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let failure = consumer(store.clone(), 100)
            .delete_stream(&cancel, "bucket", rx, 2)
            .await
            .unwrap_err();

        assert!(failure.is_cancellation());
        let sent = producer.await.unwrap();
        // Everything the producer managed to send is accounted for
        assert_eq!(failure.partial.total(), sent);
    }

    #[tokio::test]
    async fn test_backlog_is_bounded_while_deletes_stall() {
        let store = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(100)));
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let producer = tokio::spawn(async move {
            let mut sent = 0usize;
            while tx.send(format!("endless/{sent}")).await.is_ok() {
                sent += 1;
            }
            sent
        });

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let failure = consumer(store.clone(), 10)
            .delete_stream(&cancel, "bucket", rx, 1)
            .await
            .unwrap_err();

        assert!(failure.is_cancellation());
        let sent = producer.await.unwrap();
        assert_eq!(failure.partial.total(), sent);
        // Queued keys never exceed the channel plus one batch per worker
        assert!(failure.partial.pending.len() <= 16 + 10);
        assert!(sent <= store.delete_batch_sizes().iter().sum::<usize>() + 16 + 10);
    }

    #[tokio::test]
    async fn test_panicked_batch_is_accounted() {
        let (store, keys) = seeded(30);
        store.panic_delete_batch(1);
        let (tx, rx) = mpsc::channel(100);
        for key in &keys {
            tx.send(key.clone()).await.unwrap();
        }
        drop(tx);

        let failure = consumer(store.clone(), 10)
            .delete_stream(&CancellationToken::new(), "bucket", rx, 1)
            .await
            .unwrap_err();

        assert_eq!(failure.partial.unknown.len(), 10);
        assert_exact_accounting(&failure.partial, &keys);
    }

    #[tokio::test]
    async fn test_transport_error_stops_consumer() {
        let (store, keys) = seeded(50);
        store.fail_delete_batch(1);
        let (tx, rx) = mpsc::channel(100);
        for key in &keys {
            tx.send(key.clone()).await.unwrap();
        }
        drop(tx);

        let failure = consumer(store.clone(), 10)
            .delete_stream(&CancellationToken::new(), "bucket", rx, 1)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, Error::Network(_)));
        assert_eq!(failure.partial.unknown.len(), 10);
        assert_exact_accounting(&failure.partial, &keys);
    }
}
