//! Push-model listing onto a stream

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::{ListConfig, Paginator};
use crate::config::parallelism_or_default;
use crate::error::{Error, Result};
use crate::pool::BoundedPool;
use crate::traits::{ObjectInfo, ObjectStore};

/// Objects produced by a background listing
///
/// Dropping the stream stops the producer.
pub struct ObjectStream {
    inner: ReceiverStream<Result<ObjectInfo>>,
    _stop: DropGuard,
}

impl Stream for ObjectStream {
    type Item = Result<ObjectInfo>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Spawns listing producers that push objects onto an [`ObjectStream`]
#[derive(Clone)]
pub struct StreamingLister {
    store: Arc<dyn ObjectStore>,
}

impl StreamingLister {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// List every object under `config.prefix`
    ///
    /// Pages are fetched until one comes back not truncated. A listing error
    /// is yielded as the last item; cancellation yields `Error::Cancelled`
    /// when the consumer is still there to see it.
    pub fn list_all(&self, cancel: &CancellationToken, config: ListConfig) -> ObjectStream {
        let (tx, rx) = mpsc::channel(config.buffer());
        let stop = cancel.child_token();

        tokio::spawn(produce(self.store.clone(), stop.clone(), config, tx));

        ObjectStream {
            inner: ReceiverStream::new(rx),
            _stop: stop.drop_guard(),
        }
    }

    /// List several prefixes with at most `parallelism` listings running
    ///
    /// Each listing has one page request in flight at a time, so the
    /// number of concurrent page requests never exceeds `parallelism`
    /// (zero means 5). Objects from all prefixes share one stream.
    pub fn list_prefixes(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        prefixes: Vec<String>,
        parallelism: usize,
    ) -> ObjectStream {
        self.list_prefixes_with(cancel, ListConfig::new(bucket), prefixes, parallelism)
    }

    /// [`Self::list_prefixes`] with page size and buffer taken from `base`
    pub fn list_prefixes_with(
        &self,
        cancel: &CancellationToken,
        base: ListConfig,
        prefixes: Vec<String>,
        parallelism: usize,
    ) -> ObjectStream {
        let parallelism = parallelism_or_default(parallelism);
        let (tx, rx) = mpsc::channel(base.buffer());
        let stop = cancel.child_token();

        let store = self.store.clone();
        let fan_out = stop.clone();
        tokio::spawn(async move {
            let prefix_count = prefixes.len();
            let mut pool: BoundedPool<()> = BoundedPool::new(parallelism);

            for prefix in prefixes {
                let config = base.clone().with_prefix(prefix);
                let producer = produce(store.clone(), fan_out.clone(), config, tx.clone());
                if pool.spawn(&fan_out, producer).await.is_err() {
                    let _ = tx.try_send(Err(Error::Cancelled));
                    break;
                }
            }
            drop(tx);

            while let Some(done) = pool.join_next().await {
                if let Err(e) = done {
                    tracing::warn!(error = %e, "Prefix listing task failed");
                }
            }
            tracing::debug!(bucket = %base.bucket, prefixes = prefix_count, "Prefix fan-out finished");
        });

        ObjectStream {
            inner: ReceiverStream::new(rx),
            _stop: stop.drop_guard(),
        }
    }
}

async fn produce(
    store: Arc<dyn ObjectStore>,
    cancel: CancellationToken,
    config: ListConfig,
    tx: mpsc::Sender<Result<ObjectInfo>>,
) {
    let mut paginator = Paginator::new(store, &config.bucket, config.prefix.clone(), config.page_size);
    let mut listed = 0usize;

    while paginator.has_more_pages() {
        let page = match paginator.next_page(&cancel).await {
            Ok(page) => page,
            Err(error) => {
                if error.is_cancellation() {
                    let _ = tx.try_send(Err(error));
                } else {
                    tracing::debug!(bucket = %config.bucket, error = %error, "Listing failed");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            let _ = tx.try_send(Err(Error::Cancelled));
                        }
                        _ = tx.send(Err(error)) => {}
                    }
                }
                return;
            }
        };

        for object in page.objects {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let _ = tx.try_send(Err(Error::Cancelled));
                    return;
                }
                sent = tx.send(Ok(object)) => {
                    if sent.is_err() {
                        tracing::debug!(bucket = %config.bucket, "Listing consumer went away");
                        return;
                    }
                }
            }
            listed += 1;
        }
    }

    tracing::debug!(
        bucket = %config.bucket,
        prefix = %config.prefix,
        listed,
        pages = paginator.pages_fetched(),
        "Listing complete"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::memory::MemoryStore;

    fn seeded(prefixes: &[&str], per_prefix: usize) -> Arc<MemoryStore> {
        fill(MemoryStore::new(), prefixes, per_prefix)
    }

    fn fill(store: MemoryStore, prefixes: &[&str], per_prefix: usize) -> Arc<MemoryStore> {
        let store = Arc::new(store);
        store.create_bucket("bucket");
        for prefix in prefixes {
            for i in 0..per_prefix {
                store.insert("bucket", &format!("{prefix}{i:05}"), "x");
            }
        }
        store
    }

    #[tokio::test]
    async fn test_list_all_in_order() {
        let store = seeded(&["data/"], 2500);
        let lister = StreamingLister::new(store.clone());

        let objects: Vec<ObjectInfo> = lister
            .list_all(&CancellationToken::new(), ListConfig::new("bucket").with_prefix("data/"))
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert_eq!(objects.len(), 2500);
        assert!(objects.windows(2).all(|w| w[0].key < w[1].key));
        assert_eq!(store.calls().list_page.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_error_is_yielded() {
        let store = seeded(&["data/"], 1500);
        store.fail_list_page(2);
        let lister = StreamingLister::new(store);

        let items: Vec<Result<ObjectInfo>> = lister
            .list_all(&CancellationToken::new(), ListConfig::new("bucket"))
            .collect()
            .await;

        assert_eq!(items.len(), 1001);
        assert!(items[..1000].iter().all(|i| i.is_ok()));
        assert!(matches!(items[1000], Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_missing_bucket_yields_not_found() {
        let lister = StreamingLister::new(Arc::new(MemoryStore::new()));
        let mut stream = lister.list_all(&CancellationToken::new(), ListConfig::new("nope"));

        assert!(matches!(stream.next().await, Some(Err(Error::NotFound(_)))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_stream_stops_producer() {
        let store = seeded(&["data/"], 5000);
        let lister = StreamingLister::new(store.clone());

        let mut stream = lister.list_all(
            &CancellationToken::new(),
            ListConfig::new("bucket").with_page_size(100).with_buffer(4),
        );
        for _ in 0..10 {
            stream.next().await.unwrap().unwrap();
        }
        drop(stream);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let calls = store.calls().list_page.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.calls().list_page.load(Ordering::SeqCst), calls);
        assert!(calls < 50);
    }

    #[tokio::test]
    async fn test_cancel_releases_producer_blocked_on_error() {
        let (tx, _rx) = mpsc::channel(1);
        tx.send(Err(Error::General("unread".to_string()))).await.unwrap();
        let cancel = CancellationToken::new();

        // The bucket is missing, so the first page fails while the channel is full
        let producer = tokio::spawn(produce(
            Arc::new(MemoryStore::new()),
            cancel.clone(),
            ListConfig::new("missing"),
            tx,
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer should stop on cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_listing() {
        let store = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(10)));
        for i in 0..1000 {
            store.insert("bucket", &format!("k{i:04}"), "x");
        }
        let cancel = CancellationToken::new();
        let lister = StreamingLister::new(store.clone());
        let stream = lister.list_all(&cancel, ListConfig::new("bucket").with_page_size(10));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(35)).await;
            trigger.cancel();
        });

        let items: Vec<Result<ObjectInfo>> = stream.collect().await;
        assert!(items.len() < 1000);
        assert!(items.last().is_some_and(|i| matches!(i, Err(Error::Cancelled))));
    }

    #[tokio::test]
    async fn test_list_prefixes_bounded_fan_out() {
        let prefixes: Vec<String> = (0..8).map(|p| format!("p{p}/")).collect();
        let refs: Vec<&str> = prefixes.iter().map(String::as_str).collect();
        let store = fill(
            MemoryStore::new().with_latency(Duration::from_millis(5)),
            &refs,
            250,
        );
        let lister = StreamingLister::new(store.clone());

        let objects: Vec<ObjectInfo> = lister
            .list_prefixes_with(
                &CancellationToken::new(),
                ListConfig::new("bucket").with_page_size(100),
                prefixes.clone(),
                3,
            )
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert_eq!(objects.len(), 8 * 250);
        assert!(store.peak_list_in_flight() <= 3);
        assert!(store.peak_list_in_flight() >= 2);
        assert_eq!(store.calls().list_page.load(Ordering::SeqCst), 8 * 3);
    }

    #[tokio::test]
    async fn test_list_prefixes_zero_parallelism_uses_default() {
        let prefixes: Vec<String> = (0..12).map(|p| format!("p{p:02}/")).collect();
        let refs: Vec<&str> = prefixes.iter().map(String::as_str).collect();
        let store = seeded(&refs, 3);
        let lister = StreamingLister::new(store.clone());

        let count = lister
            .list_prefixes(&CancellationToken::new(), "bucket", prefixes, 0)
            .count()
            .await;

        assert_eq!(count, 36);
        assert!(store.peak_list_in_flight() <= 5);
    }
}
