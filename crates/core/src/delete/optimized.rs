//! Auto-flushing delete buffer

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::batch::BatchDeleter;
use super::{DeleteFailure, DeleteOutcome, DeleteResult};
use crate::config::TransferConfig;
use crate::traits::ObjectStore;

/// Buffers single-key deletes and sends them as batches
///
/// Each bucket has its own buffer. When a buffer reaches `flush_size` keys it
/// is sent synchronously through the [`BatchDeleter`]; callers must invoke
/// [`OptimizedDeleter::flush`] at the end to send the remainder.
pub struct OptimizedDeleter {
    deleter: BatchDeleter,
    flush_size: usize,
    buffers: Mutex<HashMap<String, Vec<String>>>,
}

impl OptimizedDeleter {
    pub fn new(deleter: BatchDeleter, flush_size: usize) -> Self {
        Self {
            deleter,
            flush_size: flush_size.max(1),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Deleter using the configured batch size and `auto_flush_size`
    pub fn from_config(store: Arc<dyn ObjectStore>, config: &TransferConfig) -> Self {
        Self::new(
            BatchDeleter::with_batch_size(store, config.batch_size()),
            config.auto_flush_size,
        )
    }

    pub fn flush_size(&self) -> usize {
        self.flush_size
    }

    /// Number of keys waiting for `bucket`
    pub async fn buffered(&self, bucket: &str) -> usize {
        self.buffers.lock().await.get(bucket).map_or(0, Vec::len)
    }

    /// Queue `key`; flushes and returns the flush result once the buffer is full
    ///
    /// Below the threshold this returns `Ok(None)` without touching the backend.
    pub async fn delete_with_auto_flush(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        key: impl Into<String>,
    ) -> Result<Option<DeleteResult>, DeleteFailure> {
        let mut buffers = self.buffers.lock().await;
        let buffer = buffers.entry(bucket.to_string()).or_default();
        buffer.push(key.into());

        if buffer.len() < self.flush_size {
            return Ok(None);
        }

        let keys = std::mem::take(buffer);
        tracing::debug!(bucket, keys = keys.len(), "Auto-flushing delete buffer");
        self.deleter.delete_batch(cancel, bucket, keys).await.map(Some)
    }

    /// Send whatever is buffered for `bucket`
    pub async fn flush(&self, cancel: &CancellationToken, bucket: &str) -> DeleteOutcome {
        let mut buffers = self.buffers.lock().await;
        let keys = buffers.remove(bucket).unwrap_or_default();

        if keys.is_empty() {
            return Ok(DeleteResult::default());
        }

        tracing::debug!(bucket, keys = keys.len(), "Flushing delete buffer");
        self.deleter.delete_batch(cancel, bucket, keys).await
    }

    /// Empty every buffer without sending anything
    pub async fn take_buffered(&self) -> Vec<String> {
        let mut buffers = self.buffers.lock().await;
        let mut buckets: Vec<_> = buffers.drain().collect();
        buckets.sort_by(|a, b| a.0.cmp(&b.0));
        buckets.into_iter().flat_map(|(_, keys)| keys).collect()
    }
}
