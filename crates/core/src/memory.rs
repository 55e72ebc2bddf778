//! In-memory object store
//!
//! Implements [`ObjectStore`] against process memory. It mirrors the backend
//! behaviours the engine relies on (lexicographic listing with continuation
//! tokens, idempotent deletes, MD5 ETags, multipart assembly) and adds call
//! accounting, injected failures and optional latency for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use jiff::Timestamp;
use md5::{Digest, Md5};

use crate::error::{Error, Result};
use crate::traits::{
    CompletedPart, DeleteBatchOutput, KeyError, ListPage, ListPageRequest, ObjectInfo, ObjectStore,
};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
    last_modified: Timestamp,
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, (Bytes, String)>,
}

/// Failures to inject into subsequent calls
#[derive(Debug, Default)]
struct Faults {
    failing_parts: HashSet<u32>,
    fail_complete: bool,
    fail_abort: bool,
    fail_put: bool,
    refused_keys: HashSet<String>,
    fail_delete_batch: Option<usize>,
    panic_delete_batch: Option<usize>,
    panic_put_key: Option<String>,
    fail_list_page: Option<usize>,
}

/// Counters for each capability
#[derive(Debug, Default)]
pub struct CallCounts {
    pub put_object: AtomicUsize,
    pub get_object: AtomicUsize,
    pub delete_object: AtomicUsize,
    pub delete_objects: AtomicUsize,
    pub list_page: AtomicUsize,
    pub create_multipart: AtomicUsize,
    pub upload_part: AtomicUsize,
    pub complete_multipart: AtomicUsize,
    pub abort_multipart: AtomicUsize,
}

fn load(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

/// Tracks concurrent calls and the high-water mark
#[derive(Debug, Default)]
struct InFlight {
    current: AtomicU64,
    peak: AtomicU64,
}

struct InFlightGuard<'a>(&'a InFlight);

impl InFlight {
    fn enter(&self) -> InFlightGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Process-local [`ObjectStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: Mutex<HashMap<String, BTreeMap<String, StoredObject>>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    faults: Mutex<Faults>,
    next_upload_id: AtomicUsize,
    latency: Mutex<Option<Duration>>,
    calls: CallCounts,
    list_in_flight: InFlight,
    delete_in_flight: InFlight,
    part_in_flight: InFlight,
    delete_batch_sizes: Mutex<Vec<usize>>,
    uploaded_parts: Mutex<Vec<(u32, usize)>>,
    completed: Mutex<Vec<Vec<u32>>>,
}

fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every backend call by `latency`
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = Some(latency);
        self
    }

    /// Create an empty bucket
    pub fn create_bucket(&self, bucket: &str) {
        self.buckets().entry(bucket.to_string()).or_default();
    }

    /// Insert an object directly, bypassing call accounting
    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.insert_with_time(bucket, key, data, Timestamp::now());
    }

    /// Insert an object with an explicit modification time
    pub fn insert_with_time(
        &self,
        bucket: &str,
        key: &str,
        data: impl Into<Bytes>,
        last_modified: Timestamp,
    ) {
        let data = data.into();
        let object = StoredObject {
            etag: md5_hex(&data),
            data,
            last_modified,
        };
        self.buckets()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), object);
    }

    /// Content of a stored object
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.buckets()
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|o| o.data.clone())
    }

    /// Whether a key exists
    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.object(bucket, key).is_some()
    }

    /// Number of objects in a bucket
    pub fn len(&self, bucket: &str) -> usize {
        self.buckets().get(bucket).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, bucket: &str) -> bool {
        self.len(bucket) == 0
    }

    /// Sorted keys of a bucket
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets()
            .get(bucket)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Multipart uploads neither completed nor aborted
    pub fn open_uploads(&self) -> usize {
        self.uploads.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn calls(&self) -> &CallCounts {
        &self.calls
    }

    /// Total calls that change backend state
    pub fn mutations(&self) -> usize {
        let c = &self.calls;
        load(&c.put_object)
            + load(&c.delete_object)
            + load(&c.delete_objects)
            + load(&c.create_multipart)
            + load(&c.upload_part)
            + load(&c.complete_multipart)
            + load(&c.abort_multipart)
    }

    /// Highest number of concurrent `list_page` calls observed
    pub fn peak_list_in_flight(&self) -> u64 {
        self.list_in_flight.peak.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent `delete_objects` calls observed
    pub fn peak_delete_in_flight(&self) -> u64 {
        self.delete_in_flight.peak.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent `upload_part` calls observed
    pub fn peak_part_in_flight(&self) -> u64 {
        self.part_in_flight.peak.load(Ordering::SeqCst)
    }

    /// Sizes of every delete-batch call, in call order
    pub fn delete_batch_sizes(&self) -> Vec<usize> {
        self.delete_batch_sizes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// `(part_number, size)` for every successful part upload, in completion order
    pub fn uploaded_parts(&self) -> Vec<(u32, usize)> {
        self.uploaded_parts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Part numbers passed to each complete-multipart call
    pub fn completed_part_lists(&self) -> Vec<Vec<u32>> {
        self.completed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Make uploads of this part number fail
    pub fn fail_part(&self, part_number: u32) {
        self.faults().failing_parts.insert(part_number);
    }

    pub fn fail_complete(&self) {
        self.faults().fail_complete = true;
    }

    pub fn fail_abort(&self) {
        self.faults().fail_abort = true;
    }

    pub fn fail_put(&self) {
        self.faults().fail_put = true;
    }

    /// Report this key as a per-key error in delete-batch responses
    pub fn refuse_delete(&self, key: &str) {
        self.faults().refused_keys.insert(key.to_string());
    }

    /// Make the n-th delete-batch call (1-based) fail at the transport level
    pub fn fail_delete_batch(&self, call: usize) {
        self.faults().fail_delete_batch = Some(call);
    }

    /// Make the n-th delete-batch call (1-based) panic, as a crashed worker would
    pub fn panic_delete_batch(&self, call: usize) {
        self.faults().panic_delete_batch = Some(call);
    }

    /// Make `put_object` panic for this key
    pub fn panic_put(&self, key: &str) {
        self.faults().panic_put_key = Some(key.to_string());
    }

    /// Make the n-th list-page call (1-based) fail at the transport level
    pub fn fail_list_page(&self, call: usize) {
        self.faults().fail_list_page = Some(call);
    }

    fn buckets(&self) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, StoredObject>>> {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn delay(&self) {
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn list_sync(&self, bucket: &str, request: &ListPageRequest) -> Result<ListPage> {
        let buckets = self.buckets();
        let Some(objects) = buckets.get(bucket) else {
            return Err(Error::NotFound(format!("Bucket not found: {bucket}")));
        };

        let prefix = request.prefix.as_deref().unwrap_or("");
        let max_keys = request.max_keys.max(1);
        let mut page = ListPage::default();
        let mut last_key: Option<&String> = None;
        let mut entries = 0usize;

        let start = request.continuation_token.as_deref();
        for (key, object) in objects {
            if start.is_some_and(|token| key.as_str() <= token) {
                continue;
            }
            if !key.starts_with(prefix) {
                continue;
            }

            let rolled_up = request.delimiter.as_deref().and_then(|delim| {
                key[prefix.len()..]
                    .find(delim)
                    .map(|idx| key[..prefix.len() + idx + delim.len()].to_string())
            });

            if let Some(common) = &rolled_up
                && page.common_prefixes.last() == Some(common)
            {
                last_key = Some(key);
                continue;
            }

            if entries == max_keys {
                page.is_truncated = true;
                break;
            }
            entries += 1;
            last_key = Some(key);

            match rolled_up {
                Some(common) => page.common_prefixes.push(common),
                None => page.objects.push(ObjectInfo {
                    key: key.clone(),
                    size: object.data.len() as u64,
                    last_modified: Some(object.last_modified),
                    etag: Some(object.etag.clone()),
                }),
            }
        }

        if page.is_truncated {
            page.continuation_token = last_key.cloned();
        }
        Ok(page)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_object(&self, bucket: &str, key: &str, data: Bytes) -> Result<Option<String>> {
        self.calls.put_object.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        let panics = self.faults().panic_put_key.as_deref() == Some(key);
        if panics {
            panic!("injected panic on put of {key}");
        }

        if self.faults().fail_put {
            return Err(Error::Network(format!("injected put failure for {key}")));
        }

        let etag = md5_hex(&data);
        self.insert(bucket, key, data);
        Ok(Some(etag))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes> {
        self.calls.get_object.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        self.object(bucket, key)
            .ok_or_else(|| Error::NotFound(format!("{bucket}/{key}")))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.calls.delete_object.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        if let Some(objects) = self.buckets().get_mut(bucket) {
            objects.remove(key);
        }
        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> Result<DeleteBatchOutput> {
        let call = self.calls.delete_objects.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = self.delete_in_flight.enter();
        self.delay().await;

        if keys.len() > crate::config::MAX_BATCH_SIZE {
            return Err(Error::General(format!(
                "delete batch of {} keys exceeds the backend limit",
                keys.len()
            )));
        }

        let panics = self.faults().panic_delete_batch == Some(call);
        if panics {
            panic!("injected panic on delete batch {call}");
        }

        let refused = {
            let faults = self.faults();
            if faults.fail_delete_batch == Some(call) {
                return Err(Error::Network(format!(
                    "injected transport failure on delete batch {call}"
                )));
            }
            faults.refused_keys.clone()
        };

        self.delete_batch_sizes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(keys.len());

        let mut output = DeleteBatchOutput::default();
        let mut buckets = self.buckets();
        let objects = buckets.entry(bucket.to_string()).or_default();
        for key in keys {
            if refused.contains(&key) {
                output
                    .errors
                    .push(KeyError::new(key, "AccessDenied", "Access Denied"));
            } else {
                objects.remove(&key);
                output.deleted.push(key);
            }
        }

        Ok(output)
    }

    async fn list_page(&self, bucket: &str, request: &ListPageRequest) -> Result<ListPage> {
        let call = self.calls.list_page.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = self.list_in_flight.enter();
        self.delay().await;

        if self.faults().fail_list_page == Some(call) {
            return Err(Error::Network(format!(
                "injected transport failure on list page {call}"
            )));
        }

        self.list_sync(bucket, request)
    }

    async fn create_multipart(&self, bucket: &str, key: &str) -> Result<String> {
        let id = self.next_upload_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls.create_multipart.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        let upload_id = format!("upload-{id}");
        self.uploads.lock().unwrap_or_else(|e| e.into_inner()).insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        self.calls.upload_part.fetch_add(1, Ordering::SeqCst);
        let _guard = self.part_in_flight.enter();
        self.delay().await;

        if self.faults().failing_parts.contains(&part_number) {
            return Err(Error::Network(format!(
                "injected failure uploading part {part_number}"
            )));
        }

        let etag = md5_hex(&data);
        let size = data.len();
        let mut uploads = self.uploads.lock().unwrap_or_else(|e| e.into_inner());
        let upload = uploads
            .get_mut(upload_id)
            .ok_or_else(|| Error::NotFound(format!("upload {upload_id}")))?;
        upload.parts.insert(part_number, (data, etag.clone()));
        drop(uploads);

        self.uploaded_parts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((part_number, size));
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<Option<String>> {
        self.calls.complete_multipart.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        self.completed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(parts.iter().map(|p| p.part_number).collect());

        if self.faults().fail_complete {
            return Err(Error::Multipart(format!(
                "injected failure completing {upload_id}"
            )));
        }

        let upload = self
            .uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(upload_id)
            .ok_or_else(|| Error::NotFound(format!("upload {upload_id}")))?;
        if upload.bucket != bucket || upload.key != key {
            return Err(Error::Multipart(format!(
                "upload {upload_id} belongs to {}/{}",
                upload.bucket, upload.key
            )));
        }

        let mut body = BytesMut::new();
        let mut digest = Md5::new();
        for part in parts {
            let (data, etag) = upload.parts.get(&part.part_number).ok_or_else(|| {
                Error::Multipart(format!("part {} was never uploaded", part.part_number))
            })?;
            if *etag != part.etag {
                return Err(Error::Multipart(format!(
                    "ETag mismatch for part {}",
                    part.part_number
                )));
            }
            body.extend_from_slice(data);
            digest.update(hex::decode(etag).unwrap_or_default());
        }

        let etag = format!("{}-{}", hex::encode(digest.finalize()), parts.len());
        let object = StoredObject {
            data: body.freeze(),
            etag: etag.clone(),
            last_modified: Timestamp::now(),
        };
        self.buckets()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), object);
        Ok(Some(etag))
    }

    async fn abort_multipart(&self, _bucket: &str, _key: &str, upload_id: &str) -> Result<()> {
        self.calls.abort_multipart.fetch_add(1, Ordering::SeqCst);
        self.delay().await;

        if self.faults().fail_abort {
            return Err(Error::Network(format!("injected failure aborting {upload_id}")));
        }

        self.uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(upload_id);
        Ok(())
    }
}
