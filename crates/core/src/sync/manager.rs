//! Sync orchestration

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{
    Comparator, ExcludeSet, Executor, MetadataComparator, OperationKind, SyncOptions, SyncReport,
    SyncResult, SyncState, plan, scan_local, scan_remote,
};
use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::list::StreamingLister;
use crate::traits::ObjectStore;

/// Runs scan, plan and execute for a local directory and a bucket prefix
pub struct SyncManager {
    store: Arc<dyn ObjectStore>,
    config: TransferConfig,
    comparator: Arc<dyn Comparator>,
    state: watch::Sender<SyncState>,
}

impl SyncManager {
    pub fn new(store: Arc<dyn ObjectStore>, config: TransferConfig) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        Self {
            store,
            config,
            comparator: Arc::new(MetadataComparator),
            state,
        }
    }

    /// Replace the change detector used by the planner
    pub fn with_comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.comparator = comparator;
        self
    }

    /// Receive every state transition
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    fn transition(&self, next: SyncState) {
        let previous = self.state.send_replace(next);
        tracing::debug!(from = %previous, to = %next, "Sync state changed");
    }

    /// Synchronize `options.local_root` to `options.bucket/options.prefix`
    ///
    /// Scan and plan errors fail the call. Execute-phase failures are
    /// recorded in the result instead. Cancellation, or running past
    /// `options.timeout`, fails the call unless every operation had already
    /// been sent and finished.
    pub async fn sync(&self, cancel: &CancellationToken, options: SyncOptions) -> Result<SyncReport> {
        let run = cancel.child_token();
        let timer = options.timeout.map(|limit| {
            let run = run.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                run.cancel();
            })
        });

        let outcome = self.run(&run, &options).await;
        if let Some(timer) = timer {
            timer.abort();
        }

        let timed_out = options.timeout.is_some() && run.is_cancelled() && !cancel.is_cancelled();
        let outcome = match outcome {
            Err(e) if e.is_cancellation() && timed_out => Err(Error::DeadlineExceeded),
            other => other,
        };

        if let Err(e) = &outcome {
            tracing::warn!(bucket = %options.bucket, error = %e, "Sync failed");
            self.transition(SyncState::Failed);
        }
        outcome
    }

    async fn run(&self, cancel: &CancellationToken, options: &SyncOptions) -> Result<SyncReport> {
        let started = Instant::now();
        let exclude = ExcludeSet::new(&options.exclude)?;

        self.transition(SyncState::ScanningLocal);
        let local = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            local = scan_local(options.local_root.clone(), exclude.clone(), options.checksum) => local?,
        };

        self.transition(SyncState::ScanningRemote);
        let lister = StreamingLister::new(self.store.clone());
        let remote = scan_remote(
            &lister,
            cancel,
            &options.bucket,
            &options.prefix,
            self.config.effective_page_size(),
            &exclude,
        )
        .await?;

        self.transition(SyncState::Planning);
        let operations = plan(
            &local,
            &remote,
            &options.prefix,
            options.delete_extra,
            self.comparator.as_ref(),
        );

        if options.dry_run {
            let result = SyncResult {
                files_skipped: operations
                    .iter()
                    .filter(|op| op.kind == OperationKind::Skip)
                    .count(),
                duration: started.elapsed(),
                ..Default::default()
            };
            tracing::info!(
                bucket = %options.bucket,
                operations = operations.len(),
                "Dry run planned"
            );
            self.transition(SyncState::DryRunDone);
            return Ok(SyncReport {
                operations,
                result,
                dry_run: true,
            });
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.transition(SyncState::Executing);
        let executor =
            Executor::new(self.store.clone(), &self.config).with_upload_parallelism(options.parallelism);
        let mut result = executor.execute(cancel, &options.bucket, &operations).await;
        result.duration = started.elapsed();

        // Operations that ran to completion stand even if cancellation came late
        let interrupted = result
            .errors
            .iter()
            .any(|e| e.code == Error::Cancelled.code());
        if interrupted {
            tracing::warn!(
                uploaded = result.files_uploaded,
                deleted = result.files_deleted,
                "Sync interrupted during execution"
            );
            return Err(Error::Cancelled);
        }

        tracing::info!(
            bucket = %options.bucket,
            uploaded = result.files_uploaded,
            skipped = result.files_skipped,
            deleted = result.files_deleted,
            errors = result.errors.len(),
            "Sync complete"
        );
        self.transition(SyncState::Done);
        Ok(SyncReport {
            operations,
            result,
            dry_run: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use jiff::{SignedDuration, Timestamp};

    use super::*;
    use crate::memory::MemoryStore;

    /// Two new files, one unchanged, one remote-only
    fn fixture() -> (tempfile::TempDir, Arc<MemoryStore>) {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "new-a.txt", "aaaa");
        write(dir.path(), "nested/new-b.txt", "bbbbbb");
        write(dir.path(), "same.txt", "same");

        let store = Arc::new(MemoryStore::new());
        let later = Timestamp::now()
            .checked_add(SignedDuration::from_hours(1))
            .unwrap();
        store.insert_with_time("bucket", "backup/same.txt", "same", later);
        store.insert_with_time("bucket", "backup/remote-only.txt", "gone", later);
        (dir, store)
    }

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_dry_run_plans_without_mutations() {
        let (dir, store) = fixture();
        let manager = SyncManager::new(store.clone(), TransferConfig::default());

        let report = manager
            .sync(
                &CancellationToken::new(),
                SyncOptions::new(dir.path(), "bucket", "backup")
                    .delete_extra(true)
                    .dry_run(true),
            )
            .await
            .unwrap();

        let kinds: Vec<OperationKind> = report.operations.iter().map(|o| o.kind).collect();
        assert_eq!(
            kinds,
            vec![
                OperationKind::Upload,
                OperationKind::Upload,
                OperationKind::Skip,
                OperationKind::Delete
            ]
        );
        assert_eq!(report.operations[0].remote_key, "backup/nested/new-b.txt");
        assert_eq!(report.operations[1].remote_key, "backup/new-a.txt");
        assert_eq!(report.operations[3].remote_key, "backup/remote-only.txt");
        assert!(report.dry_run);
        assert_eq!(report.result.files_skipped, 1);
        assert_eq!(report.result.files_uploaded, 0);
        assert_eq!(store.mutations(), 0);
        assert_eq!(manager.state(), SyncState::DryRunDone);
    }

    #[tokio::test]
    async fn test_full_sync() {
        let (dir, store) = fixture();
        let manager = SyncManager::new(store.clone(), TransferConfig::default());

        let report = manager
            .sync(
                &CancellationToken::new(),
                SyncOptions::new(dir.path(), "bucket", "backup").delete_extra(true),
            )
            .await
            .unwrap();

        assert!(!report.dry_run);
        assert_eq!(report.result.files_uploaded, 2);
        assert_eq!(report.result.files_skipped, 1);
        assert_eq!(report.result.files_deleted, 1);
        assert_eq!(report.result.bytes_uploaded, 10);
        assert!(report.result.is_success());
        assert_eq!(
            store.keys("bucket"),
            vec!["backup/nested/new-b.txt", "backup/new-a.txt", "backup/same.txt"]
        );
        assert_eq!(manager.state(), SyncState::Done);

        // A second run has nothing to do
        let again = manager
            .sync(
                &CancellationToken::new(),
                SyncOptions::new(dir.path(), "bucket", "backup").delete_extra(true),
            )
            .await
            .unwrap();
        assert_eq!(again.count(OperationKind::Skip), 3);
        assert_eq!(again.count(OperationKind::Upload), 0);
    }

    #[tokio::test]
    async fn test_remote_extras_kept_without_delete_flag() {
        let (dir, store) = fixture();
        let report = SyncManager::new(store.clone(), TransferConfig::default())
            .sync(
                &CancellationToken::new(),
                SyncOptions::new(dir.path(), "bucket", "backup"),
            )
            .await
            .unwrap();

        assert_eq!(report.count(OperationKind::Delete), 0);
        assert!(store.contains("bucket", "backup/remote-only.txt"));
    }

    #[tokio::test]
    async fn test_excluded_files_are_untouched() {
        let (dir, store) = fixture();
        write(dir.path(), "scratch.tmp", "tmp");
        store.insert("bucket", "backup/cache.tmp", "keep me");

        let report = SyncManager::new(store.clone(), TransferConfig::default())
            .sync(
                &CancellationToken::new(),
                SyncOptions::new(dir.path(), "bucket", "backup")
                    .delete_extra(true)
                    .exclude(vec!["*.tmp".to_string()]),
            )
            .await
            .unwrap();

        assert!(report.operations.iter().all(|o| !o.remote_key.ends_with(".tmp")));
        assert!(store.contains("bucket", "backup/cache.tmp"));
        assert!(!store.contains("bucket", "backup/scratch.tmp"));
    }

    #[tokio::test]
    async fn test_execute_errors_are_recorded() {
        let (dir, store) = fixture();
        store.fail_put();

        let report = SyncManager::new(store.clone(), TransferConfig::default())
            .sync(
                &CancellationToken::new(),
                SyncOptions::new(dir.path(), "bucket", "backup").delete_extra(true),
            )
            .await
            .unwrap();

        assert_eq!(report.result.files_uploaded, 0);
        assert_eq!(report.result.errors.len(), 2);
        assert_eq!(report.result.files_deleted, 1);
    }

    #[tokio::test]
    async fn test_scan_error_fails_sync() {
        let store = Arc::new(MemoryStore::new());
        let manager = SyncManager::new(store, TransferConfig::default());
        let mut states = manager.subscribe();

        let err = manager
            .sync(
                &CancellationToken::new(),
                SyncOptions::new("/definitely/not/here", "bucket", ""),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidPath(_)));
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), SyncState::Failed);
    }

    #[tokio::test]
    async fn test_missing_bucket_fails_sync() {
        let (dir, _) = fixture();
        let err = SyncManager::new(Arc::new(MemoryStore::new()), TransferConfig::default())
            .sync(
                &CancellationToken::new(),
                SyncOptions::new(dir.path(), "bucket", "backup"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_timeout_reports_deadline() {
        let (dir, _) = fixture();
        let store = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(200)));
        store.create_bucket("bucket");

        let err = SyncManager::new(store.clone(), TransferConfig::default())
            .sync(
                &CancellationToken::new(),
                SyncOptions::new(dir.path(), "bucket", "backup")
                    .timeout(Some(Duration::from_millis(50))),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DeadlineExceeded));
        assert_eq!(store.calls().put_object.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_reports_cancelled() {
        let (dir, store) = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = SyncManager::new(store, TransferConfig::default())
            .sync(&cancel, SyncOptions::new(dir.path(), "bucket", "backup"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_late_cancellation_keeps_finished_result() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "only.txt", "payload");
        let store = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(100)));
        store.create_bucket("bucket");

        let manager = SyncManager::new(store.clone(), TransferConfig::default());
        let cancel = CancellationToken::new();

        // Cancel once the single upload is already on the wire
        let mut states = manager.subscribe();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                if *states.borrow_and_update() == SyncState::Executing {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    trigger.cancel();
                    break;
                }
            }
        });

        let report = manager
            .sync(&cancel, SyncOptions::new(dir.path(), "bucket", "backup"))
            .await
            .unwrap();

        assert!(cancel.is_cancelled());
        assert_eq!(report.result.files_uploaded, 1);
        assert!(report.result.is_success());
        assert!(store.contains("bucket", "backup/only.txt"));
        assert_eq!(manager.state(), SyncState::Done);
    }

    #[tokio::test]
    async fn test_state_transitions_observed() {
        let (dir, store) = fixture();
        let manager = SyncManager::new(store, TransferConfig::default());
        assert_eq!(manager.state(), SyncState::Idle);

        let mut states = manager.subscribe();
        let watcher = tokio::spawn(async move {
            let mut seen = Vec::new();
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                seen.push(state);
                if state.is_terminal() {
                    break;
                }
            }
            seen
        });

        manager
            .sync(
                &CancellationToken::new(),
                SyncOptions::new(dir.path(), "bucket", "backup"),
            )
            .await
            .unwrap();

        let seen = watcher.await.unwrap();
        assert_eq!(seen.last(), Some(&SyncState::Done));
    }
}
