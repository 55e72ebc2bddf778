//! Directory-to-bucket synchronization
//!
//! A sync runs in three phases. The [`scanner`] builds inventories of the
//! local tree and the remote prefix, the [`planner`] diffs them into a list
//! of [`Operation`]s, and the [`executor`] carries the plan out. The
//! [`SyncManager`] drives the phases and publishes its [`SyncState`].

pub mod comparator;
pub mod executor;
pub mod manager;
pub mod planner;
pub mod scanner;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use jiff::Timestamp;
use serde::{Serialize, Serializer};

pub use comparator::{Comparator, MetadataComparator};
pub use executor::Executor;
pub use manager::SyncManager;
pub use planner::plan;
pub use scanner::{ExcludeSet, scan_local, scan_remote};

/// A file found under the local root
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalFile {
    /// Path relative to the root, `/`-separated
    pub relative: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<Timestamp>,
    /// Hex MD5 of the content, computed only in checksum mode
    pub checksum: Option<String>,
}

/// An object found under the remote prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteFile {
    /// Key relative to the prefix
    pub relative: String,
    pub key: String,
    pub size: u64,
    pub last_modified: Option<Timestamp>,
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Upload,
    Delete,
    Skip,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Upload => "upload",
            OperationKind::Delete => "delete",
            OperationKind::Skip => "skip",
        };
        f.write_str(name)
    }
}

/// One planned step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Operation {
    pub kind: OperationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    pub remote_key: String,
    pub size: u64,
    pub reason: String,
}

/// Settings for one sync run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub local_root: PathBuf,
    pub bucket: String,
    pub prefix: String,
    /// Delete remote objects with no local counterpart
    pub delete_extra: bool,
    /// Plan only
    pub dry_run: bool,
    /// Concurrent file uploads; zero uses the configured default
    pub parallelism: usize,
    /// Glob patterns matched against relative paths on both sides
    pub exclude: Vec<String>,
    /// Compare content hashes where the remote ETag allows it
    pub checksum: bool,
    pub timeout: Option<Duration>,
}

impl SyncOptions {
    pub fn new(
        local_root: impl Into<PathBuf>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            local_root: local_root.into(),
            bucket: bucket.into(),
            prefix: prefix.into(),
            delete_extra: false,
            dry_run: false,
            parallelism: 0,
            exclude: Vec::new(),
            checksum: false,
            timeout: None,
        }
    }

    pub fn delete_extra(mut self, delete_extra: bool) -> Self {
        self.delete_extra = delete_extra;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn exclude(mut self, patterns: Vec<String>) -> Self {
        self.exclude = patterns;
        self
    }

    pub fn checksum(mut self, checksum: bool) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A failed operation from the execute phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncError {
    pub key: String,
    pub operation: OperationKind,
    pub code: String,
    pub message: String,
}

/// Counters for one sync run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub files_uploaded: usize,
    pub files_skipped: usize,
    pub files_deleted: usize,
    pub bytes_uploaded: u64,
    pub errors: Vec<SyncError>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

impl SyncResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// What `SyncManager::sync` returns
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub operations: Vec<Operation>,
    pub result: SyncResult,
    pub dry_run: bool,
}

impl SyncReport {
    /// Planned operations of one kind
    pub fn count(&self, kind: OperationKind) -> usize {
        self.operations.iter().filter(|op| op.kind == kind).count()
    }
}

/// Phase of a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    ScanningLocal,
    ScanningRemote,
    Planning,
    DryRunDone,
    Executing,
    Done,
    Failed,
}

impl SyncState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SyncState::DryRunDone | SyncState::Done | SyncState::Failed)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncState::Idle => "idle",
            SyncState::ScanningLocal => "scanning local files",
            SyncState::ScanningRemote => "scanning remote objects",
            SyncState::Planning => "planning",
            SyncState::DryRunDone => "dry run complete",
            SyncState::Executing => "executing",
            SyncState::Done => "done",
            SyncState::Failed => "failed",
        };
        f.write_str(label)
    }
}
