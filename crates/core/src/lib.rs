//! objsync-core: transfer engine for S3-compatible object storage
//!
//! This crate provides:
//! - Bulk deletion (sequential, parallel, streaming and auto-flushing)
//! - Multipart upload with a size-based upload facade
//! - Paginated and streamed listing with multi-prefix fan-out
//! - Directory-to-bucket synchronization
//! - Configuration, aliases, path parsing and retry helpers
//!
//! Storage is reached only through the [`ObjectStore`] trait, so the engine
//! is independent of any specific S3 SDK. [`MemoryStore`] implements the
//! trait in memory for tests.

pub mod alias;
pub mod config;
pub mod delete;
pub mod error;
pub mod list;
pub mod memory;
pub mod path;
mod pool;
pub mod retry;
pub mod sync;
pub mod traits;
pub mod upload;

pub use alias::{Alias, AliasManager};
pub use config::{Config, ConfigManager, RetryConfig, TransferConfig};
pub use delete::{
    BatchDeleter, DeleteFailure, DeleteOutcome, DeleteResult, OptimizedDeleter,
    ParallelDeleteCoordinator, StreamingDeleteConsumer,
};
pub use error::{Error, Result};
pub use list::{ListConfig, ObjectStream, Paginator, StreamingLister};
pub use memory::MemoryStore;
pub use path::{ParsedPath, RemotePath, parse_path};
pub use retry::{is_retryable_error, retry_with_backoff};
pub use sync::{
    Operation, OperationKind, SyncManager, SyncOptions, SyncReport, SyncResult, SyncState,
};
pub use traits::{
    CompletedPart, DeleteBatchOutput, KeyError, ListPage, ListPageRequest, ObjectInfo, ObjectStore,
};
pub use upload::{
    FileSource, MultipartUploadCoordinator, PartSource, UploadResult, UploadStrategy, Uploader,
};

/// Re-exported so callers can build cancellation tokens without a direct dependency
pub use tokio_util::sync::CancellationToken;
