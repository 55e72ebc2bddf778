//! Change detection between a local file and its remote counterpart

use super::{LocalFile, RemoteFile};

/// Decides whether a local file needs to be uploaded again
pub trait Comparator: Send + Sync {
    /// `Some(reason)` when the file changed, `None` when it can be skipped
    fn changed(&self, local: &LocalFile, remote: &RemoteFile) -> Option<String>;
}

/// Compares size, then modification time, then content hash
///
/// The hash is only compared when the scanner computed one and the remote
/// ETag is a plain MD5; multipart ETags (`<hex>-<parts>`) are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataComparator;

impl Comparator for MetadataComparator {
    fn changed(&self, local: &LocalFile, remote: &RemoteFile) -> Option<String> {
        if local.size != remote.size {
            return Some(format!("size changed ({} -> {})", remote.size, local.size));
        }

        if let (Some(local_time), Some(remote_time)) = (local.modified, remote.last_modified)
            && local_time > remote_time
        {
            return Some("newer locally".to_string());
        }

        if let (Some(checksum), Some(etag)) = (&local.checksum, comparable_etag(remote))
            && !checksum.eq_ignore_ascii_case(etag)
        {
            return Some("checksum changed".to_string());
        }

        None
    }
}

/// The remote ETag as a bare MD5 hex digest, if it is one
fn comparable_etag(remote: &RemoteFile) -> Option<&str> {
    let etag = remote.etag.as_deref()?.trim_matches('"');
    (!etag.contains('-')).then_some(etag)
}
