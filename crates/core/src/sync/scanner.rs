//! Local and remote inventories

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use glob::Pattern;
use jiff::Timestamp;
use md5::{Digest, Md5};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::{LocalFile, RemoteFile};
use crate::error::{Error, Result};
use crate::list::{ListConfig, StreamingLister};

/// Compiled exclude patterns
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    patterns: Vec<Pattern>,
}

impl ExcludeSet {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| Error::Config(format!("Invalid exclude pattern '{p}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Whether a `/`-separated relative path matches any pattern
    pub fn is_excluded(&self, relative: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(relative))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Walk `root` and collect every regular file
///
/// Runs on the blocking pool. Symlinks are not followed. With `checksum`
/// set, each file is hashed with MD5.
pub async fn scan_local(root: PathBuf, exclude: ExcludeSet, checksum: bool) -> Result<Vec<LocalFile>> {
    tokio::task::spawn_blocking(move || scan_local_blocking(&root, &exclude, checksum)).await?
}

fn scan_local_blocking(root: &Path, exclude: &ExcludeSet, checksum: bool) -> Result<Vec<LocalFile>> {
    if !root.is_dir() {
        return Err(Error::InvalidPath(format!(
            "{} is not a directory",
            root.display()
        )));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = relative_key(root, entry.path())?;
        if exclude.is_excluded(&relative) {
            tracing::debug!(path = %relative, "Excluded local file");
            continue;
        }

        let metadata = entry.metadata().map_err(|e| Error::Io(e.into()))?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| Timestamp::try_from(t).ok());
        let checksum = if checksum {
            Some(md5_file(entry.path())?)
        } else {
            None
        };

        files.push(LocalFile {
            relative,
            path: entry.path().to_path_buf(),
            size: metadata.len(),
            modified,
            checksum,
        });
    }

    tracing::debug!(root = %root.display(), files = files.len(), "Scanned local tree");
    Ok(files)
}

fn relative_key(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        Error::InvalidPath(format!("{} is outside {}", path.display(), root.display()))
    })?;

    Ok(relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

fn md5_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Prefix to list so that only keys below `prefix` as a directory match
fn listing_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}

/// List every object below `prefix`
///
/// Directory markers (keys ending in `/`) are skipped.
pub async fn scan_remote(
    lister: &StreamingLister,
    cancel: &CancellationToken,
    bucket: &str,
    prefix: &str,
    page_size: usize,
    exclude: &ExcludeSet,
) -> Result<Vec<RemoteFile>> {
    let prefix = listing_prefix(prefix);
    let config = ListConfig::new(bucket)
        .with_prefix(prefix.clone())
        .with_page_size(page_size);
    let mut stream = lister.list_all(cancel, config);

    let mut files = Vec::new();
    while let Some(item) = stream.next().await {
        let object = item?;
        let Some(relative) = object.key.strip_prefix(prefix.as_str()) else {
            continue;
        };
        if relative.is_empty() || relative.ends_with('/') {
            continue;
        }
        if exclude.is_excluded(relative) {
            tracing::debug!(key = %object.key, "Excluded remote object");
            continue;
        }

        files.push(RemoteFile {
            relative: relative.to_string(),
            size: object.size,
            last_modified: object.last_modified,
            etag: object.etag,
            key: object.key,
        });
    }

    // A cancelled producer may end the stream without an error item
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    tracing::debug!(bucket, prefix = %prefix, objects = files.len(), "Scanned remote prefix");
    Ok(files)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::MemoryStore;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs/drafts")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        std::fs::write(dir.path().join("docs/b.md"), b"bravo").unwrap();
        std::fs::write(dir.path().join("docs/drafts/c.tmp"), b"charlie").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_scan_local_relative_paths() {
        let dir = tree();
        let files = scan_local(dir.path().to_path_buf(), ExcludeSet::default(), false)
            .await
            .unwrap();

        let names: Vec<&str> = files.iter().map(|f| f.relative.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "docs/b.md", "docs/drafts/c.tmp"]);
        assert_eq!(files[0].size, 5);
        assert!(files[0].modified.is_some());
        assert!(files[0].checksum.is_none());
    }

    #[tokio::test]
    async fn test_scan_local_excludes_and_checksums() {
        let dir = tree();
        let exclude = ExcludeSet::new(&["*.tmp".to_string()]).unwrap();
        let files = scan_local(dir.path().to_path_buf(), exclude, true)
            .await
            .unwrap();

        assert_eq!(files.len(), 2);
        assert_eq!(
            files[0].checksum.as_deref(),
            Some(hex::encode(Md5::digest(b"alpha")).as_str())
        );
    }

    #[tokio::test]
    async fn test_scan_local_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = scan_local(dir.path().join("missing"), ExcludeSet::default(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPath(_)));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(ExcludeSet::new(&["[".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_scan_remote_strips_prefix() {
        let store = Arc::new(MemoryStore::new());
        store.insert("bucket", "backup/a.txt", "x");
        store.insert("bucket", "backup/docs/", "");
        store.insert("bucket", "backup/docs/b.md", "xy");
        store.insert("bucket", "backup2/other.txt", "x");
        store.insert("bucket", "backup/skip.tmp", "x");

        let exclude = ExcludeSet::new(&["*.tmp".to_string()]).unwrap();
        let files = scan_remote(
            &StreamingLister::new(store),
            &CancellationToken::new(),
            "bucket",
            "backup",
            1000,
            &exclude,
        )
        .await
        .unwrap();

        let names: Vec<&str> = files.iter().map(|f| f.relative.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "docs/b.md"]);
        assert_eq!(files[1].key, "backup/docs/b.md");
        assert_eq!(files[1].size, 2);
    }
}
