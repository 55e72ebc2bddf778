//! Path parsing
//!
//! Remote paths have the form `alias/bucket[/key]`. Anything that starts with
//! `/`, `./`, `../` or `~`, or names an existing local file, is local.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// A location in object storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePath {
    pub alias: String,
    pub bucket: String,
    pub key: String,
}

impl RemotePath {
    pub fn new(alias: impl Into<String>, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Join a relative key onto this path's key, inserting `/` when needed
    pub fn join(&self, relative: &str) -> String {
        join_key(&self.key, relative)
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "{}/{}", self.alias, self.bucket)
        } else {
            write!(f, "{}/{}/{}", self.alias, self.bucket, self.key)
        }
    }
}

/// Result of parsing a user-supplied path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedPath {
    Local(PathBuf),
    Remote(RemotePath),
}

/// Parse a CLI path argument
pub fn parse_path(input: &str) -> Result<ParsedPath> {
    if input.is_empty() {
        return Err(Error::InvalidPath("Path cannot be empty".to_string()));
    }

    let looks_local = input.starts_with('/')
        || input.starts_with("./")
        || input.starts_with("../")
        || input.starts_with('~')
        || input == "."
        || input == ".."
        || Path::new(input).exists();
    if looks_local {
        return Ok(ParsedPath::Local(PathBuf::from(input)));
    }

    let mut parts = input.splitn(3, '/');
    let alias = parts.next().unwrap_or_default();
    let bucket = parts.next().unwrap_or_default();
    let key = parts.next().unwrap_or_default();

    if alias.is_empty() || bucket.is_empty() {
        return Err(Error::InvalidPath(format!(
            "Expected alias/bucket[/key], got '{input}'"
        )));
    }

    Ok(ParsedPath::Remote(RemotePath::new(alias, bucket, key)))
}

/// Join two key fragments with a single `/`
pub fn join_key(prefix: &str, relative: &str) -> String {
    if prefix.is_empty() {
        relative.to_string()
    } else if prefix.ends_with('/') {
        format!("{prefix}{relative}")
    } else {
        format!("{prefix}/{relative}")
    }
}
