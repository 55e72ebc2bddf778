//! Object listing
//!
//! [`Paginator`] pulls one page per call. [`StreamingLister`] runs the
//! paginator in a background task and pushes objects onto an
//! [`ObjectStream`], optionally fanning out over several prefixes.

mod paginator;
mod stream;

use crate::config::{MAX_BATCH_SIZE, clamp_batch};

pub use paginator::Paginator;
pub use stream::{ObjectStream, StreamingLister};

/// Parameters of a streamed listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListConfig {
    pub bucket: String,
    /// Empty lists the whole bucket
    pub prefix: String,
    pub page_size: usize,
    buffer: usize,
}

impl ListConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: String::new(),
            page_size: MAX_BATCH_SIZE,
            buffer: MAX_BATCH_SIZE,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Objects per page, clamped to `1..=1000`
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = clamp_batch(page_size);
        self
    }

    /// Objects the producer may run ahead of the consumer
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    pub fn buffer(&self) -> usize {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_config_clamps() {
        let config = ListConfig::new("bucket").with_page_size(0).with_buffer(0);
        assert_eq!(config.page_size, 1);
        assert_eq!(config.buffer(), 1);
        assert_eq!(ListConfig::new("b").with_page_size(9999).page_size, 1000);
    }
}
