//! Pull-model listing, one page per call

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::clamp_batch;
use crate::error::{Error, Result};
use crate::traits::{ListPage, ListPageRequest, ObjectStore};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Cursor {
    Start,
    Next(String),
    Exhausted,
}

/// Walks a listing page by page, holding only the current continuation token
pub struct Paginator {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: Option<String>,
    delimiter: Option<String>,
    page_size: usize,
    cursor: Cursor,
    pages: usize,
}

impl Paginator {
    /// Page size is clamped to `1..=1000`; an empty prefix lists the whole bucket
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        page_size: usize,
    ) -> Self {
        let prefix = prefix.into();
        Self {
            store,
            bucket: bucket.into(),
            prefix: (!prefix.is_empty()).then_some(prefix),
            delimiter: None,
            page_size: clamp_batch(page_size),
            cursor: Cursor::Start,
            pages: 0,
        }
    }

    /// Roll keys up at `delimiter` into [`ListPage::common_prefixes`]
    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into());
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Pages fetched so far
    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    /// True until a page comes back not truncated
    pub fn has_more_pages(&self) -> bool {
        self.cursor != Cursor::Exhausted
    }

    /// Fetch the next page
    ///
    /// A failed call leaves the cursor where it was, so the same page can be
    /// requested again.
    pub async fn next_page(&mut self, cancel: &CancellationToken) -> Result<ListPage> {
        let continuation_token = match &self.cursor {
            Cursor::Start => None,
            Cursor::Next(token) => Some(token.clone()),
            Cursor::Exhausted => {
                return Err(Error::InvalidState(format!(
                    "listing of {} is already complete",
                    self.bucket
                )));
            }
        };

        let request = ListPageRequest {
            prefix: self.prefix.clone(),
            delimiter: self.delimiter.clone(),
            continuation_token,
            max_keys: self.page_size,
        };

        let page = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            page = self.store.list_page(&self.bucket, &request) => page?,
        };

        self.cursor = match (page.is_truncated, &page.continuation_token) {
            (false, _) => Cursor::Exhausted,
            (true, Some(token)) => Cursor::Next(token.clone()),
            (true, None) => {
                return Err(Error::InvalidState(format!(
                    "truncated page of {} without a continuation token",
                    self.bucket
                )));
            }
        };
        self.pages += 1;

        tracing::debug!(
            bucket = %self.bucket,
            page = self.pages,
            objects = page.objects.len(),
            truncated = page.is_truncated,
            "Fetched list page"
        );
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::traits::MockObjectStore;

    fn seeded(n: usize) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for i in 0..n {
            store.insert("bucket", &format!("data/{i:05}"), "x");
        }
        store
    }

    #[tokio::test]
    async fn test_three_pages_for_2500_objects() {
        let store = seeded(2500);
        let mut paginator = Paginator::new(store, "bucket", "data/", 1000);
        let cancel = CancellationToken::new();

        let mut truncation = Vec::new();
        let mut total = 0;
        while paginator.has_more_pages() {
            let page = paginator.next_page(&cancel).await.unwrap();
            truncation.push(page.is_truncated);
            total += page.objects.len();
        }

        assert_eq!(truncation, vec![true, true, false]);
        assert_eq!(total, 2500);
        assert_eq!(paginator.pages_fetched(), 3);

        let err = paginator.next_page(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_page_size_clamped() {
        let paginator = Paginator::new(seeded(0), "bucket", "", 5000);
        assert_eq!(paginator.page_size(), 1000);
    }

    #[tokio::test]
    async fn test_delimiter_fills_common_prefixes() {
        let store = Arc::new(MemoryStore::new());
        store.insert("bucket", "photos/2024/a.jpg", "x");
        store.insert("bucket", "photos/2025/b.jpg", "x");
        store.insert("bucket", "photos/index.html", "x");

        let mut paginator = Paginator::new(store, "bucket", "photos/", 100).with_delimiter("/");
        let page = paginator.next_page(&CancellationToken::new()).await.unwrap();

        assert_eq!(page.common_prefixes, vec!["photos/2024/", "photos/2025/"]);
        assert_eq!(page.objects.len(), 1);
        assert!(!paginator.has_more_pages());
    }

    #[tokio::test]
    async fn test_failed_page_can_be_retried() {
        let store = seeded(150);
        store.fail_list_page(2);
        let mut paginator = Paginator::new(store, "bucket", "", 100);
        let cancel = CancellationToken::new();

        assert_eq!(paginator.next_page(&cancel).await.unwrap().objects.len(), 100);
        assert!(paginator.next_page(&cancel).await.is_err());
        assert!(paginator.has_more_pages());

        let last = paginator.next_page(&cancel).await.unwrap();
        assert_eq!(last.objects.len(), 50);
        assert_eq!(last.objects[0].key, "data/00100");
        assert!(!paginator.has_more_pages());
    }

    #[tokio::test]
    async fn test_cancelled_before_request() {
        let mut mock = MockObjectStore::new();
        mock.expect_list_page().never();
        let mut paginator = Paginator::new(Arc::new(mock), "bucket", "", 10);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = paginator.next_page(&cancel).await.unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_truncated_page_without_token() {
        let mut mock = MockObjectStore::new();
        mock.expect_list_page().times(1).returning(|_, _| {
            Ok(ListPage {
                is_truncated: true,
                ..Default::default()
            })
        });
        let mut paginator = Paginator::new(Arc::new(mock), "bucket", "", 10);

        let err = paginator
            .next_page(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }
}
