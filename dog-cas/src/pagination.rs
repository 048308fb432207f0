use async_trait::async_trait;
use futures::stream::{BoxStream, Peekable};
use futures_util::StreamExt;
use std::pin::Pin;

use crate::{BlobResult, ListedBlob};

/// Lazy listing of every blob directly under a store's namespace
pub type ListingStream = BoxStream<'static, BlobResult<ListedBlob>>;

/// Default number of keys per page
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Listing and deletion capability shared by garbage collection and scrolls
#[async_trait]
pub trait BlobListing: Send + Sync {
    /// Stable identifier (backend + namespace), for logs
    fn listing_id(&self) -> String;

    /// Fresh listing from the start of the namespace
    fn list_blobs(&self) -> ListingStream;

    /// Current size of a blob, `None` if it no longer exists
    async fn blob_size(&self, key: &str) -> BlobResult<Option<u64>>;

    /// Delete a listed blob; absent keys are a no-op
    async fn remove(&self, key: &str);
}

/// Pages over a listing. Restartable only by creating a new pager.
pub struct KeyPager {
    inner: Peekable<ListingStream>,
    page_size: usize,
}

impl KeyPager {
    pub fn new(listing: ListingStream, page_size: usize) -> Self {
        Self {
            inner: listing.peekable(),
            page_size: page_size.max(1),
        }
    }

    pub fn of(listing: &dyn BlobListing, page_size: usize) -> Self {
        Self::new(listing.list_blobs(), page_size)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whether the backend has more results. A pending error counts as more.
    pub async fn has_more(&mut self) -> bool {
        Pin::new(&mut self.inner).peek().await.is_some()
    }

    /// Next page, `None` once the listing is exhausted
    pub async fn next_page(&mut self) -> BlobResult<Option<Vec<ListedBlob>>> {
        let mut page = Vec::with_capacity(self.page_size);
        while page.len() < self.page_size {
            match self.inner.next().await {
                Some(Ok(blob)) => page.push(blob),
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
        if page.is_empty() {
            Ok(None)
        } else {
            Ok(Some(page))
        }
    }
}
