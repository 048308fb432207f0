use crate::pagination::{BlobListing, KeyPager, ListingStream};
use crate::{BlobError, BlobResult, ListedBlob};

/// Batched enumeration of every blob in a store's namespace
///
/// A scroll only moves forward. Starting over means opening a new one.
pub struct BlobScroll {
    scroll_id: String,
    pager: KeyPager,
}

impl BlobScroll {
    pub fn new(listing: &dyn BlobListing, batch_size: usize) -> Self {
        Self::from_listing(listing.listing_id(), listing.list_blobs(), batch_size)
    }

    pub fn from_listing<S: Into<String>>(scroll_id: S, listing: ListingStream, batch_size: usize) -> Self {
        Self {
            scroll_id: scroll_id.into(),
            pager: KeyPager::new(listing, batch_size),
        }
    }

    pub fn scroll_id(&self) -> &str {
        &self.scroll_id
    }

    pub fn batch_size(&self) -> usize {
        self.pager.page_size()
    }

    pub async fn has_next(&mut self) -> bool {
        self.pager.has_more().await
    }

    /// Next batch of blobs, keys relative to the store namespace
    #[allow(clippy::should_implement_trait)]
    pub async fn next(&mut self) -> BlobResult<Vec<ListedBlob>> {
        self.pager.next_page().await?.ok_or(BlobError::NoSuchElement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBlobStore;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_scroll_batches() {
        let store = InMemoryBlobStore::new("scroll");
        for i in 0..7 {
            store.insert(format!("key{}", i), vec![0u8; i]);
        }

        let mut scroll = BlobScroll::new(&store, 3);
        assert_eq!(scroll.scroll_id(), "memory:scroll");
        let mut batches = 0;
        let mut keys = HashSet::new();
        while scroll.has_next().await {
            let batch = scroll.next().await.unwrap();
            assert!(batch.len() <= 3);
            for blob in batch {
                assert_eq!(blob.size, blob.key[3..].parse::<u64>().unwrap());
                keys.insert(blob.key);
            }
            batches += 1;
        }
        assert_eq!(batches, 3);
        assert_eq!(keys.len(), 7);
        assert!(matches!(scroll.next().await, Err(BlobError::NoSuchElement)));
    }
}
