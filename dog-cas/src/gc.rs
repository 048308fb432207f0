use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::keys::KeyStrategyDigest;
use crate::pagination::{BlobListing, KeyPager, DEFAULT_PAGE_SIZE};
use crate::{BlobError, BlobResult};

/// Live and reclaimed totals of a GC pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcStatus {
    /// Bytes held by blobs that are kept
    pub size_binaries: u64,
    /// Number of blobs that are kept
    pub num_binaries: u64,
    /// Bytes reclaimed (or reclaimable, for a dry run)
    pub size_binaries_gc: u64,
    /// Number of blobs reclaimed
    pub num_binaries_gc: u64,
}

impl GcStatus {
    fn reclaim(&mut self, size: u64) {
        self.size_binaries = self.size_binaries.saturating_sub(size);
        self.num_binaries = self.num_binaries.saturating_sub(1);
        self.size_binaries_gc += size;
        self.num_binaries_gc += 1;
    }
}

/// One mark-and-sweep pass, owned by the caller between
/// [`GarbageCollector::compute_to_delete`] and
/// [`GarbageCollector::remove_unmarked_blobs_and_update_status`]
#[derive(Debug)]
pub struct GcPass {
    gc_id: String,
    to_delete: HashSet<String>,
    status: GcStatus,
}

impl GcPass {
    /// Mark a live key. Returns whether it was still a deletion candidate.
    pub fn mark(&mut self, key: &str) -> bool {
        self.to_delete.remove(key)
    }

    pub fn is_candidate(&self, key: &str) -> bool {
        self.to_delete.contains(key)
    }

    /// Number of keys that would currently be deleted
    pub fn candidates(&self) -> usize {
        self.to_delete.len()
    }

    /// Totals as computed at listing time
    pub fn status(&self) -> &GcStatus {
        &self.status
    }

    pub fn gc_id(&self) -> &str {
        &self.gc_id
    }
}

/// Mark-and-sweep collector over any store that can list and delete blobs
///
/// Only keys shaped like digests of the configured algorithm are ever
/// considered, so foreign objects sharing the namespace are left alone.
pub struct GarbageCollector<L: ?Sized> {
    listing: Arc<L>,
    keys: KeyStrategyDigest,
    page_size: usize,
}

impl<L: BlobListing + ?Sized> GarbageCollector<L> {
    pub fn new(listing: Arc<L>, keys: KeyStrategyDigest) -> Self {
        Self {
            listing,
            keys,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Backend and namespace this collector works on
    pub fn id(&self) -> String {
        self.listing.listing_id()
    }

    /// List the namespace and start a pass with every digest key as a
    /// deletion candidate. A listing failure aborts the pass.
    pub async fn compute_to_delete(&self) -> BlobResult<GcPass> {
        let gc_id = self.id();
        let mut pass = GcPass {
            gc_id: gc_id.clone(),
            to_delete: HashSet::new(),
            status: GcStatus::default(),
        };
        let mut skipped = 0usize;
        let mut pager = KeyPager::new(self.listing.list_blobs(), self.page_size);
        while let Some(page) = pager.next_page().await? {
            for blob in page {
                if !self.keys.is_valid_digest(&blob.key) {
                    skipped += 1;
                    continue;
                }
                pass.status.size_binaries += blob.size;
                pass.status.num_binaries += 1;
                pass.to_delete.insert(blob.key);
            }
        }
        info!(
            gc = %gc_id,
            candidates = pass.to_delete.len(),
            bytes = pass.status.size_binaries,
            ignored = skipped,
            "GC candidates computed"
        );
        Ok(pass)
    }

    /// Sweep every unmarked key. With `delete == false` only the status is
    /// updated and the backend is left untouched.
    pub async fn remove_unmarked_blobs_and_update_status(
        &self,
        pass: GcPass,
        delete: bool,
    ) -> BlobResult<GcStatus> {
        let gc_id = self.id();
        if pass.gc_id != gc_id {
            return Err(BlobError::invalid(format!(
                "GC pass for {} cannot be swept by {}",
                pass.gc_id, gc_id
            )));
        }
        let GcPass {
            to_delete,
            mut status,
            ..
        } = pass;
        for key in to_delete {
            let Some(size) = self.listing.blob_size(&key).await? else {
                debug!(gc = %gc_id, key, "Blob removed concurrently, skipping");
                continue;
            };
            status.reclaim(size);
            if delete {
                self.listing.remove(&key).await;
            }
        }
        info!(
            gc = %gc_id,
            delete,
            removed = status.num_binaries_gc,
            removed_bytes = status.size_binaries_gc,
            kept = status.num_binaries,
            kept_bytes = status.size_binaries,
            "GC sweep done"
        );
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBlobStore;
    use tracing_test::traced_test;

    const FOO_MD5: &str = "acbd18db4cc2f85cedef654fccc4a4d8";
    const BAR_MD5: &str = "37b51d194a7513e45b56f6524f2d51f2";

    fn store() -> Arc<InMemoryBlobStore> {
        let store = Arc::new(InMemoryBlobStore::new("gc"));
        store.insert(FOO_MD5, &b"foo"[..]);
        store.insert(BAR_MD5, &b"barbar"[..]);
        store.insert("junk", &b"not a digest"[..]);
        store
    }

    #[tokio::test]
    #[traced_test]
    async fn test_mark_and_sweep() {
        let store = store();
        let gc = GarbageCollector::new(store.clone(), KeyStrategyDigest::md5()).with_page_size(1);

        let mut pass = gc.compute_to_delete().await.unwrap();
        assert_eq!(pass.candidates(), 2);
        assert_eq!(pass.status().num_binaries, 2);
        assert_eq!(pass.status().size_binaries, 9);
        assert!(!pass.is_candidate("junk"));

        assert!(pass.mark(FOO_MD5));
        assert!(!pass.mark(FOO_MD5));
        assert!(!pass.mark("unknown"));

        let status = gc
            .remove_unmarked_blobs_and_update_status(pass, true)
            .await
            .unwrap();
        assert_eq!(
            status,
            GcStatus {
                size_binaries: 3,
                num_binaries: 1,
                size_binaries_gc: 6,
                num_binaries_gc: 1,
            }
        );
        assert!(store.get(FOO_MD5).is_some());
        assert!(store.get(BAR_MD5).is_none());
        assert!(store.get("junk").is_some());
        assert!(logs_contain("GC sweep done"));
    }

    #[tokio::test]
    async fn test_concurrently_removed_blob_is_skipped() {
        let store = store();
        let gc = GarbageCollector::new(store.clone(), KeyStrategyDigest::md5());

        let pass = gc.compute_to_delete().await.unwrap();
        store.remove(BAR_MD5).await;
        let status = gc
            .remove_unmarked_blobs_and_update_status(pass, true)
            .await
            .unwrap();
        assert_eq!(status.num_binaries_gc, 1);
        assert_eq!(status.size_binaries_gc, 3);
        // the vanished blob still counts as live: it was listed, never reclaimed
        assert_eq!(status.num_binaries, 1);
    }

    #[tokio::test]
    async fn test_pass_bound_to_its_collector() {
        let gc = GarbageCollector::new(store(), KeyStrategyDigest::md5());
        let other = GarbageCollector::new(
            Arc::new(InMemoryBlobStore::new("other")),
            KeyStrategyDigest::md5(),
        );
        let pass = other.compute_to_delete().await.unwrap();
        let result = gc.remove_unmarked_blobs_and_update_status(pass, false).await;
        assert!(matches!(result, Err(BlobError::Invalid { .. })));
    }

    #[test]
    fn test_status_serializes_for_reports() {
        let status = GcStatus {
            size_binaries: 10,
            num_binaries: 2,
            size_binaries_gc: 4,
            num_binaries_gc: 1,
        };
        let json = serde_json::to_value(status).unwrap();
        assert_eq!(json["size_binaries_gc"], 4);
        assert_eq!(json["num_binaries"], 2);
    }
}
