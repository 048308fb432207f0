use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::pagination::{BlobListing, ListingStream};
use crate::store::{SourceFile, StoreFamily};
use crate::{BlobError, BlobResult, BlobStore, BlobWriteContext, ByteRange, ByteStream, ListedBlob, Lookup};

/// Blob store that keeps everything in process memory
///
/// Used for tests and as the "different backend" side of copies: it never
/// shares a backend family with anything, so copies into or out of it
/// always go through a local file.
pub struct InMemoryBlobStore {
    name: String,
    blobs: Arc<RwLock<HashMap<String, Bytes>>>,
    allow_byte_range: bool,
    temp_dir: PathBuf,
}

impl InMemoryBlobStore {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            blobs: Arc::new(RwLock::new(HashMap::new())),
            allow_byte_range: false,
            temp_dir: std::env::temp_dir(),
        }
    }

    pub fn with_byte_range(mut self, allow: bool) -> Self {
        self.allow_byte_range = allow;
        self
    }

    pub fn with_temp_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.temp_dir = dir.into();
        self
    }

    /// Store raw content under a key, bypassing key resolution
    pub fn insert<K: Into<String>, B: Into<Bytes>>(&self, key: K, data: B) {
        self.blobs.write().insert(key.into(), data.into());
    }

    /// Content currently held under a key
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.blobs.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    fn lookup(&self, key: &str) -> Option<Bytes> {
        let (key, range) = if self.allow_byte_range {
            ByteRange::split_key(key)
        } else {
            (key, None)
        };
        let data = self.get(key)?;
        match range {
            Some(range) => {
                let len = data.len() as u64;
                if range.start >= len {
                    return None;
                }
                let end = range.as_range().end.min(len) as usize;
                Some(data.slice(range.start as usize..end))
            }
            None => Some(data),
        }
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> StoreFamily<'_> {
        StoreFamily::Memory
    }

    async fn exists(&self, key: &str) -> BlobResult<bool> {
        Ok(self.blobs.read().contains_key(key))
    }

    async fn get_stream(&self, key: &str) -> BlobResult<Option<ByteStream>> {
        Ok(self.get(key).map(|data| -> ByteStream {
            Box::pin(futures::stream::once(async move { Ok::<_, std::io::Error>(data) }))
        }))
    }

    async fn read_blob(&self, key: &str, dest: &Path) -> BlobResult<bool> {
        match self.lookup(key) {
            Some(data) => {
                tokio::fs::write(dest, &data).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn write(&self, ctx: BlobWriteContext) -> BlobResult<String> {
        let source = ctx.into_local_file(&self.temp_dir).await?;
        let present = self.blobs.read().contains_key(&source.key);
        if present {
            return Ok(source.key);
        }
        let data = Bytes::from(tokio::fs::read(&source.path).await?);
        self.blobs
            .write()
            .entry(source.key.clone())
            .or_insert(data);
        debug!(key = %source.key, store = %self.name, "Stored blob in memory");
        Ok(source.key)
    }

    async fn delete_blob(&self, key: &str) {
        self.blobs.write().remove(key);
    }

    async fn copy_or_move_blob(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        is_move: bool,
    ) -> BlobResult<Option<String>> {
        let Some(file) = SourceFile::fetch(source, source_key, &self.temp_dir).await? else {
            return Ok(None);
        };
        let present = self.blobs.read().contains_key(key);
        if !present {
            let data = Bytes::from(tokio::fs::read(&file.path).await?);
            self.blobs.write().entry(key.to_string()).or_insert(data);
        }
        drop(file);
        if is_move {
            source.delete_blob(source_key).await;
        }
        Ok(Some(key.to_string()))
    }

    async fn get_file(&self, _key: &str) -> BlobResult<Lookup<PathBuf>> {
        Ok(Lookup::Unknown)
    }

    async fn clear(&self) -> BlobResult<()> {
        self.blobs.write().clear();
        Ok(())
    }
}

#[async_trait]
impl BlobListing for InMemoryBlobStore {
    fn listing_id(&self) -> String {
        format!("memory:{}", self.name)
    }

    fn list_blobs(&self) -> ListingStream {
        let mut snapshot: Vec<ListedBlob> = self
            .blobs
            .read()
            .iter()
            .map(|(key, data)| ListedBlob::new(key.clone(), data.len() as u64))
            .collect();
        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        Box::pin(futures::stream::iter(snapshot.into_iter().map(Ok::<_, BlobError>)))
    }

    async fn blob_size(&self, key: &str) -> BlobResult<Option<u64>> {
        Ok(self.blobs.read().get(key).map(|data| data.len() as u64))
    }

    async fn remove(&self, key: &str) {
        self.delete_blob(key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_byte_range_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryBlobStore::new("mem").with_byte_range(true);
        store.insert("abc", &b"0123456789"[..]);

        let dest = dir.path().join("out");
        assert!(store.read_blob("abc;2;5", &dest).await.unwrap());
        assert_eq!(std::fs::read(&dest).unwrap(), b"2345");
        assert!(!store.read_blob("nope;0;1", &dest).await.unwrap());
        assert!(!store.read_blob("abc;10;12", &dest).await.unwrap());
    }

    #[tokio::test]
    async fn test_listing_is_sorted_snapshot() {
        let store = InMemoryBlobStore::new("mem");
        store.insert("b", &b"22"[..]);
        store.insert("a", &b"1"[..]);

        let listed: Vec<ListedBlob> = store.list_blobs().map(|r| r.unwrap()).collect().await;
        assert_eq!(listed, vec![ListedBlob::new("a", 1), ListedBlob::new("b", 2)]);
        assert_eq!(store.listing_id(), "memory:mem");
    }

    #[tokio::test]
    async fn test_get_stream() {
        let store = InMemoryBlobStore::new("mem");
        store.insert("a", &b"hello"[..]);
        let mut stream = store.get_stream("a").await.unwrap().unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert!(store.get_stream("missing").await.unwrap().is_none());
    }

    #[test]
    fn test_clear_and_delete() {
        let store = InMemoryBlobStore::new("mem");
        store.insert("a", &b"1"[..]);
        store.insert("b", &b"2"[..]);

        tokio_test::block_on(async {
            store.delete_blob("a").await;
            assert!(!store.exists("a").await.unwrap());
            assert!(store.exists("b").await.unwrap());
            store.clear().await.unwrap();
        });
        assert!(store.is_empty());
    }
}
