use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::cache::FileCache;
use crate::config::CachingConfig;
use crate::store::StoreFamily;
use crate::{BlobResult, BlobStore, BlobWriteContext, ByteRange, ByteStream, Lookup};

const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Decorator keeping a local file copy of blobs read from or written to
/// the wrapped store
///
/// Writes go to the wrapped store first and reach the cache only once the
/// store accepted them. Keys carrying a byte range always bypass the cache.
pub struct CachingBlobStore {
    name: String,
    store: Arc<dyn BlobStore>,
    cache: FileCache,
}

impl CachingBlobStore {
    pub fn new<S: Into<String>>(
        name: S,
        store: Arc<dyn BlobStore>,
        config: &CachingConfig,
    ) -> BlobResult<Self> {
        Ok(Self {
            name: name.into(),
            store,
            cache: FileCache::new(config)?,
        })
    }

    /// The wrapped store
    pub fn inner(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    fn bypasses_cache(key: &str) -> bool {
        ByteRange::split_key(key).1.is_some()
    }
}

fn file_stream(path: PathBuf) -> ByteStream {
    Box::pin(async_stream::stream! {
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                yield Err::<Bytes, std::io::Error>(e);
                return;
            }
        };
        loop {
            let mut buf = BytesMut::with_capacity(STREAM_CHUNK_SIZE);
            match file.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => yield Ok(buf.freeze()),
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    })
}

#[async_trait]
impl BlobStore for CachingBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> StoreFamily<'_> {
        self.store.family()
    }

    async fn exists(&self, key: &str) -> BlobResult<bool> {
        if !Self::bypasses_cache(key) && self.cache.get(key).await?.is_some() {
            return Ok(true);
        }
        self.store.exists(key).await
    }

    async fn get_stream(&self, key: &str) -> BlobResult<Option<ByteStream>> {
        if Self::bypasses_cache(key) {
            return self.store.get_stream(key).await;
        }
        match self.get_file(key).await? {
            Lookup::Found(path) => Ok(Some(file_stream(path))),
            Lookup::Missing => Ok(None),
            Lookup::Unknown => self.store.get_stream(key).await,
        }
    }

    async fn read_blob(&self, key: &str, dest: &Path) -> BlobResult<bool> {
        if Self::bypasses_cache(key) {
            return self.store.read_blob(key, dest).await;
        }
        match self.get_file(key).await? {
            Lookup::Found(path) => {
                tokio::fs::copy(&path, dest).await?;
                Ok(true)
            }
            Lookup::Missing => Ok(false),
            Lookup::Unknown => self.store.read_blob(key, dest).await,
        }
    }

    async fn write(&self, ctx: BlobWriteContext) -> BlobResult<String> {
        let source = ctx.into_local_file(self.cache.temp_dir()).await?;
        let key = self
            .store
            .write(BlobWriteContext::from_file(&source.path).with_key(source.key.clone()))
            .await?;
        let cached = match source.temp {
            Some(temp) => self.cache.commit(&key, temp).await,
            None => self.cache.insert_file(&key, &source.path).await,
        };
        if let Err(e) = cached {
            warn!(key, store = %self.name, error = %e, "Unable to cache written blob");
        }
        Ok(key)
    }

    async fn delete_blob(&self, key: &str) {
        self.cache.remove(key).await;
        self.store.delete_blob(key).await;
    }

    fn copy_blob_is_optimized(&self, source: &dyn BlobStore) -> bool {
        self.store.copy_blob_is_optimized(source)
    }

    async fn copy_or_move_blob(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        is_move: bool,
    ) -> BlobResult<Option<String>> {
        self.store
            .copy_or_move_blob(key, source, source_key, is_move)
            .await
    }

    /// Cached file for the key, downloading it into the cache on a miss
    async fn get_file(&self, key: &str) -> BlobResult<Lookup<PathBuf>> {
        if Self::bypasses_cache(key) {
            return Ok(Lookup::Unknown);
        }
        if let Some(path) = self.cache.get(key).await? {
            return Ok(Lookup::Found(path));
        }
        let temp = self.cache.temp_file()?;
        if !self.store.read_blob(key, temp.path()).await? {
            return Ok(Lookup::Missing);
        }
        debug!(key, store = %self.name, "Cache miss, fetched from backing store");
        Ok(Lookup::Found(self.cache.commit(key, temp).await?))
    }

    async fn clear(&self) -> BlobResult<()> {
        self.cache.clear().await?;
        self.store.clear().await
    }

    fn has_versioning(&self) -> bool {
        self.store.has_versioning()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryBlobStore, KeyStrategy};
    use futures_util::StreamExt;

    const FOO_MD5: &str = "acbd18db4cc2f85cedef654fccc4a4d8";

    fn setup(dir: &Path) -> (Arc<InMemoryBlobStore>, CachingBlobStore) {
        let inner = Arc::new(InMemoryBlobStore::new("mem"));
        let caching =
            CachingBlobStore::new("cached", inner.clone(), &CachingConfig::new(dir.join("cache")))
                .unwrap();
        (inner, caching)
    }

    fn foo() -> BlobWriteContext {
        BlobWriteContext::from_stream(Box::pin(futures::stream::iter(vec![Ok::<_, std::io::Error>(
            Bytes::from_static(b"foo"),
        )])))
    }

    #[tokio::test]
    async fn test_write_goes_through_to_backing_store() {
        let dir = tempfile::tempdir().unwrap();
        let (inner, caching) = setup(dir.path());

        let observer = KeyStrategy::default().write_observer().unwrap();
        let key = caching.write(foo().with_observer(observer)).await.unwrap();
        assert_eq!(key, FOO_MD5);
        assert_eq!(inner.get(FOO_MD5).unwrap(), Bytes::from_static(b"foo"));
        assert!(caching.cache().get(FOO_MD5).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_miss_populates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (inner, caching) = setup(dir.path());
        inner.insert("k1", &b"hello"[..]);

        let path = caching.get_file("k1").await.unwrap().found().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");

        // served from the cache even once the backing copy is gone
        inner.delete_blob("k1").await;
        let mut stream = caching.get_stream("k1").await.unwrap().unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert!(caching.get_file("nope").await.unwrap().is_missing());
    }

    #[tokio::test]
    async fn test_delete_drops_cached_copy() {
        let dir = tempfile::tempdir().unwrap();
        let (inner, caching) = setup(dir.path());
        inner.insert("k1", &b"hello"[..]);
        caching.get_file("k1").await.unwrap();

        caching.delete_blob("k1").await;
        assert!(!caching.exists("k1").await.unwrap());
        assert!(caching.cache().get("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_range_keys_bypass_cache() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(InMemoryBlobStore::new("mem").with_byte_range(true));
        let caching =
            CachingBlobStore::new("cached", inner.clone(), &CachingConfig::new(dir.path().join("c")))
                .unwrap();
        inner.insert("k1", &b"0123456789"[..]);

        assert!(caching.get_file("k1;0;3").await.unwrap().is_unknown());
        let dest = dir.path().join("out");
        assert!(caching.read_blob("k1;0;3", &dest).await.unwrap());
        assert_eq!(std::fs::read(&dest).unwrap(), b"0123");
        assert!(caching.cache().get("k1;0;3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reads_stay_with_their_own_key() {
        let dir = tempfile::tempdir().unwrap();
        let (inner, caching) = setup(dir.path());
        inner.insert("a b", &b"one"[..]);
        inner.insert("x612062", &b"two"[..]);

        let dest = dir.path().join("out");
        assert!(caching.read_blob("a b", &dest).await.unwrap());
        assert_eq!(std::fs::read(&dest).unwrap(), b"one");
        assert!(caching.read_blob("x612062", &dest).await.unwrap());
        assert_eq!(std::fs::read(&dest).unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_out_of_bounds_range_is_a_plain_key() {
        let dir = tempfile::tempdir().unwrap();
        let (inner, caching) = setup(dir.path());
        let key = format!("k;0;{}", u64::MAX);
        inner.insert(&key, &b"data"[..]);

        assert!(caching.exists(&key).await.unwrap());
        assert!(caching.get_file(&key).await.unwrap().is_found());
        assert!(caching.get_stream(&key).await.unwrap().is_some());
        let dest = dir.path().join("out");
        assert!(caching.read_blob(&key, &dest).await.unwrap());
        assert_eq!(std::fs::read(&dest).unwrap(), b"data");
    }
}
