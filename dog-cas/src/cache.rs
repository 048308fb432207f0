use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::CachingConfig;
use crate::write::TempFile;
use crate::BlobResult;

const TEMP_SUBDIR: &str = "tmp";

/// Outcome of an eviction run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionStats {
    pub removed: usize,
    pub removed_bytes: u64,
    pub remaining: usize,
    pub remaining_bytes: u64,
}

/// Directory of cached blobs, one file per key
///
/// Entries only ever appear through a rename of a fully written temp file,
/// so a reader never observes partial content. The entry mtime is the last
/// access time used for eviction.
pub struct FileCache {
    dir: PathBuf,
    temp_dir: PathBuf,
    max_size: u64,
    max_count: usize,
    min_age: Duration,
    eviction: Mutex<()>,
}

impl FileCache {
    pub fn new(config: &CachingConfig) -> BlobResult<Self> {
        let temp_dir = config.dir.join(TEMP_SUBDIR);
        std::fs::create_dir_all(&temp_dir)?;
        Ok(Self {
            dir: config.dir.clone(),
            temp_dir,
            max_size: config.max_size,
            max_count: config.max_count,
            min_age: config.min_age,
            eviction: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scratch directory on the same filesystem as the entries
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Entry file for a key. Names are always hex so distinct keys never
    /// share a file and none can shadow the temp directory.
    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(hex::encode(key))
    }

    /// Cached file for a key, refreshing its access time
    pub async fn get(&self, key: &str) -> BlobResult<Option<PathBuf>> {
        let path = self.entry_path(key);
        let file = match tokio::fs::OpenOptions::new().write(true).open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file = file.into_std().await;
        if let Err(e) = file.set_modified(SystemTime::now()) {
            debug!(key, error = %e, "Unable to refresh cache entry time");
        }
        Ok(Some(path))
    }

    pub(crate) fn temp_file(&self) -> BlobResult<TempFile> {
        TempFile::create_in(&self.temp_dir)
    }

    /// Publish a fully written temp file as the entry for `key`
    pub(crate) async fn commit(&self, key: &str, temp: TempFile) -> BlobResult<PathBuf> {
        let path = self.entry_path(key);
        temp.persist(&path).await?;
        debug!(key, "Cached blob");
        if let Err(e) = self.evict_except(Some(&path)).await {
            warn!(error = %e, "Cache eviction failed");
        }
        Ok(path)
    }

    /// Cache a copy of a local file
    pub async fn insert_file(&self, key: &str, source: &Path) -> BlobResult<PathBuf> {
        let temp = self.temp_file()?;
        tokio::fs::copy(source, temp.path()).await?;
        self.commit(key, temp).await
    }

    pub async fn remove(&self, key: &str) {
        let path = self.entry_path(key);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(key, error = %e, "Unable to remove cache entry");
            }
        }
    }

    /// Evict least recently used entries older than the minimum age until
    /// the cache is back under its size and count limits
    pub async fn evict(&self) -> BlobResult<EvictionStats> {
        self.evict_except(None).await
    }

    async fn evict_except(&self, keep: Option<&Path>) -> BlobResult<EvictionStats> {
        let _guard = self.eviction.lock().await;
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if meta.is_file() {
                entries.push((meta.modified()?, meta.len(), entry.path()));
            }
        }
        entries.sort_by_key(|(modified, ..)| *modified);

        let mut stats = EvictionStats {
            remaining: entries.len(),
            remaining_bytes: entries.iter().map(|(_, len, _)| len).sum(),
            ..Default::default()
        };
        let now = SystemTime::now();
        for (modified, len, path) in entries {
            if stats.remaining_bytes <= self.max_size && stats.remaining <= self.max_count {
                break;
            }
            if now.duration_since(modified).unwrap_or_default() < self.min_age {
                // oldest first: everything after this is younger
                break;
            }
            if keep == Some(path.as_path()) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Unable to evict cache entry");
                    continue;
                }
            }
            stats.removed += 1;
            stats.removed_bytes += len;
            stats.remaining -= 1;
            stats.remaining_bytes -= len;
        }
        if stats.removed > 0 {
            debug!(
                removed = stats.removed,
                removed_bytes = stats.removed_bytes,
                "Evicted cache entries"
            );
        }
        Ok(stats)
    }

    /// Drop every entry
    pub async fn clear(&self) -> BlobResult<()> {
        let _guard = self.eviction.lock().await;
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %entry.path().display(), error = %e, "Unable to remove cache entry");
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(dir: &Path, max_size: u64, max_count: usize) -> FileCache {
        FileCache::new(
            &CachingConfig::new(dir)
                .with_max_size(max_size)
                .with_max_count(max_count)
                .with_min_age(Duration::ZERO),
        )
        .unwrap()
    }

    fn age(path: &Path, secs: u64) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(secs))
            .unwrap();
    }

    #[tokio::test]
    async fn test_commit_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 1024, 10);
        assert!(cache.get("abc").await.unwrap().is_none());

        let temp = cache.temp_file().unwrap();
        std::fs::write(temp.path(), b"data").unwrap();
        let path = cache.commit("abc", temp).await.unwrap();

        assert_eq!(cache.get("abc").await.unwrap(), Some(path.clone()));
        assert_eq!(std::fs::read(&path).unwrap(), b"data");

        cache.remove("abc").await;
        assert!(cache.get("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unusual_keys_are_encoded() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 1024, 10);
        let source = dir.path().join("src");
        std::fs::write(&source, b"x").unwrap();

        let path = cache.insert_file("../escape", &source).await.unwrap();
        assert_eq!(path.parent(), Some(dir.path()));
        assert!(cache.get("../escape").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_distinct_keys_never_share_an_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 1024, 10);
        let one = dir.path().join("tmp").join("one");
        let two = dir.path().join("tmp").join("two");
        std::fs::write(&one, b"one").unwrap();
        std::fs::write(&two, b"two").unwrap();

        // "612062" is the hex of "a b"
        let spaced = cache.insert_file("a b", &one).await.unwrap();
        let plain = cache.insert_file("x612062", &two).await.unwrap();
        let tmp = cache.insert_file(TEMP_SUBDIR, &two).await.unwrap();

        assert_ne!(spaced, plain);
        assert_ne!(tmp, cache.temp_dir());
        assert_eq!(std::fs::read(&spaced).unwrap(), b"one");
        assert_eq!(std::fs::read(&plain).unwrap(), b"two");
        assert!(cache.temp_dir().is_dir());
    }

    #[tokio::test]
    async fn test_evicts_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path(), 1024, 2);
        let source = dir.path().join("tmp").join("src");
        std::fs::write(&source, b"x").unwrap();

        let a = cache.insert_file("a", &source).await.unwrap();
        let b = cache.insert_file("b", &source).await.unwrap();
        age(&a, 30);
        age(&b, 20);
        cache.insert_file("c", &source).await.unwrap();

        assert!(!a.exists());
        assert!(b.exists());
        assert!(cache.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_min_age_protects_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(&CachingConfig::new(dir.path()).with_max_count(1)).unwrap();
        let source = dir.path().join("tmp").join("src");
        std::fs::write(&source, b"x").unwrap();

        cache.insert_file("a", &source).await.unwrap();
        cache.insert_file("b", &source).await.unwrap();

        let stats = cache.evict().await.unwrap();
        assert_eq!(stats.removed, 0);
        assert_eq!(stats.remaining, 2);
    }
}
