use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::remote::RemoteBlobStore;
use crate::write::TempFile;
use crate::{BlobResult, BlobWriteContext, ByteStream, Lookup};

/// Core blob storage operations - implemented by every backend and decorator
///
/// All keys are relative to the store's own namespace.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store name, for logging
    fn name(&self) -> &str;

    /// Backend family this store ultimately writes to
    fn family(&self) -> StoreFamily<'_>;

    /// Whether a blob exists. Only backend failures are errors.
    async fn exists(&self, key: &str) -> BlobResult<bool>;

    /// Lazily consumed content stream, `None` if the blob is absent
    async fn get_stream(&self, key: &str) -> BlobResult<Option<ByteStream>>;

    /// Download a blob (or the byte range encoded in the key, when the store
    /// allows ranges) to `dest`. Returns `false` if absent.
    async fn read_blob(&self, key: &str, dest: &Path) -> BlobResult<bool>;

    /// Write content under its resolved key, unless the key already exists
    async fn write(&self, ctx: BlobWriteContext) -> BlobResult<String>;

    /// Delete a blob. Absent keys are a no-op; failures are logged, not raised.
    async fn delete_blob(&self, key: &str);

    /// Whether copying from `source` avoids going through a local file
    fn copy_blob_is_optimized(&self, _source: &dyn BlobStore) -> bool {
        false
    }

    /// Copy (or move) `source_key` from `source` to `key` in this store.
    ///
    /// Returns `None` when the source blob does not exist.
    async fn copy_or_move_blob(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        is_move: bool,
    ) -> BlobResult<Option<String>>;

    /// Local file holding the blob, if this store keeps one
    async fn get_file(&self, key: &str) -> BlobResult<Lookup<PathBuf>>;

    /// Delete everything in this store's namespace
    async fn clear(&self) -> BlobResult<()>;

    /// Whether the backend keeps several revisions per key
    fn has_versioning(&self) -> bool {
        false
    }
}

/// Backend family, used to pick optimized transfer paths
#[derive(Clone, Copy)]
pub enum StoreFamily<'a> {
    Remote(&'a RemoteBlobStore),
    Memory,
}

impl<'a> StoreFamily<'a> {
    pub fn as_remote(&self) -> Option<&'a RemoteBlobStore> {
        match self {
            Self::Remote(store) => Some(store),
            Self::Memory => None,
        }
    }
}

impl std::fmt::Debug for StoreFamily<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(store) => write!(f, "Remote({})", store.location()),
            Self::Memory => f.write_str("Memory"),
        }
    }
}

/// Local file holding a source blob for the generic copy path
pub(crate) struct SourceFile {
    pub path: PathBuf,
    _temp: Option<TempFile>,
}

impl SourceFile {
    /// Use the source store's own file when it has one, else download the
    /// blob to a temp file under `temp_dir`. `None` if the blob is absent.
    pub(crate) async fn fetch(
        source: &dyn BlobStore,
        source_key: &str,
        temp_dir: &Path,
    ) -> BlobResult<Option<Self>> {
        match source.get_file(source_key).await? {
            Lookup::Found(path) => {
                return Ok(Some(Self { path, _temp: None }));
            }
            Lookup::Missing => return Ok(None),
            Lookup::Unknown => {}
        }
        let temp = TempFile::create_in(temp_dir)?;
        if !source.read_blob(source_key, temp.path()).await? {
            return Ok(None);
        }
        Ok(Some(Self {
            path: temp.path().to_path_buf(),
            _temp: Some(temp),
        }))
    }
}
