use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::warn;

use crate::keys::{DigestAlgorithm, DigestHasher};
use crate::{BlobError, BlobResult, ByteStream};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Hook that sees every byte of a write before the key is finalized
pub trait WriteObserver: Send {
    /// Called for each chunk, in order
    fn observe(&mut self, chunk: &[u8]);

    /// Called once after the last chunk
    fn finish(&mut self);

    /// Key computed from the observed content, if this observer produces one
    fn key(&self) -> Option<String>;
}

/// Observer computing the content digest that becomes the blob key
pub struct DigestObserver {
    hasher: Option<DigestHasher>,
    digest: Option<String>,
}

impl DigestObserver {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self {
            hasher: Some(algorithm.hasher()),
            digest: None,
        }
    }
}

impl WriteObserver for DigestObserver {
    fn observe(&mut self, chunk: &[u8]) {
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(chunk);
        }
    }

    fn finish(&mut self) {
        if let Some(hasher) = self.hasher.take() {
            self.digest = Some(hasher.finalize_hex());
        }
    }

    fn key(&self) -> Option<String> {
        self.digest.clone()
    }
}

/// Where the bytes of a write come from
pub enum WriteSource {
    Stream(ByteStream),
    /// A local file the store may read directly
    File(PathBuf),
}

/// A single write request
///
/// The key is either given up front or produced by the observer once the
/// whole source has been consumed.
pub struct BlobWriteContext {
    source: WriteSource,
    observer: Option<Box<dyn WriteObserver>>,
    key: Option<String>,
}

impl BlobWriteContext {
    pub fn from_stream(stream: ByteStream) -> Self {
        Self {
            source: WriteSource::Stream(stream),
            observer: None,
            key: None,
        }
    }

    pub fn from_file<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            source: WriteSource::File(path.into()),
            observer: None,
            key: None,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn WriteObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_key<S: Into<String>>(mut self, key: S) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Resolved key: the explicit key, else whatever the observer produced
    pub fn key(&self) -> Option<String> {
        self.key
            .clone()
            .or_else(|| self.observer.as_ref().and_then(|o| o.key()))
    }

    /// Materialize the source as a local file and resolve the key.
    ///
    /// Streams are transferred to a temp file under `temp_dir` through the
    /// observer. A file source is read through the observer in place.
    pub(crate) async fn into_local_file(mut self, temp_dir: &Path) -> BlobResult<LocalSource> {
        let source = std::mem::replace(&mut self.source, WriteSource::File(PathBuf::new()));
        let (path, temp, length) = match source {
            WriteSource::Stream(stream) => {
                let temp = TempFile::create_in(temp_dir)?;
                let length = self.transfer(stream, temp.path()).await?;
                (temp.path().to_path_buf(), Some(temp), length)
            }
            WriteSource::File(path) => {
                let length = if self.observer.is_some() {
                    self.observe_file(&path).await?
                } else {
                    tokio::fs::metadata(&path).await?.len()
                };
                (path, None, length)
            }
        };
        let key = self.key().ok_or(BlobError::MissingKey)?;
        Ok(LocalSource {
            key,
            path,
            length,
            temp,
        })
    }

    async fn transfer(&mut self, mut stream: ByteStream, dest: &Path) -> BlobResult<u64> {
        let mut file = tokio::fs::File::create(dest).await?;
        let mut length = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if let Some(observer) = self.observer.as_mut() {
                observer.observe(&chunk);
            }
            file.write_all(&chunk).await?;
            length += chunk.len() as u64;
        }
        file.flush().await?;
        if let Some(observer) = self.observer.as_mut() {
            observer.finish();
        }
        Ok(length)
    }

    async fn observe_file(&mut self, path: &Path) -> BlobResult<u64> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut length = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            if let Some(observer) = self.observer.as_mut() {
                observer.observe(&buf[..n]);
            }
            length += n as u64;
        }
        if let Some(observer) = self.observer.as_mut() {
            observer.finish();
        }
        Ok(length)
    }
}

/// Write source materialized on the local filesystem, with its resolved key
pub(crate) struct LocalSource {
    pub key: String,
    pub path: PathBuf,
    pub length: u64,
    /// Set when `path` is a temp file owned by this write
    pub temp: Option<TempFile>,
}

/// Temp file deleted when dropped, on every exit path
///
/// Deletion failures are logged and never propagated.
pub(crate) struct TempFile {
    path: PathBuf,
    armed: bool,
}

impl TempFile {
    pub(crate) fn create_in(dir: &Path) -> BlobResult<Self> {
        let path = tempfile::Builder::new()
            .prefix("bin_")
            .suffix(".tmp")
            .tempfile_in(dir)?
            .into_temp_path()
            .keep()
            .map_err(|e| e.error)?;
        Ok(Self { path, armed: true })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically move the file to `dest`; the guard no longer deletes it
    pub(crate) async fn persist(mut self, dest: &Path) -> BlobResult<()> {
        tokio::fs::rename(&self.path, dest).await?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Unable to delete temp file");
            }
        }
    }
}
