use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use http::Method;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use object_store::{
    GetOptions, GetRange, ObjectStore, PutMode, PutOptions, PutPayload, WriteMultipart,
};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use url::Url;

use crate::config::{normalize_prefix, AzureConfig, PREFIX_DELIMITER};
use crate::pagination::{BlobListing, KeyPager, ListingStream, DEFAULT_PAGE_SIZE};
use crate::store::{SourceFile, StoreFamily};
use crate::{
    BlobError, BlobResult, BlobStore, BlobWriteContext, ByteRange, ByteStream, ListedBlob, Lookup,
};

/// Files up to this size are uploaded in a single create-if-absent request
pub const DEFAULT_SINGLE_PUT_THRESHOLD: u64 = 8 * 1024 * 1024;

const MULTIPART_CHUNK_SIZE: usize = 8 * 1024 * 1024;
const MAX_CONCURRENT_PARTS: usize = 4;

/// Physical container a remote store addresses
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreLocation {
    pub account: String,
    pub container: String,
}

impl StoreLocation {
    pub fn new<A: Into<String>, C: Into<String>>(account: A, container: C) -> Self {
        Self {
            account: account.into(),
            container: container.into(),
        }
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account, self.container)
    }
}

/// Blob store over a remote object container (Azure Blob Storage in
/// production), with every key living under `prefix`.
pub struct RemoteBlobStore {
    name: String,
    location: StoreLocation,
    object_store: Arc<dyn ObjectStore>,
    signer: Option<Arc<dyn Signer>>,
    prefix: String,
    allow_byte_range: bool,
    temp_dir: PathBuf,
    single_put_threshold: u64,
}

impl RemoteBlobStore {
    pub fn new<S: Into<String>>(
        name: S,
        location: StoreLocation,
        object_store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            name: name.into(),
            location,
            object_store,
            signer: None,
            prefix: String::new(),
            allow_byte_range: false,
            temp_dir: std::env::temp_dir(),
            single_put_threshold: DEFAULT_SINGLE_PUT_THRESHOLD,
        }
    }

    /// Azure Blob Storage store from provider configuration
    pub fn azure<S: Into<String>>(name: S, config: &AzureConfig) -> BlobResult<Self> {
        let mut builder = MicrosoftAzureBuilder::new()
            .with_account(config.account_name.clone())
            .with_access_key(config.account_key.clone())
            .with_container_name(config.container.clone());
        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint.clone());
        }
        if config.endpoint_protocol.eq_ignore_ascii_case("http") {
            builder = builder.with_allow_http(true);
        }
        let azure = Arc::new(builder.build()?);
        let location = StoreLocation::new(config.account_name.clone(), config.container.clone());

        debug!(
            location = %location,
            prefix = %config.prefix,
            "Created Azure blob store"
        );

        Ok(Self::new(name, location, azure.clone())
            .with_signer(azure)
            .with_prefix(&config.prefix)
            .with_byte_range(config.allow_byte_range))
    }

    pub fn with_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.prefix = normalize_prefix(prefix.as_ref());
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_byte_range(mut self, allow: bool) -> Self {
        self.allow_byte_range = allow;
        self
    }

    pub fn with_temp_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.temp_dir = dir.into();
        self
    }

    pub fn with_single_put_threshold(mut self, bytes: u64) -> Self {
        self.single_put_threshold = bytes;
        self
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn allows_byte_range(&self) -> bool {
        self.allow_byte_range
    }

    /// Underlying object store client
    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.object_store
    }

    fn path_for(&self, key: &str) -> ObjectPath {
        ObjectPath::from(format!("{}{}", self.prefix, key))
    }

    fn prefix_path(&self) -> Option<ObjectPath> {
        let trimmed = self.prefix.trim_end_matches(PREFIX_DELIMITER);
        (!trimmed.is_empty()).then(|| ObjectPath::from(trimmed))
    }

    /// Both stores address the same account and container
    pub fn same_backend_family(&self, other: &dyn BlobStore) -> bool {
        other
            .family()
            .as_remote()
            .is_some_and(|remote| remote.location == self.location)
    }

    async fn head_size(&self, key: &str) -> BlobResult<Option<u64>> {
        match self.object_store.head(&self.path_for(key)).await {
            Ok(meta) => Ok(Some(meta.size as u64)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Time-limited read-only URL for a key
    pub async fn signed_url(&self, key: &str, expires_in: Duration) -> BlobResult<Url> {
        let signer = self.signer.as_ref().ok_or(BlobError::Unsupported)?;
        let url = signer
            .signed_url(Method::GET, &self.path_for(key), expires_in)
            .await?;
        Ok(url)
    }

    /// Upload a local file unless the key already exists.
    ///
    /// Returns whether this call created the object.
    async fn store_file_if_absent(&self, key: &str, file: &Path, length: u64) -> BlobResult<bool> {
        if self.exists(key).await? {
            debug!(key, store = %self.name, "Blob already stored");
            return Ok(false);
        }
        let path = self.path_for(key);
        debug!(key, length, store = %self.name, "Storing blob");
        if length <= self.single_put_threshold {
            let data = tokio::fs::read(file).await?;
            let opts = PutOptions {
                mode: PutMode::Create,
                ..Default::default()
            };
            match self
                .object_store
                .put_opts(&path, PutPayload::from(Bytes::from(data)), opts)
                .await
            {
                Ok(_) => Ok(true),
                Err(object_store::Error::AlreadyExists { .. }) => {
                    debug!(key, "Blob stored concurrently by another writer");
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            }
        } else {
            self.upload_multipart(&path, file).await?;
            Ok(true)
        }
    }

    async fn upload_multipart(&self, path: &ObjectPath, file: &Path) -> BlobResult<()> {
        let upload = self.object_store.put_multipart(path).await?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, MULTIPART_CHUNK_SIZE);
        let mut reader = tokio::fs::File::open(file).await?;
        match Self::feed_parts(&mut writer, &mut reader).await {
            Ok(()) => {
                writer.finish().await?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort) = writer.abort().await {
                    warn!(path = %path, error = %abort, "Unable to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn feed_parts(writer: &mut WriteMultipart, reader: &mut tokio::fs::File) -> BlobResult<()> {
        let mut buf = vec![0u8; MULTIPART_CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            writer.wait_for_capacity(MAX_CONCURRENT_PARTS).await?;
            writer.write(&buf[..n]);
        }
    }

    /// Server-side copy within the same container
    async fn copy_or_move_optimized(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_remote: &RemoteBlobStore,
        source_key: &str,
        is_move: bool,
    ) -> BlobResult<Option<String>> {
        if source_remote.head_size(source_key).await?.is_none() {
            return Ok(None);
        }
        let from = source_remote.path_for(source_key);
        let to = self.path_for(key);
        if from != to && !self.exists(key).await? {
            debug!(from = %from, to = %to, "Server-side blob copy");
            match self.object_store.copy_if_not_exists(&from, &to).await {
                Ok(()) | Err(object_store::Error::AlreadyExists { .. }) => {}
                Err(object_store::Error::NotFound { .. }) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        if is_move && from != to {
            // through the caller's store so decorators drop their copies too
            source.delete_blob(source_key).await;
        }
        Ok(Some(key.to_string()))
    }

    /// Copy through a local file
    async fn copy_or_move_generic(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        is_move: bool,
    ) -> BlobResult<Option<String>> {
        let Some(file) = SourceFile::fetch(source, source_key, &self.temp_dir).await? else {
            return Ok(None);
        };
        let length = tokio::fs::metadata(&file.path).await?.len();
        self.store_file_if_absent(key, &file.path, length).await?;
        drop(file);
        if is_move {
            source.delete_blob(source_key).await;
        }
        Ok(Some(key.to_string()))
    }
}

#[async_trait]
impl BlobStore for RemoteBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> StoreFamily<'_> {
        StoreFamily::Remote(self)
    }

    async fn exists(&self, key: &str) -> BlobResult<bool> {
        Ok(self.head_size(key).await?.is_some())
    }

    async fn get_stream(&self, key: &str) -> BlobResult<Option<ByteStream>> {
        match self.object_store.get(&self.path_for(key)).await {
            Ok(result) => {
                let stream = result
                    .into_stream()
                    .map(|chunk| chunk.map_err(std::io::Error::other));
                Ok(Some(Box::pin(stream)))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_blob(&self, key: &str, dest: &Path) -> BlobResult<bool> {
        let (key, range) = if self.allow_byte_range {
            ByteRange::split_key(key)
        } else {
            (key, None)
        };
        debug!(key, ?range, store = %self.name, "Fetching blob");
        if let Some(range) = range {
            // a range starting past the end cannot be served
            match self.head_size(key).await? {
                Some(size) if range.start < size => {}
                _ => return Ok(false),
            }
        }
        let options = GetOptions {
            range: range.map(|r| GetRange::Bounded(r.as_range())),
            ..Default::default()
        };
        let result = match self.object_store.get_opts(&self.path_for(key), options).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let mut stream = result.into_stream();
        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(true)
    }

    async fn write(&self, ctx: BlobWriteContext) -> BlobResult<String> {
        let source = ctx.into_local_file(&self.temp_dir).await?;
        self.store_file_if_absent(&source.key, &source.path, source.length)
            .await?;
        Ok(source.key)
    }

    async fn delete_blob(&self, key: &str) {
        match self.object_store.delete(&self.path_for(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => warn!(key, store = %self.name, error = %e, "Unable to remove blob"),
        }
    }

    fn copy_blob_is_optimized(&self, source: &dyn BlobStore) -> bool {
        self.same_backend_family(source)
    }

    async fn copy_or_move_blob(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        is_move: bool,
    ) -> BlobResult<Option<String>> {
        match source.family() {
            StoreFamily::Remote(remote) if remote.location == self.location => {
                self.copy_or_move_optimized(key, source, remote, source_key, is_move)
                    .await
            }
            _ => {
                self.copy_or_move_generic(key, source, source_key, is_move)
                    .await
            }
        }
    }

    async fn get_file(&self, _key: &str) -> BlobResult<Lookup<PathBuf>> {
        Ok(Lookup::Unknown)
    }

    async fn clear(&self) -> BlobResult<()> {
        let mut pager = KeyPager::of(self, DEFAULT_PAGE_SIZE);
        while let Some(page) = pager.next_page().await? {
            for blob in page {
                self.delete_blob(&blob.key).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BlobListing for RemoteBlobStore {
    fn listing_id(&self) -> String {
        format!("azure:{}/{}", self.location.container, self.prefix)
    }

    fn list_blobs(&self) -> ListingStream {
        let store = Arc::clone(&self.object_store);
        let prefix = self.prefix.clone();
        let prefix_path = self.prefix_path();
        Box::pin(async_stream::stream! {
            let mut objects = store.list(prefix_path.as_ref());
            while let Some(meta) = objects.next().await {
                match meta {
                    Ok(meta) => {
                        let Some(key) = meta.location.as_ref().strip_prefix(prefix.as_str()) else {
                            continue;
                        };
                        // entries below a sub-directory of the namespace are not ours
                        if key.is_empty() || key.contains(PREFIX_DELIMITER) {
                            continue;
                        }
                        yield Ok(ListedBlob::new(key, meta.size as u64));
                    }
                    Err(e) => {
                        yield Err(BlobError::from(e));
                        break;
                    }
                }
            }
        })
    }

    async fn blob_size(&self, key: &str) -> BlobResult<Option<u64>> {
        self.head_size(key).await
    }

    async fn remove(&self, key: &str) {
        self.delete_blob(key).await;
    }
}
