use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::caching::CachingBlobStore;
use crate::config::{AzureConfig, CachingConfig, DEFAULT_DIRECT_DOWNLOAD_EXPIRE};
use crate::gc::GarbageCollector;
use crate::gc_command::{GcCommandRunner, LiveBlobSource};
use crate::remote::RemoteBlobStore;
use crate::scroll::BlobScroll;
use crate::{BlobError, BlobResult, BlobStore, BlobWriteContext, ByteStream, KeyStrategy};

/// Name under which a provider exposes its store scroll
pub const STORE_SCROLL_NAME: &str = "azureBlobScroll";

/// What the caller intends to do with a blob URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageHint {
    /// Browser download
    Download,
    /// Server-side streaming
    Stream,
    /// Inline embedding (previews, thumbnails)
    Embed,
}

/// A key strategy and a store (optionally cache-backed) bound under a
/// provider id
pub struct BlobProvider {
    id: String,
    key_strategy: KeyStrategy,
    remote: Arc<RemoteBlobStore>,
    store: Arc<dyn BlobStore>,
    direct_download: bool,
    direct_download_expire: Duration,
    cdn_host: Option<String>,
}

impl BlobProvider {
    /// Provider writing straight to `remote`, without cache
    pub fn new<S: Into<String>>(id: S, key_strategy: KeyStrategy, remote: Arc<RemoteBlobStore>) -> Self {
        Self {
            id: id.into(),
            key_strategy,
            store: remote.clone(),
            remote,
            direct_download: false,
            direct_download_expire: DEFAULT_DIRECT_DOWNLOAD_EXPIRE,
            cdn_host: None,
        }
    }

    /// Azure-backed provider as described by `config`
    pub fn from_config<S: Into<String>>(id: S, config: &AzureConfig) -> BlobResult<Self> {
        let id = id.into();
        let remote = Arc::new(RemoteBlobStore::azure(id.clone(), config)?);
        let mut provider = Self::new(id, KeyStrategy::digest(config.digest), remote);
        if let Some(caching) = &config.caching {
            provider = provider.with_caching(caching)?;
        }
        if config.direct_download {
            provider = provider.with_direct_download(config.direct_download_expire);
        }
        if let Some(host) = &config.cdn_host {
            provider = provider.with_cdn_host(host.clone());
        }
        Ok(provider)
    }

    pub fn from_properties<S: Into<String>>(id: S, props: &HashMap<String, String>) -> BlobResult<Self> {
        Self::from_config(id, &AzureConfig::from_properties(props)?)
    }

    /// Put a local cache tier in front of the remote store
    pub fn with_caching(mut self, config: &CachingConfig) -> BlobResult<Self> {
        let caching = CachingBlobStore::new(format!("{}-cache", self.id), self.remote.clone(), config)?;
        self.store = Arc::new(caching);
        Ok(self)
    }

    pub fn with_direct_download(mut self, expire: Duration) -> Self {
        self.direct_download = true;
        self.direct_download_expire = expire;
        self
    }

    pub fn with_cdn_host<S: Into<String>>(mut self, host: S) -> Self {
        self.cdn_host = Some(host.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key_strategy(&self) -> &KeyStrategy {
        &self.key_strategy
    }

    /// Store used for reads and writes (the cache tier when configured)
    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub fn remote(&self) -> &Arc<RemoteBlobStore> {
        &self.remote
    }

    /// Key without its `<providerId>:` qualifier
    pub fn strip_key_prefix<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.id.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(key)
    }

    /// Store content under its digest key
    pub async fn write_blob(&self, stream: ByteStream) -> BlobResult<String> {
        let observer = self.key_strategy.write_observer().ok_or_else(|| {
            BlobError::invalid(format!("Provider {} needs an explicit key for every write", self.id))
        })?;
        let key = self
            .store
            .write(BlobWriteContext::from_stream(stream).with_observer(observer))
            .await?;
        debug!(provider = %self.id, key = %key, "Wrote blob");
        Ok(key)
    }

    /// Store content under a caller-supplied key
    pub async fn write_blob_with_key(&self, key: &str, stream: ByteStream) -> BlobResult<String> {
        self.key_strategy.validate_key(key)?;
        let mut ctx = BlobWriteContext::from_stream(stream).with_key(key);
        if let Some(observer) = self.key_strategy.write_observer() {
            ctx = ctx.with_observer(observer);
        }
        self.store.write(ctx).await
    }

    pub async fn get_stream(&self, key: &str) -> BlobResult<Option<ByteStream>> {
        self.store.get_stream(self.strip_key_prefix(key)).await
    }

    pub async fn read_blob(&self, key: &str, dest: &Path) -> BlobResult<bool> {
        self.store.read_blob(self.strip_key_prefix(key), dest).await
    }

    pub async fn delete_blob(&self, key: &str) {
        self.store.delete_blob(self.strip_key_prefix(key)).await;
    }

    /// Copy or move a blob from another provider into this one
    pub async fn copy_or_move_blob(
        &self,
        key: &str,
        source: &BlobProvider,
        source_key: &str,
        is_move: bool,
    ) -> BlobResult<Option<String>> {
        self.store
            .copy_or_move_blob(
                self.strip_key_prefix(key),
                source.store.as_ref(),
                source.strip_key_prefix(source_key),
                is_move,
            )
            .await
    }

    /// Collector over the remote namespace. Only digest-keyed providers
    /// can be garbage collected.
    pub fn garbage_collector(&self) -> BlobResult<GarbageCollector<RemoteBlobStore>> {
        let digest = self.key_strategy.as_digest().ok_or(BlobError::Unsupported)?;
        Ok(GarbageCollector::new(self.remote.clone(), digest.clone()))
    }

    pub fn gc_command_runner(
        &self,
        live: Arc<dyn LiveBlobSource>,
    ) -> BlobResult<GcCommandRunner<RemoteBlobStore>> {
        Ok(GcCommandRunner::new(self.garbage_collector()?, live))
    }

    pub fn scroll_name(&self) -> &'static str {
        STORE_SCROLL_NAME
    }

    pub fn scroll(&self, batch_size: usize) -> BlobScroll {
        BlobScroll::new(self.remote.as_ref(), batch_size)
    }

    pub fn open_scroll(&self, name: &str, batch_size: usize) -> BlobResult<BlobScroll> {
        if name != STORE_SCROLL_NAME {
            return Err(BlobError::invalid(format!("Unknown scroll: {}", name)));
        }
        Ok(self.scroll(batch_size))
    }

    /// Time-limited URL for fetching the blob directly from the backend
    /// (or the CDN in front of it).
    ///
    /// `None` unless direct download is enabled and the hint is
    /// [`UsageHint::Download`].
    pub async fn signed_url(
        &self,
        key: &str,
        hint: UsageHint,
        expire: Option<Duration>,
    ) -> BlobResult<Option<Url>> {
        if !self.direct_download || hint != UsageHint::Download {
            return Ok(None);
        }
        let expire = expire.unwrap_or(self.direct_download_expire);
        let mut url = self
            .remote
            .signed_url(self.strip_key_prefix(key), expire)
            .await?;
        if let Some(host) = &self.cdn_host {
            substitute_host(&mut url, host)?;
        }
        Ok(Some(url))
    }
}

/// Replace the host (and port, if given) of `url`, keeping path and query
fn substitute_host(url: &mut Url, host: &str) -> BlobResult<()> {
    let invalid = || BlobError::config(format!("Invalid CDN host: {}", host));
    let (name, port) = match host.rsplit_once(':') {
        Some((name, port)) => (name, Some(port.parse::<u16>().map_err(|_| invalid())?)),
        None => (host, None),
    };
    url.set_host(Some(name)).map_err(|_| invalid())?;
    url.set_port(port).map_err(|_| invalid())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::StoreLocation;
    use async_trait::async_trait;
    use object_store::memory::InMemory;
    use object_store::path::Path as ObjectPath;
    use object_store::signer::Signer;

    #[derive(Debug)]
    struct StaticSigner;

    #[async_trait]
    impl Signer for StaticSigner {
        async fn signed_url(
            &self,
            _method: http::Method,
            path: &ObjectPath,
            expires_in: Duration,
        ) -> object_store::Result<Url> {
            let url = format!(
                "https://acct.blob.core.windows.net/container/{}?se={}&sig=abc",
                path,
                expires_in.as_secs()
            );
            Ok(Url::parse(&url).unwrap())
        }
    }

    fn provider() -> BlobProvider {
        let remote = RemoteBlobStore::new(
            "test",
            StoreLocation::new("acct", "container"),
            Arc::new(InMemory::new()),
        )
        .with_prefix("base")
        .with_signer(Arc::new(StaticSigner));
        BlobProvider::new("test", KeyStrategy::default(), Arc::new(remote))
    }

    #[test]
    fn test_strip_key_prefix() {
        let provider = provider();
        assert_eq!(provider.strip_key_prefix("test:abc"), "abc");
        assert_eq!(provider.strip_key_prefix("abc"), "abc");
        assert_eq!(provider.strip_key_prefix("other:abc"), "other:abc");
        assert_eq!(provider.strip_key_prefix("testing:abc"), "testing:abc");
    }

    #[tokio::test]
    async fn test_signed_url_needs_direct_download_and_hint() {
        let provider = provider();
        assert!(provider
            .signed_url("abc", UsageHint::Download, None)
            .await
            .unwrap()
            .is_none());

        let provider = provider.with_direct_download(Duration::from_secs(600));
        assert!(provider
            .signed_url("abc", UsageHint::Embed, None)
            .await
            .unwrap()
            .is_none());

        let url = provider
            .signed_url("test:abc", UsageHint::Download, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://acct.blob.core.windows.net/container/base/abc?se=600&sig=abc"
        );
    }

    #[tokio::test]
    async fn test_cdn_host_substitution() {
        let provider = provider()
            .with_direct_download(Duration::from_secs(60))
            .with_cdn_host("cdn.example.com:8443");
        let url = provider
            .signed_url("abc", UsageHint::Download, Some(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://cdn.example.com:8443/container/base/abc?se=5&sig=abc"
        );
    }

    #[test]
    fn test_open_scroll_rejects_unknown_name() {
        let provider = provider();
        assert!(provider.open_scroll(STORE_SCROLL_NAME, 10).is_ok());
        assert!(matches!(
            provider.open_scroll("nope", 10),
            Err(BlobError::Invalid { .. })
        ));
    }

    #[test]
    fn test_opaque_provider_has_no_gc() {
        let remote = RemoteBlobStore::new(
            "opaque",
            StoreLocation::new("acct", "container"),
            Arc::new(InMemory::new()),
        );
        let provider = BlobProvider::new("opaque", KeyStrategy::Opaque, Arc::new(remote));
        assert!(matches!(provider.garbage_collector(), Err(BlobError::Unsupported)));
    }
}
