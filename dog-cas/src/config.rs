use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::keys::DigestAlgorithm;
use crate::{BlobError, BlobResult};

/// Path delimiter of the remote backend
pub const PREFIX_DELIMITER: char = '/';

/// Environment variable holding the storage account name
pub const ENV_ACCOUNT_NAME: &str = "AZURE_STORAGE_ACCOUNT";

/// Environment variable holding the storage account key
pub const ENV_ACCOUNT_KEY: &str = "AZURE_STORAGE_ACCESS_KEY";

pub const PROP_ACCOUNT_NAME: &str = "account.name";
pub const PROP_ACCOUNT_KEY: &str = "account.key";
pub const PROP_CONTAINER: &str = "container";
pub const PROP_ENDPOINT_PROTOCOL: &str = "endpointProtocol";
pub const PROP_ENDPOINT: &str = "endpoint";
pub const PROP_PREFIX: &str = "prefix";
pub const PROP_NAMESPACE: &str = "namespace";
pub const PROP_CDN_HOST: &str = "cdn.host";
pub const PROP_ALLOW_BYTE_RANGE: &str = "allowByteRange";
pub const PROP_DIRECT_DOWNLOAD: &str = "directdownload";
pub const PROP_DIRECT_DOWNLOAD_EXPIRE: &str = "directdownload.expire";
pub const PROP_NO_CACHE: &str = "nocache";
pub const PROP_CACHE_DIR: &str = "cachedir";
pub const PROP_CACHE_SIZE: &str = "cachesize";
pub const PROP_CACHE_COUNT: &str = "cachecount";
pub const PROP_CACHE_MIN_AGE: &str = "cacheminage";
pub const PROP_DIGEST: &str = "digest";

pub const DEFAULT_DIRECT_DOWNLOAD_EXPIRE: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_CACHE_SIZE: u64 = 100 * 1024 * 1024;
pub const DEFAULT_CACHE_COUNT: usize = 10_000;
pub const DEFAULT_CACHE_MIN_AGE: Duration = Duration::from_secs(60 * 60);

/// Make a non-empty prefix end with the path delimiter
pub fn normalize_prefix(prefix: &str) -> String {
    let mut prefix = prefix.to_string();
    if !prefix.is_empty() && !prefix.ends_with(PREFIX_DELIMITER) {
        prefix.push(PREFIX_DELIMITER);
    }
    prefix
}

/// Local cache tier settings
#[derive(Debug, Clone)]
pub struct CachingConfig {
    /// Directory holding cached blobs
    pub dir: PathBuf,

    /// Total bytes kept before eviction starts
    pub max_size: u64,

    /// Number of entries kept before eviction starts
    pub max_count: usize,

    /// Entries younger than this are never evicted
    pub min_age: Duration,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("dog-cas-cache"),
            max_size: DEFAULT_CACHE_SIZE,
            max_count: DEFAULT_CACHE_COUNT,
            min_age: DEFAULT_CACHE_MIN_AGE,
        }
    }
}

impl CachingConfig {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn with_max_size(mut self, bytes: u64) -> Self {
        self.max_size = bytes;
        self
    }

    pub fn with_max_count(mut self, count: usize) -> Self {
        self.max_count = count;
        self
    }

    pub fn with_min_age(mut self, min_age: Duration) -> Self {
        self.min_age = min_age;
        self
    }
}

/// Azure blob provider configuration
#[derive(Debug, Clone)]
pub struct AzureConfig {
    pub account_name: String,
    pub account_key: String,
    pub container: String,

    /// `https` unless talking to an emulator
    pub endpoint_protocol: String,

    /// Endpoint override, e.g. an emulator URL
    pub endpoint: Option<String>,

    /// Key prefix inside the container, normalized to end with `/`
    pub prefix: String,

    /// Host substituted into signed URLs
    pub cdn_host: Option<String>,

    pub allow_byte_range: bool,
    pub direct_download: bool,
    pub direct_download_expire: Duration,
    pub digest: DigestAlgorithm,

    /// `None` when the cache tier is disabled
    pub caching: Option<CachingConfig>,
}

impl AzureConfig {
    pub fn new<A, K, C>(account_name: A, account_key: K, container: C) -> Self
    where
        A: Into<String>,
        K: Into<String>,
        C: Into<String>,
    {
        Self {
            account_name: account_name.into(),
            account_key: account_key.into(),
            container: container.into(),
            endpoint_protocol: "https".to_string(),
            endpoint: None,
            prefix: String::new(),
            cdn_host: None,
            allow_byte_range: false,
            direct_download: false,
            direct_download_expire: DEFAULT_DIRECT_DOWNLOAD_EXPIRE,
            digest: DigestAlgorithm::default(),
            caching: Some(CachingConfig::default()),
        }
    }

    /// Parse provider properties, falling back to the process environment
    /// for credentials
    pub fn from_properties(props: &HashMap<String, String>) -> BlobResult<Self> {
        Self::from_properties_with_env(props, |name| std::env::var(name).ok())
    }

    /// Parse provider properties with an injected environment lookup
    pub fn from_properties_with_env<F>(props: &HashMap<String, String>, env: F) -> BlobResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let prop = |name: &str| {
            props
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let (account_name, account_key) = match prop(PROP_ACCOUNT_KEY) {
            Some(key) => (prop(PROP_ACCOUNT_NAME), Some(key)),
            None => (env(ENV_ACCOUNT_NAME), env(ENV_ACCOUNT_KEY)),
        };
        let account_name = account_name.ok_or_else(|| {
            BlobError::config(format!(
                "missing {} (or {} in the environment)",
                PROP_ACCOUNT_NAME, ENV_ACCOUNT_NAME
            ))
        })?;
        let account_key = account_key.ok_or_else(|| {
            BlobError::config(format!(
                "missing {} (or {} in the environment)",
                PROP_ACCOUNT_KEY, ENV_ACCOUNT_KEY
            ))
        })?;
        let container = prop(PROP_CONTAINER)
            .ok_or_else(|| BlobError::config(format!("missing {}", PROP_CONTAINER)))?;

        let mut config = Self::new(account_name, account_key, container);

        if let Some(protocol) = prop(PROP_ENDPOINT_PROTOCOL) {
            config.endpoint_protocol = protocol;
        }
        config.endpoint = prop(PROP_ENDPOINT);
        config.cdn_host = prop(PROP_CDN_HOST);

        let raw_prefix = prop(PROP_PREFIX).unwrap_or_default();
        let mut prefix = normalize_prefix(&raw_prefix);
        if prefix != raw_prefix {
            warn!(
                prefix = %raw_prefix,
                "Prefix should end with '{}', adding it", PREFIX_DELIMITER
            );
        }
        if let Some(namespace) = prop(PROP_NAMESPACE) {
            prefix = normalize_prefix(&format!("{}{}", prefix, namespace));
        }
        config.prefix = prefix;

        config.allow_byte_range = parse_bool(prop(PROP_ALLOW_BYTE_RANGE));
        config.direct_download = parse_bool(prop(PROP_DIRECT_DOWNLOAD));
        if let Some(expire) = prop(PROP_DIRECT_DOWNLOAD_EXPIRE) {
            config.direct_download_expire = Duration::from_secs(parse_number(PROP_DIRECT_DOWNLOAD_EXPIRE, &expire)?);
        }
        if let Some(digest) = prop(PROP_DIGEST) {
            config.digest = digest.parse()?;
        }

        config.caching = if parse_bool(prop(PROP_NO_CACHE)) {
            None
        } else {
            let mut caching = CachingConfig::default();
            if let Some(dir) = prop(PROP_CACHE_DIR) {
                caching.dir = PathBuf::from(dir);
            }
            if let Some(size) = prop(PROP_CACHE_SIZE) {
                caching.max_size = parse_size(&size)?;
            }
            if let Some(count) = prop(PROP_CACHE_COUNT) {
                caching.max_count = parse_number(PROP_CACHE_COUNT, &count)? as usize;
            }
            if let Some(min_age) = prop(PROP_CACHE_MIN_AGE) {
                caching.min_age = Duration::from_secs(parse_number(PROP_CACHE_MIN_AGE, &min_age)?);
            }
            Some(caching)
        };

        Ok(config)
    }

    pub fn with_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_endpoint_protocol<S: Into<String>>(mut self, protocol: S) -> Self {
        self.endpoint_protocol = protocol.into();
        self
    }

    pub fn with_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.prefix = normalize_prefix(prefix.as_ref());
        self
    }

    pub fn with_cdn_host<S: Into<String>>(mut self, host: S) -> Self {
        self.cdn_host = Some(host.into());
        self
    }

    pub fn with_byte_range(mut self, allow: bool) -> Self {
        self.allow_byte_range = allow;
        self
    }

    /// Enable signed direct-download URLs valid for `expire`
    pub fn with_direct_download(mut self, expire: Duration) -> Self {
        self.direct_download = true;
        self.direct_download_expire = expire;
        self
    }

    pub fn with_digest(mut self, digest: DigestAlgorithm) -> Self {
        self.digest = digest;
        self
    }

    pub fn with_caching(mut self, caching: CachingConfig) -> Self {
        self.caching = Some(caching);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.caching = None;
        self
    }
}

fn parse_bool(value: Option<String>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

fn parse_number(name: &str, value: &str) -> BlobResult<u64> {
    value
        .parse::<u64>()
        .map_err(|_| BlobError::config(format!("invalid {}: {}", name, value)))
}

/// Byte size with an optional `KB`/`MB`/`GB` unit, e.g. `100 MB`
fn parse_size(value: &str) -> BlobResult<u64> {
    let upper = value.trim().to_ascii_uppercase();
    let split = upper
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(upper.len());
    let (digits, unit) = upper.split_at(split);
    let multiplier = match unit.trim() {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        _ => return Err(BlobError::config(format!("invalid {}: {}", PROP_CACHE_SIZE, value))),
    };
    parse_number(PROP_CACHE_SIZE, digits)?
        .checked_mul(multiplier)
        .ok_or_else(|| BlobError::config(format!("{} out of range: {}", PROP_CACHE_SIZE, value)))
}
