//! # dog-cas: Content-addressable blob storage
//!
//! `dog-cas` stores immutable blobs under content-digest (or caller-supplied)
//! keys in a remote object container, with an optional local cache tier,
//! mark-and-sweep garbage collection and paginated scrolls over a store's
//! namespace.
//!
//! ## Key Features
//!
//! - **Deduplication**: digest keys plus write-once-if-absent uploads, so identical content is stored once
//! - **Azure Blob Storage**: one container shared by several providers through key prefixes
//! - **Server-side copy**: copies within one container never go through the local disk
//! - **Byte ranges**: `key;start;end` keys read only the requested window
//! - **Local cache**: LRU file cache in front of the remote store
//! - **Garbage collection**: mark-and-sweep over the remote listing, with dry runs
//! - **Direct download**: signed URLs, optionally rewritten to a CDN host
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dog_cas::prelude::*;
//! use std::collections::HashMap;
//!
//! # #[tokio::main]
//! # async fn main() -> BlobResult<()> {
//! let mut props = HashMap::new();
//! props.insert("container".to_string(), "blobs".to_string());
//! props.insert("prefix".to_string(), "default".to_string());
//!
//! // account name and key come from AZURE_STORAGE_ACCOUNT / AZURE_STORAGE_ACCESS_KEY
//! let provider = BlobProvider::from_properties("default", &props)?;
//!
//! let stream = futures::stream::once(async {
//!     Ok::<_, std::io::Error>(bytes::Bytes::from_static(b"hello"))
//! });
//! let key = provider.write_blob(Box::pin(stream)).await?;
//!
//! let url = provider.signed_url(&key, UsageHint::Download, None).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │   BlobProvider   │  ← key strategy, signed URLs, GC, scrolls
//! ├──────────────────┤
//! │ CachingBlobStore │  ← optional local file cache
//! ├──────────────────┤
//! │ RemoteBlobStore  │  ← Azure container + prefix
//! └──────────────────┘
//! ```
//!
//! Garbage collection runs against the remote store directly:
//!
//! ```rust,no_run
//! use dog_cas::prelude::*;
//!
//! # async fn collect(provider: &BlobProvider, live: Vec<String>) -> BlobResult<GcStatus> {
//! let gc = provider.garbage_collector()?;
//! let mut pass = gc.compute_to_delete().await?;
//! for key in &live {
//!     pass.mark(key);
//! }
//! gc.remove_unmarked_blobs_and_update_status(pass, true).await
//! # }
//! ```

mod cache;
mod caching;
mod config;
mod error;
mod gc;
mod gc_command;
mod keys;
mod memory;
mod pagination;
mod provider;
mod remote;
mod scroll;
pub mod store;
mod types;
mod write;

pub use cache::{EvictionStats, FileCache};
pub use caching::CachingBlobStore;
pub use config::{
    normalize_prefix, AzureConfig, CachingConfig, ENV_ACCOUNT_KEY, ENV_ACCOUNT_NAME, PREFIX_DELIMITER,
};
pub use error::{BlobError, BlobResult};
pub use gc::{GarbageCollector, GcPass, GcStatus};
pub use gc_command::{
    CommandId, GcCommand, GcCommandRunner, GcCommandState, GcCommandStatus, LiveBlobSource,
};
pub use keys::{DigestAlgorithm, DigestHasher, KeyStrategy, KeyStrategyDigest};
pub use memory::InMemoryBlobStore;
pub use pagination::{BlobListing, KeyPager, ListingStream, DEFAULT_PAGE_SIZE};
pub use provider::{BlobProvider, UsageHint, STORE_SCROLL_NAME};
pub use remote::{RemoteBlobStore, StoreLocation, DEFAULT_SINGLE_PUT_THRESHOLD};
pub use scroll::BlobScroll;
pub use store::{BlobStore, StoreFamily};
pub use types::{ByteRange, ByteStream, ListedBlob, Lookup, BYTE_RANGE_SEPARATOR};
pub use write::{BlobWriteContext, DigestObserver, WriteObserver, WriteSource};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BlobError, BlobListing, BlobProvider, BlobResult, BlobStore, BlobWriteContext, ByteStream,
        GcStatus, KeyStrategy, UsageHint,
    };
}
