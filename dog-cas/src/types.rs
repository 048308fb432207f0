use bytes::Bytes;
use futures_core::Stream;
use std::ops::Range;
use std::pin::Pin;

/// Stream of bytes for blob content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Separator between a key and its byte range annotation: `key;start;end`
pub const BYTE_RANGE_SEPARATOR: char = ';';

/// Byte range for partial reads: a start offset and a length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// Range covering `start..=end`
    pub fn inclusive(start: u64, end: u64) -> Self {
        Self {
            start,
            length: end.saturating_sub(start).saturating_add(1),
        }
    }

    /// Inclusive end offset
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length.saturating_sub(1))
    }

    /// Half-open offsets, clamped to `u64::MAX`
    pub fn as_range(&self) -> Range<u64> {
        self.start..self.start.saturating_add(self.length)
    }

    /// Annotate `key` with this range
    pub fn encode_key(&self, key: &str) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            key,
            self.start,
            self.end(),
            sep = BYTE_RANGE_SEPARATOR
        )
    }

    /// Split a `key;start;end` annotation into the bare key and its range.
    ///
    /// Keys without a well-formed annotation come back unchanged with no range.
    /// An end offset of `u64::MAX` has no exclusive bound and is not a range.
    pub fn split_key(key: &str) -> (&str, Option<ByteRange>) {
        let mut parts = key.rsplitn(3, BYTE_RANGE_SEPARATOR);
        let (Some(end), Some(start), Some(base)) = (parts.next(), parts.next(), parts.next()) else {
            return (key, None);
        };
        let (Ok(start), Ok(end)) = (start.parse::<u64>(), end.parse::<u64>()) else {
            return (key, None);
        };
        if base.is_empty() || end.checked_add(1).is_none() {
            return (key, None);
        }
        match end.checked_sub(start) {
            Some(span) => (base, Some(ByteRange::new(start, span + 1))),
            None => (key, None),
        }
    }
}

/// Result of a lookup that some stores cannot answer
///
/// `Unknown` means "this store has no such representation, fall back to
/// streaming". It never means the blob is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    Missing,
    Unknown,
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            _ => None,
        }
    }
}

/// Blob entry as reported by a store listing, key relative to the store prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListedBlob {
    pub key: String,
    pub size: u64,
}

impl ListedBlob {
    pub fn new<S: Into<String>>(key: S, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
        }
    }
}
