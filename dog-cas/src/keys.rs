use md5::Md5;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::write::{DigestObserver, WriteObserver};
use crate::{BlobError, BlobResult, BYTE_RANGE_SEPARATOR};

/// Hash algorithm used to derive digest keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    /// Length of the lowercase hex digest
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha256 => 64,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Sha256 => "SHA-256",
        }
    }

    pub fn hasher(&self) -> DigestHasher {
        match self {
            Self::Md5 => DigestHasher::Md5(Md5::new()),
            Self::Sha256 => DigestHasher::Sha256(Sha256::new()),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = BlobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MD5" => Ok(Self::Md5),
            "SHA-256" | "SHA256" => Ok(Self::Sha256),
            other => Err(BlobError::config(format!("Unsupported digest algorithm: {}", other))),
        }
    }
}

/// Incremental hasher for one of the supported algorithms
pub enum DigestHasher {
    Md5(Md5),
    Sha256(Sha256),
}

impl DigestHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    /// Lowercase hex digest
    pub fn finalize_hex(self) -> String {
        match self {
            Self::Md5(h) => hex::encode(h.finalize()),
            Self::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Content-digest keys: identical content always yields the identical key
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyStrategyDigest {
    pub algorithm: DigestAlgorithm,
}

impl KeyStrategyDigest {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn md5() -> Self {
        Self::new(DigestAlgorithm::Md5)
    }

    /// Whether `s` has the shape of a key this strategy would generate.
    ///
    /// The garbage collector only ever considers keys passing this check.
    pub fn is_valid_digest(&self, s: &str) -> bool {
        s.len() == self.algorithm.hex_len()
            && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }

    /// Digest of an in-memory buffer
    pub fn digest(&self, data: &[u8]) -> String {
        let mut hasher = self.algorithm.hasher();
        hasher.update(data);
        hasher.finalize_hex()
    }
}

/// How object keys are derived for a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Key is the digest of the content (deduplicating)
    Digest(KeyStrategyDigest),
    /// Key is supplied by the caller
    Opaque,
}

impl Default for KeyStrategy {
    fn default() -> Self {
        Self::Digest(KeyStrategyDigest::default())
    }
}

impl KeyStrategy {
    pub fn digest(algorithm: DigestAlgorithm) -> Self {
        Self::Digest(KeyStrategyDigest::new(algorithm))
    }

    pub fn use_deduplication(&self) -> bool {
        matches!(self, Self::Digest(_))
    }

    pub fn as_digest(&self) -> Option<&KeyStrategyDigest> {
        match self {
            Self::Digest(digest) => Some(digest),
            Self::Opaque => None,
        }
    }

    /// Observer that computes the key while the content is written, if any
    pub fn write_observer(&self) -> Option<Box<dyn WriteObserver>> {
        match self {
            Self::Digest(digest) => Some(Box::new(DigestObserver::new(digest.algorithm))),
            Self::Opaque => None,
        }
    }

    /// Validate a key before it is used to address a store
    pub fn validate_key(&self, key: &str) -> BlobResult<()> {
        match self {
            Self::Digest(digest) if !digest.is_valid_digest(key) => Err(BlobError::invalid(format!(
                "Key {:?} is not a valid {} digest",
                key, digest.algorithm
            ))),
            Self::Digest(_) => Ok(()),
            Self::Opaque => {
                if key.is_empty() || key.contains('/') || key.contains(BYTE_RANGE_SEPARATOR) {
                    Err(BlobError::invalid(format!("Invalid opaque key: {:?}", key)))
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOO_MD5: &str = "acbd18db4cc2f85cedef654fccc4a4d8";

    #[test]
    fn test_md5_digest() {
        let keys = KeyStrategyDigest::md5();
        assert_eq!(keys.digest(b"foo"), FOO_MD5);
        assert!(keys.is_valid_digest(FOO_MD5));
    }

    #[test]
    fn test_sha256_digest() {
        let keys = KeyStrategyDigest::new(DigestAlgorithm::Sha256);
        let digest = keys.digest(b"foo");
        assert_eq!(
            digest,
            "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae"
        );
        assert!(keys.is_valid_digest(&digest));
        assert!(!keys.is_valid_digest(FOO_MD5));
    }

    #[test]
    fn test_invalid_digests() {
        let keys = KeyStrategyDigest::md5();
        assert!(!keys.is_valid_digest(""));
        assert!(!keys.is_valid_digest("acbd18db4cc2f85cedef654fccc4a4d"));
        assert!(!keys.is_valid_digest("ACBD18DB4CC2F85CEDEF654FCCC4A4D8"));
        assert!(!keys.is_valid_digest("zcbd18db4cc2f85cedef654fccc4a4d8"));
        assert!(!keys.is_valid_digest("subfolder/acbd18db4cc2f85cedef65"));
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!("md5".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Md5);
        assert_eq!("SHA-256".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Sha256);
        assert!("crc32".parse::<DigestAlgorithm>().is_err());
    }

    #[test]
    fn test_validate_key() {
        let digest = KeyStrategy::default();
        assert!(digest.validate_key(FOO_MD5).is_ok());
        assert!(digest.validate_key("id1").is_err());

        let opaque = KeyStrategy::Opaque;
        assert!(opaque.validate_key("id1").is_ok());
        assert!(opaque.validate_key("").is_err());
        assert!(opaque.validate_key("a/b").is_err());
        assert!(opaque.validate_key("a;1;2").is_err());
        assert!(!opaque.use_deduplication());
        assert!(opaque.write_observer().is_none());
    }
}
