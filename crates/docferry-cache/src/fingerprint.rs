use std::fmt;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content fingerprint: SHA-256 of the raw bytes, lowercase hex.
///
/// The digest covers the exact bytes that get uploaded; no line-ending or
/// encoding normalization happens first, so the fingerprint matches what the
/// remote store associates with the same content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Fingerprint(hex::encode(hasher.finalize()))
    }

    /// Parse a fingerprint supplied externally (CLI argument, stored state).
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            bail!("not a valid fingerprint (expected 64 hex chars): {:?}", s);
        }
        Ok(Fingerprint(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rebuild from a value this crate previously wrote to storage.
    pub(crate) fn from_storage(raw: String) -> Self {
        Fingerprint(raw)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        let fp = Fingerprint::of(b"hello world");
        assert_eq!(
            fp.as_str(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn deterministic_and_exact() {
        assert_eq!(Fingerprint::of(b"abc"), Fingerprint::of(b"abc"));
        // No normalization: CRLF and LF content are distinct.
        assert_ne!(Fingerprint::of(b"a\r\nb"), Fingerprint::of(b"a\nb"));
    }

    #[test]
    fn parse_accepts_uppercase_rejects_garbage() {
        assert!(Fingerprint::parse("abc").is_err());
        assert!(Fingerprint::parse(&"g".repeat(64)).is_err());
        let upper = "B94D27B9934D3E08A52E52D7DA7DABFAC484EFE37A5380EE9088F7ACE2EFCDE9";
        assert_eq!(Fingerprint::parse(upper).unwrap(), Fingerprint::of(b"hello world"));
    }
}
