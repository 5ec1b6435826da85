//! Content fingerprints used to pre-filter schema equality checks

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// 128-bit fingerprint of raw schema bytes.
///
/// This is the leading half of a SHA-256 digest. Two different schemas may
/// share a fingerprint, so it is only ever a filter; callers compare the
/// full bytes before declaring a match. Persisted as 32 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Fingerprint(u128);

impl Fingerprint {
    /// Compute the fingerprint of raw bytes
    pub fn from_bytes(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut head = [0u8; 16];
        head.copy_from_slice(&digest[..16]);
        Self(u128::from_be_bytes(head))
    }

    /// Wrap an existing raw value
    pub const fn from_raw(value: u128) -> Self {
        Self(value)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.to_string()
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = std::num::ParseIntError;

    fn try_from(hex: String) -> Result<Self, Self::Error> {
        u128::from_str_radix(&hex, 16).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_consistency() {
        let content = br#"{"type": "record", "name": "User"}"#;
        assert_eq!(Fingerprint::from_bytes(content), Fingerprint::from_bytes(content));
    }

    #[test]
    fn test_fingerprint_different_content() {
        let a = Fingerprint::from_bytes(b"schema-a");
        let b = Fingerprint::from_bytes(b"schema-b");
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_display_is_fixed_width() {
        let fp = Fingerprint::from_raw(0xab);
        assert_eq!(fp.to_string().len(), 32);
        assert!(fp.to_string().ends_with("ab"));
        assert_eq!(fp.as_u128(), 0xab);
    }

    #[test]
    fn test_fingerprint_serializes_as_hex() {
        let fp = Fingerprint::from_bytes(b"payload");
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{}\"", fp));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }
}
