//! Output comparison.

use sha2::{Digest, Sha256};

use super::Comparator;
use crate::domain::Comparison;

/// Byte-exact comparison by SHA-256 digest.
///
/// Fuzzy image diffing belongs to an external comparator; this one is enough
/// for deterministic backends and for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactComparator;

impl ExactComparator {
    pub fn digest(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }
}

impl Comparator for ExactComparator {
    fn compare(&self, expected: &[u8], actual: &[u8]) -> Comparison {
        if Self::digest(expected) == Self::digest(actual) {
            Comparison::Match
        } else {
            Comparison::Mismatch
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_comparison() {
        let comparator = ExactComparator;
        assert_eq!(comparator.compare(b"image", b"image"), Comparison::Match);
        assert_eq!(comparator.compare(b"image", b"imagf"), Comparison::Mismatch);
        assert_eq!(comparator.compare(b"", b""), Comparison::Match);
    }

    #[test]
    fn test_digest_is_hex_sha256() {
        assert_eq!(
            ExactComparator::digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
