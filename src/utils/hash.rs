//! Hash functions for content deduplication.
//!
//! These functions use `FxHasher` from `rustc-hash`, which is optimized for the
//! small keys the assembler deduplicates: encoded type signatures and method bodies.
//!
//! # Usage
//!
//! These functions are primarily used by:
//! - [`crate::assembler::typespec::TypeSpecCache`] for the type-spec cache key
//! - [`crate::assembler::body::BodyFolder`] for body folding buckets
use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

/// Computes a simple hash for blob content (for deduplication detection).
///
/// # Arguments
///
/// * `data` - The blob data to hash
///
/// # Returns
///
/// A 64-bit hash value suitable for deduplication comparisons. Equal inputs
/// always hash equally; callers must still compare the bytes on a hash match.
#[must_use]
pub fn hash_blob(data: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    data.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_blob_consistency() {
        let data = [0x15, 0x12, 0x08, 0x01, 0x08];
        assert_eq!(hash_blob(&data), hash_blob(&data));
    }

    #[test]
    fn test_hash_blob_single_byte_difference() {
        assert_ne!(hash_blob(&[0x1D, 0x08]), hash_blob(&[0x1D, 0x09]));
        assert_ne!(hash_blob(&[]), hash_blob(&[0]));
    }
}
