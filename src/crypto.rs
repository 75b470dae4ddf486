// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Cryptographic hash function.
//!
//! This module abstracts the specific cryptographic hash function used to
//! derive identifiers throughout the library. Currently, SHA-256 is used.

use sha2::{Digest, Sha256};

/// Regular 256-bit hash.
pub type Hash = [u8; 32];

/// Hashes all the given data slices together using SHA-256.
///
/// Each slice is prefixed with its length, so that different splits of the
/// same bytes produce different digests.
#[must_use]
pub fn hash_all(data: &[&[u8]]) -> Hash {
    let mut hasher = Sha256::new();
    for item in data {
        hasher.update((item.len() as u64).to_be_bytes());
        hasher.update(item);
    }
    hasher.finalize().into()
}

/// Truncates the given hash into a `u64`, taking the first 8 bytes big-endian.
#[must_use]
pub fn truncate_u64(hash: &Hash) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&hash[..8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_sensitive() {
        assert_ne!(hash_all(&[b"ab", b"c"]), hash_all(&[b"a", b"bc"]));
        assert_eq!(hash_all(&[b"ab", b"c"]), hash_all(&[b"ab", b"c"]));
    }

    #[test]
    fn truncation() {
        let h = hash_all(&[b"arbor"]);
        assert_eq!(truncate_u64(&h).to_be_bytes(), h[..8]);
    }
}
