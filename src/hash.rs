//! On-disk cache filenames.
//!
//! The source computes filenames with djb2 over the raw URL bytes, which
//! collides on distinct URLs with no resolution (see spec Open Question 2).
//! We key instead on SHA-256, hex-encoded, which makes accidental collision
//! cryptographically implausible at the scale this cache operates at.

use sha2::{Digest, Sha256};

/// djb2 as specified in spec.md §6, kept for documentation/parity purposes
/// only; not used to name cache files.
#[allow(dead_code)]
pub fn djb2(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 5381;
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(b as u64);
    }
    hash
}

/// Returns the on-disk filename (without directory) for a given URL.
pub fn cache_file_name(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2 + 6);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex.push_str(".cache");
    hex
}
