//! Deterministic digests for cache keys and ETags.

use sha2::{Digest, Sha256};

/// SHA-256 over length-prefixed parts, hex encoded.
///
/// Length prefixes keep `["a:b", "c"]` and `["a", "b:c"]` apart.
pub fn digest_parts<S: AsRef<str>>(parts: &[S]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        let bytes = part.as_ref().as_bytes();
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    hex::encode(hasher.finalize())
}

/// SHA-256 of raw bytes, hex encoded.
pub fn digest_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Lower-case, trim, and collapse internal whitespace.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// First `len` hex chars of a digest; short keys are easier to read in logs.
pub fn short(digest: &str, len: usize) -> &str {
    &digest[..len.min(digest.len())]
}
