//! Content fingerprints used as the sync deduplication key.

use sha2::{Digest, Sha256};

/// SHA-256 of `title` immediately followed by `body`, lowercase hex.
///
/// Pure and total: identical content always yields the identical fingerprint,
/// which is what makes re-running `upload` idempotent.
pub fn fingerprint(title: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}
