//! Mapping from remote URLs to filesystem-safe cache keys.
//!
//! Query strings and fragments are dropped before anything else, so the same
//! image requested with different cache-busting parameters lands on one
//! cache entry.

use sha2::{Digest, Sha256};

/// Extension appended to every cache key.
pub const CACHE_FILE_EXT: &str = ".img";

/// Character substituted for anything that is not ASCII alphanumeric.
const SUBSTITUTE: char = '_';

/// Longest readable prefix kept before the digest.
const MAX_READABLE_LEN: usize = 100;

/// Hex digits of the URL digest appended to every key.
const DIGEST_HEX_LEN: usize = 16;

/// The URL with its query string and fragment removed.
///
/// This is the identity the cache index is keyed on.
pub fn source_key(url: &str) -> &str {
    match url.find(['?', '#']) {
        Some(pos) => &url[..pos],
        None => url,
    }
}

/// Derive the on-disk file name for `url`.
///
/// A readable sanitized prefix followed by a digest of the source key.
/// Substitution alone is lossy (`a-b.jpg` and `a_b.jpg` sanitize alike), so
/// the digest is what keeps distinct sources on distinct files.
pub fn canonicalize(url: &str) -> String {
    let base = source_key(url);
    let mut key: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { SUBSTITUTE })
        .collect();
    key.truncate(MAX_READABLE_LEN);

    let digest = hex::encode(Sha256::digest(base.as_bytes()));
    key.push(SUBSTITUTE);
    key.push_str(&digest[..DIGEST_HEX_LEN]);
    key.push_str(CACHE_FILE_EXT);
    key
}
