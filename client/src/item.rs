//! Cached item types.

use bytes::Bytes;
use std::time::Duration;

/// A plain cache entry.
///
/// Read operations overwrite `value` and `flags` in place;
/// `expiration == Duration::ZERO` on writes means "maximum supported TTL".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    pub key: Bytes,
    pub value: Bytes,
    pub flags: u32,
    pub expiration: Duration,
}

/// A conditional cache entry carrying a caller-supplied version tag.
///
/// `etag` is opaque to the cache; `validate_ttl` is the minimum interval
/// between revalidations even while the entry is still cached. `cget`
/// overwrites `value`, `etag`, `validate_ttl` and `expiration` in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Citem {
    pub key: Bytes,
    pub value: Bytes,
    pub etag: u64,
    pub expiration: Duration,
    pub validate_ttl: Duration,
}
