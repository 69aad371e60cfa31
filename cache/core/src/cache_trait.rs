//! The capability trait cache engines implement for the shoal server.

use bytes::Bytes;
use std::time::Duration;

use crate::error::CacheResult;

/// A scoped read of a plain cache entry.
///
/// The guard owns a cheap reference-counted handle to the value; dropping it
/// releases the read on every control-flow edge, so request handlers cannot
/// leak engine resources.
#[derive(Debug, Clone)]
pub struct ValueGuard {
    value: Bytes,
    flags: u32,
    ttl: Duration,
}

impl ValueGuard {
    pub fn new(value: Bytes, flags: u32, ttl: Duration) -> Self {
        Self { value, flags, ttl }
    }

    /// The stored payload.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Consume the guard, keeping the payload.
    pub fn into_value(self) -> Bytes {
        self.value
    }

    /// The opaque 32-bit tag stored with the entry.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Remaining time to live at the moment of the read.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn size(&self) -> usize {
        self.value.len()
    }
}

/// A scoped read of a conditional (etag-carrying) entry.
#[derive(Debug, Clone)]
pub struct CitemGuard {
    value: Bytes,
    etag: u64,
    validate_ttl: Duration,
    ttl: Duration,
}

impl CitemGuard {
    pub fn new(value: Bytes, etag: u64, validate_ttl: Duration, ttl: Duration) -> Self {
        Self {
            value,
            etag,
            validate_ttl,
            ttl,
        }
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn etag(&self) -> u64 {
        self.etag
    }

    pub fn validate_ttl(&self) -> Duration {
        self.validate_ttl
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn size(&self) -> usize {
        self.value.len()
    }
}

/// Outcome of a conditional read against a caller-supplied etag.
#[derive(Debug, Clone)]
pub enum ConditionalGet {
    /// No live entry for the key.
    Miss,
    /// The stored etag matches the caller's; no payload travels.
    NotModified,
    /// The stored etag differs; the full entry is returned.
    Modified(CitemGuard),
}

/// A two-phase write.
///
/// `begin_set`/`begin_cset` size the transaction's buffer to the exact
/// payload length; the caller fills [`value_mut`](SetTxn::value_mut) (e.g.
/// straight from a socket read) and hands the transaction back to
/// [`commit_set`](Cache::commit_set). A transaction dropped before commit
/// leaves the cache untouched.
#[derive(Debug)]
pub struct SetTxn {
    key: Bytes,
    value: Vec<u8>,
    flags: u32,
    ttl: Duration,
    cond: Option<(u64, Duration)>,
}

impl SetTxn {
    pub fn new(key: Bytes, value_len: usize, flags: u32, ttl: Duration) -> Self {
        Self {
            key,
            value: vec![0u8; value_len],
            flags,
            ttl,
            cond: None,
        }
    }

    pub fn new_conditional(
        key: Bytes,
        value_len: usize,
        ttl: Duration,
        etag: u64,
        validate_ttl: Duration,
    ) -> Self {
        Self {
            key,
            value: vec![0u8; value_len],
            flags: 0,
            ttl,
            cond: Some((etag, validate_ttl)),
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The byte-exact payload window to fill before commit.
    pub fn value_mut(&mut self) -> &mut [u8] {
        &mut self.value
    }

    /// Deconstruct into `(key, value, flags, ttl, conditional)`. For engine
    /// implementations.
    pub fn into_parts(self) -> (Bytes, Vec<u8>, u32, Duration, Option<(u64, Duration)>) {
        (self.key, self.value, self.flags, self.ttl, self.cond)
    }
}

/// The narrow capability surface the server depends on.
///
/// Implementations must tolerate concurrent reads, writes and deletes from
/// many connection handlers.
pub trait Cache: Send + Sync + 'static {
    /// The largest TTL the engine supports. Requested TTLs clamp to this.
    fn max_ttl(&self) -> Duration;

    /// Read a live entry.
    fn get(&self, key: &[u8]) -> Option<ValueGuard>;

    /// Read a live entry, treating entries within `grace` of expiration as
    /// missing so the caller can repopulate ahead of the stampede.
    fn get_de(&self, key: &[u8], grace: Duration) -> Option<ValueGuard>;

    /// Conditional read against the caller's etag.
    fn get_conditional(&self, key: &[u8], etag: u64) -> ConditionalGet;

    /// Begin storing a plain entry of exactly `value_len` bytes.
    fn begin_set(
        &self,
        key: &[u8],
        value_len: usize,
        flags: u32,
        ttl: Duration,
    ) -> CacheResult<SetTxn>;

    /// Begin storing a conditional entry.
    fn begin_cset(
        &self,
        key: &[u8],
        value_len: usize,
        ttl: Duration,
        etag: u64,
        validate_ttl: Duration,
    ) -> CacheResult<SetTxn>;

    /// Publish a filled transaction atomically.
    fn commit_set(&self, txn: SetTxn) -> CacheResult<()>;

    /// Remove an entry. Returns whether it existed.
    fn delete(&self, key: &[u8]) -> bool;

    /// Drop every current entry, now (`Duration::ZERO`) or at `delay` from
    /// now. Entries stored after the deadline passes are unaffected.
    fn clear(&self, delay: Duration);
}
