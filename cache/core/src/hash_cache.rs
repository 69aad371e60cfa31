//! In-memory hashtable engine.
//!
//! `HashCache` keeps whole entries in a hashtable guarded by a single lock,
//! with lazy TTL expiry on read, insertion-order eviction when over budget,
//! and a flush deadline implementing immediate and delayed `clear`. It is
//! the default engine for the shoal server and the one the integration
//! tests run against.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::cache_trait::{Cache, CitemGuard, ConditionalGet, SetTxn, ValueGuard};
use crate::error::{CacheError, CacheResult};

/// The TTL ceiling (10 years). `exptime = 0` on the wire maps to this.
pub const MAX_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 10);

/// Keys longer than this are refused by write transactions.
const KEY_CEILING: usize = 250;

const DEFAULT_MAX_ITEMS: usize = 1_000_000;
const DEFAULT_DATA_SIZE: usize = 64 * 1024 * 1024;

struct Entry {
    value: Bytes,
    flags: u32,
    expires_at: Instant,
    stored_at: Instant,
    seq: u64,
    /// `(etag, validate_ttl)` for entries written through `begin_cset`.
    cond: Option<(u64, Duration)>,
}

struct Inner {
    map: HashMap<Bytes, Entry, ahash::RandomState>,
    /// Insertion order as `(key, seq)`; stale pairs are skipped at eviction.
    order: VecDeque<(Bytes, u64)>,
    bytes_used: usize,
    clear_deadline: Option<Instant>,
    next_seq: u64,
}

impl Inner {
    fn charge(key: &[u8], value: &[u8]) -> usize {
        key.len() + value.len()
    }

    fn flushed(&self, entry: &Entry, now: Instant) -> bool {
        matches!(self.clear_deadline, Some(d) if now >= d && entry.stored_at <= d)
    }

    fn remove(&mut self, key: &[u8]) -> bool {
        match self.map.remove(key) {
            Some(entry) => {
                self.bytes_used -= Self::charge(key, &entry.value);
                true
            }
            None => false,
        }
    }

    /// Look up a live entry, reaping it if it is expired or flushed.
    fn live_entry(&mut self, key: &[u8], now: Instant) -> Option<&Entry> {
        let dead = match self.map.get(key) {
            Some(entry) => now >= entry.expires_at || self.flushed(entry, now),
            None => return None,
        };
        if dead {
            self.remove(key);
            return None;
        }
        self.map.get(key)
    }

    /// Evict the oldest live insertion. Returns false when nothing is left.
    fn evict_one(&mut self) -> bool {
        while let Some((key, seq)) = self.order.pop_front() {
            if self.map.get(&key).map(|e| e.seq) == Some(seq) {
                self.remove(&key);
                return true;
            }
        }
        false
    }
}

/// Builder for [`HashCache`], mirroring the engine's two sizing knobs:
/// a maximum item count and a total data budget in bytes.
#[derive(Debug, Clone)]
pub struct HashCacheBuilder {
    max_items: usize,
    data_size: usize,
}

impl Default for HashCacheBuilder {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
            data_size: DEFAULT_DATA_SIZE,
        }
    }
}

impl HashCacheBuilder {
    /// Maximum number of items held at once.
    pub fn max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items.max(1);
        self
    }

    /// Total key+value byte budget.
    pub fn data_size(mut self, data_size: usize) -> Self {
        self.data_size = data_size.max(1);
        self
    }

    pub fn build(self) -> HashCache {
        HashCache {
            inner: Mutex::new(Inner {
                map: HashMap::with_hasher(ahash::RandomState::new()),
                order: VecDeque::new(),
                bytes_used: 0,
                clear_deadline: None,
                next_seq: 0,
            }),
            max_items: self.max_items,
            data_size: self.data_size,
        }
    }
}

/// Lock-guarded in-memory cache engine.
pub struct HashCache {
    inner: Mutex<Inner>,
    max_items: usize,
    data_size: usize,
}

impl HashCache {
    pub fn builder() -> HashCacheBuilder {
        HashCacheBuilder::default()
    }

    fn begin(
        &self,
        key: &[u8],
        value_len: usize,
    ) -> CacheResult<Bytes> {
        if key.is_empty() || key.len() > KEY_CEILING {
            return Err(CacheError::KeyTooLong);
        }
        if key.len() + value_len > self.data_size {
            return Err(CacheError::ValueTooLarge);
        }
        Ok(Bytes::copy_from_slice(key))
    }
}

impl Cache for HashCache {
    fn max_ttl(&self) -> Duration {
        MAX_TTL
    }

    fn get(&self, key: &[u8]) -> Option<ValueGuard> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let entry = inner.live_entry(key, now)?;
        Some(ValueGuard::new(
            entry.value.clone(),
            entry.flags,
            entry.expires_at - now,
        ))
    }

    fn get_de(&self, key: &[u8], grace: Duration) -> Option<ValueGuard> {
        let guard = self.get(key)?;
        // Within the grace window the entry is reported missing so the
        // caller repopulates before it actually expires.
        if guard.ttl() <= grace {
            return None;
        }
        Some(guard)
    }

    fn get_conditional(&self, key: &[u8], etag: u64) -> ConditionalGet {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let Some(entry) = inner.live_entry(key, now) else {
            return ConditionalGet::Miss;
        };
        let (stored_etag, validate_ttl) = entry.cond.unwrap_or((0, Duration::ZERO));
        if stored_etag == etag {
            ConditionalGet::NotModified
        } else {
            ConditionalGet::Modified(CitemGuard::new(
                entry.value.clone(),
                stored_etag,
                validate_ttl,
                entry.expires_at - now,
            ))
        }
    }

    fn begin_set(
        &self,
        key: &[u8],
        value_len: usize,
        flags: u32,
        ttl: Duration,
    ) -> CacheResult<SetTxn> {
        let key = self.begin(key, value_len)?;
        Ok(SetTxn::new(key, value_len, flags, ttl.min(MAX_TTL)))
    }

    fn begin_cset(
        &self,
        key: &[u8],
        value_len: usize,
        ttl: Duration,
        etag: u64,
        validate_ttl: Duration,
    ) -> CacheResult<SetTxn> {
        let key = self.begin(key, value_len)?;
        Ok(SetTxn::new_conditional(
            key,
            value_len,
            ttl.min(MAX_TTL),
            etag,
            validate_ttl,
        ))
    }

    fn commit_set(&self, txn: SetTxn) -> CacheResult<()> {
        let (key, value, flags, ttl, cond) = txn.into_parts();
        let value = Bytes::from(value);
        let charge = Inner::charge(&key, &value);
        let now = Instant::now();

        let mut inner = self.inner.lock();
        inner.remove(&key);
        while inner.map.len() >= self.max_items || inner.bytes_used + charge > self.data_size {
            if !inner.evict_one() {
                return Err(CacheError::OutOfCapacity);
            }
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.bytes_used += charge;
        inner.order.push_back((key.clone(), seq));
        inner.map.insert(
            key,
            Entry {
                value,
                flags,
                expires_at: now + ttl.min(MAX_TTL),
                stored_at: now,
                seq,
                cond,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.live_entry(key, now).is_none() {
            return false;
        }
        inner.remove(key)
    }

    fn clear(&self, delay: Duration) {
        let mut inner = self.inner.lock();
        if delay.is_zero() {
            inner.map.clear();
            inner.order.clear();
            inner.bytes_used = 0;
            inner.clear_deadline = None;
        } else {
            inner.clear_deadline = Some(Instant::now() + delay);
        }
    }
}
