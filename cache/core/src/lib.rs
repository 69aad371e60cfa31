//! Cache-engine capability surface for the shoal server.
//!
//! The server depends only on the narrow [`Cache`] trait: scoped read
//! guards, two-phase write transactions, delete and (possibly delayed)
//! clear. [`HashCache`] is the in-workspace engine behind that trait; any
//! other engine satisfying the same contract can be dropped in.

mod cache_trait;
mod error;
mod hash_cache;

pub use cache_trait::{Cache, CitemGuard, ConditionalGet, SetTxn, ValueGuard};
pub use error::{CacheError, CacheResult};
pub use hash_cache::{HashCache, HashCacheBuilder, MAX_TTL};
