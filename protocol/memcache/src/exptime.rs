//! Expiration encoding shared by both ends of the wire.
//!
//! The `exptime` field of store commands is a single unsigned integer with
//! three ranges:
//!
//! - `0` — the maximum TTL the cache engine supports;
//! - `1..=30 days` — a relative duration in seconds;
//! - above that — an absolute Unix timestamp in seconds.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Largest exptime value interpreted as a relative duration (30 days in
/// seconds). Anything above is an absolute Unix timestamp.
pub const RELATIVE_EXPTIME_LIMIT_SECS: u64 = 30 * 24 * 3600;

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Encode an expiration for the wire. `Duration::ZERO` means "maximum TTL"
/// and encodes as 0; durations beyond 30 days become absolute timestamps.
///
/// A non-zero sub-second duration rounds up to one second rather than
/// collapsing into the max-TTL sentinel.
pub fn encode_exptime(expiration: Duration) -> u64 {
    if expiration == Duration::ZERO {
        return 0;
    }
    let secs = expiration.as_secs().max(1);
    if secs > RELATIVE_EXPTIME_LIMIT_SECS {
        unix_now_secs().saturating_add(secs)
    } else {
        secs
    }
}

/// Decode a wire exptime into a TTL. `max_ttl` is the engine ceiling
/// substituted for the 0 sentinel. An absolute timestamp in the past
/// decodes to `Duration::ZERO` (expires immediately).
pub fn decode_exptime(exptime: u64, max_ttl: Duration) -> Duration {
    if exptime == 0 {
        max_ttl
    } else if exptime > RELATIVE_EXPTIME_LIMIT_SECS {
        Duration::from_secs(exptime.saturating_sub(unix_now_secs()))
    } else {
        Duration::from_secs(exptime)
    }
}
