//! Memcache ASCII wire codec.
//!
//! Implements the classic memcache text protocol (`get`/`gets`/`set`/
//! `delete`/`flush_all`) plus shoal's extensions: conditional get/set
//! (`cget`/`cset`, carrying an etag and a revalidation TTL) and
//! grace-window get (`getde`).
//!
//! The crate is I/O-free: [`Command`] parses a single request line on the
//! server side, [`Request`] encodes commands on the client side, and the
//! [`response`] module covers both response emission and response-line
//! parsing. Framing (CRLF line reads, payload windows) is the transport's
//! job.

mod command;
mod exptime;
mod request;
pub mod response;

pub use command::{Command, ParseError};
pub use exptime::{decode_exptime, encode_exptime, RELATIVE_EXPTIME_LIMIT_SECS};
pub use request::Request;

use bytes::BytesMut;

/// Maximum key length accepted on the wire.
pub const MAX_KEY_LEN: usize = 250;

/// Check a key against the protocol rules: 1..=250 bytes, no space and no
/// CR/LF (any of these would break the line framing).
pub fn key_is_valid(key: &[u8]) -> bool {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return false;
    }
    !key.iter()
        .any(|&b| b == b' ' || b == b'\r' || b == b'\n')
}

/// Append `n` in base-10 ASCII to `buf`.
pub(crate) fn push_decimal(buf: &mut BytesMut, n: u64) {
    if n == 0 {
        buf.extend_from_slice(b"0");
        return;
    }
    let mut digits = [0u8; 20];
    let mut pos = digits.len();
    let mut val = n;
    while val > 0 {
        pos -= 1;
        digits[pos] = b'0' + (val % 10) as u8;
        val /= 10;
    }
    buf.extend_from_slice(&digits[pos..]);
}

/// Parse an unsigned base-10 integer token. No sign, no leading junk.
pub(crate) fn parse_decimal(token: &[u8]) -> Option<u64> {
    if token.is_empty() || token.len() > 20 {
        return None;
    }
    let mut n: u64 = 0;
    for &b in token {
        if !b.is_ascii_digit() {
            return None;
        }
        n = n.checked_mul(10)?.checked_add((b - b'0') as u64)?;
    }
    Some(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_keys() {
        assert!(key_is_valid(b"key"));
        assert!(key_is_valid(b"key_123:v2"));
        assert!(key_is_valid(&[b'k'; MAX_KEY_LEN]));
    }

    #[test]
    fn invalid_keys() {
        assert!(!key_is_valid(b""));
        assert!(!key_is_valid(b"malformed key with spaces"));
        assert!(!key_is_valid(b"malformed\nkey\nwith\nnewlines"));
        assert!(!key_is_valid(b"cr\rkey"));
        assert!(!key_is_valid(&[b'k'; MAX_KEY_LEN + 1]));
    }

    #[test]
    fn decimal_round_trip() {
        for n in [0u64, 1, 9, 10, 12345, u64::MAX] {
            let mut buf = BytesMut::new();
            push_decimal(&mut buf, n);
            assert_eq!(parse_decimal(&buf), Some(n));
        }
    }

    #[test]
    fn decimal_rejects_garbage() {
        assert_eq!(parse_decimal(b""), None);
        assert_eq!(parse_decimal(b"-1"), None);
        assert_eq!(parse_decimal(b"12a"), None);
        assert_eq!(parse_decimal(b"99999999999999999999999"), None);
    }
}
