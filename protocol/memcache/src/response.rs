//! Response frames: emission helpers for the server, line parsers for the
//! client.
//!
//! Hit streams are `VALUE` headers each followed by a byte-exact payload and
//! CRLF, terminated by `END`. Write acknowledgements are single lines.

use bytes::{Bytes, BytesMut};

use crate::{parse_decimal, push_decimal};

pub const END: &[u8] = b"END\r\n";
pub const STORED: &[u8] = b"STORED\r\n";
pub const NOT_STORED: &[u8] = b"NOT_STORED\r\n";
pub const DELETED: &[u8] = b"DELETED\r\n";
pub const NOT_FOUND: &[u8] = b"NOT_FOUND\r\n";
pub const NOT_MODIFIED: &[u8] = b"NOT_MODIFIED\r\n";
pub const OK: &[u8] = b"OK\r\n";
pub const ERROR: &[u8] = b"ERROR\r\n";

/// Append a `VALUE <key> <flags> <size>` header line.
pub fn put_value_header(buf: &mut BytesMut, key: &[u8], flags: u32, size: usize) {
    buf.extend_from_slice(b"VALUE ");
    buf.extend_from_slice(key);
    buf.extend_from_slice(b" ");
    push_decimal(buf, u64::from(flags));
    buf.extend_from_slice(b" ");
    push_decimal(buf, size as u64);
    buf.extend_from_slice(b"\r\n");
}

/// Append a conditional-get header line:
/// `VALUE <key> <etag> <validate_ttl_ms> <expiration_secs> <size>`.
pub fn put_cvalue_header(
    buf: &mut BytesMut,
    key: &[u8],
    etag: u64,
    validate_ttl_ms: u64,
    expiration_secs: u64,
    size: usize,
) {
    buf.extend_from_slice(b"VALUE ");
    buf.extend_from_slice(key);
    buf.extend_from_slice(b" ");
    push_decimal(buf, etag);
    buf.extend_from_slice(b" ");
    push_decimal(buf, validate_ttl_ms);
    buf.extend_from_slice(b" ");
    push_decimal(buf, expiration_secs);
    buf.extend_from_slice(b" ");
    push_decimal(buf, size as u64);
    buf.extend_from_slice(b"\r\n");
}

/// Append a `CLIENT_ERROR <text>` line.
pub fn put_client_error(buf: &mut BytesMut, text: &str) {
    buf.extend_from_slice(b"CLIENT_ERROR ");
    buf.extend_from_slice(text.as_bytes());
    buf.extend_from_slice(b"\r\n");
}

/// Append a `SERVER_ERROR <text>` line.
pub fn put_server_error(buf: &mut BytesMut, text: &str) {
    buf.extend_from_slice(b"SERVER_ERROR ");
    buf.extend_from_slice(text.as_bytes());
    buf.extend_from_slice(b"\r\n");
}

/// A parsed `VALUE` header from a `get`/`gets`/`getde` stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueHeader {
    pub key: Bytes,
    pub flags: u32,
    pub size: usize,
}

/// A parsed `VALUE` header from a `cget` stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CvalueHeader {
    pub key: Bytes,
    pub etag: u64,
    pub validate_ttl_ms: u64,
    pub expiration_secs: u64,
    pub size: usize,
}

/// One line of a `get` response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetLine {
    Value(ValueHeader),
    End,
}

/// One line of a `cget` response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CgetLine {
    Value(CvalueHeader),
    NotModified,
    End,
}

/// A single-line write acknowledgement or error frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Stored,
    NotStored,
    Deleted,
    NotFound,
    Ok,
    /// `ERROR` — the server did not recognize what we sent.
    Error,
    ClientError(String),
    ServerError(String),
}

/// Error for a response line that matches no expected shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadResponse;

impl std::fmt::Display for BadResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unparseable response line")
    }
}

impl std::error::Error for BadResponse {}

/// Parse one CRLF-stripped line of a `get` response stream.
pub fn parse_get_line(line: &[u8]) -> Result<GetLine, BadResponse> {
    if line == b"END" {
        return Ok(GetLine::End);
    }
    let rest = line.strip_prefix(b"VALUE ").ok_or(BadResponse)?;
    let mut it = rest.split(|&b| b == b' ').filter(|t| !t.is_empty());
    let key = it.next().ok_or(BadResponse)?;
    let flags = int_field(&mut it)?;
    if flags > u64::from(u32::MAX) {
        return Err(BadResponse);
    }
    let size = int_field(&mut it)? as usize;
    // A trailing cas token is tolerated and ignored.
    match (it.next(), it.next()) {
        (None, _) => {}
        (Some(cas), None) if parse_decimal(cas).is_some() => {}
        _ => return Err(BadResponse),
    }
    Ok(GetLine::Value(ValueHeader {
        key: Bytes::copy_from_slice(key),
        flags: flags as u32,
        size,
    }))
}

/// Parse one CRLF-stripped line of a `cget` response stream.
pub fn parse_cget_line(line: &[u8]) -> Result<CgetLine, BadResponse> {
    if line == b"END" {
        return Ok(CgetLine::End);
    }
    if line == b"NOT_MODIFIED" {
        return Ok(CgetLine::NotModified);
    }
    let rest = line.strip_prefix(b"VALUE ").ok_or(BadResponse)?;
    let mut it = rest.split(|&b| b == b' ').filter(|t| !t.is_empty());
    let key = it.next().ok_or(BadResponse)?;
    let etag = int_field(&mut it)?;
    let validate_ttl_ms = int_field(&mut it)?;
    let expiration_secs = int_field(&mut it)?;
    let size = int_field(&mut it)? as usize;
    if it.next().is_some() {
        return Err(BadResponse);
    }
    Ok(CgetLine::Value(CvalueHeader {
        key: Bytes::copy_from_slice(key),
        etag,
        validate_ttl_ms,
        expiration_secs,
        size,
    }))
}

/// Parse a single-line acknowledgement or error frame.
pub fn parse_reply(line: &[u8]) -> Result<Reply, BadResponse> {
    match line {
        b"STORED" => Ok(Reply::Stored),
        b"NOT_STORED" => Ok(Reply::NotStored),
        b"DELETED" => Ok(Reply::Deleted),
        b"NOT_FOUND" => Ok(Reply::NotFound),
        b"OK" => Ok(Reply::Ok),
        b"ERROR" => Ok(Reply::Error),
        _ => parse_error_line(line).ok_or(BadResponse),
    }
}

/// Recognize `ERROR`/`CLIENT_ERROR`/`SERVER_ERROR` lines. Used by readers of
/// multi-line streams, where an error frame can substitute for the whole
/// response.
pub fn parse_error_line(line: &[u8]) -> Option<Reply> {
    if line == b"ERROR" {
        return Some(Reply::Error);
    }
    if let Some(text) = line.strip_prefix(b"CLIENT_ERROR ") {
        return Some(Reply::ClientError(
            String::from_utf8_lossy(text).into_owned(),
        ));
    }
    if let Some(text) = line.strip_prefix(b"SERVER_ERROR ") {
        return Some(Reply::ServerError(
            String::from_utf8_lossy(text).into_owned(),
        ));
    }
    None
}

fn int_field<'a, I>(it: &mut I) -> Result<u64, BadResponse>
where
    I: Iterator<Item = &'a [u8]>,
{
    it.next().and_then(parse_decimal).ok_or(BadResponse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_header_round_trip() {
        let mut buf = BytesMut::new();
        put_value_header(&mut buf, b"key", 12345, 5);
        assert_eq!(&buf[..], b"VALUE key 12345 5\r\n");
        let parsed = parse_get_line(&buf[..buf.len() - 2]).unwrap();
        assert_eq!(
            parsed,
            GetLine::Value(ValueHeader {
                key: Bytes::from_static(b"key"),
                flags: 12345,
                size: 5,
            })
        );
    }

    #[test]
    fn value_header_with_cas_token() {
        let parsed = parse_get_line(b"VALUE key 0 5 0").unwrap();
        assert!(matches!(parsed, GetLine::Value(h) if h.size == 5));
    }

    #[test]
    fn get_line_end() {
        assert_eq!(parse_get_line(b"END").unwrap(), GetLine::End);
    }

    #[test]
    fn get_line_garbage() {
        assert!(parse_get_line(b"VALUES key 0 5").is_err());
        assert!(parse_get_line(b"VALUE key x 5").is_err());
        assert!(parse_get_line(b"VALUE key 0 5 0 extra").is_err());
    }

    #[test]
    fn cvalue_header_round_trip() {
        let mut buf = BytesMut::new();
        put_cvalue_header(&mut buf, b"key", 1234567890, 98765432, 443343600, 5);
        assert_eq!(&buf[..], b"VALUE key 1234567890 98765432 443343600 5\r\n");
        let parsed = parse_cget_line(&buf[..buf.len() - 2]).unwrap();
        assert_eq!(
            parsed,
            CgetLine::Value(CvalueHeader {
                key: Bytes::from_static(b"key"),
                etag: 1234567890,
                validate_ttl_ms: 98765432,
                expiration_secs: 443343600,
                size: 5,
            })
        );
    }

    #[test]
    fn cget_line_terminal_frames() {
        assert_eq!(parse_cget_line(b"END").unwrap(), CgetLine::End);
        assert_eq!(
            parse_cget_line(b"NOT_MODIFIED").unwrap(),
            CgetLine::NotModified
        );
    }

    #[test]
    fn replies() {
        assert_eq!(parse_reply(b"STORED").unwrap(), Reply::Stored);
        assert_eq!(parse_reply(b"NOT_STORED").unwrap(), Reply::NotStored);
        assert_eq!(parse_reply(b"DELETED").unwrap(), Reply::Deleted);
        assert_eq!(parse_reply(b"NOT_FOUND").unwrap(), Reply::NotFound);
        assert_eq!(parse_reply(b"OK").unwrap(), Reply::Ok);
        assert_eq!(parse_reply(b"ERROR").unwrap(), Reply::Error);
        assert_eq!(
            parse_reply(b"CLIENT_ERROR bad data chunk").unwrap(),
            Reply::ClientError("bad data chunk".to_string())
        );
        assert_eq!(
            parse_reply(b"SERVER_ERROR out of memory").unwrap(),
            Reply::ServerError("out of memory".to_string())
        );
        assert!(parse_reply(b"BANANA").is_err());
    }

    #[test]
    fn error_helpers() {
        let mut buf = BytesMut::new();
        put_client_error(&mut buf, "bad data chunk");
        put_server_error(&mut buf, "cannot start transaction");
        assert_eq!(
            &buf[..],
            b"CLIENT_ERROR bad data chunk\r\nSERVER_ERROR cannot start transaction\r\n" as &[u8]
        );
    }
}
