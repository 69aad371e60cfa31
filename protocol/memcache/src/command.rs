//! Server-side request parsing.
//!
//! A [`Command`] is parsed from one request line with the trailing CRLF
//! already stripped. Store commands (`set`/`cset`) are followed on the wire
//! by a payload of exactly `size` bytes plus CRLF; reading that window is
//! the connection's job.

use bytes::Bytes;

use crate::parse_decimal;

/// One parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `get`/`gets` with one or more keys.
    Get { keys: Vec<Bytes> },
    /// `set <key> <flags> <exptime> <size> [noreply]`
    Set {
        key: Bytes,
        flags: u32,
        exptime: u64,
        size: usize,
        noreply: bool,
    },
    /// `cget <key> <etag>` — conditional get against the caller's etag.
    Cget { key: Bytes, etag: u64 },
    /// `cset <key> <etag> <exptime> <validate_ttl_ms> <size> [noreply]`
    Cset {
        key: Bytes,
        etag: u64,
        exptime: u64,
        validate_ttl_ms: u64,
        size: usize,
        noreply: bool,
    },
    /// `getde <key> <grace_ms>` — get with a dogpile grace window.
    GetDe { key: Bytes, grace_ms: u64 },
    /// `delete <key> [noreply]`
    Delete { key: Bytes, noreply: bool },
    /// `flush_all [<delay_secs>] [noreply]`
    FlushAll { delay_secs: u64, noreply: bool },
}

/// Why a request line failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// The verb is not recognized. Answered with `ERROR`; closes the
    /// connection.
    UnknownCommand,
    /// Arguments are malformed but no payload follows, so the stream is
    /// still framed. Answered with `CLIENT_ERROR`; connection stays open.
    BadArguments(&'static str),
    /// A store header is malformed: the payload window is unknowable and
    /// the connection cannot be re-synchronized.
    BadStoreHeader(&'static str),
}

impl ParseError {
    /// Human-readable detail carried in `CLIENT_ERROR` frames.
    pub fn message(&self) -> &'static str {
        match self {
            ParseError::UnknownCommand => "unknown command",
            ParseError::BadArguments(msg) | ParseError::BadStoreHeader(msg) => msg,
        }
    }
}

fn tokens(line: &[u8]) -> impl Iterator<Item = &[u8]> {
    line.split(|&b| b == b' ').filter(|t| !t.is_empty())
}

impl Command {
    /// Parse one CRLF-stripped request line.
    pub fn parse(line: &[u8]) -> Result<Command, ParseError> {
        let mut it = tokens(line);
        let verb = it.next().ok_or(ParseError::UnknownCommand)?;
        match verb {
            b"get" | b"gets" => parse_get(it),
            b"set" => parse_set(it),
            b"cget" => parse_cget(it),
            b"cset" => parse_cset(it),
            b"getde" => parse_getde(it),
            b"delete" => parse_delete(it),
            b"flush_all" => parse_flush_all(it),
            _ => Err(ParseError::UnknownCommand),
        }
    }
}

fn parse_get<'a>(it: impl Iterator<Item = &'a [u8]>) -> Result<Command, ParseError> {
    let keys: Vec<Bytes> = it.map(Bytes::copy_from_slice).collect();
    if keys.is_empty() {
        return Err(ParseError::BadArguments("'get' needs at least one key"));
    }
    Ok(Command::Get { keys })
}

fn parse_set<'a>(mut it: impl Iterator<Item = &'a [u8]>) -> Result<Command, ParseError> {
    let key = store_token(&mut it, "missing key in 'set'")?;
    let flags = store_int(&mut it, "bad flags in 'set'")?;
    if flags > u64::from(u32::MAX) {
        return Err(ParseError::BadStoreHeader("bad flags in 'set'"));
    }
    let exptime = store_int(&mut it, "bad exptime in 'set'")?;
    let size = store_int(&mut it, "bad size in 'set'")? as usize;
    let noreply = store_noreply(&mut it, "unrecognized trailing token in 'set'")?;
    Ok(Command::Set {
        key,
        flags: flags as u32,
        exptime,
        size,
        noreply,
    })
}

fn parse_cset<'a>(mut it: impl Iterator<Item = &'a [u8]>) -> Result<Command, ParseError> {
    let key = store_token(&mut it, "missing key in 'cset'")?;
    let etag = store_int(&mut it, "bad etag in 'cset'")?;
    let exptime = store_int(&mut it, "bad exptime in 'cset'")?;
    let validate_ttl_ms = store_int(&mut it, "bad validate ttl in 'cset'")?;
    let size = store_int(&mut it, "bad size in 'cset'")? as usize;
    let noreply = store_noreply(&mut it, "unrecognized trailing token in 'cset'")?;
    Ok(Command::Cset {
        key,
        etag,
        exptime,
        validate_ttl_ms,
        size,
        noreply,
    })
}

fn parse_cget<'a>(mut it: impl Iterator<Item = &'a [u8]>) -> Result<Command, ParseError> {
    let key = arg_token(&mut it, "missing key in 'cget'")?;
    let etag = arg_int(&mut it, "bad etag in 'cget'")?;
    arg_end(&mut it, "trailing bytes after 'cget'")?;
    Ok(Command::Cget { key, etag })
}

fn parse_getde<'a>(mut it: impl Iterator<Item = &'a [u8]>) -> Result<Command, ParseError> {
    let key = arg_token(&mut it, "missing key in 'getde'")?;
    let grace_ms = arg_int(&mut it, "bad grace in 'getde'")?;
    arg_end(&mut it, "trailing bytes after 'getde'")?;
    Ok(Command::GetDe { key, grace_ms })
}

fn parse_delete<'a>(mut it: impl Iterator<Item = &'a [u8]>) -> Result<Command, ParseError> {
    let key = arg_token(&mut it, "missing key in 'delete'")?;
    let noreply = arg_noreply(&mut it, "unrecognized trailing token in 'delete'")?;
    Ok(Command::Delete { key, noreply })
}

fn parse_flush_all<'a>(mut it: impl Iterator<Item = &'a [u8]>) -> Result<Command, ParseError> {
    let (delay_secs, noreply) = match it.next() {
        None => (0, false),
        Some(b"noreply") => (0, true),
        Some(tok) => {
            let delay = parse_decimal(tok)
                .ok_or(ParseError::BadArguments("bad delay in 'flush_all'"))?;
            let noreply =
                arg_noreply(&mut it, "unrecognized trailing token in 'flush_all'")?;
            (delay, noreply)
        }
    };
    arg_end(&mut it, "trailing bytes after 'flush_all'")?;
    Ok(Command::FlushAll { delay_secs, noreply })
}

// Argument helpers. The `store_*` variants report `BadStoreHeader` because a
// payload follows the line and the stream cannot be re-framed; the `arg_*`
// variants report the recoverable `BadArguments`.

fn arg_token<'a, I>(it: &mut I, msg: &'static str) -> Result<Bytes, ParseError>
where
    I: Iterator<Item = &'a [u8]>,
{
    it.next()
        .map(Bytes::copy_from_slice)
        .ok_or(ParseError::BadArguments(msg))
}

fn arg_int<'a, I>(it: &mut I, msg: &'static str) -> Result<u64, ParseError>
where
    I: Iterator<Item = &'a [u8]>,
{
    it.next()
        .and_then(parse_decimal)
        .ok_or(ParseError::BadArguments(msg))
}

fn arg_noreply<'a, I>(it: &mut I, msg: &'static str) -> Result<bool, ParseError>
where
    I: Iterator<Item = &'a [u8]>,
{
    match it.next() {
        None => Ok(false),
        Some(b"noreply") => {
            arg_end(it, msg)?;
            Ok(true)
        }
        Some(_) => Err(ParseError::BadArguments(msg)),
    }
}

fn arg_end<'a, I>(it: &mut I, msg: &'static str) -> Result<(), ParseError>
where
    I: Iterator<Item = &'a [u8]>,
{
    match it.next() {
        None => Ok(()),
        Some(_) => Err(ParseError::BadArguments(msg)),
    }
}

fn store_token<'a, I>(it: &mut I, msg: &'static str) -> Result<Bytes, ParseError>
where
    I: Iterator<Item = &'a [u8]>,
{
    it.next()
        .map(Bytes::copy_from_slice)
        .ok_or(ParseError::BadStoreHeader(msg))
}

fn store_int<'a, I>(it: &mut I, msg: &'static str) -> Result<u64, ParseError>
where
    I: Iterator<Item = &'a [u8]>,
{
    it.next()
        .and_then(parse_decimal)
        .ok_or(ParseError::BadStoreHeader(msg))
}

fn store_noreply<'a, I>(it: &mut I, msg: &'static str) -> Result<bool, ParseError>
where
    I: Iterator<Item = &'a [u8]>,
{
    match it.next() {
        None => Ok(false),
        Some(b"noreply") => match it.next() {
            None => Ok(true),
            Some(_) => Err(ParseError::BadStoreHeader(msg)),
        },
        Some(_) => Err(ParseError::BadStoreHeader(msg)),
    }
}
