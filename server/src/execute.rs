//! Command execution: bridges parsed commands to cache operations and
//! response frames.

use bytes::BytesMut;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use shoal_cache::{Cache, CacheError, ConditionalGet};
use shoal_protocol::response::{
    put_client_error, put_cvalue_header, put_server_error, put_value_header, DELETED, END,
    NOT_FOUND, NOT_MODIFIED, OK, STORED,
};
use shoal_protocol::{decode_exptime, key_is_valid, Command};

/// What the connection loop should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close,
}

pub(crate) async fn execute<C, R, W>(
    cmd: Command,
    reader: &mut R,
    writer: &mut W,
    cache: &C,
) -> io::Result<Flow>
where
    C: Cache,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(256);
    let flow = match cmd {
        Command::Get { keys } => {
            if keys.iter().any(|k| !key_is_valid(k)) {
                put_client_error(&mut buf, "malformed key");
            } else {
                for key in &keys {
                    if let Some(guard) = cache.get(key) {
                        put_value_header(&mut buf, key, guard.flags(), guard.size());
                        buf.extend_from_slice(guard.value());
                        buf.extend_from_slice(b"\r\n");
                    }
                }
                buf.extend_from_slice(END);
            }
            Flow::Continue
        }

        Command::GetDe { key, grace_ms } => {
            if !key_is_valid(&key) {
                put_client_error(&mut buf, "malformed key");
            } else {
                if let Some(guard) = cache.get_de(&key, Duration::from_millis(grace_ms)) {
                    put_value_header(&mut buf, &key, guard.flags(), guard.size());
                    buf.extend_from_slice(guard.value());
                    buf.extend_from_slice(b"\r\n");
                }
                buf.extend_from_slice(END);
            }
            Flow::Continue
        }

        Command::Cget { key, etag } => {
            if !key_is_valid(&key) {
                put_client_error(&mut buf, "malformed key");
            } else {
                match cache.get_conditional(&key, etag) {
                    ConditionalGet::Miss => buf.extend_from_slice(END),
                    ConditionalGet::NotModified => buf.extend_from_slice(NOT_MODIFIED),
                    ConditionalGet::Modified(guard) => {
                        put_cvalue_header(
                            &mut buf,
                            &key,
                            guard.etag(),
                            guard.validate_ttl().as_millis() as u64,
                            guard.ttl().as_secs(),
                            guard.size(),
                        );
                        buf.extend_from_slice(guard.value());
                        buf.extend_from_slice(b"\r\n");
                        buf.extend_from_slice(END);
                    }
                }
            }
            Flow::Continue
        }

        Command::Set {
            key,
            flags,
            exptime,
            size,
            noreply,
        } => {
            let ttl = decode_exptime(exptime, cache.max_ttl());
            let txn = if key_is_valid(&key) {
                cache.begin_set(&key, size, flags, ttl)
            } else {
                Err(CacheError::KeyTooLong)
            };
            store_payload(reader, writer, cache, txn, size, noreply, &mut buf).await?
        }

        Command::Cset {
            key,
            etag,
            exptime,
            validate_ttl_ms,
            size,
            noreply,
        } => {
            let ttl = decode_exptime(exptime, cache.max_ttl());
            let txn = if key_is_valid(&key) {
                cache.begin_cset(&key, size, ttl, etag, Duration::from_millis(validate_ttl_ms))
            } else {
                Err(CacheError::KeyTooLong)
            };
            store_payload(reader, writer, cache, txn, size, noreply, &mut buf).await?
        }

        Command::Delete { key, noreply } => {
            if !key_is_valid(&key) {
                if !noreply {
                    put_client_error(&mut buf, "malformed key");
                }
            } else {
                let existed = cache.delete(&key);
                if !noreply {
                    buf.extend_from_slice(if existed { DELETED } else { NOT_FOUND });
                }
            }
            Flow::Continue
        }

        Command::FlushAll { delay_secs, noreply } => {
            cache.clear(Duration::from_secs(delay_secs));
            if !noreply {
                buf.extend_from_slice(OK);
            }
            Flow::Continue
        }
    };

    if !buf.is_empty() {
        writer.write_all(&buf).await?;
    }
    Ok(flow)
}

/// Read a store payload into the transaction window (or discard it when the
/// transaction was refused), check the trailing CRLF, and commit.
async fn store_payload<C, R, W>(
    reader: &mut R,
    writer: &mut W,
    cache: &C,
    txn: Result<shoal_cache::SetTxn, CacheError>,
    size: usize,
    noreply: bool,
    buf: &mut BytesMut,
) -> io::Result<Flow>
where
    C: Cache,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match txn {
        Ok(mut txn) => {
            reader.read_exact(txn.value_mut()).await?;
            if !read_crlf(reader).await? {
                warn!("store payload not followed by CRLF");
                put_client_error(buf, "bad data chunk");
                writer.write_all(buf).await?;
                buf.clear();
                return Ok(Flow::Close);
            }
            match cache.commit_set(txn) {
                Ok(()) => {
                    if !noreply {
                        buf.extend_from_slice(STORED);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "store transaction failed to commit");
                    if !noreply {
                        put_server_error(buf, &e.to_string());
                    }
                }
            }
        }
        Err(e) => {
            // The payload still occupies the stream; swallow it to keep the
            // connection framed.
            discard_exact(reader, size).await?;
            if !read_crlf(reader).await? {
                if !noreply {
                    put_client_error(buf, "bad data chunk");
                    writer.write_all(buf).await?;
                    buf.clear();
                }
                return Ok(Flow::Close);
            }
            if !noreply {
                match e {
                    CacheError::KeyTooLong => put_client_error(buf, "malformed key"),
                    _ => put_server_error(buf, &e.to_string()),
                }
            }
        }
    }
    Ok(Flow::Continue)
}

async fn read_crlf<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<bool> {
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
    Ok(&crlf == b"\r\n")
}

async fn discard_exact<R: AsyncRead + Unpin>(reader: &mut R, mut n: usize) -> io::Result<()> {
    let mut chunk = [0u8; 4096];
    while n > 0 {
        let take = n.min(chunk.len());
        reader.read_exact(&mut chunk[..take]).await?;
        n -= take;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_cache::HashCache;

    async fn run_cmd(cache: &HashCache, line: &[u8], payload: &[u8]) -> (Vec<u8>, Flow) {
        let cmd = Command::parse(line).unwrap();
        let mut reader: &[u8] = payload;
        let mut out = Vec::new();
        let flow = execute(cmd, &mut reader, &mut out, cache).await.unwrap();
        (out, flow)
    }

    #[tokio::test]
    async fn set_then_get() {
        let cache = HashCache::builder().build();
        let (out, flow) = run_cmd(&cache, b"set key 12345 0 5", b"value\r\n").await;
        assert_eq!(out, b"STORED\r\n");
        assert_eq!(flow, Flow::Continue);

        let (out, _) = run_cmd(&cache, b"get key", b"").await;
        assert_eq!(out, b"VALUE key 12345 5\r\nvalue\r\nEND\r\n");
    }

    #[tokio::test]
    async fn get_miss_is_bare_end() {
        let cache = HashCache::builder().build();
        let (out, _) = run_cmd(&cache, b"get nothing", b"").await;
        assert_eq!(out, b"END\r\n");
    }

    #[tokio::test]
    async fn set_noreply_is_silent() {
        let cache = HashCache::builder().build();
        let (out, _) = run_cmd(&cache, b"set key 0 0 1 noreply", b"v\r\n").await;
        assert!(out.is_empty());
        let (out, _) = run_cmd(&cache, b"get key", b"").await;
        assert_eq!(out, b"VALUE key 0 1\r\nv\r\nEND\r\n");
    }

    #[tokio::test]
    async fn set_missing_crlf_closes() {
        let cache = HashCache::builder().build();
        let (out, flow) = run_cmd(&cache, b"set key 0 0 5", b"valueXY").await;
        assert_eq!(out, b"CLIENT_ERROR bad data chunk\r\n");
        assert_eq!(flow, Flow::Close);
    }

    #[tokio::test]
    async fn cset_then_cget() {
        let cache = HashCache::builder().build();
        let (out, _) = run_cmd(&cache, b"cset key 42 0 1500 5", b"value\r\n").await;
        assert_eq!(out, b"STORED\r\n");

        // Matching etag: no payload travels.
        let (out, _) = run_cmd(&cache, b"cget key 42", b"").await;
        assert_eq!(out, b"NOT_MODIFIED\r\n");

        // Differing etag: full frame.
        let (out, _) = run_cmd(&cache, b"cget key 7", b"").await;
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("VALUE key 42 1500 "), "got {text:?}");
        assert!(text.ends_with("5\r\nvalue\r\nEND\r\n"));

        // Missing key.
        let (out, _) = run_cmd(&cache, b"cget other 42", b"").await;
        assert_eq!(out, b"END\r\n");
    }

    #[tokio::test]
    async fn getde_grace_window() {
        let cache = HashCache::builder().build();
        // Expires in 1s; a 5000ms grace window makes it a miss.
        let (out, _) = run_cmd(&cache, b"set key 0 1 5", b"value\r\n").await;
        assert_eq!(out, b"STORED\r\n");
        let (out, _) = run_cmd(&cache, b"getde key 5000", b"").await;
        assert_eq!(out, b"END\r\n");
        let (out, _) = run_cmd(&cache, b"getde key 1", b"").await;
        assert_eq!(out, b"VALUE key 0 5\r\nvalue\r\nEND\r\n");
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let cache = HashCache::builder().build();
        let (out, _) = run_cmd(&cache, b"delete key", b"").await;
        assert_eq!(out, b"NOT_FOUND\r\n");
        run_cmd(&cache, b"set key 0 0 1", b"v\r\n").await;
        let (out, _) = run_cmd(&cache, b"delete key", b"").await;
        assert_eq!(out, b"DELETED\r\n");
    }

    #[tokio::test]
    async fn flush_all_replies_ok() {
        let cache = HashCache::builder().build();
        run_cmd(&cache, b"set key 0 0 1", b"v\r\n").await;
        let (out, _) = run_cmd(&cache, b"flush_all", b"").await;
        assert_eq!(out, b"OK\r\n");
        let (out, _) = run_cmd(&cache, b"get key", b"").await;
        assert_eq!(out, b"END\r\n");
    }

    #[tokio::test]
    async fn malformed_key_in_store_swallows_payload() {
        let cache = HashCache::builder().build();
        let long_key = vec![b'k'; 251];
        let line = [b"set " as &[u8], &long_key, b" 0 0 5"].concat();
        let (out, flow) = run_cmd(&cache, &line, b"value\r\n").await;
        assert_eq!(out, b"CLIENT_ERROR malformed key\r\n");
        assert_eq!(flow, Flow::Continue);
    }
}
