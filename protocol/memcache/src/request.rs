//! Client-side request encoding.

use bytes::{Bytes, BytesMut};

use crate::push_decimal;

/// A request ready to be serialized onto the wire.
///
/// Store variants carry the payload so the whole command (header line,
/// payload, trailing CRLF) is emitted in one [`encode`](Request::encode)
/// call, preserving write-queue ordering.
#[derive(Debug, Clone)]
pub enum Request<'a> {
    /// `get <key> [<key> ...]\r\n`
    Get { keys: &'a [Bytes] },
    /// `getde <key> <grace_ms>\r\n`
    GetDe { key: &'a [u8], grace_ms: u64 },
    /// `cget <key> <etag>\r\n`
    Cget { key: &'a [u8], etag: u64 },
    /// `set <key> <flags> <exptime> <size> [noreply]\r\n<payload>\r\n`
    Set {
        key: &'a [u8],
        flags: u32,
        exptime: u64,
        value: &'a [u8],
        noreply: bool,
    },
    /// `cset <key> <etag> <exptime> <validate_ttl_ms> <size> [noreply]\r\n<payload>\r\n`
    Cset {
        key: &'a [u8],
        etag: u64,
        exptime: u64,
        validate_ttl_ms: u64,
        value: &'a [u8],
        noreply: bool,
    },
    /// `delete <key> [noreply]\r\n`
    Delete { key: &'a [u8], noreply: bool },
    /// `flush_all [<delay_secs>] [noreply]\r\n`
    FlushAll {
        delay_secs: Option<u64>,
        noreply: bool,
    },
}

impl Request<'_> {
    /// Append the full wire form of this request to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match *self {
            Request::Get { keys } => {
                buf.extend_from_slice(b"get");
                for key in keys {
                    buf.extend_from_slice(b" ");
                    buf.extend_from_slice(key);
                }
                buf.extend_from_slice(b"\r\n");
            }
            Request::GetDe { key, grace_ms } => {
                buf.extend_from_slice(b"getde ");
                buf.extend_from_slice(key);
                buf.extend_from_slice(b" ");
                push_decimal(buf, grace_ms);
                buf.extend_from_slice(b"\r\n");
            }
            Request::Cget { key, etag } => {
                buf.extend_from_slice(b"cget ");
                buf.extend_from_slice(key);
                buf.extend_from_slice(b" ");
                push_decimal(buf, etag);
                buf.extend_from_slice(b"\r\n");
            }
            Request::Set {
                key,
                flags,
                exptime,
                value,
                noreply,
            } => {
                buf.extend_from_slice(b"set ");
                buf.extend_from_slice(key);
                buf.extend_from_slice(b" ");
                push_decimal(buf, u64::from(flags));
                buf.extend_from_slice(b" ");
                push_decimal(buf, exptime);
                buf.extend_from_slice(b" ");
                push_decimal(buf, value.len() as u64);
                if noreply {
                    buf.extend_from_slice(b" noreply");
                }
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(value);
                buf.extend_from_slice(b"\r\n");
            }
            Request::Cset {
                key,
                etag,
                exptime,
                validate_ttl_ms,
                value,
                noreply,
            } => {
                buf.extend_from_slice(b"cset ");
                buf.extend_from_slice(key);
                buf.extend_from_slice(b" ");
                push_decimal(buf, etag);
                buf.extend_from_slice(b" ");
                push_decimal(buf, exptime);
                buf.extend_from_slice(b" ");
                push_decimal(buf, validate_ttl_ms);
                buf.extend_from_slice(b" ");
                push_decimal(buf, value.len() as u64);
                if noreply {
                    buf.extend_from_slice(b" noreply");
                }
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(value);
                buf.extend_from_slice(b"\r\n");
            }
            Request::Delete { key, noreply } => {
                buf.extend_from_slice(b"delete ");
                buf.extend_from_slice(key);
                if noreply {
                    buf.extend_from_slice(b" noreply");
                }
                buf.extend_from_slice(b"\r\n");
            }
            Request::FlushAll { delay_secs, noreply } => {
                buf.extend_from_slice(b"flush_all");
                if let Some(delay) = delay_secs {
                    buf.extend_from_slice(b" ");
                    push_decimal(buf, delay);
                }
                if noreply {
                    buf.extend_from_slice(b" noreply");
                }
                buf.extend_from_slice(b"\r\n");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(req: Request<'_>) -> BytesMut {
        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        buf
    }

    #[test]
    fn encode_get() {
        let keys = vec![Bytes::from_static(b"mykey")];
        assert_eq!(&encoded(Request::Get { keys: &keys })[..], b"get mykey\r\n");
    }

    #[test]
    fn encode_get_multi() {
        let keys = vec![
            Bytes::from_static(b"key1"),
            Bytes::from_static(b"key2"),
            Bytes::from_static(b"key3"),
        ];
        assert_eq!(
            &encoded(Request::Get { keys: &keys })[..],
            b"get key1 key2 key3\r\n"
        );
    }

    #[test]
    fn encode_set() {
        let buf = encoded(Request::Set {
            key: b"mykey",
            flags: 123,
            exptime: 3600,
            value: b"myvalue",
            noreply: false,
        });
        assert_eq!(&buf[..], b"set mykey 123 3600 7\r\nmyvalue\r\n");
    }

    #[test]
    fn encode_set_noreply() {
        let buf = encoded(Request::Set {
            key: b"k",
            flags: 0,
            exptime: 0,
            value: b"v",
            noreply: true,
        });
        assert_eq!(&buf[..], b"set k 0 0 1 noreply\r\nv\r\n");
    }

    #[test]
    fn encode_cset() {
        let buf = encoded(Request::Cset {
            key: b"k",
            etag: 1234567890,
            exptime: 100,
            validate_ttl_ms: 98765432,
            value: b"value",
            noreply: false,
        });
        assert_eq!(&buf[..], b"cset k 1234567890 100 98765432 5\r\nvalue\r\n");
    }

    #[test]
    fn encode_cget() {
        assert_eq!(
            &encoded(Request::Cget { key: b"k", etag: 42 })[..],
            b"cget k 42\r\n"
        );
    }

    #[test]
    fn encode_getde() {
        assert_eq!(
            &encoded(Request::GetDe {
                key: b"k",
                grace_ms: 250
            })[..],
            b"getde k 250\r\n"
        );
    }

    #[test]
    fn encode_delete() {
        assert_eq!(
            &encoded(Request::Delete {
                key: b"mykey",
                noreply: false
            })[..],
            b"delete mykey\r\n"
        );
        assert_eq!(
            &encoded(Request::Delete {
                key: b"mykey",
                noreply: true
            })[..],
            b"delete mykey noreply\r\n"
        );
    }

    #[test]
    fn encode_flush_all() {
        assert_eq!(
            &encoded(Request::FlushAll {
                delay_secs: None,
                noreply: false
            })[..],
            b"flush_all\r\n"
        );
        assert_eq!(
            &encoded(Request::FlushAll {
                delay_secs: Some(3),
                noreply: true
            })[..],
            b"flush_all 3 noreply\r\n"
        );
    }

    #[test]
    fn encoded_requests_parse_back() {
        use crate::Command;

        let keys = vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")];
        let mut buf = encoded(Request::Get { keys: &keys });
        buf.truncate(buf.len() - 2);
        assert!(matches!(Command::parse(&buf), Ok(Command::Get { .. })));

        let mut buf = BytesMut::new();
        Request::Cset {
            key: b"k",
            etag: 7,
            exptime: 9,
            validate_ttl_ms: 11,
            value: b"xyz",
            noreply: true,
        }
        .encode(&mut buf);
        let header_end = buf.windows(2).position(|w| w == b"\r\n").unwrap();
        match Command::parse(&buf[..header_end]) {
            Ok(Command::Cset {
                etag,
                exptime,
                validate_ttl_ms,
                size,
                noreply,
                ..
            }) => {
                assert_eq!(
                    (etag, exptime, validate_ttl_ms, size, noreply),
                    (7, 9, 11, 3, true)
                );
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }
}
