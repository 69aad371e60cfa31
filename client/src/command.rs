//! Tasks queued on a pipeline: the request ingredients paired with a
//! completion handle the reader signals once the matching response arrives.

use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::sync::oneshot;

use shoal_protocol::Request;

use crate::error::ClientError;
use crate::item::Item;

/// Result payload of a plain read.
#[derive(Debug, Clone)]
pub(crate) struct Fetched {
    pub value: Bytes,
    pub flags: u32,
}

/// Result payload of a conditional read that found a changed entry.
#[derive(Debug, Clone)]
pub(crate) struct CFetched {
    pub value: Bytes,
    pub etag: u64,
    pub validate_ttl: Duration,
    pub expiration: Duration,
}

/// The three shapes a `cget` response can take.
#[derive(Debug, Clone)]
pub(crate) enum CgetOutcome {
    Miss,
    NotModified,
    Modified(CFetched),
}

/// One queued request. Write variants with `reply: None` are fire-and-forget:
/// they are emitted with the `noreply` marker, never travel to the reader,
/// and complete when enqueued.
pub(crate) enum Task {
    Get {
        key: Bytes,
        tx: oneshot::Sender<Result<Option<Fetched>, ClientError>>,
    },
    GetMulti {
        keys: Vec<Bytes>,
        tx: oneshot::Sender<Result<Vec<Item>, ClientError>>,
    },
    GetDe {
        key: Bytes,
        grace: Duration,
        tx: oneshot::Sender<Result<Option<Fetched>, ClientError>>,
    },
    Cget {
        key: Bytes,
        etag: u64,
        tx: oneshot::Sender<Result<CgetOutcome, ClientError>>,
    },
    Set {
        key: Bytes,
        value: Bytes,
        flags: u32,
        exptime: u64,
        reply: Option<oneshot::Sender<Result<(), ClientError>>>,
    },
    Cset {
        key: Bytes,
        value: Bytes,
        etag: u64,
        exptime: u64,
        validate_ttl_ms: u64,
        reply: Option<oneshot::Sender<Result<(), ClientError>>>,
    },
    Delete {
        key: Bytes,
        /// Completed with whether the key existed.
        reply: Option<oneshot::Sender<Result<bool, ClientError>>>,
    },
    FlushAll {
        delay_secs: Option<u64>,
        reply: Option<oneshot::Sender<Result<(), ClientError>>>,
    },
}

impl Task {
    /// Whether a response travels back for this task. Determines both the
    /// `noreply` marker and whether the task joins the reader queue.
    pub fn expects_reply(&self) -> bool {
        match self {
            Task::Get { .. } | Task::GetMulti { .. } | Task::GetDe { .. } | Task::Cget { .. } => {
                true
            }
            Task::Set { reply, .. } => reply.is_some(),
            Task::Cset { reply, .. } => reply.is_some(),
            Task::Delete { reply, .. } => reply.is_some(),
            Task::FlushAll { reply, .. } => reply.is_some(),
        }
    }

    /// Append this task's wire form to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let noreply = !self.expects_reply();
        let request = match self {
            Task::Get { key, .. } => Request::Get {
                keys: std::slice::from_ref(key),
            },
            Task::GetMulti { keys, .. } => Request::Get { keys },
            Task::GetDe { key, grace, .. } => Request::GetDe {
                key,
                grace_ms: grace.as_millis() as u64,
            },
            Task::Cget { key, etag, .. } => Request::Cget { key, etag: *etag },
            Task::Set {
                key,
                value,
                flags,
                exptime,
                ..
            } => Request::Set {
                key,
                flags: *flags,
                exptime: *exptime,
                value,
                noreply,
            },
            Task::Cset {
                key,
                value,
                etag,
                exptime,
                validate_ttl_ms,
                ..
            } => Request::Cset {
                key,
                etag: *etag,
                exptime: *exptime,
                validate_ttl_ms: *validate_ttl_ms,
                value,
                noreply,
            },
            Task::Delete { key, .. } => Request::Delete { key, noreply },
            Task::FlushAll { delay_secs, .. } => Request::FlushAll {
                delay_secs: *delay_secs,
                noreply,
            },
        };
        request.encode(buf);
    }

    /// Fail this task's completion handle, if it has one.
    pub fn fail(self, err: ClientError) {
        match self {
            Task::Get { tx, .. } => {
                let _ = tx.send(Err(err));
            }
            Task::GetMulti { tx, .. } => {
                let _ = tx.send(Err(err));
            }
            Task::GetDe { tx, .. } => {
                let _ = tx.send(Err(err));
            }
            Task::Cget { tx, .. } => {
                let _ = tx.send(Err(err));
            }
            Task::Set { reply, .. } | Task::Cset { reply, .. } | Task::FlushAll { reply, .. } => {
                if let Some(tx) = reply {
                    let _ = tx.send(Err(err));
                }
            }
            Task::Delete { reply, .. } => {
                if let Some(tx) = reply {
                    let _ = tx.send(Err(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nowait_write_encodes_noreply() {
        let task = Task::Set {
            key: Bytes::from_static(b"k"),
            value: Bytes::from_static(b"v"),
            flags: 0,
            exptime: 0,
            reply: None,
        };
        assert!(!task.expects_reply());
        let mut buf = BytesMut::new();
        task.encode(&mut buf);
        assert_eq!(&buf[..], b"set k 0 0 1 noreply\r\nv\r\n");
    }

    #[test]
    fn sync_write_expects_reply() {
        let (tx, _rx) = oneshot::channel();
        let task = Task::Delete {
            key: Bytes::from_static(b"k"),
            reply: Some(tx),
        };
        assert!(task.expects_reply());
        let mut buf = BytesMut::new();
        task.encode(&mut buf);
        assert_eq!(&buf[..], b"delete k\r\n");
    }

    #[test]
    fn failing_a_task_reaches_the_caller() {
        let (tx, mut rx) = oneshot::channel();
        let task = Task::Get {
            key: Bytes::from_static(b"k"),
            tx,
        };
        task.fail(ClientError::aborted());
        match rx.try_recv().unwrap() {
            Err(ClientError::Transport(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
