//! Client-facing error kinds.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The key is not present. Also returned by `get_de` inside the grace
    /// window and by `delete` of a missing key.
    #[error("cache miss")]
    CacheMiss,

    /// `cget`: the supplied etag matches the stored one; the caller's value
    /// buffer is left untouched.
    #[error("not modified")]
    NotModified,

    /// The key contains forbidden bytes or exceeds the protocol ceiling.
    /// Detected locally, before any network activity.
    #[error("malformed key")]
    MalformedKey,

    /// A distributed operation was attempted with zero members.
    #[error("no servers configured")]
    NoServers,

    /// I/O failure between client and server, or an in-flight request
    /// aborted by `stop`.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Unexpected wire response; the pipeline drops its connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered `CLIENT_ERROR`/`SERVER_ERROR` for this request.
    #[error("server error: {0}")]
    Server(String),

    /// A `get_de` grace window elapsed with no result from the leader.
    #[error("timed out waiting for in-flight request")]
    Timeout,
}

impl ClientError {
    /// The error observed by callers whose request died with its pipeline.
    pub(crate) fn aborted() -> ClientError {
        ClientError::Transport(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "request aborted",
        ))
    }
}
