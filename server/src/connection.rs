//! Per-connection request loop.

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use shoal_cache::Cache;
use shoal_protocol::response::{put_client_error, ERROR};
use shoal_protocol::{Command, ParseError};

use crate::execute::{self, Flow};

/// Handle one accepted connection until EOF, protocol failure, or I/O error.
pub(crate) async fn run<C: Cache>(
    stream: TcpStream,
    cache: Arc<C>,
    read_buffer_size: usize,
    write_buffer_size: usize,
) {
    let peer = stream.peer_addr().ok();
    if let Err(e) = serve(stream, cache, read_buffer_size, write_buffer_size).await {
        debug!(?peer, error = %e, "connection closed");
    }
}

async fn serve<C: Cache>(
    stream: TcpStream,
    cache: Arc<C>,
    read_buffer_size: usize,
    write_buffer_size: usize,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::with_capacity(read_buffer_size, read_half);
    let mut writer = BufWriter::with_capacity(write_buffer_size, write_half);
    let mut line = Vec::with_capacity(1024);

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            break;
        }
        if !line.ends_with(b"\r\n") {
            warn!("request line without CRLF framing");
            writer.write_all(ERROR).await?;
            break;
        }
        line.truncate(line.len() - 2);

        match Command::parse(&line) {
            Ok(cmd) => match execute::execute(cmd, &mut reader, &mut writer, cache.as_ref()).await? {
                Flow::Continue => {}
                Flow::Close => break,
            },
            Err(ParseError::UnknownCommand) => {
                warn!("unrecognized command");
                writer.write_all(ERROR).await?;
                break;
            }
            Err(e @ ParseError::BadArguments(_)) => {
                let mut buf = bytes::BytesMut::new();
                put_client_error(&mut buf, e.message());
                writer.write_all(&buf).await?;
            }
            Err(e @ ParseError::BadStoreHeader(_)) => {
                // The payload window is unknowable; the stream cannot be
                // re-framed, so answer and close.
                let mut buf = bytes::BytesMut::new();
                put_client_error(&mut buf, e.message());
                writer.write_all(&buf).await?;
                break;
            }
        }

        // Flush only once the read side has drained: pipelined bursts fold
        // their responses into as few segments as possible.
        if reader.buffer().is_empty() {
            writer.flush().await?;
        }
    }

    writer.flush().await
}
