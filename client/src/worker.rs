//! The connection pipeline.
//!
//! One pipeline owns one TCP connection and two cooperating loops. The
//! writer consumes the bounded task queue, serializes each request, and
//! hands tasks that expect a response to the reader's FIFO queue. The
//! reader parses responses in that same order — TCP's total order over the
//! stream is the only correlation mechanism, so the reader queue must never
//! be reordered.
//!
//! On any socket failure the pipeline fails every task still queued on
//! either side (their completion handles are dropped, which callers observe
//! as a transport error) and redials with a linearly growing, capped
//! backoff. Callers that enqueue while the pipeline is reconnecting simply
//! wait in the task queue.

use bytes::{Bytes, BytesMut};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use shoal_protocol::response::{
    parse_cget_line, parse_error_line, parse_get_line, parse_reply, CgetLine, GetLine, Reply,
};

use crate::command::{CFetched, CgetOutcome, Fetched, Task};
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::item::Item;

/// Redial backoff ceiling.
const MAX_RECONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// How long `stop` waits for responses already on the wire before aborting
/// them.
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Handle to one spawned pipeline.
pub(crate) struct Pipeline {
    tx: mpsc::Sender<Task>,
    handle: JoinHandle<()>,
}

impl Pipeline {
    pub fn spawn(config: ClientConfig) -> Pipeline {
        let (tx, rx) = mpsc::channel(config.request_queue_size.max(1));
        let handle = tokio::spawn(run(config, rx));
        Pipeline { tx, handle }
    }

    /// A cheap handle for enqueueing tasks.
    pub fn sender(&self) -> mpsc::Sender<Task> {
        self.tx.clone()
    }

    /// Close the queue and join the pipeline task.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.handle.await;
    }
}

enum Exit {
    /// The task queue closed: the client is stopping.
    Stopped,
    /// The connection failed; redial.
    ConnectionLost,
}

async fn run(config: ClientConfig, mut rx: mpsc::Receiver<Task>) {
    let mut backoff = config.reconnect_timeout;
    let mut carry: Option<Task> = None;

    loop {
        // A closed queue during reconnection means stop: fail fast (carried
        // task included) instead of waiting for a backend that may never
        // come back.
        if rx.is_closed() {
            break;
        }

        match TcpStream::connect(&config.connect_addr).await {
            Ok(stream) => {
                backoff = config.reconnect_timeout;
                match drive(stream, &config, &mut rx, &mut carry).await {
                    Exit::Stopped => break,
                    Exit::ConnectionLost => {}
                }
            }
            Err(e) => {
                debug!(addr = %config.connect_addr, error = %e, "connect failed");
            }
        }

        if carry.is_none() {
            tokio::select! {
                _ = sleep(backoff) => {}
                task = rx.recv() => match task {
                    Some(task) => {
                        carry = Some(task);
                        sleep(backoff).await;
                    }
                    None => break,
                },
            }
        } else {
            sleep(backoff).await;
        }
        backoff = (backoff + config.reconnect_timeout).min(MAX_RECONNECT_TIMEOUT);
    }

    if let Some(task) = carry.take() {
        task.fail(ClientError::aborted());
    }
    while let Ok(task) = rx.try_recv() {
        task.fail(ClientError::aborted());
    }
}

/// Run writer and reader over one live connection until stop or failure.
async fn drive(
    stream: TcpStream,
    config: &ClientConfig,
    rx: &mut mpsc::Receiver<Task>,
    carry: &mut Option<Task>,
) -> Exit {
    if stream.set_nodelay(true).is_err() {
        return Exit::ConnectionLost;
    }
    let (read_half, write_half) = stream.into_split();

    let (inflight_tx, inflight_rx) = mpsc::unbounded_channel();
    let mut reader = tokio::spawn(read_loop(
        BufReader::with_capacity(config.read_buffer_size, read_half),
        inflight_rx,
    ));
    let writer = write_loop(
        BufWriter::with_capacity(config.write_buffer_size, write_half),
        rx,
        carry,
        inflight_tx,
    );
    tokio::pin!(writer);

    tokio::select! {
        exit = &mut writer => match exit {
            WriterExit::Stopped => {
                // Everything queued has been written; give responses already
                // on the wire a bounded chance to land before aborting them.
                if tokio::time::timeout(STOP_DRAIN_TIMEOUT, &mut reader)
                    .await
                    .is_err()
                {
                    reader.abort();
                    let _ = reader.await;
                }
                Exit::Stopped
            }
            WriterExit::Failed => {
                reader.abort();
                let _ = reader.await;
                Exit::ConnectionLost
            }
        },
        // The reader died first (read error, server close, or a response we
        // could not parse). Dropping the writer future fails its in-hand
        // task; the redial loop takes over.
        _ = &mut reader => Exit::ConnectionLost,
    }
}

enum WriterExit {
    Stopped,
    Failed,
}

async fn write_loop(
    mut writer: BufWriter<OwnedWriteHalf>,
    rx: &mut mpsc::Receiver<Task>,
    carry: &mut Option<Task>,
    inflight: mpsc::UnboundedSender<Task>,
) -> WriterExit {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let task = if let Some(task) = carry.take() {
            task
        } else {
            match rx.try_recv() {
                Ok(task) => task,
                Err(TryRecvError::Empty) => {
                    // The queue just drained: flush the batch, then block.
                    if writer.flush().await.is_err() {
                        return WriterExit::Failed;
                    }
                    match rx.recv().await {
                        Some(task) => task,
                        None => return WriterExit::Stopped,
                    }
                }
                Err(TryRecvError::Disconnected) => {
                    let _ = writer.flush().await;
                    return WriterExit::Stopped;
                }
            }
        };

        buf.clear();
        task.encode(&mut buf);
        if writer.write_all(&buf).await.is_err() {
            // The task in hand is dropped with its completion handle.
            return WriterExit::Failed;
        }
        if task.expects_reply() && inflight.send(task).is_err() {
            return WriterExit::Failed;
        }
    }
}

async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    mut inflight: mpsc::UnboundedReceiver<Task>,
) {
    let mut line = Vec::with_capacity(1024);
    while let Some(task) = inflight.recv().await {
        if let Err(failure) = complete(&mut reader, &mut line, task).await {
            debug!(error = %failure, "pipeline read failed");
            // Dropping the remaining in-flight tasks fails their callers.
            break;
        }
    }
}

/// Why the read side of a pipeline died.
enum ReadFailure {
    Io(io::Error),
    Protocol(String),
}

impl ReadFailure {
    /// The error handed to the task that hit this failure. The original is
    /// kept for the pipeline's own log line.
    fn client_error(&self) -> ClientError {
        match self {
            ReadFailure::Io(e) => ClientError::Transport(io::Error::new(e.kind(), e.to_string())),
            ReadFailure::Protocol(s) => ClientError::Protocol(s.clone()),
        }
    }
}

impl std::fmt::Display for ReadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadFailure::Io(e) => write!(f, "io error: {e}"),
            ReadFailure::Protocol(s) => write!(f, "protocol error: {s}"),
        }
    }
}

/// A failure while reading one task's response: either scoped to the
/// request (the connection keeps going) or fatal to the pipe.
enum TaskError {
    Request(ClientError),
    Pipe(ReadFailure),
}

impl From<ReadFailure> for TaskError {
    fn from(failure: ReadFailure) -> Self {
        TaskError::Pipe(failure)
    }
}

/// Parse the response for `task` and signal its completion handle.
async fn complete(
    reader: &mut BufReader<OwnedReadHalf>,
    line: &mut Vec<u8>,
    task: Task,
) -> Result<(), ReadFailure> {
    match task {
        Task::Get { tx, .. } | Task::GetDe { tx, .. } => {
            match read_value_stream(reader, line).await {
                Ok(mut items) => {
                    let fetched = items.pop().map(|item| Fetched {
                        value: item.value,
                        flags: item.flags,
                    });
                    let _ = tx.send(Ok(fetched));
                    Ok(())
                }
                Err(e) => dispose(tx, e),
            }
        }
        Task::GetMulti { tx, .. } => match read_value_stream(reader, line).await {
            Ok(items) => {
                let _ = tx.send(Ok(items));
                Ok(())
            }
            Err(e) => dispose(tx, e),
        },
        Task::Cget { tx, .. } => match read_cget(reader, line).await {
            Ok(outcome) => {
                let _ = tx.send(Ok(outcome));
                Ok(())
            }
            Err(e) => dispose(tx, e),
        },
        Task::Set { reply, .. } | Task::Cset { reply, .. } => {
            let tx = reply.expect("sync write task without completion handle");
            match read_store_reply(reader, line).await {
                Ok(()) => {
                    let _ = tx.send(Ok(()));
                    Ok(())
                }
                Err(e) => dispose(tx, e),
            }
        }
        Task::Delete { reply, .. } => {
            let tx = reply.expect("sync delete task without completion handle");
            match read_delete_reply(reader, line).await {
                Ok(existed) => {
                    let _ = tx.send(Ok(existed));
                    Ok(())
                }
                Err(e) => dispose(tx, e),
            }
        }
        Task::FlushAll { reply, .. } => {
            let tx = reply.expect("sync flush task without completion handle");
            match read_flush_reply(reader, line).await {
                Ok(()) => {
                    let _ = tx.send(Ok(()));
                    Ok(())
                }
                Err(e) => dispose(tx, e),
            }
        }
    }
}

/// Route a task error: request-scoped errors complete the task and keep the
/// connection; pipe errors complete the task and tear it down.
fn dispose<T>(
    tx: tokio::sync::oneshot::Sender<Result<T, ClientError>>,
    err: TaskError,
) -> Result<(), ReadFailure> {
    match err {
        TaskError::Request(e) => {
            let _ = tx.send(Err(e));
            Ok(())
        }
        TaskError::Pipe(failure) => {
            let _ = tx.send(Err(failure.client_error()));
            Err(failure)
        }
    }
}

async fn read_line(
    reader: &mut BufReader<OwnedReadHalf>,
    line: &mut Vec<u8>,
) -> Result<(), ReadFailure> {
    line.clear();
    let n = reader
        .read_until(b'\n', line)
        .await
        .map_err(ReadFailure::Io)?;
    if n == 0 {
        return Err(ReadFailure::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by server",
        )));
    }
    if !line.ends_with(b"\r\n") {
        return Err(ReadFailure::Protocol(
            "response line without CRLF framing".to_string(),
        ));
    }
    line.truncate(line.len() - 2);
    Ok(())
}

async fn read_payload(
    reader: &mut BufReader<OwnedReadHalf>,
    size: usize,
) -> Result<Bytes, ReadFailure> {
    let mut value = vec![0u8; size];
    reader
        .read_exact(&mut value)
        .await
        .map_err(ReadFailure::Io)?;
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await.map_err(ReadFailure::Io)?;
    if &crlf != b"\r\n" {
        return Err(ReadFailure::Protocol(
            "payload not followed by CRLF".to_string(),
        ));
    }
    Ok(Bytes::from(value))
}

/// Classify an `ERROR`/`CLIENT_ERROR`/`SERVER_ERROR` frame that arrived in
/// place of a normal response.
fn reply_failure(reply: Reply) -> TaskError {
    match reply {
        Reply::Error => TaskError::Pipe(ReadFailure::Protocol(
            "server answered ERROR".to_string(),
        )),
        Reply::ClientError(text) | Reply::ServerError(text) => {
            TaskError::Request(ClientError::Server(text))
        }
        other => TaskError::Pipe(ReadFailure::Protocol(format!(
            "unexpected reply: {other:?}"
        ))),
    }
}

/// Read `VALUE`/payload frames until `END`.
async fn read_value_stream(
    reader: &mut BufReader<OwnedReadHalf>,
    line: &mut Vec<u8>,
) -> Result<Vec<Item>, TaskError> {
    let mut items = Vec::new();
    loop {
        read_line(reader, line).await?;
        if let Some(reply) = parse_error_line(line) {
            return Err(reply_failure(reply));
        }
        match parse_get_line(line) {
            Ok(GetLine::End) => return Ok(items),
            Ok(GetLine::Value(header)) => {
                let value = read_payload(reader, header.size).await?;
                items.push(Item {
                    key: header.key,
                    value,
                    flags: header.flags,
                    expiration: Duration::ZERO,
                });
            }
            Err(_) => {
                return Err(TaskError::Pipe(ReadFailure::Protocol(format!(
                    "unexpected line in value stream: {}",
                    String::from_utf8_lossy(line)
                ))));
            }
        }
    }
}

async fn read_cget(
    reader: &mut BufReader<OwnedReadHalf>,
    line: &mut Vec<u8>,
) -> Result<CgetOutcome, TaskError> {
    read_line(reader, line).await?;
    if let Some(reply) = parse_error_line(line) {
        return Err(reply_failure(reply));
    }
    match parse_cget_line(line) {
        Ok(CgetLine::End) => Ok(CgetOutcome::Miss),
        Ok(CgetLine::NotModified) => Ok(CgetOutcome::NotModified),
        Ok(CgetLine::Value(header)) => {
            let value = read_payload(reader, header.size).await?;
            read_line(reader, line).await?;
            if &line[..] != b"END" {
                return Err(TaskError::Pipe(ReadFailure::Protocol(format!(
                    "cget stream not terminated by END: {}",
                    String::from_utf8_lossy(line)
                ))));
            }
            Ok(CgetOutcome::Modified(CFetched {
                value,
                etag: header.etag,
                validate_ttl: Duration::from_millis(header.validate_ttl_ms),
                expiration: Duration::from_secs(header.expiration_secs),
            }))
        }
        Err(_) => Err(TaskError::Pipe(ReadFailure::Protocol(format!(
            "unexpected cget line: {}",
            String::from_utf8_lossy(line)
        )))),
    }
}

async fn read_store_reply(
    reader: &mut BufReader<OwnedReadHalf>,
    line: &mut Vec<u8>,
) -> Result<(), TaskError> {
    read_line(reader, line).await?;
    match parse_reply(line) {
        Ok(Reply::Stored) => Ok(()),
        Ok(Reply::NotStored) => Err(TaskError::Request(ClientError::Server(
            "not stored".to_string(),
        ))),
        Ok(other) => Err(reply_failure(other)),
        Err(_) => Err(TaskError::Pipe(ReadFailure::Protocol(format!(
            "unexpected store reply: {}",
            String::from_utf8_lossy(line)
        )))),
    }
}

async fn read_delete_reply(
    reader: &mut BufReader<OwnedReadHalf>,
    line: &mut Vec<u8>,
) -> Result<bool, TaskError> {
    read_line(reader, line).await?;
    match parse_reply(line) {
        Ok(Reply::Deleted) => Ok(true),
        Ok(Reply::NotFound) => Ok(false),
        Ok(other) => Err(reply_failure(other)),
        Err(_) => Err(TaskError::Pipe(ReadFailure::Protocol(format!(
            "unexpected delete reply: {}",
            String::from_utf8_lossy(line)
        )))),
    }
}

async fn read_flush_reply(
    reader: &mut BufReader<OwnedReadHalf>,
    line: &mut Vec<u8>,
) -> Result<(), TaskError> {
    read_line(reader, line).await?;
    match parse_reply(line) {
        Ok(Reply::Ok) => Ok(()),
        Ok(other) => Err(reply_failure(other)),
        Err(_) => Err(TaskError::Pipe(ReadFailure::Protocol(format!(
            "unexpected flush reply: {}",
            String::from_utf8_lossy(line)
        )))),
    }
}
