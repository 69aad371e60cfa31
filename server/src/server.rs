//! Server lifecycle: accept loop, handler tracking, graceful stop.

use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use shoal_cache::Cache;

use crate::config::Config;
use crate::connection;

/// A running server's handles. Exists iff the server is in state Running.
struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    done: watch::Receiver<bool>,
    error: Arc<Mutex<Option<io::Error>>>,
    run: JoinHandle<()>,
}

/// The memcache-compatible TCP server.
///
/// State machine: Idle → (`start`) → Running → (`stop`) → Idle. `start` on a
/// running server and `stop` on an idle one are precondition violations and
/// panic. `serve` is `start` followed by `wait`.
pub struct Server<C: Cache> {
    config: Config,
    cache: Arc<C>,
    running: Mutex<Option<Running>>,
}

impl<C: Cache> Server<C> {
    pub fn new(config: Config, cache: C) -> Self {
        Self {
            config,
            cache: Arc::new(cache),
            running: Mutex::new(None),
        }
    }

    /// The bound address, once running. Useful with a port-0 listen address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// Bind the listener and launch the accept loop.
    pub async fn start(&self) -> io::Result<()> {
        if self.running.lock().is_some() {
            panic!("server is already running (did you forget to call stop()?)");
        }

        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let error = Arc::new(Mutex::new(None));

        let run = tokio::spawn(run_loop(
            listener,
            self.cache.clone(),
            self.config.read_buffer_size,
            self.config.write_buffer_size,
            shutdown_rx,
            done_tx,
            error.clone(),
        ));

        let mut slot = self.running.lock();
        if slot.is_some() {
            panic!("server is already running (did you forget to call stop()?)");
        }
        *slot = Some(Running {
            local_addr,
            shutdown: shutdown_tx,
            done: done_rx,
            error,
            run,
        });
        Ok(())
    }

    /// Block until the accept loop exits, returning its terminal error.
    /// Returns immediately if the server is not running (already stopped).
    pub async fn wait(&self) -> io::Result<()> {
        let handles = {
            let running = self.running.lock();
            running.as_ref().map(|r| (r.done.clone(), r.error.clone()))
        };
        let Some((mut done, error)) = handles else {
            return Ok(());
        };
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
        let result = match error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        };
        result
    }

    /// `start` + `wait`.
    pub async fn serve(&self) -> io::Result<()> {
        self.start().await?;
        self.wait().await
    }

    /// Stop accepting, drain in-flight connections, and join the accept
    /// loop. On return no server task is running.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .take()
            .expect("server is not running (did you forget to call start()?)");
        let _ = running.shutdown.send(true);
        if running.run.await.is_err() {
            error!("server run loop panicked");
        }
    }
}

async fn run_loop<C: Cache>(
    listener: TcpListener,
    cache: Arc<C>,
    read_buffer_size: usize,
    write_buffer_size: usize,
    mut shutdown: watch::Receiver<bool>,
    done: watch::Sender<bool>,
    error: Arc<Mutex<Option<io::Error>>>,
) {
    // Every accepted connection joins this set; it doubles as the handler
    // wait-group drained before the loop reports done.
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    let cache = cache.clone();
                    handlers.spawn(connection::run(
                        stream,
                        cache,
                        read_buffer_size,
                        write_buffer_size,
                    ));
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    *error.lock() = Some(e);
                    break;
                }
            },
            _ = shutdown.changed() => break,
            // Reap finished handlers so the set does not grow unbounded.
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
        }
    }

    // New connections become impossible the moment the listener drops;
    // in-flight handlers drain to natural EOF or error.
    drop(listener);
    while handlers.join_next().await.is_some() {}
    let _ = done.send(true);
}
