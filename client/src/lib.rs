//! Memcache client for shoal.
//!
//! [`Client`] talks to one backend over a fixed bank of pipelined TCP
//! connections; [`DistributedClient`] shards keys over a dynamic set of
//! backends with a stable hash. Both expose the same operation surface:
//! reads fill the caller's [`Item`]/[`Citem`] in place, `*_nowait` writes
//! are fire-and-forget, and `start`/`stop` bracket the component's workers.
//!
//! # Example
//!
//! ```no_run
//! use shoal_client::{Client, ClientConfig, Item};
//!
//! # async fn example() -> Result<(), shoal_client::ClientError> {
//! let client = Client::new(ClientConfig {
//!     connect_addr: "127.0.0.1:11211".to_string(),
//!     ..Default::default()
//! });
//! client.start();
//!
//! let mut item = Item {
//!     key: "hello".into(),
//!     value: "world".into(),
//!     ..Default::default()
//! };
//! client.set(&item).await?;
//! item.value = Default::default();
//! client.get(&mut item).await?;
//! assert_eq!(&item.value[..], b"world");
//!
//! client.stop().await;
//! # Ok(())
//! # }
//! ```

mod command;
mod config;
mod distributed;
mod dogpile;
mod error;
mod item;
mod worker;

pub use config::{ClientConfig, DistributedConfig};
pub use distributed::DistributedClient;
pub use error::ClientError;
pub use item::{Citem, Item};

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

use shoal_protocol::{encode_exptime, key_is_valid};

use command::{CgetOutcome, Fetched, Task};
use dogpile::{FlightFailure, FlightOutcome, Role};
use worker::Pipeline;

/// Reject forbidden keys before they reach a queue or the network.
fn check_key(key: &[u8]) -> Result<(), ClientError> {
    if key_is_valid(key) {
        Ok(())
    } else {
        Err(ClientError::MalformedKey)
    }
}

struct Bank {
    pipelines: Vec<Pipeline>,
    next: AtomicU64,
}

/// Client for a single backend.
///
/// Holds `connections_count` pipelines to the same server; tasks are placed
/// round-robin. `start` and `stop` must alternate strictly; calling either
/// out of turn is a precondition violation and panics.
pub struct Client {
    config: ClientConfig,
    bank: Mutex<Option<Bank>>,
    flights: dogpile::Flights,
}

impl Client {
    pub fn new(config: ClientConfig) -> Client {
        Client {
            config,
            bank: Mutex::new(None),
            flights: dogpile::Flights::default(),
        }
    }

    /// Launch the pipeline bank. Connections are established lazily by the
    /// pipelines themselves. Must be called within a tokio runtime.
    pub fn start(&self) {
        let mut bank = self.bank.lock();
        if bank.is_some() {
            panic!("client is already started (did you forget to call stop()?)");
        }
        let pipelines = (0..self.config.connections_count.max(1))
            .map(|_| Pipeline::spawn(self.config.clone()))
            .collect();
        *bank = Some(Bank {
            pipelines,
            next: AtomicU64::new(0),
        });
    }

    /// Stop all pipelines and join them. Requests still queued fail with a
    /// transport error; on return no worker task is running.
    pub async fn stop(&self) {
        let bank = self
            .bank
            .lock()
            .take()
            .expect("client is not started (did you forget to call start()?)");
        self.flights.clear();
        for pipeline in bank.pipelines {
            pipeline.shutdown().await;
        }
    }

    /// Round-robin task placement over the bank.
    async fn submit(&self, task: Task) -> Result<(), ClientError> {
        let sender = {
            let bank = self.bank.lock();
            let bank = bank
                .as_ref()
                .expect("client is not started (did you forget to call start()?)");
            let idx = bank.next.fetch_add(1, Ordering::Relaxed) as usize;
            bank.pipelines[idx % bank.pipelines.len()].sender()
        };
        sender.send(task).await.map_err(|_| ClientError::aborted())
    }

    async fn fetch(&self, key: Bytes) -> Result<Option<Fetched>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.submit(Task::Get { key, tx }).await?;
        rx.await.map_err(|_| ClientError::aborted())?
    }

    async fn fetch_de(
        &self,
        key: Bytes,
        grace: Duration,
    ) -> Result<Option<Fetched>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.submit(Task::GetDe { key, grace, tx }).await?;
        rx.await.map_err(|_| ClientError::aborted())?
    }

    /// Get the entry for `item.key`, filling `value` and `flags` in place.
    pub async fn get(&self, item: &mut Item) -> Result<(), ClientError> {
        check_key(&item.key)?;
        match self.fetch(item.key.clone()).await? {
            Some(fetched) => {
                item.value = fetched.value;
                item.flags = fetched.flags;
                Ok(())
            }
            None => Err(ClientError::CacheMiss),
        }
    }

    /// Fetch many keys in one request. Missing keys are absent from the
    /// result, not errors; order is unspecified.
    pub async fn get_multi(&self, keys: &[Bytes]) -> Result<Vec<Item>, ClientError> {
        for key in keys {
            check_key(key)?;
        }
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let (tx, rx) = oneshot::channel();
        self.submit(Task::GetMulti {
            keys: keys.to_vec(),
            tx,
        })
        .await?;
        rx.await.map_err(|_| ClientError::aborted())?
    }

    /// Dogpile-mitigating get: entries within `grace` of expiration read as
    /// misses, and concurrent calls for one key collapse onto a single
    /// backend request. Followers wait at most `grace` for the leader.
    pub async fn get_de(&self, item: &mut Item, grace: Duration) -> Result<(), ClientError> {
        check_key(&item.key)?;
        match self.flights.join(&item.key) {
            Role::Leader(flight) => {
                let result = self.fetch_de(item.key.clone(), grace).await;
                let outcome = match &result {
                    Ok(Some(fetched)) => FlightOutcome::Hit(fetched.clone()),
                    Ok(None) => FlightOutcome::Miss,
                    // Followers must see the real failure, not a miss the
                    // leader never established.
                    Err(e) => FlightOutcome::Failed(FlightFailure::of(e)),
                };
                flight.finish(outcome);
                match result? {
                    Some(fetched) => {
                        item.value = fetched.value;
                        item.flags = fetched.flags;
                        Ok(())
                    }
                    None => Err(ClientError::CacheMiss),
                }
            }
            Role::Follower(mut rx) => {
                match tokio::time::timeout(grace, rx.recv()).await {
                    Err(_) => Err(ClientError::Timeout),
                    Ok(Ok(FlightOutcome::Hit(fetched))) => {
                        item.value = fetched.value;
                        item.flags = fetched.flags;
                        Ok(())
                    }
                    Ok(Ok(FlightOutcome::Miss)) => Err(ClientError::CacheMiss),
                    Ok(Ok(FlightOutcome::Failed(failure))) => {
                        Err(failure.into_client_error())
                    }
                    // The slot map was cleared: the client stopped.
                    Ok(Err(_)) => Err(ClientError::aborted()),
                }
            }
        }
    }

    /// Conditional get. `NotModified` when the stored etag matches
    /// `item.etag` (the caller's value buffer is untouched); otherwise the
    /// stored etag, validate TTL, remaining expiration and value are filled
    /// in atomically.
    pub async fn cget(&self, item: &mut Citem) -> Result<(), ClientError> {
        check_key(&item.key)?;
        let (tx, rx) = oneshot::channel();
        self.submit(Task::Cget {
            key: item.key.clone(),
            etag: item.etag,
            tx,
        })
        .await?;
        match rx.await.map_err(|_| ClientError::aborted())?? {
            CgetOutcome::Miss => Err(ClientError::CacheMiss),
            CgetOutcome::NotModified => Err(ClientError::NotModified),
            CgetOutcome::Modified(fetched) => {
                item.value = fetched.value;
                item.etag = fetched.etag;
                item.validate_ttl = fetched.validate_ttl;
                item.expiration = fetched.expiration;
                Ok(())
            }
        }
    }

    /// Store `item`.
    pub async fn set(&self, item: &Item) -> Result<(), ClientError> {
        check_key(&item.key)?;
        let (tx, rx) = oneshot::channel();
        self.submit(self.set_task(item, Some(tx))).await?;
        rx.await.map_err(|_| ClientError::aborted())?
    }

    /// Fire-and-forget store; completes once the request is queued.
    pub async fn set_nowait(&self, item: &Item) -> Result<(), ClientError> {
        check_key(&item.key)?;
        self.submit(self.set_task(item, None)).await
    }

    fn set_task(
        &self,
        item: &Item,
        reply: Option<oneshot::Sender<Result<(), ClientError>>>,
    ) -> Task {
        Task::Set {
            key: item.key.clone(),
            value: item.value.clone(),
            flags: item.flags,
            exptime: encode_exptime(item.expiration),
            reply,
        }
    }

    /// Store a conditional entry.
    pub async fn cset(&self, item: &Citem) -> Result<(), ClientError> {
        check_key(&item.key)?;
        let (tx, rx) = oneshot::channel();
        self.submit(self.cset_task(item, Some(tx))).await?;
        rx.await.map_err(|_| ClientError::aborted())?
    }

    /// Fire-and-forget conditional store.
    pub async fn cset_nowait(&self, item: &Citem) -> Result<(), ClientError> {
        check_key(&item.key)?;
        self.submit(self.cset_task(item, None)).await
    }

    fn cset_task(
        &self,
        item: &Citem,
        reply: Option<oneshot::Sender<Result<(), ClientError>>>,
    ) -> Task {
        Task::Cset {
            key: item.key.clone(),
            value: item.value.clone(),
            etag: item.etag,
            exptime: encode_exptime(item.expiration),
            validate_ttl_ms: item.validate_ttl.as_millis() as u64,
            reply,
        }
    }

    /// Delete a key. `CacheMiss` if it was not present.
    pub async fn delete(&self, key: &[u8]) -> Result<(), ClientError> {
        check_key(key)?;
        let (tx, rx) = oneshot::channel();
        self.submit(Task::Delete {
            key: Bytes::copy_from_slice(key),
            reply: Some(tx),
        })
        .await?;
        match rx.await.map_err(|_| ClientError::aborted())?? {
            true => Ok(()),
            false => Err(ClientError::CacheMiss),
        }
    }

    /// Fire-and-forget delete.
    pub async fn delete_nowait(&self, key: &[u8]) -> Result<(), ClientError> {
        check_key(key)?;
        self.submit(Task::Delete {
            key: Bytes::copy_from_slice(key),
            reply: None,
        })
        .await
    }

    /// Drop every entry on the backend now.
    pub async fn flush_all(&self) -> Result<(), ClientError> {
        self.flush(None).await
    }

    /// Drop every current entry `delay` from now.
    pub async fn flush_all_delayed(&self, delay: Duration) -> Result<(), ClientError> {
        self.flush(Some(delay.as_secs())).await
    }

    /// Fire-and-forget flush.
    pub async fn flush_all_nowait(&self) -> Result<(), ClientError> {
        self.submit(Task::FlushAll {
            delay_secs: None,
            reply: None,
        })
        .await
    }

    /// Fire-and-forget delayed flush.
    pub async fn flush_all_delayed_nowait(&self, delay: Duration) -> Result<(), ClientError> {
        self.submit(Task::FlushAll {
            delay_secs: Some(delay.as_secs()),
            reply: None,
        })
        .await
    }

    async fn flush(&self, delay_secs: Option<u64>) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.submit(Task::FlushAll {
            delay_secs,
            reply: Some(tx),
        })
        .await?;
        rx.await.map_err(|_| ClientError::aborted())?
    }
}
