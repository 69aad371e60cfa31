//! Consistently-sharded client over a dynamic set of backends.
//!
//! Membership is an insertion-ordered list; a stable FNV-1a hash of the key
//! picks the member. There is deliberately no rebalancing: adding or
//! removing a server shifts the placement of existing keys, which callers
//! tolerate as cache invalidation.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use crate::config::DistributedConfig;
use crate::error::ClientError;
use crate::item::{Citem, Item};
use crate::{check_key, Client};

/// Route a key to a member index using FNV-1a.
///
/// The hash must be stable across processes and runs: it decides which
/// backend owns a key, and every client instance has to agree.
fn route_key(key: &[u8], members: usize) -> usize {
    if members <= 1 {
        return 0;
    }
    (fnv1a(key) as usize) % members
}

/// FNV-1a, 32-bit.
fn fnv1a(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in data {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

struct Member {
    addr: String,
    client: Arc<Client>,
}

struct State {
    started: bool,
    members: Vec<Member>,
}

/// Client over zero or more backends.
///
/// Every operation of [`Client`] is available and routes by key; broadcast
/// operations fan out to all members. With zero members every operation
/// fails with [`ClientError::NoServers`].
pub struct DistributedClient {
    config: DistributedConfig,
    state: Mutex<State>,
}

impl Default for DistributedClient {
    fn default() -> Self {
        Self::new(DistributedConfig::default())
    }
}

impl DistributedClient {
    pub fn new(config: DistributedConfig) -> DistributedClient {
        DistributedClient {
            config,
            state: Mutex::new(State {
                started: false,
                members: Vec::new(),
            }),
        }
    }

    /// Start every member client. `start`/`stop` must alternate strictly.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if state.started {
            panic!("distributed client is already started (did you forget to call stop()?)");
        }
        state.started = true;
        for member in &state.members {
            member.client.start();
        }
    }

    /// Stop every member client, in reverse insertion order, and join their
    /// workers.
    pub async fn stop(&self) {
        let clients: Vec<Arc<Client>> = {
            let mut state = self.state.lock();
            if !state.started {
                panic!("distributed client is not started (did you forget to call start()?)");
            }
            state.started = false;
            state.members.iter().rev().map(|m| m.client.clone()).collect()
        };
        for client in clients {
            client.stop().await;
        }
    }

    /// Add a backend. The underlying client starts lazily iff the
    /// distributed client is running.
    pub fn add_server(&self, addr: &str) {
        let client = Arc::new(Client::new(self.config.client_config(addr)));
        let mut state = self.state.lock();
        if state.started {
            client.start();
        }
        state.members.push(Member {
            addr: addr.to_string(),
            client,
        });
    }

    /// Remove a backend by address, stopping its client if running. Removal
    /// shifts the key mapping; that is documented behavior.
    pub async fn delete_server(&self, addr: &str) {
        let removed = {
            let mut state = self.state.lock();
            match state.members.iter().position(|m| m.addr == addr) {
                Some(idx) => {
                    let member = state.members.remove(idx);
                    state.started.then_some(member.client)
                }
                None => None,
            }
        };
        if let Some(client) = removed {
            client.stop().await;
        }
    }

    /// The member owning `key`.
    fn route(&self, key: &[u8]) -> Result<Arc<Client>, ClientError> {
        let state = self.state.lock();
        if !state.started {
            panic!("distributed client is not started (did you forget to call start()?)");
        }
        if state.members.is_empty() {
            return Err(ClientError::NoServers);
        }
        let idx = route_key(key, state.members.len());
        Ok(state.members[idx].client.clone())
    }

    /// A snapshot of every member, for fan-out operations.
    fn members(&self) -> Result<Vec<Arc<Client>>, ClientError> {
        let state = self.state.lock();
        if !state.started {
            panic!("distributed client is not started (did you forget to call start()?)");
        }
        if state.members.is_empty() {
            return Err(ClientError::NoServers);
        }
        Ok(state.members.iter().map(|m| m.client.clone()).collect())
    }

    pub async fn get(&self, item: &mut Item) -> Result<(), ClientError> {
        check_key(&item.key)?;
        self.route(&item.key)?.get(item).await
    }

    /// Scatter/gather multi-get: keys are partitioned by destination under
    /// one membership snapshot, fanned out in parallel, and concatenated.
    /// Any member error fails the whole call; partial replies are discarded.
    pub async fn get_multi(&self, keys: &[Bytes]) -> Result<Vec<Item>, ClientError> {
        for key in keys {
            check_key(key)?;
        }
        let members = self.members()?;
        let mut parts: Vec<Vec<Bytes>> = vec![Vec::new(); members.len()];
        for key in keys {
            parts[route_key(key, members.len())].push(key.clone());
        }

        let mut fanout = JoinSet::new();
        for (client, part) in members.into_iter().zip(parts) {
            if part.is_empty() {
                continue;
            }
            fanout.spawn(async move { client.get_multi(&part).await });
        }

        let mut items = Vec::with_capacity(keys.len());
        let mut first_err = None;
        while let Some(joined) = fanout.join_next().await {
            match joined {
                Ok(Ok(mut part)) => items.append(&mut part),
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(_) => {
                    first_err.get_or_insert(ClientError::aborted());
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(items),
        }
    }

    pub async fn get_de(&self, item: &mut Item, grace: Duration) -> Result<(), ClientError> {
        check_key(&item.key)?;
        self.route(&item.key)?.get_de(item, grace).await
    }

    pub async fn cget(&self, item: &mut Citem) -> Result<(), ClientError> {
        check_key(&item.key)?;
        self.route(&item.key)?.cget(item).await
    }

    pub async fn set(&self, item: &Item) -> Result<(), ClientError> {
        check_key(&item.key)?;
        self.route(&item.key)?.set(item).await
    }

    pub async fn set_nowait(&self, item: &Item) -> Result<(), ClientError> {
        check_key(&item.key)?;
        self.route(&item.key)?.set_nowait(item).await
    }

    pub async fn cset(&self, item: &Citem) -> Result<(), ClientError> {
        check_key(&item.key)?;
        self.route(&item.key)?.cset(item).await
    }

    pub async fn cset_nowait(&self, item: &Citem) -> Result<(), ClientError> {
        check_key(&item.key)?;
        self.route(&item.key)?.cset_nowait(item).await
    }

    pub async fn delete(&self, key: &[u8]) -> Result<(), ClientError> {
        check_key(key)?;
        self.route(key)?.delete(key).await
    }

    pub async fn delete_nowait(&self, key: &[u8]) -> Result<(), ClientError> {
        check_key(key)?;
        self.route(key)?.delete_nowait(key).await
    }

    /// Broadcast an immediate flush to every member. Any member error fails
    /// the call after all branches complete.
    pub async fn flush_all(&self) -> Result<(), ClientError> {
        self.broadcast_flush(None).await
    }

    /// Broadcast a delayed flush to every member.
    pub async fn flush_all_delayed(&self, delay: Duration) -> Result<(), ClientError> {
        self.broadcast_flush(Some(delay)).await
    }

    /// Fire-and-forget broadcast flush; never reports errors.
    pub async fn flush_all_nowait(&self) {
        if let Ok(members) = self.members() {
            for client in members {
                let _ = client.flush_all_nowait().await;
            }
        }
    }

    /// Fire-and-forget broadcast delayed flush; never reports errors.
    pub async fn flush_all_delayed_nowait(&self, delay: Duration) {
        if let Ok(members) = self.members() {
            for client in members {
                let _ = client.flush_all_delayed_nowait(delay).await;
            }
        }
    }

    async fn broadcast_flush(&self, delay: Option<Duration>) -> Result<(), ClientError> {
        let members = self.members()?;
        let mut fanout = JoinSet::new();
        for client in members {
            fanout.spawn(async move {
                match delay {
                    Some(delay) => client.flush_all_delayed(delay).await,
                    None => client.flush_all().await,
                }
            });
        }
        let mut first_err = None;
        while let Some(joined) = fanout.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_err.get_or_insert(e);
                }
                Err(_) => {
                    first_err.get_or_insert(ClientError::aborted());
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_member_always_zero() {
        assert_eq!(route_key(b"any-key", 1), 0);
        assert_eq!(route_key(b"", 1), 0);
    }

    #[test]
    fn routing_is_deterministic() {
        assert_eq!(route_key(b"some-key", 5), route_key(b"some-key", 5));
    }

    #[test]
    fn routing_spreads_keys() {
        let mut counts = [0u32; 4];
        for i in 0..1000u32 {
            let key = format!("key_{i}");
            counts[route_key(key.as_bytes(), 4)] += 1;
        }
        for count in &counts {
            assert!(*count > 100, "poor distribution: {counts:?}");
        }
    }
}
