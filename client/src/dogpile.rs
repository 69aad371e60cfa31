//! Singleflight coordination for `get_de`.
//!
//! Concurrent `get_de` calls for the same key collapse onto one in-flight
//! backend request: the first arrival installs a slot and performs the
//! read, later arrivals subscribe to the slot and wait (bounded by their
//! grace window) for the leader's outcome. The published outcome carries
//! hits, misses, and the leader's failure — a follower must never see a
//! fabricated miss when the leader merely failed to reach the backend.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use tokio::sync::broadcast;

use crate::command::Fetched;
use crate::error::ClientError;

/// What the leader's backend read produced, in a form that can fan out to
/// every follower.
#[derive(Debug, Clone)]
pub(crate) enum FlightOutcome {
    Hit(Fetched),
    Miss,
    Failed(FlightFailure),
}

/// A clonable copy of the leader's error. `ClientError` owns an
/// `io::Error` and cannot be cloned, so the failure is rebuilt per
/// follower.
#[derive(Debug, Clone)]
pub(crate) enum FlightFailure {
    Transport(io::ErrorKind, String),
    Protocol(String),
    Server(String),
}

impl FlightFailure {
    pub fn of(err: &ClientError) -> FlightFailure {
        match err {
            ClientError::Transport(e) => FlightFailure::Transport(e.kind(), e.to_string()),
            ClientError::Protocol(s) => FlightFailure::Protocol(s.clone()),
            ClientError::Server(s) => FlightFailure::Server(s.clone()),
            other => FlightFailure::Transport(io::ErrorKind::Other, other.to_string()),
        }
    }

    pub fn into_client_error(self) -> ClientError {
        match self {
            FlightFailure::Transport(kind, msg) => {
                ClientError::Transport(io::Error::new(kind, msg))
            }
            FlightFailure::Protocol(s) => ClientError::Protocol(s),
            FlightFailure::Server(s) => ClientError::Server(s),
        }
    }
}

/// The in-flight slot map. One per client.
#[derive(Default)]
pub(crate) struct Flights {
    slots: Mutex<HashMap<Bytes, broadcast::Sender<FlightOutcome>>>,
}

/// What a `get_de` caller became after joining a flight.
pub(crate) enum Role<'a> {
    /// First arrival: performs the backend read, then publishes through the
    /// guard.
    Leader(FlightGuard<'a>),
    /// Later arrival: waits for the leader's outcome.
    Follower(broadcast::Receiver<FlightOutcome>),
}

impl Flights {
    pub fn join(&self, key: &Bytes) -> Role<'_> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(key) {
            return Role::Follower(slot.subscribe());
        }
        let (tx, _rx) = broadcast::channel(1);
        slots.insert(key.clone(), tx);
        Role::Leader(FlightGuard {
            flights: self,
            key: key.clone(),
            done: false,
        })
    }

    /// Drop every slot. Waiting followers observe a closed channel.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    fn publish(&self, key: &Bytes, outcome: FlightOutcome) {
        // Remove the slot before publishing: a caller arriving after the
        // outcome starts a fresh flight instead of reading a stale one.
        let slot = self.slots.lock().remove(key);
        if let Some(tx) = slot {
            let _ = tx.send(outcome);
        }
    }
}

/// Leadership of one flight. Publishing consumes the guard; if the leader's
/// future is dropped instead, the guard publishes an aborted-transport
/// failure so followers are never stranded or misled.
pub(crate) struct FlightGuard<'a> {
    flights: &'a Flights,
    key: Bytes,
    done: bool,
}

impl FlightGuard<'_> {
    pub fn finish(mut self, outcome: FlightOutcome) {
        self.done = true;
        self.flights.publish(&self.key, outcome);
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.flights.publish(
                &self.key,
                FlightOutcome::Failed(FlightFailure::Transport(
                    io::ErrorKind::ConnectionAborted,
                    "request aborted".to_string(),
                )),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn leader_then_followers() {
        let flights = Flights::default();
        let key = Bytes::from_static(b"key");

        let Role::Leader(guard) = flights.join(&key) else {
            panic!("first arrival must lead");
        };
        let Role::Follower(mut rx) = flights.join(&key) else {
            panic!("second arrival must follow");
        };

        guard.finish(FlightOutcome::Hit(Fetched {
            value: Bytes::from_static(b"v"),
            flags: 7,
        }));
        match rx.recv().await.unwrap() {
            FlightOutcome::Hit(fetched) => {
                assert_eq!(fetched.value, Bytes::from_static(b"v"));
                assert_eq!(fetched.flags, 7);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        // The slot is gone; the next arrival leads a fresh flight.
        assert!(matches!(flights.join(&key), Role::Leader(_)));
    }

    #[tokio::test]
    async fn leader_miss_reaches_followers() {
        let flights = Flights::default();
        let key = Bytes::from_static(b"key");

        let Role::Leader(guard) = flights.join(&key) else {
            panic!("first arrival must lead");
        };
        let Role::Follower(mut rx) = flights.join(&key) else {
            panic!("second arrival must follow");
        };

        guard.finish(FlightOutcome::Miss);
        assert!(matches!(rx.recv().await.unwrap(), FlightOutcome::Miss));
    }

    #[tokio::test]
    async fn leader_failure_is_not_a_miss() {
        let flights = Flights::default();
        let key = Bytes::from_static(b"key");

        let Role::Leader(guard) = flights.join(&key) else {
            panic!("first arrival must lead");
        };
        let Role::Follower(mut rx) = flights.join(&key) else {
            panic!("second arrival must follow");
        };

        let err = ClientError::aborted();
        guard.finish(FlightOutcome::Failed(FlightFailure::of(&err)));
        match rx.recv().await.unwrap() {
            FlightOutcome::Failed(failure) => match failure.into_client_error() {
                ClientError::Transport(e) => {
                    assert_eq!(e.kind(), io::ErrorKind::ConnectionAborted);
                }
                other => panic!("unexpected error: {other:?}"),
            },
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_leader_publishes_failure() {
        let flights = Flights::default();
        let key = Bytes::from_static(b"key");

        let Role::Leader(guard) = flights.join(&key) else {
            panic!("first arrival must lead");
        };
        let Role::Follower(mut rx) = flights.join(&key) else {
            panic!("second arrival must follow");
        };

        drop(guard);
        assert!(matches!(
            rx.recv().await.unwrap(),
            FlightOutcome::Failed(_)
        ));
    }
}
