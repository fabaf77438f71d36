//! Process-local registry of fetches that are currently owned by a request.
//!
//! Waiters in the same process subscribe to the owner's channel and wake as soon as the
//! owner publishes or fails. Waiters in other processes, or ones that arrive after the
//! entry is gone, fall back to polling the store.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

use super::keys::CanonicalKey;

/// Lifecycle of an owned fetch, as observed by waiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlightState {
    Pending,
    /// The response record has been committed.
    Published,
    Failed(Arc<str>),
}

struct Flight {
    id: u64,
    tx: Arc<watch::Sender<FlightState>>,
}

/// Tracks canonical keys with an owner fetching in this process.
#[derive(Default, Clone)]
pub struct InFlightExchanges {
    flights: Arc<DashMap<CanonicalKey, Flight>>,
    next_id: Arc<AtomicU64>,
}

impl InFlightExchanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the caller as the owner of `key`.
    ///
    /// Any previous entry for the key is replaced; its receivers observe a closed channel
    /// and go back to polling.
    pub fn acquire(&self, key: CanonicalKey) -> FlightGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, _rx) = watch::channel(FlightState::Pending);
        let tx = Arc::new(tx);
        self.flights.insert(
            key.clone(),
            Flight {
                id,
                tx: Arc::clone(&tx),
            },
        );

        FlightGuard {
            key,
            id,
            tx,
            flights: Arc::clone(&self.flights),
            finished: false,
        }
    }

    /// Subscribe to the owner of `key`, if one is fetching in this process.
    pub fn subscribe(&self, key: &CanonicalKey) -> Option<watch::Receiver<FlightState>> {
        self.flights.get(key).map(|flight| flight.tx.subscribe())
    }

    pub fn contains(&self, key: &CanonicalKey) -> bool {
        self.flights.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }
}

/// Ownership of one fetch. Dropping it without an outcome reports failure to waiters.
pub struct FlightGuard {
    key: CanonicalKey,
    id: u64,
    tx: Arc<watch::Sender<FlightState>>,
    flights: Arc<DashMap<CanonicalKey, Flight>>,
    finished: bool,
}

impl FlightGuard {
    pub fn publish(mut self) {
        self.finish(FlightState::Published);
    }

    pub fn fail(mut self, reason: impl Into<Arc<str>>) {
        self.finish(FlightState::Failed(reason.into()));
    }

    fn finish(&mut self, state: FlightState) {
        if self.finished {
            return;
        }
        self.finished = true;

        let waiters = self.tx.receiver_count();
        self.tx.send_replace(state);
        self.flights.remove_if(&self.key, |_, flight| flight.id == self.id);
        debug!(
            host = %self.key.host_and_port,
            path = %self.key.path,
            waiters,
            "released in-flight fetch"
        );
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.finish(FlightState::Failed(Arc::from("owner abandoned the fetch")));
    }
}
