//! Single-flight arbitration between concurrent identical requests.

use std::{sync::Arc, time::Duration};

use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::{sync::watch, time::Instant};
use tracing::{debug, instrument, warn};

use super::{
    CacheConfig,
    inflight::{FlightGuard, FlightState, InFlightExchanges},
    keys::{CanonicalKey, CanonicalRequest},
};
use crate::{
    application::{
        error::ProxyError,
        repos::{ExchangeStore, RepoError},
    },
    domain::entities::ResponseRecord,
};

/// How a caller participates in the fetch for its key.
pub enum Resolution {
    /// A stored response exists and can be served directly.
    Ready(ResponseRecord),
    /// The caller fetches from upstream and must report the outcome.
    Owner(OwnerTicket),
    /// Another caller is fetching; wait for its result.
    Waiter(WaitTicket),
}

/// Obligations of the caller that won ownership of a key.
///
/// A ticket dropped without an outcome (the request future was cancelled) releases the
/// record in a background task before failing the flight.
pub struct OwnerTicket {
    request_id: i64,
    store: Arc<dyn ExchangeStore>,
    guard: Option<FlightGuard>,
}

impl OwnerTicket {
    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    /// Announce that the response record is committed.
    pub fn publish(mut self) {
        if let Some(guard) = self.guard.take() {
            guard.publish();
        }
    }

    /// Give the record up for the next caller, then release waiters with a failure.
    /// Nothing was persisted.
    pub async fn fail(mut self, reason: impl Into<Arc<str>>) {
        release_record(self.store.as_ref(), self.request_id).await;
        if let Some(guard) = self.guard.take() {
            guard.fail(reason);
        }
    }
}

impl Drop for OwnerTicket {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let request_id = self.request_id;
        runtime.spawn(async move {
            release_record(store.as_ref(), request_id).await;
            drop(guard);
        });
    }
}

async fn release_record(store: &dyn ExchangeStore, request_id: i64) {
    if let Err(err) = store.release_request(request_id).await {
        warn!(request_id, error = %err, "failed to release request record");
    }
}

pub struct WaitTicket {
    request_id: i64,
    key: CanonicalKey,
    flight: Option<watch::Receiver<FlightState>>,
}

impl WaitTicket {
    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    /// Whether an owner in this process will notify the waiter directly.
    pub fn is_subscribed(&self) -> bool {
        self.flight.is_some()
    }
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("no response after {waited:?}")]
    Timeout { waited: Duration },
    #[error("owner failed: {reason}")]
    OwnerFailed { reason: Arc<str> },
    #[error(transparent)]
    Store(#[from] RepoError),
}

impl From<WaitError> for ProxyError {
    fn from(error: WaitError) -> Self {
        match error {
            WaitError::Timeout { waited } => ProxyError::WaiterTimeout {
                waited_ms: waited.as_millis(),
            },
            WaitError::OwnerFailed { reason } => ProxyError::OwnerFailed {
                reason: reason.to_string(),
            },
            WaitError::Store(err) => ProxyError::StoreUnavailable(err),
        }
    }
}

/// Decides, per canonical key, who fetches and who waits.
pub struct Coordinator {
    store: Arc<dyn ExchangeStore>,
    flights: InFlightExchanges,
    config: CacheConfig,
}

impl Coordinator {
    pub fn new(store: Arc<dyn ExchangeStore>, config: CacheConfig) -> Self {
        Self {
            store,
            flights: InFlightExchanges::new(),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ExchangeStore> {
        &self.store
    }

    pub fn flights(&self) -> &InFlightExchanges {
        &self.flights
    }

    #[instrument(skip_all, fields(host = %request.key.host_and_port, path = %request.key.path))]
    pub async fn resolve(&self, request: &CanonicalRequest) -> Result<Resolution, RepoError> {
        let slot = self.store.get_or_create_request(request).await?;
        if slot.created {
            debug!(request_id = slot.id, "became owner of new request record");
            return Ok(Resolution::Owner(self.own(slot.id, request)));
        }

        if let Some(record) = self.store.get_response(slot.id).await? {
            return Ok(Resolution::Ready(record));
        }

        if !self.flights.contains(&request.key) {
            let now = OffsetDateTime::now_utc();
            let stale_before = self.config.owner_lease.map(|lease| now - lease);
            if self.store.reclaim_request(slot.id, stale_before, now).await? {
                counter!("mnemo_cache_reclaim_total").increment(1);
                debug!(request_id = slot.id, "took over released or stale request record");
                return Ok(Resolution::Owner(self.own(slot.id, request)));
            }
        }

        Ok(Resolution::Waiter(WaitTicket {
            request_id: slot.id,
            key: request.key.clone(),
            flight: self.flights.subscribe(&request.key),
        }))
    }

    fn own(&self, request_id: i64, request: &CanonicalRequest) -> OwnerTicket {
        OwnerTicket {
            request_id,
            store: Arc::clone(&self.store),
            guard: Some(self.flights.acquire(request.key.clone())),
        }
    }

    /// Block until the owner's response is stored, the owner fails, or the wait times out.
    ///
    /// A waiter that found no local owner keeps trying to subscribe on every poll, since the
    /// owner registers only after its record insert has returned.
    #[instrument(skip_all, fields(request_id = ticket.request_id))]
    pub async fn wait(&self, ticket: WaitTicket) -> Result<ResponseRecord, WaitError> {
        let WaitTicket {
            request_id,
            key,
            mut flight,
        } = ticket;
        let started = Instant::now();
        let deadline = started + self.config.waiter_timeout;
        let mut delay = self.config.backoff_initial;

        loop {
            if flight.is_none() {
                flight = self.flights.subscribe(&key);
            }
            if let Some(rx) = flight.as_mut()
                && let FlightState::Failed(reason) = &*rx.borrow_and_update()
            {
                return Err(WaitError::OwnerFailed {
                    reason: Arc::clone(reason),
                });
            }

            if let Some(record) = self.store.get_response(request_id).await? {
                return Ok(record);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout {
                    waited: now - started,
                });
            }
            let nap = delay.min(deadline - now);

            let mut closed = false;
            match flight.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        _ = tokio::time::sleep(nap) => {}
                        changed = rx.changed() => closed = changed.is_err(),
                    }
                }
                None => tokio::time::sleep(nap).await,
            }
            if closed {
                flight = None;
            }

            delay = self.config.next_backoff(delay);
        }
    }
}
