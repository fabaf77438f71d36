//! Request deduplication and persistent response caching.
//!
//! - [`CanonicalRequest`] derives the identity a request is memoized under.
//! - [`Coordinator`] decides whether a caller serves a stored response, fetches as the
//!   single owner of its key, or waits for that owner.
//! - [`response_cache_layer`] wires both into the request lifecycle.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! waiter_timeout_seconds = 30
//! waiter_backoff_initial_ms = 10
//! waiter_backoff_max_ms = 500
//! # owner_lease_seconds = 300
//! ```

mod config;
mod coordinator;
mod inflight;
mod keys;
mod lock;
mod middleware;
mod tee;

pub use config::CacheConfig;
pub use coordinator::{Coordinator, OwnerTicket, Resolution, WaitError, WaitTicket};
pub use inflight::{FlightGuard, FlightState, InFlightExchanges};
pub use keys::{CanonicalKey, CanonicalRequest};
pub use middleware::{CacheState, response_cache_layer};
pub use tee::BodyCapture;
