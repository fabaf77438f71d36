//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use crate::cache::CanonicalRequest;
use crate::domain::entities::{CapturedResponse, ResponseRecord};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Outcome of [`ExchangeStore::get_or_create_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSlot {
    pub id: i64,
    pub created: bool,
}

/// Durable storage of request identities and their cached responses.
///
/// Every method holds a pooled connection only for the statement it runs.
#[async_trait]
pub trait ExchangeStore: Send + Sync {
    /// Return the record id for `request`, inserting it when absent.
    ///
    /// Exactly one concurrent caller per key observes `created == true`; the others get the
    /// existing id. Unique-index conflicts are resolved here and never returned.
    async fn get_or_create_request(
        &self,
        request: &CanonicalRequest,
    ) -> Result<RequestSlot, RepoError>;

    async fn get_response(&self, request_id: i64) -> Result<Option<ResponseRecord>, RepoError>;

    /// Persist the response for `request_id`. Fails with [`RepoError::Duplicate`] when one
    /// already exists.
    async fn put_response(
        &self,
        request_id: i64,
        response: &CapturedResponse,
    ) -> Result<(), RepoError>;

    /// Attach the observed request body. Empty bodies are ignored.
    async fn attach_request_body(&self, request_id: i64, body: &[u8]) -> Result<(), RepoError>;

    /// Mark the fetch attempt of a response-less record as given up, so the next caller can
    /// take the record over without waiting for a lease to expire.
    async fn release_request(&self, request_id: i64) -> Result<(), RepoError>;

    /// Take over a response-less record whose last fetch attempt was released, or started
    /// before `stale_before` when a lease applies. The attempt is stamped with `now`.
    /// Returns `true` for the single caller that won.
    async fn reclaim_request(
        &self,
        request_id: i64,
        stale_before: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Result<bool, RepoError>;
}
