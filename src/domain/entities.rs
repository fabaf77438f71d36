use bytes::Bytes;
use time::OffsetDateTime;

use super::error::DomainError;
use super::headers::HeaderMultimap;

/// A distinct canonical request identity, as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub id: i64,
    pub scheme: String,
    pub host_and_port: String,
    pub path: String,
    pub method: String,
    pub headers: Vec<u8>,
    pub created_at: OffsetDateTime,
    pub body: Option<Vec<u8>>,
}

/// The cached upstream reply for one request record. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    pub req_id: i64,
    pub status: u16,
    pub headers: Vec<u8>,
    pub created_at: OffsetDateTime,
    pub body: Bytes,
}

impl ResponseRecord {
    pub fn header_multimap(&self) -> Result<HeaderMultimap, DomainError> {
        HeaderMultimap::parse(&self.headers)
    }
}

/// A captured upstream reply ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedResponse {
    pub status: u16,
    pub headers: HeaderMultimap,
    pub body: Bytes,
}
