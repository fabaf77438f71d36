//! Canonical request identity.
//!
//! A [`CanonicalKey`] is the tuple the `reqs` unique index is built on. Scheme travels
//! alongside in [`CanonicalRequest`] for storage but never takes part in comparisons.

use axum::http::{HeaderMap, Method, Uri, header};

use crate::domain::{error::DomainError, headers::HeaderMultimap};

/// Identity of a proxied request: host with optional port, path, method and the serialized
/// header multimap.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalKey {
    pub host_and_port: String,
    pub path: String,
    pub method: String,
    pub headers: Vec<u8>,
}

/// A canonical key plus the scheme it was requested with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRequest {
    pub scheme: String,
    pub key: CanonicalKey,
}

impl CanonicalRequest {
    pub fn new(
        scheme: &str,
        host: &str,
        port: Option<u16>,
        path: &str,
        method: &str,
        headers: &HeaderMultimap,
    ) -> Self {
        let host = host.to_ascii_lowercase();
        let host_and_port = match port {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };

        Self {
            scheme: scheme.to_ascii_lowercase(),
            key: CanonicalKey {
                host_and_port,
                path: path.to_string(),
                method: method.to_string(),
                headers: headers.serialize(),
            },
        }
    }

    /// Build the identity of an absolute-form proxy request.
    ///
    /// `Host` is left out of the header blob: the upstream request is always sent with the
    /// target authority as its host, which `host_and_port` already captures. The query
    /// string stays part of `path`.
    pub fn from_parts(method: &Method, uri: &Uri, headers: &HeaderMap) -> Result<Self, DomainError> {
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| DomainError::invalid_target("request URI has no scheme"))?;
        let authority = uri
            .authority()
            .ok_or_else(|| DomainError::invalid_target("request URI has no authority"))?;
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/");

        let headers = HeaderMultimap::from_header_map(headers, &[header::HOST]);

        Ok(Self::new(
            scheme,
            authority.host(),
            authority.port_u16(),
            path,
            method.as_str(),
            &headers,
        ))
    }
}
