use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{application::repos::RepoError, domain::error::DomainError, infra::error::InfraError};

/// Diagnostic chain attached to generated error responses.
///
/// The response logger reads it back out of the extensions, and the caching layer uses its
/// presence to tell a proxy-generated failure apart from an upstream reply.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: &'static str,
    report: ErrorReport,
}

impl HttpError {
    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        error: &dyn StdError,
    ) -> Self {
        let report = ErrorReport::from_error(source, status, error);
        Self {
            status,
            public_message,
            report,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.public_message).into_response();
        self.report.attach(&mut response);
        response
    }
}

/// Failures on the proxy path, one variant per way a client can be let down.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("request cannot be proxied")]
    InvalidTarget(#[source] DomainError),
    #[error("cache store unavailable")]
    StoreUnavailable(#[from] RepoError),
    #[error("upstream unreachable")]
    UpstreamUnreachable(#[source] InfraError),
    #[error("gave up waiting for in-flight fetch after {waited_ms} ms")]
    WaiterTimeout { waited_ms: u128 },
    #[error("in-flight fetch failed: {reason}")]
    OwnerFailed { reason: String },
    #[error("cached response headers are malformed")]
    MalformedStoredHeaders(#[source] DomainError),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            ProxyError::StoreUnavailable(_) | ProxyError::MalformedStoredHeaders(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::UpstreamUnreachable(_) | ProxyError::OwnerFailed { .. } => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::WaiterTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn report_source(&self) -> &'static str {
        match self {
            ProxyError::UpstreamUnreachable(_) => "infra::http::proxy",
            _ => "cache::middleware",
        }
    }

    fn presentation_message(&self) -> &'static str {
        match self {
            ProxyError::InvalidTarget(_) => "Proxy requests must use an absolute URI",
            ProxyError::StoreUnavailable(_) => "Cache store unavailable",
            ProxyError::MalformedStoredHeaders(_) => "Cached response is corrupt",
            ProxyError::UpstreamUnreachable(_) | ProxyError::OwnerFailed { .. } => "Bad gateway",
            ProxyError::WaiterTimeout { .. } => "Gateway timeout",
        }
    }
}

impl From<ProxyError> for HttpError {
    fn from(error: ProxyError) -> Self {
        HttpError::from_error(
            error.report_source(),
            error.status_code(),
            error.presentation_message(),
            &error,
        )
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        HttpError::from(self).into_response()
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}
