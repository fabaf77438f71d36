use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("malformed header block at line {line}: {reason}")]
    MalformedHeaders { line: usize, reason: String },
    #[error("request target cannot be proxied: {reason}")]
    InvalidTarget { reason: String },
    #[error("stored status code {status} is not a valid HTTP status")]
    InvalidStatus { status: i64 },
}

impl DomainError {
    pub fn malformed_headers(line: usize, reason: impl Into<String>) -> Self {
        Self::MalformedHeaders {
            line,
            reason: reason.into(),
        }
    }

    pub fn invalid_target(reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            reason: reason.into(),
        }
    }
}
