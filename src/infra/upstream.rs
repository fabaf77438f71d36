//! Outbound HTTP client used to reach origin servers.

use axum::{
    body::{Body, HttpBody},
    http::{HeaderMap, HeaderName, Method, StatusCode, Uri, header},
    response::Response,
};
use futures::TryStreamExt;
use tracing::{debug, instrument};
use url::Url;

use crate::config::UpstreamSettings;

use super::error::InfraError;

/// Connection-scoped headers that must not be relayed from the origin to the client.
pub const HOP_BY_HOP_HEADERS: [HeaderName; 7] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::TRANSFER_ENCODING,
    HeaderName::from_static("proxy-connection"),
    header::TE,
    header::TRAILER,
    header::UPGRADE,
];

#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(settings: &UpstreamSettings) -> Result<Self, InfraError> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .connect_timeout(settings.connect_timeout);
        if let Some(timeout) = settings.request_timeout {
            builder = builder.timeout(timeout);
        }

        let client = builder
            .build()
            .map_err(|err| InfraError::upstream(format!("failed to build client: {err}")))?;
        Ok(Self { client })
    }

    /// Send `method target` with the given headers and body, returning the origin's reply
    /// with hop-by-hop headers removed and the body still streaming.
    ///
    /// The client's `Host` header is replaced by the target authority, so the origin always
    /// sees the host the request is cached under.
    #[instrument(skip_all, fields(method = %method, target = %target))]
    pub async fn fetch(
        &self,
        method: Method,
        target: &Uri,
        mut headers: HeaderMap,
        body: Body,
    ) -> Result<Response, InfraError> {
        let url = Url::parse(&target.to_string())
            .map_err(|err| InfraError::upstream(format!("invalid target `{target}`: {err}")))?;
        headers.remove(header::HOST);

        let mut outbound = self.client.request(method, url).headers(headers);
        if body.size_hint().exact() != Some(0) {
            outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream = outbound
            .send()
            .await
            .map_err(|err| InfraError::upstream(describe_reqwest_error(&err)))?;

        let status: StatusCode = upstream.status();
        debug!(status = status.as_u16(), "upstream responded");

        let mut relayed_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut relayed_headers);

        let stream = upstream.bytes_stream().map_err(std::io::Error::other);
        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = relayed_headers;
        Ok(response)
    }
}

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn describe_reqwest_error(err: &reqwest::Error) -> String {
    let kind = if err.is_connect() {
        "connect"
    } else if err.is_timeout() {
        "timeout"
    } else if err.is_request() {
        "request"
    } else {
        "transport"
    };

    let mut message = format!("{kind} error: {err}");
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}
