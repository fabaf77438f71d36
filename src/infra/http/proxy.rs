use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    response::{IntoResponse, Response},
};

use crate::{application::error::ProxyError, infra::upstream::UpstreamClient};

/// Forward the request to its absolute target and relay the origin's reply.
///
/// Transport failures become a 502 carrying an error report, which the caching layer
/// treats as a failed fetch.
pub async fn forward(
    State(upstream): State<Arc<UpstreamClient>>,
    request: Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();
    match upstream
        .fetch(parts.method, &parts.uri, parts.headers, body)
        .await
    {
        Ok(response) => response,
        Err(err) => ProxyError::UpstreamUnreachable(err).into_response(),
    }
}
