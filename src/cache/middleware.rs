//! Caching proxy middleware.
//!
//! Wraps the forwarding handler: answers hits from the store, parks duplicate requests
//! behind the owner of their key, and tees the owner's upstream exchange into the store.

use std::{io, sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use super::{
    coordinator::{Coordinator, OwnerTicket, Resolution, WaitError},
    keys::CanonicalRequest,
    tee::BodyCapture,
};
use crate::{
    application::error::{ErrorReport, ProxyError},
    domain::{
        entities::{CapturedResponse, ResponseRecord},
        error::DomainError,
        headers::HeaderMultimap,
    },
};

const RELAY_BUFFER_CHUNKS: usize = 16;

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub coordinator: Arc<Coordinator>,
}

impl CacheState {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

/// Middleware that memoizes upstream exchanges.
///
/// Every proxied request passes through here. Only the single owner of a key reaches the
/// inner handler.
#[instrument(skip_all, fields(method = %request.method(), uri = %request.uri()))]
pub async fn response_cache_layer(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let canonical =
        match CanonicalRequest::from_parts(request.method(), request.uri(), request.headers()) {
            Ok(canonical) => canonical,
            Err(err) => return ProxyError::InvalidTarget(err).into_response(),
        };

    let resolution = match cache.coordinator.resolve(&canonical).await {
        Ok(resolution) => resolution,
        Err(err) => return ProxyError::from(err).into_response(),
    };

    match resolution {
        Resolution::Ready(record) => {
            counter!("mnemo_cache_hit_total").increment(1);
            debug!(cache = "store", outcome = "hit", request_id = record.req_id);
            serve_stored(record).unwrap_or_else(IntoResponse::into_response)
        }
        Resolution::Waiter(ticket) => {
            counter!("mnemo_cache_wait_total").increment(1);
            debug!(
                cache = "store",
                outcome = "wait",
                request_id = ticket.request_id(),
                subscribed = ticket.is_subscribed()
            );
            let started = Instant::now();
            let outcome = cache.coordinator.wait(ticket).await;
            histogram!("mnemo_cache_wait_ms").record(started.elapsed().as_secs_f64() * 1000.0);

            match outcome {
                Ok(record) => serve_stored(record).unwrap_or_else(IntoResponse::into_response),
                Err(err) => {
                    if matches!(err, WaitError::Timeout { .. }) {
                        counter!("mnemo_cache_wait_timeout_total").increment(1);
                    }
                    ProxyError::from(err).into_response()
                }
            }
        }
        Resolution::Owner(ticket) => {
            counter!("mnemo_cache_miss_total").increment(1);
            debug!(
                cache = "store",
                outcome = "miss",
                request_id = ticket.request_id()
            );
            fetch_as_owner(cache.coordinator, ticket, request, next).await
        }
    }
}

async fn fetch_as_owner(
    coordinator: Arc<Coordinator>,
    ticket: OwnerTicket,
    request: Request<Body>,
    next: Next,
) -> Response {
    let capture = BodyCapture::new();
    let (parts, body) = request.into_parts();
    let request = Request::from_parts(parts, capture.tee(body));

    let response = next.run(request).await;

    if let Some(report) = response.extensions().get::<ErrorReport>() {
        counter!("mnemo_upstream_failure_total").increment(1);
        let reason = if report.messages.is_empty() {
            "upstream fetch failed".to_string()
        } else {
            report.messages.join(": ")
        };
        ticket.fail(reason).await;
        return response;
    }

    let (parts, body) = response.into_parts();
    let captured_headers = HeaderMultimap::from_header_map(&parts.headers, &[]);
    let (tx, rx) = mpsc::channel(RELAY_BUFFER_CHUNKS);

    tokio::spawn(pump(
        PumpContext {
            coordinator,
            ticket,
            status: parts.status,
            headers: captured_headers,
            request_body: capture,
        },
        body,
        tx,
    ));

    Response::from_parts(parts, Body::from_stream(relay(rx)))
}

fn relay(
    mut rx: mpsc::Receiver<Result<Bytes, io::Error>>,
) -> impl futures::Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
    async_stream::stream! {
        while let Some(item) = rx.recv().await {
            yield item;
        }
    }
}

struct PumpContext {
    coordinator: Arc<Coordinator>,
    ticket: OwnerTicket,
    status: StatusCode,
    headers: HeaderMultimap,
    request_body: BodyCapture,
}

/// Drive the upstream body to the client while keeping a copy, then persist and publish.
///
/// The client stream ends only after the record is committed or the fetch was released as
/// failed.
async fn pump(ctx: PumpContext, body: Body, tx: mpsc::Sender<Result<Bytes, io::Error>>) {
    let PumpContext {
        coordinator,
        ticket,
        status,
        headers,
        request_body,
    } = ctx;
    let request_id = ticket.request_id();
    let mut stream = body.into_data_stream();
    let mut captured = BytesMut::new();

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                captured.extend_from_slice(&bytes);
                if tx.send(Ok(bytes)).await.is_err() {
                    warn!(request_id, "client disconnected before body completed");
                    ticket.fail("client disconnected mid-stream").await;
                    return;
                }
            }
            Err(err) => {
                counter!("mnemo_upstream_failure_total").increment(1);
                warn!(request_id, error = %err, "upstream body failed mid-stream");
                let reason = format!("upstream body failed: {err}");
                let _ = tx.send(Err(io::Error::other(err))).await;
                ticket.fail(reason).await;
                return;
            }
        }
    }

    let store = coordinator.store();
    let request_bytes = request_body.take();
    if !request_bytes.is_empty()
        && let Err(err) = store.attach_request_body(request_id, &request_bytes).await
    {
        warn!(request_id, error = %err, "failed to attach request body");
    }

    let response = CapturedResponse {
        status: status.as_u16(),
        headers,
        body: captured.freeze(),
    };
    match store.put_response(request_id, &response).await {
        Ok(()) => {
            debug!(
                request_id,
                status = response.status,
                bytes = response.body.len(),
                "stored upstream response"
            );
            ticket.publish();
        }
        Err(err) => {
            warn!(request_id, error = %err, "failed to store upstream response");
            ticket.fail(format!("failed to store response: {err}")).await;
        }
    }

    drop(tx);
}

/// Rebuild a response from its stored record, byte for byte.
fn serve_stored(record: ResponseRecord) -> Result<Response, ProxyError> {
    let headers = record
        .header_multimap()
        .and_then(|headers| headers.to_header_map())
        .map_err(ProxyError::MalformedStoredHeaders)?;
    let status = StatusCode::from_u16(record.status).map_err(|_| {
        ProxyError::MalformedStoredHeaders(DomainError::InvalidStatus {
            status: i64::from(record.status),
        })
    })?;

    let mut response = Response::new(Body::from(record.body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}
