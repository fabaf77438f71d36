mod middleware;
mod proxy;

pub use middleware::RequestContext;

use std::sync::Arc;

use axum::{
    Router,
    extract::FromRef,
    http::StatusCode,
    middleware::{from_fn, from_fn_with_state},
    routing::get,
};

use crate::{
    cache::{CacheState, response_cache_layer},
    infra::upstream::UpstreamClient,
};

use self::middleware::{log_responses, set_request_context};

#[derive(Clone)]
pub struct RouterState {
    pub cache: CacheState,
    pub upstream: Arc<UpstreamClient>,
}

impl FromRef<RouterState> for CacheState {
    fn from_ref(state: &RouterState) -> Self {
        state.cache.clone()
    }
}

impl FromRef<RouterState> for Arc<UpstreamClient> {
    fn from_ref(state: &RouterState) -> Self {
        Arc::clone(&state.upstream)
    }
}

/// Build the listener's router.
///
/// `GET /healthcheck` is answered locally. Every other request, including other methods
/// on `/healthcheck`, goes through the caching layer to the forwarding handler.
pub fn build_router(state: RouterState) -> Router {
    let proxied = Router::new()
        .fallback(proxy::forward)
        .layer(from_fn_with_state(state.cache.clone(), response_cache_layer))
        .with_state(state);

    Router::new()
        .route(
            "/healthcheck",
            get(healthcheck).fallback_service(proxied.clone()),
        )
        .fallback_service(proxied)
        .layer(from_fn(log_responses))
        .layer(from_fn(set_request_context))
}

async fn healthcheck() -> StatusCode {
    StatusCode::OK
}
