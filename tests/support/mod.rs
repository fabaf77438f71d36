#![allow(dead_code)]

use std::{
    io,
    net::SocketAddr,
    num::NonZeroU32,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mnemo::{
    cache::{CacheConfig, CacheState, Coordinator},
    config::{DatabaseSettings, UpstreamSettings},
    infra::{
        db::SqliteRepositories,
        http::{RouterState, build_router},
        upstream::UpstreamClient,
    },
};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const ORIGIN_DELAY: Duration = Duration::from_millis(150);
pub const STREAM_PAUSE: Duration = Duration::from_millis(300);
pub const BROKEN_BODY_DELAY: Duration = Duration::from_millis(100);

/// A proxy router backed by a fresh on-disk database.
pub struct TestProxy {
    pub router: Router,
    pub repos: Arc<SqliteRepositories>,
    pub coordinator: Arc<Coordinator>,
    _dir: TempDir,
}

pub async fn proxy(config: CacheConfig) -> TestProxy {
    let dir = tempfile::tempdir().expect("temp dir");
    let settings = DatabaseSettings {
        url: format!("sqlite://{}", dir.path().join("mnemo.sqlite").display()),
        max_connections: NonZeroU32::new(8).expect("non-zero"),
        acquire_timeout: Duration::from_secs(5),
        busy_timeout: Duration::from_secs(5),
    };
    let pool = SqliteRepositories::connect(&settings)
        .await
        .expect("sqlite pool should open");
    SqliteRepositories::run_migrations(&pool)
        .await
        .expect("migrations should apply");
    let repos = Arc::new(SqliteRepositories::new(pool));

    let coordinator = Arc::new(Coordinator::new(repos.clone(), config));
    let upstream = Arc::new(
        UpstreamClient::new(&UpstreamSettings {
            connect_timeout: Duration::from_secs(2),
            request_timeout: Some(Duration::from_secs(10)),
        })
        .expect("upstream client should build"),
    );

    let router = build_router(RouterState {
        cache: CacheState::new(coordinator.clone()),
        upstream,
    });

    TestProxy {
        router,
        repos,
        coordinator,
        _dir: dir,
    }
}

pub fn fast_config() -> CacheConfig {
    CacheConfig {
        waiter_timeout: Duration::from_secs(5),
        backoff_initial: Duration::from_millis(5),
        backoff_max: Duration::from_millis(50),
        owner_lease: None,
    }
}

/// An origin server counting every request it receives.
pub struct Origin {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
}

impl Origin {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

pub async fn spawn_origin() -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("origin should bind");
    serve_origin(listener)
}

/// Start the origin on a specific address, such as one that refused connections earlier.
pub async fn spawn_origin_at(addr: SocketAddr) -> Origin {
    let listener = TcpListener::bind(addr)
        .await
        .expect("origin should bind to the requested address");
    serve_origin(listener)
}

fn serve_origin(listener: TcpListener) -> Origin {
    let hits = Arc::new(AtomicUsize::new(0));
    let broken_calls = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/foo", get(slow_hello))
        .route("/bytes", get(binary_payload))
        .route("/echo", post(echo))
        .route("/redirect", get(redirect))
        .route("/healthcheck", post(upstream_health))
        .route("/host", get(echo_host))
        .route("/tag", get(echo_tag))
        .route("/named", get(opaque_header))
        .route("/stream", get(slow_stream))
        .route(
            "/broken",
            get(move || broken_then_whole(Arc::clone(&broken_calls))),
        )
        .layer(middleware::from_fn_with_state(hits.clone(), count_hits));

    let addr = listener.local_addr().expect("origin addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Origin { addr, hits }
}

/// An origin that accepts connections and closes them after `delay` without replying.
pub async fn spawn_dropping_origin(delay: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("origin should bind");
    let addr = listener.local_addr().expect("origin addr");
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                drop(socket);
            });
        }
    });
    addr
}

/// A loopback address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind placeholder listener");
    listener.local_addr().expect("placeholder addr")
}

async fn count_hits(
    State(hits): State<Arc<AtomicUsize>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    hits.fetch_add(1, Ordering::SeqCst);
    next.run(request).await
}

async fn slow_hello() -> &'static str {
    tokio::time::sleep(ORIGIN_DELAY).await;
    "hello"
}

async fn binary_payload() -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        "application/octet-stream".parse().expect("header value"),
    );
    headers.append("x-multi", "one".parse().expect("header value"));
    headers.append("x-multi", "two".parse().expect("header value"));
    let body: Vec<u8> = (0u8..=255).collect();
    (StatusCode::CREATED, headers, body).into_response()
}

async fn echo(body: Bytes) -> Bytes {
    body
}

async fn redirect() -> Response {
    (StatusCode::FOUND, [(header::LOCATION, "/elsewhere")]).into_response()
}

async fn upstream_health() -> &'static str {
    "upstream"
}

async fn echo_host(headers: HeaderMap) -> Vec<u8> {
    headers
        .get(header::HOST)
        .map(|value| value.as_bytes().to_vec())
        .unwrap_or_default()
}

async fn echo_tag(headers: HeaderMap) -> Vec<u8> {
    headers
        .get("x-tag")
        .map(|value| value.as_bytes().to_vec())
        .unwrap_or_default()
}

async fn opaque_header() -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("x-name"),
        HeaderValue::from_bytes(b"caf\xe9").expect("obs-text value"),
    );
    (headers, "named").into_response()
}

/// Two chunks separated by [`STREAM_PAUSE`].
async fn slow_stream() -> Body {
    Body::from_stream(async_stream::stream! {
        yield Ok::<_, io::Error>(Bytes::from_static(b"first"));
        tokio::time::sleep(STREAM_PAUSE).await;
        yield Ok(Bytes::from_static(b"second"));
    })
}

/// The first call aborts its body after one chunk; later calls succeed.
async fn broken_then_whole(calls: Arc<AtomicUsize>) -> Body {
    if calls.fetch_add(1, Ordering::SeqCst) > 0 {
        return Body::from("whole");
    }
    Body::from_stream(async_stream::stream! {
        yield Ok::<_, io::Error>(Bytes::from_static(b"partial"));
        tokio::time::sleep(BROKEN_BODY_DELAY).await;
        yield Err(io::Error::other("origin aborted the body"));
    })
}

pub fn get_request(uri: &str, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::empty()).expect("request should build")
}

pub fn request_with_raw_header(uri: &str, name: &'static str, value: &[u8]) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header(name, HeaderValue::from_bytes(value).expect("header value"))
        .body(Body::empty())
        .expect("request should build")
}

pub async fn body_bytes(response: Response) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should collect")
}
