//! Shared fixtures: a mock backend and an in-process gateway.

#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cachegate::admission::RateLimiter;
use cachegate::config::{BackendConfig, Config, MetricsConfig};
use cachegate::observability::MetricsCollector;
use cachegate::proxy::{engine, AppState, BackendForwarder, Gateway, ResponseCache};

/// Backend that counts requests per path
#[derive(Clone, Default)]
pub struct MockBackend {
    hits: Arc<Mutex<HashMap<String, usize>>>,
    /// Released by the test to let `/gated` send its second chunk
    pub gate: Arc<Notify>,
    /// Signalled once `/upload` has read the first chunk of its request body
    pub upload_started: Arc<Notify>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }

    fn record(&self, path: &str) {
        *self.hits.lock().unwrap().entry(path.to_string()).or_insert(0) += 1;
    }

    /// Start on an ephemeral port
    pub async fn start(&self) -> (SocketAddr, JoinHandle<()>) {
        let app = Router::new()
            .route("/a", get(page))
            .route("/notfound", get(|| async { (StatusCode::NOT_FOUND, "missing") }))
            .route("/error", get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }))
            .route("/cookies", get(cookies))
            .route("/headers", get(echo_headers))
            .route("/echo", post(echo_body))
            .route("/gated", post(gated))
            .route("/slow", get(slow).post(slow))
            .route("/truncated", get(truncated).post(truncated))
            .route("/upload", post(upload))
            .fallback(page)
            .with_state(self.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (addr, handle)
    }
}

async fn page(State(backend): State<MockBackend>, req: Request) -> impl IntoResponse {
    let path = req.uri().path_and_query().map(|pq| pq.as_str().to_string()).unwrap_or_default();
    backend.record(req.uri().path());
    (
        [(header::CONTENT_TYPE, "text/plain")],
        format!("hello from {} (call {})", path, backend.hits(req.uri().path())),
    )
}

async fn cookies(State(backend): State<MockBackend>) -> Response {
    backend.record("/cookies");
    Response::builder()
        .header("set-cookie", "a=1")
        .header("set-cookie", "b=2")
        .body(Body::from("cookies"))
        .unwrap()
}

async fn echo_headers(State(backend): State<MockBackend>, headers: HeaderMap) -> impl IntoResponse {
    backend.record("/headers");
    let value = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(String::from);
    Json(json!({
        "host": value("host"),
        "x-forwarded-host": value("x-forwarded-host"),
        "x-forwarded-proto": value("x-forwarded-proto"),
        "x-forwarded-for": value("x-forwarded-for"),
        "connection-token": value("x-hop"),
    }))
}

async fn echo_body(State(backend): State<MockBackend>, body: Bytes) -> impl IntoResponse {
    backend.record("/echo");
    (StatusCode::CREATED, body)
}

async fn gated(State(backend): State<MockBackend>) -> Response {
    backend.record("/gated");
    let gate = backend.gate.clone();

    let chunks = futures::stream::unfold(0u8, move |step| {
        let gate = gate.clone();
        async move {
            match step {
                0 => Some((Ok::<_, Infallible>(Bytes::from_static(b"first,")), 1)),
                1 => {
                    gate.notified().await;
                    Some((Ok(Bytes::from_static(b"second")), 2))
                }
                _ => None,
            }
        }
    });

    Response::new(Body::from_stream(chunks))
}

/// Four one-byte chunks, 300ms apart
async fn slow(State(backend): State<MockBackend>) -> Response {
    backend.record("/slow");
    let chunks = futures::stream::unfold(0u8, |step| async move {
        if step == 4 {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        Some((Ok::<_, Infallible>(Bytes::from_static(b".")), step + 1))
    });
    Response::new(Body::from_stream(chunks))
}

/// Sends part of the body, then drops the connection
async fn truncated(State(backend): State<MockBackend>) -> Response {
    backend.record("/truncated");
    let chunks = futures::stream::unfold(0u8, |step| async move {
        match step {
            0 => Some((Ok(Bytes::from_static(b"partial")), 1)),
            1 => {
                // Let the head and first chunk reach the gateway before failing
                tokio::time::sleep(Duration::from_millis(100)).await;
                Some((Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "backend went away")), 2))
            }
            _ => None,
        }
    });
    Response::new(Body::from_stream(chunks))
}

/// Reports the size of a request body it reads chunk by chunk
async fn upload(State(backend): State<MockBackend>, body: Body) -> impl IntoResponse {
    use futures::StreamExt;

    backend.record("/upload");
    let mut stream = body.into_data_stream();
    let mut total = 0;
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else {
            return (StatusCode::BAD_REQUEST, "broken upload".to_string());
        };
        if total == 0 {
            backend.upload_started.notify_one();
        }
        total += chunk.len();
    }
    (StatusCode::OK, format!("received {} bytes", total))
}

/// A gateway wired the way `main` wires it, serving on an ephemeral port
pub struct TestGateway {
    pub addr: SocketAddr,
    pub cache: Arc<ResponseCache>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<MetricsCollector>,
    shutdown: CancellationToken,
    server: JoinHandle<std::io::Result<()>>,
}

impl TestGateway {
    pub async fn start(backend_url: &str, requests_per_minute: usize, ttl: Duration) -> Self {
        Self::start_with_timeout(backend_url, requests_per_minute, ttl, Duration::from_secs(10)).await
    }

    pub async fn start_with_timeout(
        backend_url: &str,
        requests_per_minute: usize,
        ttl: Duration,
        request_timeout: Duration,
    ) -> Self {
        let mut backend = BackendConfig::default();
        backend.url = backend_url.to_string();
        backend.flush_interval = Duration::ZERO;
        backend.read_timeout = Duration::from_secs(5);
        backend.tls_handshake_timeout = Duration::from_secs(2);

        let config = Config {
            backend,
            ..Config::default()
        };

        let cache = Arc::new(ResponseCache::new(ttl));
        let limiter = Arc::new(RateLimiter::new(
            requests_per_minute,
            Duration::from_secs(60),
            Duration::from_secs(600),
        ));
        let metrics = Arc::new(MetricsCollector::new(&MetricsConfig::default(), None));
        let forwarder = BackendForwarder::new(config.backend_url().unwrap(), &config.backend).unwrap();

        let gateway = Arc::new(Gateway::new(
            cache.clone(),
            limiter.clone(),
            metrics.clone(),
            forwarder,
            true,
            request_timeout,
        ));
        let app = engine::router(
            AppState {
                gateway,
                metrics: metrics.clone(),
            },
            request_timeout,
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(engine::serve(listener, app, shutdown.clone()));

        Self {
            addr,
            cache,
            limiter,
            metrics,
            shutdown,
            server,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Wait until `count` requests have been logged; streamed requests log from a background task
    pub async fn wait_for_logs(&self, count: usize) {
        for _ in 0..100 {
            if self.metrics.recent_logs(count).len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {} log records", count);
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.server.await;
    }
}

/// HTTP client that never goes through a system proxy
pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// An address nothing is listening on
pub async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}
