use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::admission::{client_identity, AdmissionControl};
use crate::error::{GatewayError, BACKEND_UNAVAILABLE_BODY};
use crate::observability::{MetricsCollector, MetricsRecorder, RequestLogEntry};
use super::{
    cache::{CacheEntry, CacheStore},
    capture::{write_text, BufferedSink, ResponseCapture, ResponseSink, StreamingSink},
    forwarder::{request_body, BackendForwarder, ForwardError},
    ProxyContext,
};

/// The request pipeline: admission, cache, forwarding and accounting
pub struct Gateway {
    cache: Arc<dyn CacheStore>,
    admission: Arc<dyn AdmissionControl>,
    metrics: Arc<dyn MetricsRecorder>,
    forwarder: BackendForwarder,
    trust_forwarded_headers: bool,
    request_timeout: Duration,
}

/// How a request ended, for the log record
struct Outcome {
    status: StatusCode,
    bytes_sent: u64,
    content_type: Option<String>,
    cache_hit: bool,
    cache_ttl_remaining: Option<Duration>,
}

impl Outcome {
    fn from_headers(status: StatusCode, headers: &HeaderMap, bytes_sent: u64) -> Self {
        Self {
            status,
            bytes_sent,
            content_type: headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(String::from),
            cache_hit: false,
            cache_ttl_remaining: None,
        }
    }
}

impl Gateway {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        admission: Arc<dyn AdmissionControl>,
        metrics: Arc<dyn MetricsRecorder>,
        forwarder: BackendForwarder,
        trust_forwarded_headers: bool,
        request_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            admission,
            metrics,
            forwarder,
            trust_forwarded_headers,
            request_timeout,
        }
    }

    /// Process a single client request
    #[instrument(
        skip_all,
        fields(
            request_id = tracing::field::Empty,
            client = tracing::field::Empty,
            method = %req.method(),
            uri = %req.uri()
        )
    )]
    pub async fn handle(self: &Arc<Self>, req: Request, peer: SocketAddr) -> Response {
        let request_id = Uuid::new_v4().to_string();
        let client = client_identity(req.headers(), &peer, self.trust_forwarded_headers);

        tracing::Span::current()
            .record("request_id", request_id.as_str())
            .record("client", client.as_str());

        self.metrics.increment_total_requests();

        let (parts, body) = req.into_parts();
        let context = ProxyContext::new(request_id, client, &parts);

        if !self.admission.allow(&context.client) {
            self.metrics.increment_blocked_requests();
            warn!("Rate limit exceeded for client {}", context.client);
            return self.reject(&context, GatewayError::RateLimitExceeded { client: context.client.clone() });
        }

        let body = request_body(body);

        if parts.method == Method::GET {
            self.handle_get(context, parts, body, peer).await
        } else {
            self.handle_streaming(context, parts, body, peer).await
        }
    }

    async fn handle_get(
        &self,
        context: ProxyContext,
        parts: axum::http::request::Parts,
        body: Option<reqwest::Body>,
        peer: SocketAddr,
    ) -> Response {
        let key = context.path.clone();

        if let Some(entry) = self.cache.get(&key) {
            self.metrics.increment_cache_hits();
            let remaining = entry.remaining_ttl();
            debug!("Cache HIT for key: {} ({}s remaining)", key, remaining.as_secs());

            let mut outcome = Outcome::from_headers(
                entry.response.status,
                &entry.response.headers,
                entry.response.body.len() as u64,
            );
            outcome.cache_hit = true;
            outcome.cache_ttl_remaining = Some(remaining);
            self.finish(&context, outcome);

            return replay(&entry);
        }

        self.metrics.increment_cache_misses();
        debug!("Cache MISS for key: {}", key);

        let mut capture = ResponseCapture::new(BufferedSink::new());
        let result = tokio::time::timeout(
            self.request_timeout,
            self.forwarder.forward(&parts, body, peer, &mut capture),
        )
        .await;
        let (captured, sink) = capture.finish();

        match result {
            Ok(Ok(status)) => {
                if status == StatusCode::OK {
                    if let Some(captured) = captured {
                        self.cache.set(key.clone(), captured);
                        debug!("Cached response for key: {}", key);
                    }
                }

                let outcome = Outcome::from_headers(status, sink.headers(), sink.bytes_written());
                self.finish(&context, outcome);
                sink.into_response()
            }
            // Nothing reached the client yet, so a clean 503 replaces any partial response
            Ok(Err(e)) => {
                warn!("Backend unavailable for {} {}: {}", context.method, context.path, e);
                self.reject(&context, GatewayError::BackendUnavailable(e.to_string()))
            }
            Err(_) => {
                warn!(
                    "Backend did not finish {} {} within {:?}",
                    context.method, context.path, self.request_timeout
                );
                self.reject(&context, GatewayError::BackendUnavailable("request timed out".to_string()))
            }
        }
    }

    async fn handle_streaming(
        self: &Arc<Self>,
        context: ProxyContext,
        parts: axum::http::request::Parts,
        body: Option<reqwest::Body>,
        peer: SocketAddr,
    ) -> Response {
        let (mut sink, pending) = StreamingSink::channel(false);
        let gateway = self.clone();

        tokio::spawn(
            async move {
                let result = tokio::time::timeout(
                    gateway.request_timeout,
                    gateway.forwarder.forward(&parts, body, peer, &mut sink),
                )
                .await;

                match result {
                    Ok(Ok(status)) => debug!("Streamed {} response for {} {}", status, context.method, context.path),
                    Ok(Err(ForwardError::Transport(e))) => {
                        warn!("Backend unavailable for {} {}: {}", context.method, context.path, e);
                        let _ = write_text(&mut sink, StatusCode::SERVICE_UNAVAILABLE, BACKEND_UNAVAILABLE_BODY).await;
                    }
                    Ok(Err(ForwardError::ClientGone(_))) => {
                        debug!("Client left during {} {}", context.method, context.path);
                    }
                    Ok(Err(e)) => {
                        warn!("Backend response for {} {} broke off: {}", context.method, context.path, e);
                        sink.abort().await;
                    }
                    Err(_) if sink.head_written() => {
                        warn!(
                            "Backend did not finish {} {} within {:?}",
                            context.method, context.path, gateway.request_timeout
                        );
                        sink.abort().await;
                    }
                    Err(_) => {
                        warn!(
                            "Backend did not answer {} {} within {:?}",
                            context.method, context.path, gateway.request_timeout
                        );
                        let _ = write_text(&mut sink, StatusCode::SERVICE_UNAVAILABLE, BACKEND_UNAVAILABLE_BODY).await;
                    }
                }

                let status = sink.status().unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
                let outcome = Outcome::from_headers(status, sink.headers(), sink.bytes_written());
                gateway.finish(&context, outcome);
            }
            .in_current_span(),
        );

        match pending.into_response().await {
            Some(response) => response,
            None => GatewayError::BackendUnavailable("response task ended without a head".to_string()).into_response(),
        }
    }

    /// Answer with an error response and account for it
    fn reject(&self, context: &ProxyContext, err: GatewayError) -> Response {
        let response = err.into_response();
        let outcome = Outcome::from_headers(
            response.status(),
            response.headers(),
            response_len(&response),
        );
        self.finish(context, outcome);
        response
    }

    /// One response-time sample and one log record per request
    fn finish(&self, context: &ProxyContext, outcome: Outcome) {
        let elapsed = context.start_time.elapsed();
        self.metrics.record_response_time(elapsed);

        let origin = self.forwarder.origin();
        let upstream_host = match origin.port() {
            Some(port) => format!("{}:{}", origin.host_str().unwrap_or_default(), port),
            None => origin.host_str().unwrap_or_default().to_string(),
        };

        debug!(
            "Completed request {} in {}ms with {}",
            context.request_id,
            elapsed.as_millis(),
            outcome.status
        );

        self.metrics.add_request_log(RequestLogEntry {
            timestamp: Utc::now(),
            request_id: context.request_id.clone(),
            method: context.method.clone(),
            path: context.path.clone(),
            status: outcome.status.as_u16(),
            client: context.client.clone(),
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            cache_hit: outcome.cache_hit,
            bytes_sent: outcome.bytes_sent,
            upstream_host,
            upstream_scheme: origin.scheme().to_string(),
            user_agent: context.user_agent.clone(),
            referer: context.referer.clone(),
            content_type: outcome.content_type,
            cache_ttl_remaining_secs: outcome.cache_ttl_remaining.map(|ttl| ttl.as_secs()),
        });
    }
}

fn replay(entry: &CacheEntry) -> Response {
    let mut response = Response::new(Body::from(entry.response.body.clone()));
    *response.status_mut() = entry.response.status;
    *response.headers_mut() = entry.response.headers.clone();
    response
}

fn response_len(response: &Response) -> u64 {
    use axum::body::HttpBody as _;
    response.body().size_hint().exact().unwrap_or(0)
}

/// Shared state for the gateway router
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub metrics: Arc<MetricsCollector>,
}

/// Main router: `/health`, `/metrics`, everything else proxied.
///
/// The timeout layer only covers the local routes. Proxied requests are
/// bounded inside [`Gateway`] so an overrun still ends in a logged 503.
pub fn router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/metrics", get(metrics_handler))
        .route_layer(TimeoutLayer::new(request_timeout))
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `app` on `listener` until `shutdown` is cancelled, then drain in-flight requests
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Gateway listening on {}", addr);
    }

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    state.gateway.handle(req, peer).await
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
}
