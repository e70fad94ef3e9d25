pub mod cache;
pub mod capture;
pub mod engine;
pub mod forwarder;

use axum::http::{header, request::Parts};
use tokio::time::Instant;

pub use cache::{CacheStore, CachedResponse, ResponseCache};
pub use capture::{BufferedSink, ResponseCapture, ResponseSink, StreamingSink};
pub use engine::{AppState, Gateway};
pub use forwarder::{BackendForwarder, ForwardError};

/// Per-request facts gathered before the request is consumed
#[derive(Debug, Clone)]
pub struct ProxyContext {
    pub request_id: String,
    pub client: String,
    pub method: String,
    pub path: String,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub start_time: Instant,
}

impl ProxyContext {
    pub fn new(request_id: String, client: String, parts: &Parts) -> Self {
        let header_value = |name: header::HeaderName| {
            parts
                .headers
                .get(name)
                .and_then(|h| h.to_str().ok())
                .map(String::from)
        };

        Self {
            request_id,
            client,
            method: parts.method.to_string(),
            path: cache_key(parts),
            user_agent: header_value(header::USER_AGENT),
            referer: header_value(header::REFERER),
            start_time: Instant::now(),
        }
    }
}

/// Cache key for a request: path plus query, as received
pub fn cache_key(parts: &Parts) -> String {
    parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}
