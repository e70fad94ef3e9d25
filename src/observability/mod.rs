pub mod logger;
pub mod metrics;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use logger::{AccessLogFormat, AccessLogger};
pub use metrics::MetricsCollector;

/// One record per finished request
#[derive(Debug, Clone, Serialize)]
pub struct RequestLogEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub client: String,
    pub duration_ms: f64,
    pub cache_hit: bool,
    pub bytes_sent: u64,
    pub upstream_host: String,
    pub upstream_scheme: String,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub content_type: Option<String>,
    /// Seconds left on the cache entry that served this request
    pub cache_ttl_remaining_secs: Option<u64>,
}

impl RequestLogEntry {
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_ms / 1000.0)
    }
}

/// Sink for request-path observations.
///
/// Called inline on the request path, so implementations must not block.
pub trait MetricsRecorder: Send + Sync {
    fn increment_total_requests(&self);
    fn increment_cache_hits(&self);
    fn increment_cache_misses(&self);
    fn increment_blocked_requests(&self);
    fn record_response_time(&self, elapsed: Duration);
    fn add_request_log(&self, entry: RequestLogEntry);
}
