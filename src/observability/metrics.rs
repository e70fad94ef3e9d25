use std::collections::VecDeque;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::time::Instant;
use tracing::info;

use crate::config::MetricsConfig;
use super::{AccessLogger, MetricsRecorder, RequestLogEntry};

/// In-process request counters, recent response times and recent request logs
pub struct MetricsCollector {
    total_requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    blocked_requests: AtomicU64,
    response_times: Mutex<VecDeque<Duration>>,
    max_samples: usize,
    recent_logs: Mutex<VecDeque<RequestLogEntry>>,
    max_logs: usize,
    access_log: Option<AccessLogger>,
    started_at: Instant,
}

/// Point-in-time view of the counters
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub blocked_requests: u64,
    /// Percent of cache lookups that hit
    pub cache_hit_rate: f64,
    pub average_response_time: Duration,
    pub response_time_samples: usize,
    pub uptime: Duration,
}

impl MetricsCollector {
    pub fn new(config: &MetricsConfig, access_log: Option<AccessLogger>) -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            blocked_requests: AtomicU64::new(0),
            response_times: Mutex::new(VecDeque::with_capacity(config.response_time_samples)),
            max_samples: config.response_time_samples.max(1),
            recent_logs: Mutex::new(VecDeque::with_capacity(config.recent_logs)),
            max_logs: config.recent_logs,
            access_log,
            started_at: Instant::now(),
        }
    }

    /// Install the Prometheus exporter and describe the facade metrics
    pub fn install_exporter(config: &MetricsConfig) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

        describe_counter!("gateway_requests_total", "Total number of requests received");
        describe_counter!("gateway_cache_hits_total", "GET requests served from the cache");
        describe_counter!("gateway_cache_misses_total", "GET requests forwarded after a cache miss");
        describe_counter!("gateway_blocked_requests_total", "Requests rejected by the rate limiter");
        describe_counter!("gateway_access_log_dropped_total", "Access log lines dropped under back-pressure");
        describe_histogram!("gateway_response_time_seconds", "Time to produce a response");
        describe_gauge!("gateway_cache_entries", "Entries held in the response cache");
        describe_gauge!("gateway_rate_limit_clients", "Client windows tracked by the rate limiter");

        info!("Prometheus exporter listening on {}", addr);
        Ok(())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = cache_hits + cache_misses;

        let (average_response_time, response_time_samples) = {
            let samples = lock(&self.response_times);
            let total: Duration = samples.iter().sum();
            let average = if samples.is_empty() {
                Duration::ZERO
            } else {
                total / samples.len() as u32
            };
            (average, samples.len())
        };

        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
            blocked_requests: self.blocked_requests.load(Ordering::Relaxed),
            cache_hit_rate: if lookups > 0 {
                cache_hits as f64 / lookups as f64 * 100.0
            } else {
                0.0
            },
            average_response_time,
            response_time_samples,
            uptime: self.started_at.elapsed(),
        }
    }

    /// Most recent request logs, newest first
    pub fn recent_logs(&self, limit: usize) -> Vec<RequestLogEntry> {
        lock(&self.recent_logs).iter().rev().take(limit).cloned().collect()
    }

    /// Prometheus text exposition of the counters
    pub fn render_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::with_capacity(1024);

        let mut metric = |name: &str, kind: &str, help: &str, value: String| {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} {}", name, kind);
            let _ = writeln!(out, "{} {}", name, value);
            out.push('\n');
        };

        metric("cachegate_total_requests", "counter", "Total number of requests processed",
            snapshot.total_requests.to_string());
        metric("cachegate_cache_hits", "counter", "Total number of cache hits",
            snapshot.cache_hits.to_string());
        metric("cachegate_cache_misses", "counter", "Total number of cache misses",
            snapshot.cache_misses.to_string());
        metric("cachegate_blocked_requests", "counter", "Total number of blocked requests due to rate limiting",
            snapshot.blocked_requests.to_string());
        metric("cachegate_cache_hit_rate", "gauge", "Cache hit rate percentage",
            format!("{:.2}", snapshot.cache_hit_rate));
        metric("cachegate_average_response_time", "gauge", "Average response time in milliseconds",
            format!("{:.2}", snapshot.average_response_time.as_secs_f64() * 1000.0));
        metric("cachegate_response_time_samples", "gauge", "Number of response time samples",
            snapshot.response_time_samples.to_string());
        metric("cachegate_uptime_seconds", "counter", "Server uptime in seconds",
            format!("{:.0}", snapshot.uptime.as_secs_f64()));

        out
    }

    /// JSON summary for the admin API
    pub fn summary(&self) -> serde_json::Value {
        let snapshot = self.snapshot();

        serde_json::json!({
            "total_requests": snapshot.total_requests,
            "cache_hits": snapshot.cache_hits,
            "cache_misses": snapshot.cache_misses,
            "blocked_requests": snapshot.blocked_requests,
            "cache_hit_rate": snapshot.cache_hit_rate,
            "average_response_time_ms": snapshot.average_response_time.as_secs_f64() * 1000.0,
            "response_time_samples": snapshot.response_time_samples,
            "uptime_seconds": snapshot.uptime.as_secs(),
            "access_log_dropped": self.access_log.as_ref().map(|log| log.dropped()).unwrap_or(0),
        })
    }
}

impl MetricsRecorder for MetricsCollector {
    fn increment_total_requests(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        counter!("gateway_requests_total").increment(1);
    }

    fn increment_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        counter!("gateway_cache_hits_total").increment(1);
    }

    fn increment_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        counter!("gateway_cache_misses_total").increment(1);
    }

    fn increment_blocked_requests(&self) {
        self.blocked_requests.fetch_add(1, Ordering::Relaxed);
        counter!("gateway_blocked_requests_total").increment(1);
    }

    fn record_response_time(&self, elapsed: Duration) {
        histogram!("gateway_response_time_seconds").record(elapsed.as_secs_f64());

        let mut samples = lock(&self.response_times);
        if samples.len() == self.max_samples {
            samples.pop_front();
        }
        samples.push_back(elapsed);
    }

    fn add_request_log(&self, entry: RequestLogEntry) {
        if let Some(access_log) = &self.access_log {
            access_log.log(entry.clone());
        }

        if self.max_logs == 0 {
            return;
        }
        let mut logs = lock(&self.recent_logs);
        if logs.len() == self.max_logs {
            logs.pop_front();
        }
        logs.push_back(entry);
    }
}

// A panic while holding one of these locks leaves the data usable
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
