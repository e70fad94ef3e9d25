use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::admission::{AdmissionControl, RateLimiter};
use crate::config::{AdminConfig, Config};
use crate::observability::MetricsCollector;
use crate::proxy::cache::{CacheStore, ResponseCache};

const DEFAULT_LOG_LIMIT: usize = 100;

/// Operator API on its own port: metrics, request logs, cache and limiter state
pub struct AdminServer {
    config: AdminConfig,
    state: AdminState,
}

#[derive(Clone)]
pub struct AdminState {
    pub app_config: Arc<Config>,
    pub metrics: Arc<MetricsCollector>,
    pub cache: Arc<ResponseCache>,
    pub limiter: Arc<RateLimiter>,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    message: Option<String>,
    timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            timestamp: chrono::Utc::now(),
        }
    }

    fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            timestamp: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EntryQuery {
    key: String,
}

impl AdminServer {
    pub fn new(config: &AdminConfig, state: AdminState) -> Self {
        Self {
            config: config.clone(),
            state,
        }
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve the admin API until `shutdown` is cancelled
    pub async fn start(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{}", self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind admin server to {}: {}", addr, e))?;

        info!("Admin server listening on {}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| anyhow::anyhow!("Admin server error: {}", e))?;

        Ok(())
    }
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/status", get(get_system_status))
        .route("/api/metrics", get(get_metrics))
        .route("/api/logs", get(get_logs))
        .route("/api/cache", get(get_cache_statistics))
        .route("/api/cache/clear", post(clear_cache))
        .route("/api/cache/entry", delete(remove_cache_entry))
        .route("/api/clients/:id", get(get_client))
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    "OK"
}

async fn get_system_status(State(state): State<AdminState>) -> impl IntoResponse {
    let config = &state.app_config;
    let status = json!({
        "service": "cachegate",
        "version": env!("CARGO_PKG_VERSION"),
        "backend": config.backend.url,
        "uptime_seconds": state.metrics.snapshot().uptime.as_secs(),
        "configuration": {
            "requests_per_minute": config.rate_limit.requests_per_minute,
            "cache_ttl_seconds": config.cache.ttl.as_secs(),
            "access_log_enabled": config.logging.access_log.enabled,
            "metrics_exporter_enabled": config.metrics.enabled,
        },
    });
    Json(ApiResponse::success(status))
}

async fn get_metrics(State(state): State<AdminState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.metrics.summary()))
}

async fn get_logs(State(state): State<AdminState>, Query(query): Query<LogsQuery>) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    Json(ApiResponse::success(state.metrics.recent_logs(limit)))
}

async fn get_cache_statistics(State(state): State<AdminState>) -> impl IntoResponse {
    let mut stats = state.cache.statistics();
    stats["rate_limiter"] = state.limiter.statistics();
    Json(ApiResponse::success(stats))
}

async fn clear_cache(State(state): State<AdminState>) -> impl IntoResponse {
    let removed = state.cache.size();
    state.cache.clear();
    info!("Cache cleared via admin API ({} entries)", removed);
    Json(ApiResponse::success(json!({ "removed": removed })))
}

async fn remove_cache_entry(State(state): State<AdminState>, Query(query): Query<EntryQuery>) -> impl IntoResponse {
    if state.cache.delete(&query.key) {
        info!("Cache entry {} removed via admin API", query.key);
        (StatusCode::OK, Json(ApiResponse::success(query.key)))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<String>::error(format!("Cache entry not found: {}", query.key))),
        )
    }
}

async fn get_client(State(state): State<AdminState>, Path(id): Path<String>) -> impl IntoResponse {
    Json(ApiResponse::success(json!({
        "client": id,
        "current_count": state.limiter.current_count(&id),
        "limit": state.limiter.limit(),
        "window_seconds": state.limiter.window().as_secs(),
        "tracked_clients": state.limiter.tracked_clients(),
    })))
}
