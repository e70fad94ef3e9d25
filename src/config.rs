use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::GatewayError;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on producing a response head
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
    /// How long in-flight requests get to finish after a shutdown signal
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
    /// Use X-Forwarded-For / X-Real-IP as the client identity
    pub trust_forwarded_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            trust_forwarded_headers: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    pub url: String,
    pub max_idle_connections: usize,
    pub max_idle_per_host: usize,
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub tls_handshake_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub read_timeout: Duration,
    /// Zero flushes every chunk as soon as it arrives
    #[serde(with = "duration_serde")]
    pub flush_interval: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8081".to_string(),
            max_idle_connections: 100,
            max_idle_per_host: 100,
            idle_timeout: Duration::from_secs(90),
            tls_handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            flush_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    #[serde(with = "duration_serde")]
    pub window: Duration,
    #[serde(with = "duration_serde")]
    pub reap_interval: Duration,
    #[serde(with = "duration_serde")]
    pub reap_after: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 100,
            window: Duration::from_secs(60),
            reap_interval: Duration::from_secs(300),
            reap_after: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "duration_serde")]
    pub ttl: Duration,
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "text" or "json"
    pub format: String,
    pub access_log: AccessLogConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            access_log: AccessLogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AccessLogConfig {
    pub enabled: bool,
    /// "json", "combined" or "common"
    pub format: String,
    /// "stdout" or a file path
    pub output: String,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            format: "json".to_string(),
            output: "stdout".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Install the Prometheus exporter on `port`
    pub enabled: bool,
    pub port: u16,
    pub response_time_samples: usize,
    pub recent_logs: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
            response_time_samples: 1000,
            recent_logs: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9091,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be zero");
        }

        self.backend_url()?;

        if self.rate_limit.requests_per_minute == 0 {
            anyhow::bail!("Rate limit must allow at least one request per window");
        }
        if self.rate_limit.window.is_zero() {
            anyhow::bail!("Rate limit window cannot be zero");
        }
        if self.rate_limit.reap_interval.is_zero() {
            anyhow::bail!("Rate limit reap interval cannot be zero");
        }

        if self.cache.ttl.is_zero() {
            anyhow::bail!("Cache TTL cannot be zero");
        }
        if self.cache.sweep_interval.is_zero() {
            anyhow::bail!("Cache sweep interval cannot be zero");
        }

        if self.metrics.response_time_samples == 0 {
            anyhow::bail!("Response time sample window cannot be zero");
        }

        if !matches!(self.logging.access_log.format.as_str(), "json" | "combined" | "common") {
            anyhow::bail!("Unknown access log format: {}", self.logging.access_log.format);
        }

        Ok(())
    }

    /// Parse the backend origin, rejecting anything that is not an absolute http(s) URL
    pub fn backend_url(&self) -> std::result::Result<Url, GatewayError> {
        parse_backend_url(&self.backend.url)
    }
}

pub fn parse_backend_url(raw: &str) -> std::result::Result<Url, GatewayError> {
    let invalid = |reason: &str| GatewayError::InvalidBackendConfig {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host"));
    }

    Ok(url)
}

/// Parse `30s`, `5m`, `1h`, `250ms` or a bare number of seconds
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let parse = |num: &str| num.trim().parse::<u64>().map_err(|e| format!("invalid duration '{}': {}", s, e));

    if let Some(num) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(parse(num)?))
    } else if let Some(num) = s.strip_suffix('s') {
        Ok(Duration::from_secs(parse(num)?))
    } else if let Some(num) = s.strip_suffix('m') {
        Ok(Duration::from_secs(parse(num)? * 60))
    } else if let Some(num) = s.strip_suffix('h') {
        Ok(Duration::from_secs(parse(num)? * 3600))
    } else {
        Ok(Duration::from_secs(parse(s)?))
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
