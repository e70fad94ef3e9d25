use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use axum::body::{Body, HttpBody};
use axum::http::{header, request::Parts, HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use reqwest::Url;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::config::BackendConfig;
use super::capture::{ResponseSink, SinkClosed};

pub const PROXY_SERVER_HEADER: &str = "x-proxy-server";
pub const PROXY_TIMESTAMP_HEADER: &str = "x-proxy-timestamp";
const PROXY_SERVER_NAME: &str = "cachegate";

/// Why a forward did not complete
#[derive(Debug, Error)]
pub enum ForwardError {
    /// No response head was received from the backend
    #[error("backend request failed: {0}")]
    Transport(#[source] reqwest::Error),

    /// The head was delivered but the body broke off
    #[error("backend body failed after {bytes} bytes: {source}")]
    Body {
        bytes: u64,
        #[source]
        source: reqwest::Error,
    },

    #[error(transparent)]
    ClientGone(#[from] SinkClosed),
}

/// Forwards requests to the single configured origin
#[derive(Clone)]
pub struct BackendForwarder {
    client: reqwest::Client,
    origin: Url,
    flush_interval: Duration,
}

impl BackendForwarder {
    pub fn new(origin: Url, config: &BackendConfig) -> Result<Self> {
        // One origin, so the per-host pool is the whole pool
        let max_idle = config.max_idle_per_host.min(config.max_idle_connections);

        let client = reqwest::Client::builder()
            .connect_timeout(config.tls_handshake_timeout)
            .read_timeout(config.read_timeout)
            .pool_idle_timeout(config.idle_timeout)
            .pool_max_idle_per_host(max_idle)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            origin,
            flush_interval: config.flush_interval,
        })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Backend URL for an inbound path and query
    pub fn target_url(&self, path_and_query: &str) -> String {
        let base = self.origin.as_str().trim_end_matches('/');
        if path_and_query.starts_with('/') {
            format!("{}{}", base, path_and_query)
        } else {
            format!("{}/{}", base, path_and_query)
        }
    }

    /// Send the request to the backend and write the response into `sink`.
    ///
    /// The head is written before any body byte. A [`ForwardError::Transport`]
    /// leaves the sink untouched so the caller can still answer with its own status.
    pub async fn forward<S>(
        &self,
        parts: &Parts,
        body: Option<reqwest::Body>,
        peer: SocketAddr,
        sink: &mut S,
    ) -> std::result::Result<StatusCode, ForwardError>
    where
        S: ResponseSink + ?Sized,
    {
        let path_and_query = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let target_url = self.target_url(path_and_query);

        debug!("Forwarding {} {} to {}", parts.method, path_and_query, target_url);

        let mut request_builder = self
            .client
            .request(parts.method.clone(), &target_url)
            .headers(outbound_headers(parts, &peer));

        if let Some(body) = body {
            request_builder = request_builder.body(body);
        }

        let mut response = request_builder.send().await.map_err(|e| {
            error!("Backend request to {} failed: {}", target_url, e);
            ForwardError::Transport(e)
        })?;

        let status = response.status();
        copy_response_headers(response.headers(), sink.headers_mut());
        stamp_proxy_headers(sink.headers_mut());
        sink.write_head(status);

        self.copy_body(&mut response, sink).await?;
        Ok(status)
    }

    async fn copy_body<S>(&self, response: &mut reqwest::Response, sink: &mut S) -> std::result::Result<(), ForwardError>
    where
        S: ResponseSink + ?Sized,
    {
        let mut copied = 0u64;

        if self.flush_interval.is_zero() {
            while let Some(chunk) = next_chunk(response, copied).await? {
                copied += chunk.len() as u64;
                sink.write(chunk).await?;
                sink.flush().await?;
            }
            return Ok(());
        }

        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                chunk = next_chunk(response, copied) => match chunk? {
                    Some(chunk) => {
                        copied += chunk.len() as u64;
                        sink.write(chunk).await?;
                    }
                    None => break,
                },
                _ = ticker.tick() => sink.flush().await?,
            }
        }

        sink.flush().await?;
        Ok(())
    }
}

async fn next_chunk(response: &mut reqwest::Response, copied: u64) -> std::result::Result<Option<Bytes>, ForwardError> {
    response
        .chunk()
        .await
        .map_err(|source| ForwardError::Body { bytes: copied, source })
}

/// Stream an inbound body to the backend without buffering it.
///
/// Returns `None` for a body known to be empty so bodiless requests are not
/// sent with chunked framing.
pub fn request_body(body: Body) -> Option<reqwest::Body> {
    if body.size_hint().exact() == Some(0) {
        return None;
    }
    Some(reqwest::Body::wrap_stream(body.into_data_stream()))
}

/// Request headers for the backend.
///
/// Host is left for the client to derive from the target URL, the original
/// goes into `X-Forwarded-Host`. The peer address is appended to any
/// existing `X-Forwarded-For` chain. `Content-Length` is kept since the body
/// is streamed through unchanged.
///
/// The gateway does not terminate TLS, so `X-Forwarded-Proto` only reads
/// `https` when the request line carries an absolute `https://` URI. Ordinary
/// origin-form requests are always reported as `http`.
pub fn outbound_headers(parts: &Parts, peer: &SocketAddr) -> HeaderMap {
    let connection_tokens = connection_tokens(&parts.headers);
    let mut headers = HeaderMap::with_capacity(parts.headers.len() + 3);

    for (name, value) in parts.headers.iter() {
        if is_hop_by_hop_header(name)
            || connection_tokens.contains(name)
            || name == header::HOST
            || name.as_str() == "x-forwarded-for"
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let original_host = parts
        .headers
        .get(header::HOST)
        .cloned()
        .or_else(|| parts.uri.authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()));
    if let Some(host) = original_host {
        headers.insert("x-forwarded-host", host);
    }

    let proto = if parts.uri.scheme_str() == Some("https") { "https" } else { "http" };
    headers.insert("x-forwarded-proto", HeaderValue::from_static(proto));

    let prior: Vec<&str> = parts
        .headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .collect();
    let peer_ip = peer.ip().to_string();
    let forwarded_for = if prior.is_empty() {
        peer_ip
    } else {
        format!("{}, {}", prior.join(", "), peer_ip)
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }

    headers
}

/// Copy backend response headers, dropping hop-by-hop ones
pub fn copy_response_headers(from: &HeaderMap, to: &mut HeaderMap) {
    let connection_tokens = connection_tokens(from);

    for (name, value) in from.iter() {
        if is_hop_by_hop_header(name) || connection_tokens.contains(name) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

/// Add the diagnostic headers every forwarded response carries
pub fn stamp_proxy_headers(headers: &mut HeaderMap) {
    headers.insert(PROXY_SERVER_HEADER, HeaderValue::from_static(PROXY_SERVER_NAME));

    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    if let Ok(value) = HeaderValue::from_str(&timestamp) {
        headers.insert(PROXY_TIMESTAMP_HEADER, value);
    }
}

// Headers named by `Connection` are hop-by-hop for this message only
fn connection_tokens(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect()
}

fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection" | "keep-alive" | "proxy-connection" | "proxy-authenticate" | "proxy-authorization" |
        "te" | "trailer" | "trailers" | "transfer-encoding" | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(builder: axum::http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    fn forwarder(url: &str) -> BackendForwarder {
        BackendForwarder::new(Url::parse(url).unwrap(), &BackendConfig::default()).unwrap()
    }

    #[test]
    fn test_target_url_joins_origin_and_path() {
        let plain = forwarder("http://localhost:8081");
        assert_eq!(plain.target_url("/a?b=1"), "http://localhost:8081/a?b=1");

        let prefixed = forwarder("https://api.internal/v1/");
        assert_eq!(prefixed.target_url("/users"), "https://api.internal/v1/users");
        assert_eq!(prefixed.target_url("users"), "https://api.internal/v1/users");
    }

    #[test]
    fn test_outbound_headers_rewrite_forwarding_chain() {
        let parts = parts(
            Request::get("/a")
                .header("host", "gateway.example.com")
                .header("x-forwarded-for", "203.0.113.7")
                .header("connection", "keep-alive, x-secret")
                .header("x-secret", "drop me")
                .header("keep-alive", "timeout=5")
                .header("accept", "application/json")
                .header("content-length", "12"),
        );
        let peer: SocketAddr = "10.0.0.9:40000".parse().unwrap();

        let headers = outbound_headers(&parts, &peer);

        assert_eq!(headers.get("x-forwarded-host").unwrap(), "gateway.example.com");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "203.0.113.7, 10.0.0.9");
        assert_eq!(headers.get("accept").unwrap(), "application/json");
        assert!(headers.get("host").is_none());
        assert!(headers.get("connection").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-secret").is_none());
        assert_eq!(headers.get("content-length").unwrap(), "12");
    }

    #[test]
    fn test_outbound_headers_start_chain_and_honor_absolute_https_uri() {
        let parts = parts(Request::get("https://secure.example.com/login"));
        let peer: SocketAddr = "[2001:db8::7]:443".parse().unwrap();

        let headers = outbound_headers(&parts, &peer);

        assert_eq!(headers.get("x-forwarded-for").unwrap(), "2001:db8::7");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "secure.example.com");
    }

    #[test]
    fn test_response_headers_keep_repeats_and_drop_hop_by_hop() {
        let mut backend = HeaderMap::new();
        backend.append("set-cookie", HeaderValue::from_static("a=1"));
        backend.append("set-cookie", HeaderValue::from_static("b=2"));
        backend.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        backend.insert("content-type", HeaderValue::from_static("text/plain"));

        let mut copied = HeaderMap::new();
        copy_response_headers(&backend, &mut copied);
        stamp_proxy_headers(&mut copied);

        let cookies: Vec<_> = copied.get_all("set-cookie").iter().collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert!(copied.get("transfer-encoding").is_none());
        assert_eq!(copied.get(PROXY_SERVER_HEADER).unwrap(), "cachegate");

        let stamp = copied.get(PROXY_TIMESTAMP_HEADER).unwrap().to_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
        assert!(stamp.ends_with('Z'));
    }

    #[test]
    fn test_request_body_skips_known_empty_bodies() {
        assert!(request_body(Body::empty()).is_none());
        assert!(request_body(Body::from("payload")).is_some());

        let chunks = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(b"a"))]);
        assert!(request_body(Body::from_stream(chunks)).is_some());
    }

    #[tokio::test]
    async fn test_unreachable_backend_leaves_sink_untouched() {
        use super::super::capture::BufferedSink;

        // Port 9 on loopback is the discard port and normally refuses connections
        let forwarder = forwarder("http://127.0.0.1:9");
        let parts = parts(Request::get("/a"));
        let mut sink = BufferedSink::new();

        let err = forwarder
            .forward(&parts, None, "127.0.0.1:5000".parse().unwrap(), &mut sink)
            .await
            .unwrap_err();

        assert!(matches!(err, ForwardError::Transport(_)));
        assert!(!sink.head_written());
        assert!(sink.headers().is_empty());
    }
}
