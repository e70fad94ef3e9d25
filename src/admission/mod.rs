pub mod rate_limiter;

use std::net::SocketAddr;

use axum::http::HeaderMap;

pub use rate_limiter::RateLimiter;

/// Per-client admission decision made before any other request work.
pub trait AdmissionControl: Send + Sync {
    /// Record an attempt for `client` and report whether it may proceed.
    fn allow(&self, client: &str) -> bool;

    /// Attempts admitted inside the current window. Does not record anything.
    fn current_count(&self, client: &str) -> usize;
}

/// Resolve the identity a request is rate limited under.
///
/// Order: first `X-Forwarded-For` entry, then `X-Real-IP`, then the socket
/// address without its port. Forwarding headers are taken as given unless
/// `trust_forwarded_headers` is off.
pub fn client_identity(headers: &HeaderMap, peer: &SocketAddr, trust_forwarded_headers: bool) -> String {
    if trust_forwarded_headers {
        if let Some(forwarded_for) = header_str(headers, "x-forwarded-for") {
            if let Some(first) = forwarded_for.split(',').next() {
                return first.trim().to_string();
            }
        }

        if let Some(real_ip) = header_str(headers, "x-real-ip") {
            return real_ip.trim().to_string();
        }
    }

    peer.ip().to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
}
