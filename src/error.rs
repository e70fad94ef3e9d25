use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

pub const RATE_LIMITED_BODY: &str = "Rate limit exceeded";
pub const BACKEND_UNAVAILABLE_BODY: &str = "Backend service unavailable";

/// Application-wide error types
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid backend URL '{url}': {reason}")]
    InvalidBackendConfig { url: String, reason: String },

    #[error("Rate limit exceeded for client {client}")]
    RateLimitExceeded { client: String },

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InvalidBackendConfig { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Body shown to the client. Never carries internal error detail.
    pub fn client_message(&self) -> &'static str {
        match self {
            GatewayError::RateLimitExceeded { .. } => RATE_LIMITED_BODY,
            GatewayError::BackendUnavailable(_) => BACKEND_UNAVAILABLE_BODY,
            GatewayError::InvalidBackendConfig { .. } => "Internal server error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut response = (self.status_code(), self.client_message()).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
