//! Caching, rate-limiting reverse proxy in front of a single HTTP backend.

pub mod admin;
pub mod admission;
pub mod config;
pub mod error;
pub mod observability;
pub mod proxy;
pub mod tasks;

pub use config::Config;
pub use error::{GatewayError, Result};
