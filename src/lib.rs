//! Proxy Pool - self-healing proxy pool and resilient HTTP client
//!
//! Candidate proxies are fetched from public listings, scored from real
//! traffic and periodic health probes, and handed to an HTTP client that
//! rotates through them and falls back to direct connections.

pub mod client;
pub mod config;
pub mod error;
pub mod proxy;

pub use client::{ClientConfig, ProxyProvider, RequestOptions, ResilientClient};
pub use config::PoolConfig;
pub use error::{PoolError, Result};
pub use proxy::*;
