//! Proxy pool module
//!
//! This module provides functionality for:
//! - Fetching candidate proxies from listing sources
//! - Parsing and validating proxy addresses
//! - Scoring, selecting and persisting pooled proxies
//! - Health checking pooled proxies on a schedule or on demand

pub mod checker;
pub mod fetcher;
pub mod geo;
pub mod models;
pub mod parser;
pub mod pool;
pub mod scoring;
pub mod snapshot;
pub mod sources;

pub use checker::{CheckerConfig, HealthChecker, HealthCheckerHandle, HealthReport};
pub use fetcher::{FetchResult, FetcherConfig, ProxyFetcher};
pub use geo::GeoLocator;
pub use models::{Anonymity, ProbeResult, ProbeStatus, ProxyProtocol, ProxyRecord, RequestOutcome};
pub use parser::ProxyParser;
pub use pool::{PoolQuality, PoolStats, ProxyPool};
pub use scoring::{DefaultScoring, ScoringPolicy};
pub use snapshot::{AddressStats, DirectStats, PoolSnapshot};
pub use sources::{ProxySource, SourceFormat, SourceParser};
