//! Proxy source fetcher
//!
//! This module provides functionality for:
//! - Querying listing endpoints in priority order
//! - Parsing each response with the parser registered for its format
//! - Capping, tagging and deduplicating the candidates
//! - Falling back to the seed list when every source comes back empty

use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;
use reqwest::Client;
use tracing::{debug, info, instrument, warn};

use crate::client::fingerprint;
use crate::error::{PoolError, Result};
use crate::proxy::models::ProxyRecord;
use crate::proxy::sources::{builtin_sources, seed_proxies, ProxySource};

/// Default timeout for source requests in seconds
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 20;

/// Default lower bound of the pause between two sources in milliseconds
pub const DEFAULT_MIN_PACING_MS: u64 = 1000;

/// Default upper bound of the pause between two sources in milliseconds
pub const DEFAULT_MAX_PACING_MS: u64 = 3000;

/// Result of fetching a single source
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Name of the source that was fetched
    pub source: String,
    /// Records kept from the source after capping
    pub proxies: Vec<ProxyRecord>,
    /// Error message if fetching failed
    pub error: Option<String>,
}

impl FetchResult {
    pub fn success(source: String, proxies: Vec<ProxyRecord>) -> Self {
        Self {
            source,
            proxies,
            error: None,
        }
    }

    pub fn failure(source: String, error: String) -> Self {
        Self {
            source,
            proxies: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Configuration for the proxy fetcher
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub sources: Vec<ProxySource>,
    /// Fallback records used when no source yields anything
    pub seeds: Vec<ProxyRecord>,
    /// Timeout for each source request
    pub timeout: Duration,
    pub min_pacing: Duration,
    pub max_pacing: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            sources: builtin_sources(),
            seeds: seed_proxies(),
            timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            min_pacing: Duration::from_millis(DEFAULT_MIN_PACING_MS),
            max_pacing: Duration::from_millis(DEFAULT_MAX_PACING_MS),
        }
    }
}

impl FetcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sources(mut self, sources: Vec<ProxySource>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_seeds(mut self, seeds: Vec<ProxyRecord>) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pause drawn uniformly from `[min, max]` between two sources
    pub fn with_pacing(mut self, min: Duration, max: Duration) -> Self {
        self.min_pacing = min;
        self.max_pacing = max.max(min);
        self
    }
}

/// Fetches candidate proxies from the configured sources
pub struct ProxyFetcher {
    config: FetcherConfig,
    client: Client,
}

impl ProxyFetcher {
    /// Create a new fetcher with the built-in sources
    pub fn new() -> Result<Self> {
        Self::with_config(FetcherConfig::default())
    }

    pub fn with_config(config: FetcherConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .no_proxy()
            .build()?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Fetch every configured source and return the deduplicated candidates.
    ///
    /// Never fails: broken sources are logged and skipped, and the seed list
    /// stands in when nothing at all was fetched.
    pub async fn fetch_all(&self) -> Vec<ProxyRecord> {
        let results = self.fetch_sources_with_results().await;

        let mut seen = HashSet::new();
        let mut candidates: Vec<ProxyRecord> = results
            .into_iter()
            .flat_map(|result| result.proxies)
            .filter(|record| seen.insert(record.address.clone()))
            .collect();

        if candidates.is_empty() && !self.config.seeds.is_empty() {
            warn!(
                "All proxy sources came back empty, falling back to {} seed proxies",
                self.config.seeds.len()
            );
            candidates = self.config.seeds.clone();
        }

        info!("Fetched {} unique candidate proxies", candidates.len());
        candidates
    }

    /// Fetch each source in priority order, returning one result per source
    pub async fn fetch_sources_with_results(&self) -> Vec<FetchResult> {
        let mut sources: Vec<&ProxySource> = self.config.sources.iter().collect();
        sources.sort_by_key(|source| source.priority);

        let mut results = Vec::with_capacity(sources.len());
        for (index, source) in sources.into_iter().enumerate() {
            if index > 0 {
                self.pace().await;
            }

            let result = match self.fetch_source(source).await {
                Ok(proxies) => {
                    info!("Fetched {} proxies from {}", proxies.len(), source.name);
                    FetchResult::success(source.name.clone(), proxies)
                }
                Err(e) => {
                    warn!("{}", e);
                    FetchResult::failure(source.name.clone(), e.to_string())
                }
            };
            results.push(result);
        }

        results
    }

    /// Fetch and parse a single source, keeping at most its result cap
    #[instrument(skip(self, source), fields(source = %source.name))]
    pub async fn fetch_source(&self, source: &ProxySource) -> Result<Vec<ProxyRecord>> {
        let fetch_error = |reason: String| PoolError::SourceFetch {
            source_name: source.name.clone(),
            reason,
        };

        let response = self
            .client
            .get(&source.url)
            .header(reqwest::header::USER_AGENT, fingerprint::random_user_agent())
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(fetch_error(format!("HTTP {}", status.as_u16())));
        }

        let body = response
            .text()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        let mut records = source
            .parse(&body)
            .map_err(|e| fetch_error(format!("unreadable response: {}", e)))?;

        let cap = source.result_cap();
        if records.len() > cap {
            debug!("Capping {} records to {}", records.len(), cap);
            records.truncate(cap);
        }

        Ok(records)
    }

    async fn pace(&self) {
        let min = self.config.min_pacing;
        let max = self.config.max_pacing;
        if max.is_zero() {
            return;
        }
        let delay = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        tokio::time::sleep(delay).await;
    }
}
