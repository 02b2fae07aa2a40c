//! Proxy health checking
//!
//! Probes run outside the pool lock on copies of the records; their results
//! are applied back through [`ProxyPool::apply_probe`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use rand::seq::SliceRandom;
use reqwest::{Client, StatusCode};
use tokio::sync::{watch, Semaphore};
use tokio::time::interval;
use tracing::{debug, info, instrument, warn};

use crate::client::fingerprint;
use crate::config::{PoolConfig, DEFAULT_CONCURRENT_CHECKS, DEFAULT_MAX_RESPONSE_TIME_SECS};
use crate::error::{PoolError, Result};
use crate::proxy::geo::GeoLocator;
use crate::proxy::models::{ProbeResult, ProxyRecord};
use crate::proxy::pool::ProxyPool;

/// Default timeout for proxy probes in seconds
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;

/// Echo endpoints a probe picks from at random
pub const DEFAULT_TEST_URLS: &[&str] = &[
    "http://httpbin.org/ip",
    "https://api.ipify.org?format=json",
    "http://ip-api.com/json",
    "https://httpbin.org/user-agent",
    "https://icanhazip.com",
    "http://jsonip.com",
];

/// Configuration for the health checker
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Timeout for each probe
    pub timeout: Duration,
    /// Number of concurrent probes
    pub concurrency: usize,
    /// Probes slower than this count as failures
    pub max_response_time: Duration,
    pub test_urls: Vec<String>,
    /// Interval between scheduled cycles
    pub check_interval: Duration,
    /// Path to MMDB file for country lookups (optional)
    pub mmdb_path: Option<PathBuf>,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            concurrency: DEFAULT_CONCURRENT_CHECKS,
            max_response_time: Duration::from_secs_f64(DEFAULT_MAX_RESPONSE_TIME_SECS),
            test_urls: DEFAULT_TEST_URLS.iter().map(|url| url.to_string()).collect(),
            check_interval: PoolConfig::default().check_interval(),
            mmdb_path: None,
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe settings taken from the pool configuration
    pub fn from_pool_config(config: &PoolConfig) -> Self {
        Self::default()
            .with_timeout(config.timeout())
            .with_concurrency(config.concurrent_checks)
            .with_max_response_time(Duration::from_secs_f64(config.max_response_time.max(0.0)))
            .with_check_interval(config.check_interval())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_max_response_time(mut self, max: Duration) -> Self {
        self.max_response_time = max;
        self
    }

    pub fn with_test_urls(mut self, urls: Vec<String>) -> Self {
        self.test_urls = urls;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_mmdb_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.mmdb_path = Some(path.into());
        self
    }
}

/// Tally of one health-check cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub checked: usize,
    pub working: usize,
    pub failed: usize,
    /// Records pruned from the pool at the end of the cycle
    pub removed: usize,
}

/// Health checker for pooled proxies
#[derive(Clone)]
pub struct HealthChecker {
    config: CheckerConfig,
    geo_locator: Option<GeoLocator>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::with_config(CheckerConfig::default())
    }

    pub fn with_config(config: CheckerConfig) -> Self {
        let geo_locator = config.mmdb_path.as_ref().and_then(|path| {
            GeoLocator::from_path(path)
                .map_err(|e| warn!("Country lookup disabled: {}", e))
                .ok()
        });

        Self {
            config,
            geo_locator,
        }
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    /// Probe one proxy without touching the pool
    #[instrument(skip(self, record), fields(proxy = %record.address))]
    pub async fn probe(&self, record: &ProxyRecord) -> ProbeResult {
        let address = record.address.clone();
        let client = match self.create_client(record) {
            Ok(client) => client,
            Err(e) => return ProbeResult::failed(address, e.to_string()),
        };
        let test_url = {
            let mut rng = rand::thread_rng();
            self.config.test_urls.choose(&mut rng).cloned()
        };
        let Some(test_url) = test_url else {
            return ProbeResult::failed(address, "no test URL configured".to_string());
        };

        let start = Instant::now();
        let request = client
            .get(&test_url)
            .header(reqwest::header::USER_AGENT, fingerprint::random_user_agent())
            .send();

        match tokio::time::timeout(self.config.timeout, request).await {
            Ok(Ok(response)) => {
                let elapsed = start.elapsed();
                let status = response.status();
                // A 404 still proves the proxy relayed the request
                let reached = status.is_success() || status == StatusCode::NOT_FOUND;
                if !reached {
                    debug!("Probe rejected with HTTP {}", status.as_u16());
                    ProbeResult::failed(address, format!("HTTP status: {}", status))
                } else if elapsed > self.config.max_response_time {
                    ProbeResult::failed(address, format!("too slow: {:.2}s", elapsed.as_secs_f64()))
                } else {
                    ProbeResult::working(address, elapsed.as_secs_f64())
                }
            }
            Ok(Err(e)) if e.is_timeout() => ProbeResult::timeout(address),
            Ok(Err(e)) => ProbeResult::failed(address, PoolError::from_transport(e).to_string()),
            Err(_) => ProbeResult::timeout(address),
        }
    }

    /// Probe one proxy and record the result in the pool
    pub async fn test_one(&self, pool: &ProxyPool, record: &ProxyRecord) -> bool {
        let result = self.probe(record).await;
        self.apply(pool, record, &result);
        result.is_working()
    }

    fn apply(&self, pool: &ProxyPool, record: &ProxyRecord, result: &ProbeResult) {
        let country = if result.is_working() && record.has_unknown_country() {
            self.lookup_country(record)
        } else {
            None
        };
        if result.is_working() {
            debug!(
                "Proxy {} working ({:.2}s)",
                record.address,
                result.response_time.unwrap_or_default()
            );
        } else {
            debug!("Proxy {} failed: {:?}", record.address, result.status);
        }
        pool.apply_probe(result, country);
    }

    fn lookup_country(&self, record: &ProxyRecord) -> Option<String> {
        let geo = self.geo_locator.as_ref()?;
        match geo.country_code(record.host()) {
            Ok(country) => country,
            Err(e) => {
                debug!("No country for {}: {}", record.address, e);
                None
            }
        }
    }

    /// Probe records concurrently, at most `concurrency` at a time
    pub async fn probe_all(&self, records: Vec<ProxyRecord>) -> Vec<(ProxyRecord, ProbeResult)> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));

        stream::iter(records)
            .map(|record| {
                let sem = Arc::clone(&semaphore);
                async move {
                    let result = match sem.acquire().await {
                        Ok(_permit) => self.probe(&record).await,
                        Err(e) => ProbeResult::failed(record.address.clone(), e.to_string()),
                    };
                    (record, result)
                }
            })
            .buffer_unordered(self.config.concurrency)
            .collect::<Vec<_>>()
            .await
    }

    async fn check_records(&self, pool: &ProxyPool, records: Vec<ProxyRecord>) -> HealthReport {
        let mut report = HealthReport {
            checked: records.len(),
            ..HealthReport::default()
        };

        for (record, result) in self.probe_all(records).await {
            if result.is_working() {
                report.working += 1;
            } else {
                report.failed += 1;
            }
            self.apply(pool, &record, &result);
        }
        report
    }

    /// Run one health-check cycle over the pool's due batch, prune and persist
    pub async fn check_health(&self, pool: &ProxyPool) -> HealthReport {
        info!("Checking proxy pool health");
        let batch = pool.health_check_batch(pool.config().health_check_batch);
        let mut report = self.check_records(pool, batch).await;

        report.removed = pool.finish_health_cycle();
        if let Err(e) = pool.save() {
            warn!("Continuing without persistence: {}", e);
        }

        info!(
            "Health check complete: {} working, {} failed, {} removed, {} remaining",
            report.working,
            report.failed,
            report.removed,
            pool.len()
        );
        report
    }

    /// Probe the first `count` records in pool order
    pub async fn probe_first(&self, pool: &ProxyPool, count: usize) -> HealthReport {
        let records: Vec<ProxyRecord> = pool.records().into_iter().take(count).collect();
        let report = self.check_records(pool, records).await;
        if let Err(e) = pool.save() {
            warn!("Continuing without persistence: {}", e);
        }
        report
    }

    /// Run health checks every `check_interval` until shutdown is signalled
    #[instrument(skip(self, pool, shutdown))]
    pub async fn run(&self, pool: Arc<ProxyPool>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting health checker with {}s interval",
            self.config.check_interval.as_secs()
        );

        let mut check_interval = interval(self.config.check_interval);

        loop {
            tokio::select! {
                _ = check_interval.tick() => {
                    self.check_health(&pool).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn create_client(&self, record: &ProxyRecord) -> Result<Client> {
        let proxy = record.reqwest_proxy()?;

        let client = Client::builder()
            .proxy(proxy)
            .timeout(self.config.timeout)
            .build()?;

        Ok(client)
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

/// Stops a running [`HealthChecker::run`] loop
pub struct HealthCheckerHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl HealthCheckerHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::fetcher::{FetcherConfig, ProxyFetcher};
    use crate::proxy::models::{ProbeStatus, ProxyProtocol};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP proxy that answers every request with `status`
    async fn fake_proxy(status: u16) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {} Fake\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
                        status
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        address
    }

    fn test_checker() -> HealthChecker {
        HealthChecker::with_config(
            CheckerConfig::new()
                .with_timeout(Duration::from_secs(5))
                .with_test_urls(vec!["http://probe.invalid/ip".to_string()]),
        )
    }

    fn offline_pool(config: PoolConfig) -> ProxyPool {
        let fetcher = ProxyFetcher::with_config(
            FetcherConfig::new()
                .with_sources(Vec::new())
                .with_seeds(Vec::new())
                .with_pacing(Duration::ZERO, Duration::ZERO),
        )
        .unwrap();
        ProxyPool::with_components(config, fetcher, test_checker())
    }

    #[test]
    fn test_checker_config_default() {
        let config = CheckerConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS));
        assert_eq!(config.concurrency, DEFAULT_CONCURRENT_CHECKS);
        assert_eq!(config.test_urls.len(), DEFAULT_TEST_URLS.len());
        assert!(config.mmdb_path.is_none());
    }

    #[test]
    fn test_checker_config_from_pool_config() {
        let pool_config = PoolConfig::new()
            .with_timeout(Duration::from_secs(4))
            .with_concurrent_checks(3)
            .with_max_response_time(7.5)
            .with_check_interval(Duration::from_secs(60));
        let config = CheckerConfig::from_pool_config(&pool_config);

        assert_eq!(config.timeout, Duration::from_secs(4));
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.max_response_time, Duration::from_secs_f64(7.5));
        assert_eq!(config.check_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_missing_mmdb_disables_lookup() {
        let checker = HealthChecker::with_config(CheckerConfig::new().with_mmdb_path("/nonexistent.mmdb"));
        assert!(checker.geo_locator.is_none());
    }

    #[tokio::test]
    async fn test_probe_classification() {
        let checker = test_checker();

        let ok = ProxyRecord::new(fake_proxy(200).await, ProxyProtocol::Http);
        assert!(checker.probe(&ok).await.is_working());

        let not_found = ProxyRecord::new(fake_proxy(404).await, ProxyProtocol::Http);
        assert!(checker.probe(&not_found).await.is_working());

        let forbidden = ProxyRecord::new(fake_proxy(403).await, ProxyProtocol::Http);
        let result = checker.probe(&forbidden).await;
        assert!(matches!(result.status, ProbeStatus::Failed(_)));
    }

    #[tokio::test]
    async fn test_probe_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = test_checker()
            .probe(&ProxyRecord::new(address, ProxyProtocol::Http))
            .await;
        assert!(!result.is_working());
    }

    #[tokio::test]
    async fn test_check_health_prunes_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");
        let pool = offline_pool(PoolConfig::new().with_max_retries(1).with_proxy_file(&path));

        let good = fake_proxy(200).await;
        let bad = fake_proxy(403).await;
        pool.merge(vec![
            ProxyRecord::new(good.as_str(), ProxyProtocol::Http),
            ProxyRecord::new(bad.as_str(), ProxyProtocol::Http),
        ]);

        let report = pool.checker().check_health(&pool).await;
        assert_eq!(report.checked, 2);
        assert_eq!(report.working, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.removed, 1);

        let survivor = pool.get(&good).unwrap();
        assert_eq!(survivor.success_count, 1);
        assert!(survivor.last_checked.is_some());
        assert!(pool.get(&bad).is_none());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(offline_pool(
            PoolConfig::new().with_proxy_file(dir.path().join("pool.json")),
        ));
        let (handle, rx) = HealthCheckerHandle::new();
        let checker = test_checker();

        let task = tokio::spawn(async move { checker.run(pool, rx).await });
        handle.shutdown();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("health checker did not stop")
            .unwrap();
    }
}
