//! Resilient HTTP client
//!
//! Requests go out through a pooled proxy first and fall back to a direct
//! connection. The proxy is kept for `rotation_interval` requests before a
//! new one is acquired. Every attempt is reported back to the provider.

pub mod fingerprint;
pub mod provider;

pub use provider::ProxyProvider;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::{PoolError, Result};
use crate::proxy::models::{ProxyRecord, RequestOutcome};
use crate::proxy::pool::PoolStats;

/// Default number of requests served by one proxy before rotating
pub const DEFAULT_ROTATION_INTERVAL: u64 = 10;

/// Default attempts through the current proxy
pub const DEFAULT_PROXIED_ATTEMPTS: u32 = 2;

/// Default pause between proxied attempts in milliseconds
pub const DEFAULT_PROXIED_BACKOFF_MS: u64 = 1000;

/// Default direct attempts
pub const DEFAULT_DIRECT_RETRIES: u32 = 3;

/// Default base of the linear direct backoff in milliseconds
pub const DEFAULT_DIRECT_BACKOFF_MS: u64 = 2000;

/// Default base of the extra backoff after a direct 403 in milliseconds
pub const DEFAULT_FORBIDDEN_BACKOFF_MS: u64 = 3000;

/// Default per-attempt timeout in seconds
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 20;

/// Default pacing delay bounds in milliseconds
pub const DEFAULT_MIN_DELAY_MS: u64 = 500;
pub const DEFAULT_MAX_DELAY_MS: u64 = 2500;

/// Configuration for the resilient client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub use_proxy: bool,
    pub rotation_interval: u64,
    pub proxied_attempts: u32,
    pub proxied_backoff: Duration,
    pub direct_retries: u32,
    /// Wait before direct retry `n` (0-based) is `(n + 1) * direct_backoff`
    pub direct_backoff: Duration,
    /// Extra wait after a direct 403, `(n + 1) * forbidden_backoff`
    pub forbidden_backoff: Duration,
    pub timeout: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            use_proxy: true,
            rotation_interval: DEFAULT_ROTATION_INTERVAL,
            proxied_attempts: DEFAULT_PROXIED_ATTEMPTS,
            proxied_backoff: Duration::from_millis(DEFAULT_PROXIED_BACKOFF_MS),
            direct_retries: DEFAULT_DIRECT_RETRIES,
            direct_backoff: Duration::from_millis(DEFAULT_DIRECT_BACKOFF_MS),
            forbidden_backoff: Duration::from_millis(DEFAULT_FORBIDDEN_BACKOFF_MS),
            timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            min_delay: Duration::from_millis(DEFAULT_MIN_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_use_proxy(mut self, use_proxy: bool) -> Self {
        self.use_proxy = use_proxy;
        self
    }

    pub fn with_rotation_interval(mut self, interval: u64) -> Self {
        self.rotation_interval = interval.max(1);
        self
    }

    pub fn with_proxied_attempts(mut self, attempts: u32, backoff: Duration) -> Self {
        self.proxied_attempts = attempts;
        self.proxied_backoff = backoff;
        self
    }

    pub fn with_direct_retries(mut self, retries: u32, backoff: Duration, forbidden_backoff: Duration) -> Self {
        self.direct_retries = retries;
        self.direct_backoff = backoff;
        self.forbidden_backoff = forbidden_backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_delay(mut self, min: Duration, max: Duration) -> Self {
        self.min_delay = min;
        self.max_delay = max.max(min);
        self
    }

    /// No pacing and no backoff
    pub fn without_delays(mut self) -> Self {
        self.min_delay = Duration::ZERO;
        self.max_delay = Duration::ZERO;
        self.proxied_backoff = Duration::ZERO;
        self.direct_backoff = Duration::ZERO;
        self.forbidden_backoff = Duration::ZERO;
        self
    }
}

/// Per-request options
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Caller headers, these win over the randomized ones
    pub headers: HeaderMap,
    /// Overrides the configured per-attempt timeout
    pub timeout: Option<Duration>,
    pub body: Option<String>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Snapshot of the client's own counters
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub total_requests: u64,
    pub use_proxy: bool,
    pub current_proxy: Option<String>,
    pub pool: Option<PoolStats>,
}

#[derive(Debug, Default)]
struct Session {
    current: Option<ProxyRecord>,
    request_count: u64,
}

enum ProxiedResult {
    Done(Response),
    FellThrough { attempts: u32, last_error: Option<String> },
}

/// HTTP client that rotates pooled proxies and degrades to direct requests
pub struct ResilientClient {
    config: ClientConfig,
    provider: Arc<dyn ProxyProvider>,
    session: Mutex<Session>,
}

impl ResilientClient {
    pub fn new(provider: Arc<dyn ProxyProvider>) -> Self {
        Self::with_config(provider, ClientConfig::default())
    }

    pub fn with_config(provider: Arc<dyn ProxyProvider>, config: ClientConfig) -> Self {
        Self {
            config,
            provider,
            session: Mutex::new(Session::default()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        self.request(Method::GET, url, RequestOptions::default()).await
    }

    pub async fn post(&self, url: &str, body: impl Into<String>) -> Result<Response> {
        self.request(Method::POST, url, RequestOptions::new().with_body(body))
            .await
    }

    /// Execute one request.
    ///
    /// Returns a 2xx response, a definitive 404 (or a 403 that survived every
    /// direct retry), or `RequestsExhausted` when both paths gave up.
    #[instrument(skip(self, options))]
    pub async fn request(&self, method: Method, url: &str, options: RequestOptions) -> Result<Response> {
        let proxy = self.session_proxy().await;
        self.pace().await;

        let mut headers = fingerprint::random_headers();
        headers.extend(options.headers.clone());
        let timeout = options.timeout.unwrap_or(self.config.timeout);

        let mut proxied_attempts = 0;
        let mut last_error = None;
        if let Some(record) = proxy {
            match self
                .try_proxied(&record, &method, url, &headers, timeout, &options)
                .await
            {
                ProxiedResult::Done(response) => return Ok(response),
                ProxiedResult::FellThrough { attempts, last_error: error } => {
                    warn!("Proxied request failed, switching to direct connection");
                    proxied_attempts = attempts;
                    last_error = error;
                }
            }
        }

        self.try_direct(&method, url, &headers, timeout, &options, proxied_attempts, last_error)
            .await
    }

    /// The proxy for this request, rotating every `rotation_interval` requests
    async fn session_proxy(&self) -> Option<ProxyRecord> {
        let rotate = {
            let mut session = self.session.lock();
            session.request_count += 1;
            if !self.config.use_proxy {
                return None;
            }
            session.current.is_none()
                || session.request_count % self.config.rotation_interval.max(1) == 0
        };

        if rotate {
            let next = self.provider.acquire().await;
            match &next {
                Some(record) => info!("Rotating to proxy {}", record.address),
                None => warn!("No usable proxy, using direct connection"),
            }
            self.session.lock().current = next;
        }

        self.session.lock().current.clone()
    }

    fn clear_current(&self, address: &str) {
        let mut session = self.session.lock();
        if session.current.as_ref().map(|r| r.address.as_str()) == Some(address) {
            session.current = None;
        }
    }

    async fn try_proxied(
        &self,
        record: &ProxyRecord,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
        timeout: Duration,
        options: &RequestOptions,
    ) -> ProxiedResult {
        let mut last_error = None;
        let mut attempts = 0;

        let client = match build_client(Some(record), timeout) {
            Ok(client) => client,
            Err(e) => {
                warn!("Cannot use proxy {}: {}", record.address, e);
                self.provider
                    .report(&record.address, RequestOutcome::failure(None, 0.0));
                self.clear_current(&record.address);
                return ProxiedResult::FellThrough {
                    attempts,
                    last_error: Some(e.to_string()),
                };
            }
        };

        for attempt in 0..self.config.proxied_attempts {
            attempts += 1;
            debug!(
                "{} {} via proxy {} (attempt {}/{})",
                method,
                url,
                record.address,
                attempt + 1,
                self.config.proxied_attempts
            );

            let start = Instant::now();
            match send(&client, method, url, headers, options).await {
                Ok(response) => {
                    let elapsed = start.elapsed().as_secs_f64();
                    let status = response.status();
                    if status.is_success() {
                        debug!("Proxied request succeeded: {}", url);
                        self.provider
                            .report(&record.address, RequestOutcome::success(status.as_u16(), elapsed));
                        return ProxiedResult::Done(response);
                    }
                    if status == StatusCode::NOT_FOUND {
                        warn!("{}", PoolError::TargetNotFound { url: url.to_string() });
                        self.provider
                            .report(&record.address, RequestOutcome::success(status.as_u16(), elapsed));
                        return ProxiedResult::Done(response);
                    }
                    self.provider.report(
                        &record.address,
                        RequestOutcome::failure(Some(status.as_u16()), elapsed),
                    );
                    if status == StatusCode::FORBIDDEN {
                        let rejected = PoolError::ProxyRejected { status: status.as_u16() };
                        last_error = Some(rejected.to_string());
                        if let Some(result) = self.give_up_on(record, rejected, attempts) {
                            return result;
                        }
                    } else {
                        warn!("Proxy returned unexpected status {}: {}", status.as_u16(), url);
                        last_error = Some(format!("HTTP {}", status.as_u16()));
                    }
                }
                Err(e) => {
                    self.provider.report(
                        &record.address,
                        RequestOutcome::failure(None, start.elapsed().as_secs_f64()),
                    );
                    let error = PoolError::from_transport(e);
                    last_error = Some(error.to_string());
                    if let Some(result) = self.give_up_on(record, error, attempts) {
                        return result;
                    }
                }
            }

            if attempt + 1 < self.config.proxied_attempts {
                tokio::time::sleep(self.config.proxied_backoff).await;
            }
        }

        ProxiedResult::FellThrough { attempts, last_error }
    }

    /// Drop the session proxy when `error` is charged to it
    fn give_up_on(&self, record: &ProxyRecord, error: PoolError, attempts: u32) -> Option<ProxiedResult> {
        if !error.is_proxy_failure() {
            return None;
        }
        warn!("Proxy {}: {}", record.address, error);
        self.clear_current(&record.address);
        Some(ProxiedResult::FellThrough {
            attempts,
            last_error: Some(error.to_string()),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_direct(
        &self,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
        timeout: Duration,
        options: &RequestOptions,
        proxied_attempts: u32,
        mut last_error: Option<String>,
    ) -> Result<Response> {
        let client = build_client(None, timeout)?;
        let retries = self.config.direct_retries;

        for attempt in 0..retries {
            let is_last = attempt + 1 == retries;
            debug!("{} {} direct (attempt {}/{})", method, url, attempt + 1, retries);

            match send(&client, method, url, headers, options).await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        debug!("Direct request succeeded: {}", url);
                        self.provider.record_direct_outcome(true);
                        return Ok(response);
                    }
                    if status == StatusCode::NOT_FOUND {
                        warn!("{}", PoolError::TargetNotFound { url: url.to_string() });
                        self.provider.record_direct_outcome(true);
                        return Ok(response);
                    }

                    self.provider.record_direct_outcome(false);
                    if status == StatusCode::FORBIDDEN {
                        warn!("Direct connection rejected (403): {}", url);
                        if is_last {
                            return Ok(response);
                        }
                        let wait = self.config.forbidden_backoff * (attempt + 1);
                        info!("Address may be rate limited, waiting {:?}", wait);
                        tokio::time::sleep(wait).await;
                    } else {
                        warn!("Direct request returned status {}: {}", status.as_u16(), url);
                    }
                    last_error = Some(format!("HTTP {}", status.as_u16()));
                }
                Err(e) => {
                    self.provider.record_direct_outcome(false);
                    warn!("Direct request error: {}", e);
                    last_error = Some(e.to_string());
                }
            }

            if !is_last {
                let wait = self.config.direct_backoff * (attempt + 1);
                debug!("Retrying direct request in {:?}", wait);
                tokio::time::sleep(wait).await;
            }
        }

        let error = PoolError::RequestsExhausted {
            proxied_attempts,
            direct_attempts: retries,
            last_error: last_error.unwrap_or_else(|| "no attempt made".to_string()),
        };
        tracing::error!("All request strategies failed for {}: {}", url, error);
        Err(error)
    }

    async fn pace(&self) {
        let (min, max) = (self.config.min_delay, self.config.max_delay);
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

    pub fn get_stats(&self) -> ClientStats {
        let session = self.session.lock();
        ClientStats {
            total_requests: session.request_count,
            use_proxy: self.config.use_proxy,
            current_proxy: session.current.as_ref().map(|r| r.address.clone()),
            pool: self.provider.stats(),
        }
    }
}

fn build_client(proxy: Option<&ProxyRecord>, timeout: Duration) -> Result<Client> {
    let builder = Client::builder().timeout(timeout);
    let builder = match proxy {
        Some(record) => builder.proxy(record.reqwest_proxy()?),
        None => builder.no_proxy(),
    };
    Ok(builder.build()?)
}

async fn send(
    client: &Client,
    method: &Method,
    url: &str,
    headers: &HeaderMap,
    options: &RequestOptions,
) -> std::result::Result<Response, reqwest::Error> {
    let mut request = client.request(method.clone(), url).headers(headers.clone());
    if let Some(body) = &options.body {
        request = request.body(body.clone());
    }
    request.send().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert!(config.use_proxy);
        assert_eq!(config.rotation_interval, 10);
        assert_eq!(config.proxied_attempts, 2);
        assert_eq!(config.proxied_backoff, Duration::from_secs(1));
        assert_eq!(config.direct_retries, 3);
        assert_eq!(config.direct_backoff, Duration::from_secs(2));
        assert_eq!(config.forbidden_backoff, Duration::from_secs(3));
        assert_eq!(config.timeout, Duration::from_secs(20));
        assert_eq!(config.min_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_millis(2500));
    }

    #[test]
    fn test_client_config_without_delays() {
        let config = ClientConfig::new()
            .with_rotation_interval(0)
            .with_proxied_attempts(4, Duration::from_secs(9))
            .without_delays();
        assert_eq!(config.rotation_interval, 1);
        assert_eq!(config.proxied_attempts, 4);
        assert!(config.proxied_backoff.is_zero());
        assert!(config.direct_backoff.is_zero());
        assert!(config.forbidden_backoff.is_zero());
        assert!(config.max_delay.is_zero());
    }

    #[test]
    fn test_request_options_builder() {
        let options = RequestOptions::new()
            .with_timeout(Duration::from_secs(3))
            .with_body("{}");
        assert_eq!(options.timeout, Some(Duration::from_secs(3)));
        assert_eq!(options.body.as_deref(), Some("{}"));
        assert!(options.headers.is_empty());
    }

    struct IdleProvider;

    #[async_trait::async_trait]
    impl ProxyProvider for IdleProvider {
        async fn acquire(&self) -> Option<ProxyRecord> {
            None
        }

        fn report(&self, _address: &str, _outcome: RequestOutcome) {}

        fn record_direct_outcome(&self, _success: bool) {}
    }

    #[test]
    fn test_only_proxy_failures_drop_the_session_proxy() {
        let client = ResilientClient::new(Arc::new(IdleProvider));
        let record = ProxyRecord::new("10.0.0.1:8080", crate::proxy::models::ProxyProtocol::Http);
        client.session.lock().current = Some(record.clone());

        let kept = client.give_up_on(&record, PoolError::Persistence("disk full".into()), 1);
        assert!(kept.is_none());
        assert!(client.session.lock().current.is_some());

        match client.give_up_on(&record, PoolError::ProxyRejected { status: 403 }, 2) {
            Some(ProxiedResult::FellThrough { attempts, last_error }) => {
                assert_eq!(attempts, 2);
                assert!(last_error.unwrap().contains("403"));
            }
            _ => panic!("rejection should fall through"),
        }
        assert!(client.session.lock().current.is_none());
    }
}
