//! Pool configuration
//!
//! `PoolConfig` is persisted alongside the records in every snapshot, so
//! durations are stored as plain seconds.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default maximum number of records kept in the pool
pub const DEFAULT_MAX_POOL_SIZE: usize = 100;

/// Default seconds between scheduled health checks
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 300;

/// Default failure threshold before a proxy is excluded from selection
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default per-probe timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default minimum success rate for selection
pub const DEFAULT_MIN_SUCCESS_RATE: f64 = 0.3;

/// Default slowest acceptable probe response in seconds
pub const DEFAULT_MAX_RESPONSE_TIME_SECS: f64 = 30.0;

/// Default number of concurrent health probes
pub const DEFAULT_CONCURRENT_CHECKS: usize = 10;

/// Default snapshot file
pub const DEFAULT_PROXY_FILE: &str = "proxy_pool.json";

/// Default number of ranked records eligible for weighted selection
pub const DEFAULT_SELECTION_TOP_K: usize = 5;

/// Default number of records probed per health-check cycle
pub const DEFAULT_HEALTH_CHECK_BATCH: usize = 30;

/// Configuration for the proxy pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of records kept after a merge
    pub max_pool_size: usize,
    /// Seconds between scheduled health checks
    pub check_interval: u64,
    /// Failures before a proxy joins the failed set
    pub max_retries: u32,
    /// Per-probe timeout in seconds
    pub timeout: u64,
    /// Records below this success rate are never selected
    pub min_success_rate: f64,
    /// Probes slower than this many seconds count as failures
    pub max_response_time: f64,
    /// Size of the health-check worker pool
    pub concurrent_checks: usize,
    /// Snapshot file path
    pub proxy_file: PathBuf,
    /// How many of the best-ranked records take part in weighted selection
    pub selection_top_k: usize,
    /// How many records a health-check cycle probes
    pub health_check_batch: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            check_interval: DEFAULT_CHECK_INTERVAL_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: DEFAULT_TIMEOUT_SECS,
            min_success_rate: DEFAULT_MIN_SUCCESS_RATE,
            max_response_time: DEFAULT_MAX_RESPONSE_TIME_SECS,
            concurrent_checks: DEFAULT_CONCURRENT_CHECKS,
            proxy_file: PathBuf::from(DEFAULT_PROXY_FILE),
            selection_top_k: DEFAULT_SELECTION_TOP_K,
            health_check_batch: DEFAULT_HEALTH_CHECK_BATCH,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_pool_size(mut self, max_pool_size: usize) -> Self {
        self.max_pool_size = max_pool_size;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.as_secs().max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.as_secs().max(1);
        self
    }

    pub fn with_min_success_rate(mut self, rate: f64) -> Self {
        self.min_success_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_response_time(mut self, seconds: f64) -> Self {
        self.max_response_time = seconds;
        self
    }

    pub fn with_concurrent_checks(mut self, concurrency: usize) -> Self {
        self.concurrent_checks = concurrency;
        self
    }

    pub fn with_proxy_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.proxy_file = path.into();
        self
    }

    pub fn with_selection_top_k(mut self, top_k: usize) -> Self {
        self.selection_top_k = top_k;
        self
    }

    pub fn with_health_check_batch(mut self, batch: usize) -> Self {
        self.health_check_batch = batch;
        self
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }

    /// Failure count at which a record is dropped from the pool entirely
    pub fn removal_threshold(&self) -> u32 {
        self.max_retries.saturating_mul(2)
    }

    /// Path of the backup written before each snapshot overwrite
    pub fn backup_file(&self) -> PathBuf {
        let mut name = self.proxy_file.as_os_str().to_owned();
        name.push(".backup");
        PathBuf::from(name)
    }
}
