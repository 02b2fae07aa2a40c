//! The proxy pool store
//!
//! `ProxyPool` is the single owner of the record list, the failed set and the
//! per-address traffic stats. All of it lives behind one lock that is never
//! held across an `.await`; network work (fetching, probing) happens on
//! copies and the results are applied afterwards.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::proxy::checker::{CheckerConfig, HealthChecker, HealthReport};
use crate::proxy::fetcher::ProxyFetcher;
use crate::proxy::models::{ProbeResult, ProxyProtocol, ProxyRecord};
use crate::proxy::parser::ProxyParser;
use crate::proxy::scoring::{DefaultScoring, ScoringPolicy};
use crate::proxy::snapshot::{AddressStats, DirectStats, PoolSnapshot};

/// Score above which a record counts as high quality
const HIGH_QUALITY_SCORE: f64 = 70.0;

#[derive(Debug, Default)]
struct PoolState {
    records: Vec<ProxyRecord>,
    failed: HashSet<String>,
    stats: BTreeMap<String, AddressStats>,
    direct: DirectStats,
    last_health_check: Option<DateTime<Utc>>,
}

impl PoolState {
    fn position(&self, address: &str) -> Option<usize> {
        self.records.iter().position(|r| r.address == address)
    }

    fn forget(&mut self, address: &str) {
        self.failed.remove(address);
        self.stats.remove(address);
    }
}

/// Overall pool health label derived from the mean score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl PoolQuality {
    pub fn from_avg_score(avg_score: f64) -> Self {
        if avg_score > 80.0 {
            PoolQuality::Excellent
        } else if avg_score > 60.0 {
            PoolQuality::Good
        } else if avg_score > 40.0 {
            PoolQuality::Fair
        } else {
            PoolQuality::Poor
        }
    }
}

impl fmt::Display for PoolQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PoolQuality::Excellent => "excellent",
            PoolQuality::Good => "good",
            PoolQuality::Fair => "fair",
            PoolQuality::Poor => "poor",
        };
        write!(f, "{}", label)
    }
}

/// Summary returned by [`ProxyPool::get_stats`]
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total_proxies: usize,
    /// Records that would pass selection right now
    pub working_proxies: usize,
    pub failed_proxies: usize,
    pub high_quality_proxies: usize,
    /// Working records as a percentage of all records
    pub working_ratio: f64,
    /// Mean of the measured (non-zero) response times, in seconds
    pub avg_response_time: f64,
    /// Mean of the non-zero scores
    pub avg_score: f64,
    pub protocol_distribution: BTreeMap<String, usize>,
    pub source_distribution: BTreeMap<String, usize>,
    pub country_distribution: BTreeMap<String, usize>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub pool_quality: PoolQuality,
    pub direct: DirectStats,
}

/// Thread-safe registry of proxy records
pub struct ProxyPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// Serializes snapshot writers; the rename and write pair is not atomic
    persist: Mutex<()>,
    scoring: Arc<dyn ScoringPolicy>,
    fetcher: ProxyFetcher,
    checker: HealthChecker,
}

impl ProxyPool {
    /// Create an empty pool with the built-in sources and a checker derived from `config`
    pub fn new(config: PoolConfig) -> Result<Self> {
        let fetcher = ProxyFetcher::new()?;
        let checker = HealthChecker::with_config(CheckerConfig::from_pool_config(&config));
        Ok(Self::with_components(config, fetcher, checker))
    }

    /// Create an empty pool around explicit components
    pub fn with_components(config: PoolConfig, fetcher: ProxyFetcher, checker: HealthChecker) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState::default()),
            persist: Mutex::new(()),
            scoring: Arc::new(DefaultScoring),
            fetcher,
            checker,
        }
    }

    /// Replace the scoring policy
    pub fn with_scoring(mut self, scoring: Arc<dyn ScoringPolicy>) -> Self {
        self.scoring = scoring;
        self
    }

    /// Create a pool and restore its snapshot
    pub async fn open(config: PoolConfig) -> Result<Self> {
        let pool = Self::new(config)?;
        pool.load().await;
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn checker(&self) -> &HealthChecker {
        &self.checker
    }

    /// Restore the snapshot from `proxy_file`.
    ///
    /// A missing or unreadable snapshot leaves the pool empty; an empty pool
    /// is then filled from the sources. Returns the number of records held.
    pub async fn load(&self) -> usize {
        match PoolSnapshot::load(&self.config.proxy_file, &self.config) {
            Ok(Some(snapshot)) => self.restore(snapshot),
            Ok(None) => {}
            Err(e) => warn!("Starting with an empty pool: {}", e),
        }

        if self.is_empty() {
            info!("Proxy pool is empty, fetching fresh proxies");
            let added = self.merge(self.fetcher.fetch_all().await);
            if added > 0 {
                self.save_or_log();
            }
        }
        self.len()
    }

    fn restore(&self, snapshot: PoolSnapshot) {
        let mut state = self.state.lock();
        let mut seen = HashSet::new();
        state.records = snapshot
            .proxies
            .into_iter()
            .filter(|record| seen.insert(record.address.clone()))
            .collect();
        state.stats = snapshot.stats;
        state.direct = snapshot.direct;
        state.failed = state
            .records
            .iter()
            .filter(|r| r.fail_count >= self.config.max_retries)
            .map(|r| r.address.clone())
            .collect();
    }

    /// Persist the current state, keeping a backup of the previous file
    pub fn save(&self) -> Result<()> {
        let _writer = self.persist.lock();
        let snapshot = {
            let state = self.state.lock();
            PoolSnapshot {
                proxies: state.records.clone(),
                stats: state.stats.clone(),
                direct: state.direct,
                updated_at: Some(Utc::now()),
                config: self.config.clone(),
            }
        };
        snapshot.save(&self.config.proxy_file, &self.config.backup_file())
    }

    fn save_or_log(&self) {
        if let Err(e) = self.save() {
            warn!("Continuing without persistence: {}", e);
        }
    }

    /// Final checkpoint before the pool is dropped
    pub fn shutdown(&self) -> Result<()> {
        info!("Saving proxy pool ({} proxies)", self.len());
        self.save()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    pub fn get(&self, address: &str) -> Option<ProxyRecord> {
        let state = self.state.lock();
        state.records.iter().find(|r| r.address == address).cloned()
    }

    pub fn records(&self) -> Vec<ProxyRecord> {
        self.state.lock().records.clone()
    }

    pub fn failed_addresses(&self) -> Vec<String> {
        let mut failed: Vec<String> = self.state.lock().failed.iter().cloned().collect();
        failed.sort();
        failed
    }

    pub fn is_failed(&self, address: &str) -> bool {
        self.state.lock().failed.contains(address)
    }

    pub fn address_stats(&self, address: &str) -> Option<AddressStats> {
        self.state.lock().stats.get(address).cloned()
    }

    /// Add unseen candidates, then trim to `max_pool_size` keeping the best scored.
    ///
    /// Returns how many candidates were new.
    pub fn merge(&self, candidates: Vec<ProxyRecord>) -> usize {
        let mut state = self.state.lock();
        let mut known: HashSet<String> = state.records.iter().map(|r| r.address.clone()).collect();

        let before = state.records.len();
        for candidate in candidates {
            if known.insert(candidate.address.clone()) {
                state.records.push(candidate);
            }
        }
        let added = state.records.len() - before;

        if state.records.len() > self.config.max_pool_size {
            state
                .records
                .sort_by(|a, b| b.quality_score.total_cmp(&a.quality_score));
            let dropped: Vec<String> = state
                .records
                .drain(self.config.max_pool_size..)
                .map(|r| r.address)
                .collect();
            for address in &dropped {
                state.forget(address);
            }
            debug!("Trimmed {} proxies over the pool limit", dropped.len());
        }

        if added > 0 {
            info!("Merged {} new proxies, pool size {}", added, state.records.len());
        }
        added
    }

    fn is_selectable(&self, state: &PoolState, record: &ProxyRecord) -> bool {
        !state.failed.contains(&record.address)
            && record.fail_count < self.config.max_retries
            && record.success_rate() >= self.config.min_success_rate
    }

    fn rank(a: &ProxyRecord, b: &ProxyRecord) -> Ordering {
        b.quality_score
            .total_cmp(&a.quality_score)
            .then_with(|| b.success_rate().total_cmp(&a.success_rate()))
            .then_with(|| a.fail_count.cmp(&b.fail_count))
            .then_with(|| a.response_time.total_cmp(&b.response_time))
    }

    /// Pick one record from the best ranked candidates
    pub fn select(&self) -> Result<ProxyRecord> {
        self.select_with_rng(&mut thread_rng())
    }

    /// Weighted random choice among the top `selection_top_k` eligible records.
    ///
    /// A record at rank `r` (0-based) weighs `(score + 1) / (r + 1)`.
    pub fn select_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<ProxyRecord> {
        let state = self.state.lock();
        let mut eligible: Vec<&ProxyRecord> = state
            .records
            .iter()
            .filter(|r| self.is_selectable(&state, r))
            .collect();
        if eligible.is_empty() {
            return Err(PoolError::PoolExhausted);
        }

        eligible.sort_by(|a, b| Self::rank(a, b));
        eligible.truncate(self.config.selection_top_k.max(1));

        let weights = eligible
            .iter()
            .enumerate()
            .map(|(rank, r)| (r.quality_score.max(0.0) + 1.0) / (rank as f64 + 1.0));
        let chosen = match WeightedIndex::new(weights) {
            Ok(dist) => eligible[dist.sample(rng)],
            Err(_) => eligible[0],
        };

        debug!(
            "Selected proxy {} (score {:.1}, success rate {:.2}, response time {:.2}s)",
            chosen.address,
            chosen.quality_score,
            chosen.success_rate(),
            chosen.response_time
        );
        Ok(chosen.clone())
    }

    /// Select a proxy, refetching once when nothing qualifies.
    ///
    /// `None` means the caller should go direct.
    pub async fn acquire(&self) -> Option<ProxyRecord> {
        match self.select() {
            Ok(record) => return Some(record),
            Err(e) => warn!("{}, fetching fresh proxies", e),
        }

        let added = self.merge(self.fetcher.fetch_all().await);
        if added > 0 {
            self.save_or_log();
        }

        match self.select() {
            Ok(record) => Some(record),
            Err(_) => {
                warn!("Still no usable proxy, falling back to direct connections");
                None
            }
        }
    }

    /// Feed the result of one real request back into the record for `address`.
    ///
    /// A failure at `max_retries` joins the failed set; at twice that the
    /// record is dropped.
    pub fn report_outcome(&self, address: &str, success: bool, response_time: Option<f64>) {
        let mut state = self.state.lock();
        let Some(index) = state.position(address) else {
            debug!("Outcome for unknown proxy {} ignored", address);
            return;
        };

        state
            .stats
            .entry(address.to_string())
            .or_default()
            .record(success, response_time);

        let record = &mut state.records[index];
        if success {
            record.record_success(response_time, self.scoring.as_ref());
            return;
        }

        record.record_failure(self.scoring.as_ref());
        let fail_count = record.fail_count;
        if fail_count >= self.config.max_retries && state.failed.insert(address.to_string()) {
            info!("Proxy {} marked as failed after {} failures", address, fail_count);
        }
        if fail_count >= self.config.removal_threshold() {
            state.records.remove(index);
            state.forget(address);
            info!("Removed proxy {} after {} failures", address, fail_count);
        }
    }

    /// Count a request that went out without a proxy
    pub fn record_direct_outcome(&self, success: bool) {
        self.state.lock().direct.record(success);
    }

    /// Apply one health probe result
    pub fn apply_probe(&self, result: &ProbeResult, country: Option<String>) {
        let mut state = self.state.lock();
        let Some(index) = state.position(&result.address) else {
            return;
        };

        let working = result.is_working();
        state
            .stats
            .entry(result.address.clone())
            .or_default()
            .record(working, result.response_time);

        let record = &mut state.records[index];
        if working {
            record.record_success(result.response_time, self.scoring.as_ref());
            record.last_checked = Some(Utc::now());
            if let (Some(country), true) = (country, record.has_unknown_country()) {
                record.country = country;
            }
        } else {
            record.record_failure(self.scoring.as_ref());
        }
    }

    /// Records due for probing: lowest score first, then the least recently checked
    pub fn health_check_batch(&self, limit: usize) -> Vec<ProxyRecord> {
        let mut records = self.records();
        records.sort_by(|a, b| {
            a.quality_score
                .total_cmp(&b.quality_score)
                .then_with(|| a.last_checked.cmp(&b.last_checked))
        });
        records.truncate(limit);
        records
    }

    /// Close a health-check cycle: mark exhausted records failed and prune the failed set.
    ///
    /// Returns how many records were removed.
    pub fn finish_health_cycle(&self) -> usize {
        let mut state = self.state.lock();
        let exhausted: Vec<String> = state
            .records
            .iter()
            .filter(|r| r.fail_count >= self.config.max_retries)
            .map(|r| r.address.clone())
            .collect();
        state.failed.extend(exhausted);

        let before = state.records.len();
        let PoolState {
            records, failed, stats, ..
        } = &mut *state;
        records.retain(|r| !failed.contains(&r.address));
        stats.retain(|address, _| !failed.contains(address));

        state.last_health_check = Some(Utc::now());
        before - state.records.len()
    }

    /// Clear the failed set and every record's failure count
    pub fn reset_failed(&self) -> usize {
        let mut state = self.state.lock();
        let cleared = state.failed.len();
        state.failed.clear();
        for record in &mut state.records {
            if record.fail_count > 0 {
                record.fail_count = 0;
                record.quality_score = self.scoring.score(record);
            }
        }
        info!("Reset {} failed proxies", cleared);
        cleared
    }

    /// Fetch from every source, merge, health-check and persist
    pub async fn force_refresh(&self) -> HealthReport {
        info!("Forcing proxy pool refresh");
        let added = self.merge(self.fetcher.fetch_all().await);
        debug!("Refresh merged {} new proxies", added);
        // check_health saves at the end of its cycle
        self.checker.check_health(self).await
    }

    /// Add an operator-supplied proxy; `Ok(false)` when the address is already known
    pub fn add_custom_proxy(&self, address: &str, protocol: ProxyProtocol) -> Result<bool> {
        let address = ProxyParser::validate_address(address)?;
        {
            let mut state = self.state.lock();
            if state.position(&address).is_some() {
                warn!("Proxy {} already exists", address);
                return Ok(false);
            }
            state.records.push(ProxyRecord::new(address.as_str(), protocol));
        }

        info!("Added custom proxy {}", address);
        self.save_or_log();
        Ok(true)
    }

    /// Remove a proxy together with its stats and failed-set entry
    pub fn remove_proxy(&self, address: &str) -> bool {
        let address = address.trim();
        let removed = {
            let mut state = self.state.lock();
            match state.position(address) {
                Some(index) => {
                    state.records.remove(index);
                    state.forget(address);
                    true
                }
                None => false,
            }
        };

        if removed {
            info!("Removed proxy {}", address);
            self.save_or_log();
        } else {
            warn!("Proxy {} does not exist", address);
        }
        removed
    }

    /// The `limit` best scored records
    pub fn get_top_proxies(&self, limit: usize) -> Vec<ProxyRecord> {
        let mut records = self.records();
        records.sort_by(|a, b| b.quality_score.total_cmp(&a.quality_score));
        records.truncate(limit);
        records
    }

    pub fn get_stats(&self) -> PoolStats {
        let state = self.state.lock();
        let total = state.records.len();

        let working = state
            .records
            .iter()
            .filter(|r| self.is_selectable(&state, r))
            .count();
        let high_quality = state
            .records
            .iter()
            .filter(|r| r.quality_score > HIGH_QUALITY_SCORE)
            .count();

        let response_times: Vec<f64> = state
            .records
            .iter()
            .map(|r| r.response_time)
            .filter(|rt| *rt > 0.0)
            .collect();
        let scores: Vec<f64> = state
            .records
            .iter()
            .map(|r| r.quality_score)
            .filter(|s| *s > 0.0)
            .collect();
        let avg_score = mean(&scores);

        let mut protocol_distribution = BTreeMap::new();
        let mut source_distribution = BTreeMap::new();
        let mut country_distribution = BTreeMap::new();
        for record in &state.records {
            *protocol_distribution
                .entry(record.protocol.to_string())
                .or_insert(0) += 1;
            *source_distribution.entry(record.source.clone()).or_insert(0) += 1;
            *country_distribution.entry(record.country.clone()).or_insert(0) += 1;
        }

        PoolStats {
            total_proxies: total,
            working_proxies: working,
            failed_proxies: state.failed.len(),
            high_quality_proxies: high_quality,
            working_ratio: working as f64 / total.max(1) as f64 * 100.0,
            avg_response_time: mean(&response_times),
            avg_score,
            protocol_distribution,
            source_distribution,
            country_distribution,
            last_health_check: state.last_health_check,
            pool_quality: PoolQuality::from_avg_score(avg_score),
            direct: state.direct,
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
