//! On-disk pool snapshot
//!
//! The snapshot is a JSON document `{proxies, stats, direct, updated_at, config}`.
//! Older files that store `proxies` as plain address strings, or that are a bare
//! list of addresses, still load.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::proxy::models::{lenient_timestamp, parse_timestamp, ProxyProtocol, ProxyRecord};

/// Real-traffic counters for one proxy address
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    /// Mean response time of successful requests, in seconds
    pub avg_response_time: f64,
    #[serde(deserialize_with = "lenient_timestamp")]
    pub last_success: Option<DateTime<Utc>>,
}

impl AddressStats {
    pub fn record(&mut self, success: bool, response_time: Option<f64>) {
        self.total_requests += 1;
        if !success {
            return;
        }
        self.successful_requests += 1;
        self.last_success = Some(Utc::now());
        if let Some(elapsed) = response_time {
            let n = self.successful_requests as f64;
            self.avg_response_time += (elapsed - self.avg_response_time) / n;
        }
    }
}

/// Counters for requests sent without a proxy
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectStats {
    pub total_requests: u64,
    pub successful_requests: u64,
}

impl DirectStats {
    pub fn record(&mut self, success: bool) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        }
    }
}

/// Serializable form of the whole pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub proxies: Vec<ProxyRecord>,
    pub stats: BTreeMap<String, AddressStats>,
    pub direct: DirectStats,
    pub updated_at: Option<DateTime<Utc>>,
    pub config: PoolConfig,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Record(ProxyRecord),
    Address(String),
}

impl From<StoredEntry> for ProxyRecord {
    fn from(entry: StoredEntry) -> Self {
        match entry {
            StoredEntry::Record(record) => record,
            StoredEntry::Address(address) => ProxyRecord::new(address, ProxyProtocol::Http),
        }
    }
}

#[derive(Deserialize)]
struct StoredSnapshot {
    #[serde(default)]
    proxies: Vec<StoredEntry>,
    #[serde(default)]
    stats: BTreeMap<String, AddressStats>,
    #[serde(default)]
    direct: DirectStats,
    #[serde(default)]
    updated_at: Option<Value>,
    #[serde(default)]
    config: Option<PoolConfig>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredFile {
    Snapshot(StoredSnapshot),
    AddressList(Vec<StoredEntry>),
}

impl PoolSnapshot {
    /// Parse a snapshot document in either the current or a legacy layout
    pub fn from_json(content: &str, config: &PoolConfig) -> Result<Self> {
        let stored: StoredFile = serde_json::from_str(content)?;
        let snapshot = match stored {
            StoredFile::Snapshot(stored) => PoolSnapshot {
                proxies: stored.proxies.into_iter().map(ProxyRecord::from).collect(),
                stats: stored.stats,
                direct: stored.direct,
                updated_at: stored
                    .updated_at
                    .as_ref()
                    .and_then(Value::as_str)
                    .and_then(parse_timestamp),
                config: stored.config.unwrap_or_else(|| config.clone()),
            },
            StoredFile::AddressList(entries) => PoolSnapshot {
                proxies: entries.into_iter().map(ProxyRecord::from).collect(),
                stats: BTreeMap::new(),
                direct: DirectStats::default(),
                updated_at: None,
                config: config.clone(),
            },
        };
        Ok(snapshot)
    }

    /// Load the snapshot at `path`; `Ok(None)` when the file does not exist
    pub fn load(path: &Path, config: &PoolConfig) -> Result<Option<Self>> {
        if !path.exists() {
            debug!("No snapshot at {:?}", path);
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        let snapshot = Self::from_json(&content, config)
            .map_err(|e| PoolError::Persistence(format!("corrupt snapshot {:?}: {}", path, e)))?;

        info!("Loaded {} proxies from {:?}", snapshot.proxies.len(), path);
        if let Some(updated_at) = snapshot.updated_at {
            info!("Snapshot last updated at {}", updated_at);
        }
        Ok(Some(snapshot))
    }

    /// Write the snapshot to `path`.
    ///
    /// An existing file is first renamed to `backup`; if the write fails the
    /// backup is moved back into place.
    pub fn save(&self, path: &Path, backup: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;

        let had_previous = path.exists();
        if had_previous {
            fs::rename(path, backup)?;
        }

        if let Err(e) = Self::write_file(path, &content) {
            if had_previous {
                match fs::rename(backup, path) {
                    Ok(()) => info!("Restored snapshot backup {:?}", backup),
                    Err(restore) => warn!("Could not restore snapshot backup: {}", restore),
                }
            }
            return Err(PoolError::Persistence(format!(
                "failed to write {:?}: {}",
                path, e
            )));
        }

        debug!("Saved {} proxies to {:?}", self.proxies.len(), path);
        Ok(())
    }

    fn write_file(path: &Path, content: &str) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, content)
    }
}
