//! Proxy data models

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{PoolError, Result};
use crate::proxy::scoring::{DefaultScoring, ScoringPolicy};

/// Proxy protocol enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    #[default]
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks4 => "socks4",
            ProxyProtocol::Socks5 => "socks5",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "http" => Some(ProxyProtocol::Http),
            "https" => Some(ProxyProtocol::Https),
            "socks4" | "socks4a" => Some(ProxyProtocol::Socks4),
            "socks5" | "socks5h" => Some(ProxyProtocol::Socks5),
            _ => None,
        }
    }

    /// URL scheme used to reach a proxy of this protocol.
    ///
    /// HTTPS proxies are spoken to in plain HTTP and tunnel with CONNECT.
    pub fn scheme(&self) -> &'static str {
        match self {
            ProxyProtocol::Http | ProxyProtocol::Https => "http",
            ProxyProtocol::Socks4 => "socks4",
            ProxyProtocol::Socks5 => "socks5",
        }
    }
}

impl FromStr for ProxyProtocol {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| PoolError::UnsupportedProtocol(s.to_string()))
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How much of the caller's identity a proxy leaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum Anonymity {
    Transparent,
    Anonymous,
    HighAnonymous,
    #[default]
    Unknown,
}

impl Anonymity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Anonymity::Transparent => "transparent",
            Anonymity::Anonymous => "anonymous",
            Anonymity::HighAnonymous => "high_anonymous",
            Anonymity::Unknown => "unknown",
        }
    }

    /// Lenient parse of the labels proxy listings use
    pub fn parse(s: &str) -> Self {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "transparent" => Anonymity::Transparent,
            "anonymous" | "anonymity" => Anonymity::Anonymous,
            "high_anonymous" | "elite" | "elite_proxy" | "high" | "high_anonymity" => {
                Anonymity::HighAnonymous
            }
            _ => Anonymity::Unknown,
        }
    }
}

impl From<String> for Anonymity {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl fmt::Display for Anonymity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn default_country() -> String {
    "unknown".to_string()
}

fn default_source() -> String {
    "manual".to_string()
}

/// Parse an RFC 3339 or zone-less ISO timestamp; zone-less values are taken as UTC
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

pub(crate) fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

/// A proxy known to the pool together with its observed quality
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRecord {
    /// `host:port`
    #[serde(alias = "proxy")]
    pub address: String,
    #[serde(default)]
    pub protocol: ProxyProtocol,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default)]
    pub anonymity: Anonymity,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub fail_count: u32,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_checked: Option<DateTime<Utc>>,
    /// Last measured response time in seconds, 0 when never measured
    #[serde(default)]
    pub response_time: f64,
    #[serde(default = "default_source")]
    pub source: String,
    /// Derived 0-100 quality metric
    #[serde(default, alias = "score")]
    pub quality_score: f64,
}

impl ProxyRecord {
    /// Create a record on first observation
    pub fn new(address: impl Into<String>, protocol: ProxyProtocol) -> Self {
        Self {
            address: address.into(),
            protocol,
            country: default_country(),
            anonymity: Anonymity::Unknown,
            success_count: 0,
            fail_count: 0,
            last_checked: None,
            response_time: 0.0,
            source: default_source(),
            quality_score: 0.0,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        let country = country.into();
        if !country.trim().is_empty() {
            self.country = country;
        }
        self
    }

    pub fn with_anonymity(mut self, anonymity: Anonymity) -> Self {
        self.anonymity = anonymity;
        self
    }

    pub fn total_requests(&self) -> u32 {
        self.success_count.saturating_add(self.fail_count)
    }

    /// Fraction of successful observations, optimistic 1.0 when unobserved
    pub fn success_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            1.0
        } else {
            f64::from(self.success_count) / f64::from(total)
        }
    }

    /// Get the proxy URL string
    pub fn proxy_url(&self) -> String {
        format!("{}://{}", self.protocol.scheme(), self.address)
    }

    /// reqwest proxy for this record; SOCKS4 has no reqwest connector
    pub fn reqwest_proxy(&self) -> Result<reqwest::Proxy> {
        if self.protocol == ProxyProtocol::Socks4 {
            return Err(PoolError::UnsupportedProtocol(self.protocol.to_string()));
        }
        Ok(reqwest::Proxy::all(self.proxy_url())?)
    }

    /// Host part of the address
    pub fn host(&self) -> &str {
        self.address
            .rsplit_once(':')
            .map_or(self.address.as_str(), |(host, _)| host)
    }

    pub fn has_unknown_country(&self) -> bool {
        self.country.is_empty() || self.country.eq_ignore_ascii_case("unknown")
    }

    /// Recompute the quality score with the default weights
    pub fn recompute_score(&mut self) {
        self.quality_score = DefaultScoring.score(self);
    }

    /// Record a successful observation
    pub fn record_success(&mut self, response_time: Option<f64>, policy: &dyn ScoringPolicy) {
        self.success_count = self.success_count.saturating_add(1);
        if let Some(elapsed) = response_time {
            self.response_time = elapsed.max(0.0);
        }
        self.quality_score = policy.score(self);
    }

    /// Record a failed observation
    pub fn record_failure(&mut self, policy: &dyn ScoringPolicy) {
        self.fail_count = self.fail_count.saturating_add(1);
        self.quality_score = policy.score(self);
    }
}

impl fmt::Display for ProxyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.proxy_url())
    }
}

/// Result of one HTTP attempt, consumed to update exactly one record
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    pub success: bool,
    pub status: Option<u16>,
    /// Elapsed time in seconds
    pub elapsed: f64,
}

impl RequestOutcome {
    pub fn success(status: u16, elapsed: f64) -> Self {
        Self {
            success: true,
            status: Some(status),
            elapsed,
        }
    }

    pub fn failure(status: Option<u16>, elapsed: f64) -> Self {
        Self {
            success: false,
            status,
            elapsed,
        }
    }
}

/// Result of probing a single proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProbeStatus {
    Working,
    Failed(String),
    Timeout,
}

/// Detailed result of a health probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub address: String,
    pub status: ProbeStatus,
    /// Response time in seconds
    pub response_time: Option<f64>,
}

impl ProbeResult {
    pub fn working(address: String, response_time: f64) -> Self {
        Self {
            address,
            status: ProbeStatus::Working,
            response_time: Some(response_time),
        }
    }

    pub fn failed(address: String, error: String) -> Self {
        Self {
            address,
            status: ProbeStatus::Failed(error),
            response_time: None,
        }
    }

    pub fn timeout(address: String) -> Self {
        Self {
            address,
            status: ProbeStatus::Timeout,
            response_time: None,
        }
    }

    pub fn is_working(&self) -> bool {
        matches!(self.status, ProbeStatus::Working)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_creation() {
        let record = ProxyRecord::new("127.0.0.1:8080", ProxyProtocol::Http);
        assert_eq!(record.address, "127.0.0.1:8080");
        assert_eq!(record.protocol, ProxyProtocol::Http);
        assert_eq!(record.country, "unknown");
        assert_eq!(record.source, "manual");
        assert_eq!(record.quality_score, 0.0);
        assert_eq!(record.success_rate(), 1.0);
        assert_eq!(record.host(), "127.0.0.1");
    }

    #[test]
    fn test_proxy_url_strategy_table() {
        let mut record = ProxyRecord::new("1.2.3.4:1234", ProxyProtocol::Http);
        assert_eq!(record.proxy_url(), "http://1.2.3.4:1234");

        record.protocol = ProxyProtocol::Https;
        assert_eq!(record.proxy_url(), "http://1.2.3.4:1234");

        record.protocol = ProxyProtocol::Socks4;
        assert_eq!(record.proxy_url(), "socks4://1.2.3.4:1234");

        record.protocol = ProxyProtocol::Socks5;
        assert_eq!(record.proxy_url(), "socks5://1.2.3.4:1234");
    }

    #[test]
    fn test_protocol_parsing() {
        assert_eq!(ProxyProtocol::parse("HTTP"), Some(ProxyProtocol::Http));
        assert_eq!(ProxyProtocol::parse("socks5h"), Some(ProxyProtocol::Socks5));
        assert_eq!(ProxyProtocol::parse("socks4a"), Some(ProxyProtocol::Socks4));
        assert_eq!(ProxyProtocol::parse("ftp"), None);
        assert_eq!(ProxyProtocol::Socks4.to_string(), "socks4");

        assert_eq!("socks5".parse::<ProxyProtocol>().unwrap(), ProxyProtocol::Socks5);
        assert!(matches!(
            "ftp".parse::<ProxyProtocol>(),
            Err(PoolError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn test_reqwest_proxy_support() {
        assert!(ProxyRecord::new("1.2.3.4:1080", ProxyProtocol::Socks5).reqwest_proxy().is_ok());
        assert!(ProxyRecord::new("1.2.3.4:3128", ProxyProtocol::Https).reqwest_proxy().is_ok());
        assert!(matches!(
            ProxyRecord::new("1.2.3.4:1080", ProxyProtocol::Socks4).reqwest_proxy(),
            Err(PoolError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn test_anonymity_parsing() {
        assert_eq!(Anonymity::parse("elite"), Anonymity::HighAnonymous);
        assert_eq!(Anonymity::parse("Elite Proxy"), Anonymity::HighAnonymous);
        assert_eq!(Anonymity::parse("anonymous"), Anonymity::Anonymous);
        assert_eq!(Anonymity::parse("transparent"), Anonymity::Transparent);
        assert_eq!(Anonymity::parse("???"), Anonymity::Unknown);
    }

    #[test]
    fn test_success_rate_and_counters() {
        let mut record = ProxyRecord::new("127.0.0.1:8080", ProxyProtocol::Http);
        record.record_success(Some(1.5), &DefaultScoring);
        record.record_success(None, &DefaultScoring);
        record.record_failure(&DefaultScoring);

        assert_eq!(record.total_requests(), 3);
        assert!((record.success_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(record.response_time, 1.5);
        assert!(record.quality_score > 0.0);
    }

    #[test]
    fn test_legacy_field_names() {
        let json = r#"{"proxy": "8.8.8.8:80", "score": 42.5, "protocol": "socks5", "anonymity": "elite"}"#;
        let record: ProxyRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.address, "8.8.8.8:80");
        assert_eq!(record.quality_score, 42.5);
        assert_eq!(record.protocol, ProxyProtocol::Socks5);
        assert_eq!(record.anonymity, Anonymity::HighAnonymous);
        assert_eq!(record.country, "unknown");
    }

    #[test]
    fn test_zone_less_last_checked() {
        let json = r#"{"proxy": "8.8.8.8:80", "last_checked": "2024-03-01T12:30:00.250000"}"#;
        let record: ProxyRecord = serde_json::from_str(json).unwrap();
        let checked = record.last_checked.unwrap();
        assert_eq!(checked.to_rfc3339(), "2024-03-01T12:30:00.250+00:00");

        let json = r#"{"proxy": "8.8.8.8:80", "last_checked": "yesterday"}"#;
        let record: ProxyRecord = serde_json::from_str(json).unwrap();
        assert!(record.last_checked.is_none());

        let mut record = ProxyRecord::new("8.8.8.8:80", ProxyProtocol::Http);
        record.last_checked = Some(Utc::now());
        let restored: ProxyRecord =
            serde_json::from_str(&serde_json::to_string(&record).unwrap()).unwrap();
        assert_eq!(restored.last_checked, record.last_checked);
    }

    #[test]
    fn test_listing_anonymity_labels_deserialize() {
        let record: ProxyRecord =
            serde_json::from_str(r#"{"proxy": "1.1.1.1:80", "anonymity": "Elite Proxy"}"#).unwrap();
        assert_eq!(record.anonymity, Anonymity::HighAnonymous);

        let json = serde_json::to_string(&Anonymity::HighAnonymous).unwrap();
        assert_eq!(json, r#""high_anonymous""#);
        let back: Anonymity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Anonymity::HighAnonymous);
        let odd: Anonymity = serde_json::from_str(r#""whatever""#).unwrap();
        assert_eq!(odd, Anonymity::Unknown);
    }

    #[test]
    fn test_probe_result() {
        let result = ProbeResult::working("127.0.0.1:8080".to_string(), 0.1);
        assert!(result.is_working());
        assert_eq!(result.response_time, Some(0.1));

        let result = ProbeResult::failed("127.0.0.1:8080".to_string(), "refused".to_string());
        assert!(!result.is_working());

        let result = ProbeResult::timeout("127.0.0.1:8080".to_string());
        assert!(!result.is_working());
    }
}
