//! Proxy listing sources and their response parsers
//!
//! Every known listing shape has one [`SourceParser`] implementation; a
//! [`ProxySource`] picks its parser through its [`SourceFormat`].

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::proxy::models::{Anonymity, ProxyProtocol, ProxyRecord};
use crate::proxy::parser::ProxyParser;

/// Response shape of a listing endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// Newline separated `ip:port` entries
    Text,
    /// `{"data": [{"ip", "port", "protocols": [..], "country", "anonymityLevel"}]}`
    Geonode,
    /// A flat JSON array (or single object) of `{"ip", "port", "type", "country", "anonymity"}`
    JsonList,
}

impl SourceFormat {
    /// Parser registered for this format
    pub fn parser(&self) -> &'static dyn SourceParser {
        match self {
            SourceFormat::Text => &TextListParser,
            SourceFormat::Geonode => &GeonodeParser,
            SourceFormat::JsonList => &JsonListParser,
        }
    }
}

/// Proxy source representing an endpoint that provides proxy lists
#[derive(Debug, Clone)]
pub struct ProxySource {
    /// Name of the proxy source, recorded as each record's `source`
    pub name: String,
    /// URL to fetch proxies from
    pub url: String,
    pub format: SourceFormat,
    /// 1 is the most trusted; lower numbers are fetched first
    pub priority: u8,
    /// Protocol assumed for entries that do not state one
    pub protocol: ProxyProtocol,
}

impl ProxySource {
    /// Create a source; the default protocol is inferred from the name
    pub fn new(name: &str, url: &str, format: SourceFormat, priority: u8) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            format,
            priority,
            protocol: protocol_from_name(name),
        }
    }

    pub fn with_protocol(mut self, protocol: ProxyProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Maximum number of records kept from one fetch of this source
    pub fn result_cap(&self) -> usize {
        if self.priority <= 1 {
            50
        } else {
            30
        }
    }

    /// Parse a response body with the parser registered for this source's format
    pub fn parse(&self, body: &str) -> Result<Vec<ProxyRecord>> {
        self.format.parser().parse(body, self)
    }
}

fn protocol_from_name(name: &str) -> ProxyProtocol {
    let name = name.to_lowercase();
    if name.contains("socks5") {
        ProxyProtocol::Socks5
    } else if name.contains("socks4") {
        ProxyProtocol::Socks4
    } else if name.contains("https") {
        ProxyProtocol::Https
    } else {
        ProxyProtocol::Http
    }
}

/// Turns one listing response into candidate records.
///
/// Malformed entries are dropped; an `Err` means the whole body was unreadable.
pub trait SourceParser: Send + Sync {
    fn parse(&self, body: &str, source: &ProxySource) -> Result<Vec<ProxyRecord>>;
}

/// Line-scanning parser for plain-text lists
pub struct TextListParser;

impl SourceParser for TextListParser {
    fn parse(&self, body: &str, source: &ProxySource) -> Result<Vec<ProxyRecord>> {
        Ok(body
            .lines()
            .filter_map(|line| ProxyParser::parse_line(line, source.protocol))
            .map(|record| record.with_source(source.name.as_str()))
            .collect())
    }
}

/// Parser for the geonode API shape
pub struct GeonodeParser;

#[derive(Debug, Deserialize)]
struct GeonodeResponse {
    #[serde(default)]
    data: Vec<Value>,
}

impl SourceParser for GeonodeParser {
    fn parse(&self, body: &str, source: &ProxySource) -> Result<Vec<ProxyRecord>> {
        let response: GeonodeResponse = serde_json::from_str(body)?;
        Ok(response
            .data
            .iter()
            .filter_map(|item| {
                let protocol = item
                    .get("protocols")
                    .and_then(Value::as_array)
                    .and_then(|protocols| protocols.first())
                    .and_then(Value::as_str)
                    .and_then(ProxyProtocol::parse)
                    .unwrap_or(source.protocol);
                record_from_entry(item, source, protocol, "anonymityLevel")
            })
            .collect())
    }
}

/// Parser for flat JSON arrays of `{ip, port, ...}` objects
pub struct JsonListParser;

impl SourceParser for JsonListParser {
    fn parse(&self, body: &str, source: &ProxySource) -> Result<Vec<ProxyRecord>> {
        let value: Value = serde_json::from_str(body)?;
        let items = match value {
            Value::Array(items) => items,
            other => vec![other],
        };
        Ok(items
            .iter()
            .filter_map(|item| {
                let protocol = item
                    .get("type")
                    .and_then(Value::as_str)
                    .and_then(ProxyProtocol::parse)
                    .unwrap_or(source.protocol);
                record_from_entry(item, source, protocol, "anonymity")
            })
            .collect())
    }
}

/// Build a record from a structured entry; the port may be a number or a string
fn record_from_entry(
    item: &Value,
    source: &ProxySource,
    protocol: ProxyProtocol,
    anonymity_key: &str,
) -> Option<ProxyRecord> {
    let ip = item.get("ip")?.as_str()?;
    let port = match item.get("port")? {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    let Some(address) = ProxyParser::checked_ipv4_address(ip, &port) else {
        debug!("Dropping malformed entry from {}: {}:{}", source.name, ip, port);
        return None;
    };

    let country = item.get("country").and_then(Value::as_str).unwrap_or("unknown");
    let anonymity = item
        .get(anonymity_key)
        .and_then(Value::as_str)
        .map(Anonymity::parse)
        .unwrap_or_default();

    Some(
        ProxyRecord::new(address, protocol)
            .with_source(source.name.as_str())
            .with_country(country)
            .with_anonymity(anonymity),
    )
}

/// Built-in listing endpoints, in no particular order
pub fn builtin_sources() -> Vec<ProxySource> {
    vec![
        ProxySource::new(
            "proxyscrape_http",
            "https://api.proxyscrape.com/v2/?request=get&protocol=http&timeout=10000&country=all&ssl=all&anonymity=all",
            SourceFormat::Text,
            1,
        ),
        ProxySource::new(
            "geonode_api",
            "https://proxylist.geonode.com/api/proxy-list?limit=50&page=1&sort_by=lastChecked&sort_type=desc",
            SourceFormat::Geonode,
            1,
        ),
        ProxySource::new(
            "github_monosans",
            "https://raw.githubusercontent.com/monosans/proxy-list/main/proxies/http.txt",
            SourceFormat::Text,
            2,
        ),
        ProxySource::new(
            "github_clarketm",
            "https://raw.githubusercontent.com/clarketm/proxy-list/master/proxy-list-raw.txt",
            SourceFormat::Text,
            2,
        ),
        ProxySource::new(
            "proxyscrape_socks4",
            "https://api.proxyscrape.com/v2/?request=get&protocol=socks4&timeout=10000&country=all",
            SourceFormat::Text,
            3,
        ),
    ]
}

/// Hardcoded fallback used when every source comes back empty
pub fn seed_proxies() -> Vec<ProxyRecord> {
    [
        "162.223.94.164:80",
        "45.55.32.201:3128",
        "165.22.81.188:43993",
        "138.68.60.8:8080",
        "159.65.207.97:80",
        "185.162.231.106:80",
        "91.107.6.115:53281",
        "185.38.111.1:8080",
        "193.70.36.70:8080",
        "46.4.96.137:8080",
        "103.127.1.130:80",
        "103.76.12.42:80",
        "114.129.2.82:8080",
        "47.74.152.29:8888",
        "8.210.83.33:80",
        "167.172.173.210:44207",
        "128.199.202.122:8080",
        "20.111.54.16:80",
    ]
    .iter()
    .map(|address| ProxyRecord::new(*address, ProxyProtocol::Http).with_source("builtin"))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_source() -> ProxySource {
        ProxySource::new("list_socks5", "https://example.com/p.txt", SourceFormat::Text, 2)
    }

    #[test]
    fn test_protocol_inferred_from_name() {
        assert_eq!(text_source().protocol, ProxyProtocol::Socks5);
        assert_eq!(
            ProxySource::new("proxyscrape_socks4", "u", SourceFormat::Text, 3).protocol,
            ProxyProtocol::Socks4
        );
        assert_eq!(
            ProxySource::new("sslproxies_https", "u", SourceFormat::Text, 3).protocol,
            ProxyProtocol::Https
        );
        assert_eq!(
            ProxySource::new("plain", "u", SourceFormat::Text, 3).protocol,
            ProxyProtocol::Http
        );
    }

    #[test]
    fn test_result_cap_by_priority() {
        assert_eq!(ProxySource::new("a", "u", SourceFormat::Text, 1).result_cap(), 50);
        assert_eq!(ProxySource::new("b", "u", SourceFormat::Text, 2).result_cap(), 30);
    }

    #[test]
    fn test_text_parser() {
        let body = "# header\n\n1.1.1.1:80\n2.2.2.2:1080\nnonsense\n300.1.1.1:80\n";
        let records = text_source().parse(body).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.protocol == ProxyProtocol::Socks5));
        assert!(records.iter().all(|r| r.source == "list_socks5"));

        // an explicit scheme wins over the source's protocol
        let records = text_source()
            .parse("192.168.1.1:8080\n// note\nhttp://192.168.1.3:8080\nnot a proxy\n")
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].protocol, ProxyProtocol::Socks5);
        assert_eq!(records[1].protocol, ProxyProtocol::Http);
        assert_eq!(records[1].address, "192.168.1.3:8080");
    }

    #[test]
    fn test_geonode_parser() {
        let source = ProxySource::new("geonode_api", "u", SourceFormat::Geonode, 1);
        let body = r#"{
            "data": [
                {"ip": "5.5.5.5", "port": "8080", "protocols": ["socks5"], "country": "DE", "anonymityLevel": "elite"},
                {"ip": "6.6.6.6", "port": 3128, "country": "US"},
                {"ip": "not-an-ip", "port": "80"},
                {"port": "80"}
            ],
            "total": 4
        }"#;
        let records = source.parse(body).unwrap();
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].address, "5.5.5.5:8080");
        assert_eq!(records[0].protocol, ProxyProtocol::Socks5);
        assert_eq!(records[0].country, "DE");
        assert_eq!(records[0].anonymity, Anonymity::HighAnonymous);

        assert_eq!(records[1].address, "6.6.6.6:3128");
        assert_eq!(records[1].protocol, ProxyProtocol::Http);
        assert_eq!(records[1].anonymity, Anonymity::Unknown);
    }

    #[test]
    fn test_json_list_parser() {
        let source = ProxySource::new("json_list", "u", SourceFormat::JsonList, 2);
        let body = r#"[
            {"ip": "7.7.7.7", "port": 80, "type": "HTTPS", "anonymity": "anonymous"},
            {"ip": "8.8.8.8", "port": 0}
        ]"#;
        let records = source.parse(body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].protocol, ProxyProtocol::Https);
        assert_eq!(records[0].anonymity, Anonymity::Anonymous);

        let single = source.parse(r#"{"ip": "9.9.9.9", "port": "81"}"#).unwrap();
        assert_eq!(single.len(), 1);
    }

    #[test]
    fn test_structured_parser_rejects_garbage_body() {
        let source = ProxySource::new("geonode_api", "u", SourceFormat::Geonode, 1);
        assert!(source.parse("<html>rate limited</html>").is_err());
    }

    #[test]
    fn test_builtin_sources_and_seeds() {
        let sources = builtin_sources();
        assert!(!sources.is_empty());
        for source in &sources {
            assert!(!source.name.is_empty());
            assert!(source.url.starts_with("http"));
        }
        assert_eq!(
            sources.iter().find(|s| s.name == "proxyscrape_socks4").unwrap().protocol,
            ProxyProtocol::Socks4
        );

        let seeds = seed_proxies();
        assert!(!seeds.is_empty());
        assert!(seeds.iter().all(|s| s.source == "builtin"));
        for seed in &seeds {
            assert!(ProxyParser::validate_address(&seed.address).is_ok());
        }
    }
}
