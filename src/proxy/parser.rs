//! Proxy address parsing and validation

use crate::error::{PoolError, Result};
use crate::proxy::models::{ProxyProtocol, ProxyRecord};
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::Ipv4Addr;

/// Regex pattern to match IP:PORT patterns in text
static IP_PORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d{1,5})\b")
        .expect("Invalid IP:PORT regex")
});

/// Regex pattern for scheme-prefixed proxy URLs
static URL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(https?|socks[45]h?|socks4a)://(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d{1,5})/?$")
        .expect("Invalid proxy URL regex")
});

/// Proxy parser for turning listing text into records
pub struct ProxyParser;

impl ProxyParser {
    /// Parse a single proxy line
    ///
    /// Supports formats:
    /// - IP:PORT
    /// - scheme://IP:PORT
    /// - any line containing an IP:PORT token (tables, CSV, annotated lists)
    ///
    /// Blank lines and lines starting with `#` or `//` are skipped.
    pub fn parse_line(line: &str, default_protocol: ProxyProtocol) -> Option<ProxyRecord> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            return None;
        }

        if let Some(record) = Self::parse_url_format(line) {
            return Some(record);
        }

        let caps = IP_PORT_REGEX.captures(line)?;
        let address = Self::checked_ipv4_address(&caps[1], &caps[2])?;
        Some(ProxyRecord::new(address, default_protocol))
    }

    /// Parse URL format proxy (e.g., http://ip:port or socks5://ip:port)
    fn parse_url_format(line: &str) -> Option<ProxyRecord> {
        let caps = URL_REGEX.captures(line)?;
        let protocol = ProxyProtocol::parse(&caps[1])?;
        let address = Self::checked_ipv4_address(&caps[2], &caps[3])?;
        Some(ProxyRecord::new(address, protocol))
    }

    /// Build `ip:port` from separately captured parts, rejecting out-of-range values
    pub fn checked_ipv4_address(ip: &str, port: &str) -> Option<String> {
        let ip: Ipv4Addr = ip.trim().parse().ok()?;
        let port = Self::checked_port(port.trim())?;
        Some(format!("{}:{}", ip, port))
    }

    fn checked_port(port: &str) -> Option<u16> {
        match port.parse::<u16>() {
            Ok(0) | Err(_) => None,
            Ok(port) => Some(port),
        }
    }

    /// Validate an operator-supplied `host:port` address
    ///
    /// IPv4 hosts must have in-range octets; other hosts must be valid DNS names.
    pub fn validate_address(address: &str) -> Result<String> {
        let address = address.trim();
        let invalid = || PoolError::InvalidAddress(address.to_string());

        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = Self::checked_port(port).ok_or_else(invalid)?;

        let looks_numeric = host.chars().all(|c| c.is_ascii_digit() || c == '.');
        if looks_numeric {
            let ip: Ipv4Addr = host.parse().map_err(|_| invalid())?;
            return Ok(format!("{}:{}", ip, port));
        }

        match url::Host::parse(host) {
            Ok(url::Host::Domain(domain)) => Ok(format!("{}:{}", domain, port)),
            _ => Err(invalid()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_format() {
        let record = ProxyParser::parse_line("192.168.1.1:8080", ProxyProtocol::Http).unwrap();
        assert_eq!(record.address, "192.168.1.1:8080");
        assert_eq!(record.protocol, ProxyProtocol::Http);
    }

    #[test]
    fn test_parse_url_format_socks5() {
        let record = ProxyParser::parse_line("socks5://192.168.1.1:1080", ProxyProtocol::Http).unwrap();
        assert_eq!(record.address, "192.168.1.1:1080");
        assert_eq!(record.protocol, ProxyProtocol::Socks5);
    }

    #[test]
    fn test_parse_annotated_line() {
        let record =
            ProxyParser::parse_line("10.0.0.1:3128 US-H-S +", ProxyProtocol::Socks4).unwrap();
        assert_eq!(record.address, "10.0.0.1:3128");
        assert_eq!(record.protocol, ProxyProtocol::Socks4);
    }

    #[test]
    fn test_parse_skips_blank_and_comment_lines() {
        assert!(ProxyParser::parse_line("", ProxyProtocol::Http).is_none());
        assert!(ProxyParser::parse_line("   ", ProxyProtocol::Http).is_none());
        assert!(ProxyParser::parse_line("# 1.1.1.1:80", ProxyProtocol::Http).is_none());
        assert!(ProxyParser::parse_line("// 1.1.1.1:80", ProxyProtocol::Http).is_none());
    }

    #[test]
    fn test_parse_invalid_entries() {
        assert!(ProxyParser::parse_line("invalid", ProxyProtocol::Http).is_none());
        assert!(ProxyParser::parse_line("192.168.1.1", ProxyProtocol::Http).is_none());
        assert!(ProxyParser::parse_line("999.1.1.1:8080", ProxyProtocol::Http).is_none());
        assert!(ProxyParser::parse_line("1.1.1.1:0", ProxyProtocol::Http).is_none());
        assert!(ProxyParser::parse_line("1.1.1.1:70000", ProxyProtocol::Http).is_none());
    }

    #[test]
    fn test_validate_address() {
        assert_eq!(
            ProxyParser::validate_address(" 1.2.3.4:8080 ").unwrap(),
            "1.2.3.4:8080"
        );
        assert_eq!(
            ProxyParser::validate_address("proxy.example.com:3128").unwrap(),
            "proxy.example.com:3128"
        );
        assert!(ProxyParser::validate_address("1.2.3.4").is_err());
        assert!(ProxyParser::validate_address(":8080").is_err());
        assert!(ProxyParser::validate_address("1.2.3.256:8080").is_err());
        assert!(ProxyParser::validate_address("1.2.3.4:abc").is_err());
        assert!(matches!(
            ProxyParser::validate_address("bad host:80"),
            Err(PoolError::InvalidAddress(_))
        ));
    }
}
