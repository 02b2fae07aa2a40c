//! Country lookup for proxy hosts
//!
//! Backed by a MaxMind country or city database. Records only ever need the
//! ISO code, so that is all a lookup returns.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use maxminddb::{geoip2, Reader};

use crate::error::{PoolError, Result};

/// Shared MMDB reader; clones are cheap
#[derive(Clone)]
pub struct GeoLocator {
    db: Arc<Reader<Vec<u8>>>,
}

impl GeoLocator {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let db = Reader::open_readfile(path)
            .map_err(|e| PoolError::Geo(format!("cannot open {:?}: {}", path, e)))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// ISO country code of `host`, `None` when the database has no entry.
    ///
    /// Hostnames are not resolved; only literal IP addresses are looked up.
    pub fn country_code(&self, host: &str) -> Result<Option<String>> {
        let ip: IpAddr = host
            .parse()
            .map_err(|_| PoolError::Geo(format!("not an IP address: {}", host)))?;
        self.country_code_of(ip)
    }

    fn country_code_of(&self, ip: IpAddr) -> Result<Option<String>> {
        let entry: Option<geoip2::Country> = self
            .db
            .lookup(ip)
            .map_err(|e| PoolError::Geo(e.to_string()))?
            .decode()
            .map_err(|e| PoolError::Geo(e.to_string()))?;

        Ok(entry
            .and_then(|entry| entry.country.iso_code)
            .map(|code| code.to_uppercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_database() {
        let err = GeoLocator::from_path("/nonexistent/GeoLite2-Country.mmdb").err().unwrap();
        assert!(matches!(err, PoolError::Geo(_)));
        assert!(err.to_string().contains("GeoLite2-Country.mmdb"));
    }

    #[test]
    fn test_unreadable_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.mmdb");
        std::fs::write(&path, b"not a maxmind database").unwrap();
        assert!(matches!(GeoLocator::from_path(&path), Err(PoolError::Geo(_))));
    }
}
