use thiserror::Error;

/// Unified error type for the proxy pool
#[derive(Error, Debug)]
pub enum PoolError {
    // Source errors
    #[error("Failed to fetch proxies from {source_name}: {reason}")]
    SourceFetch { source_name: String, reason: String },

    // Proxy-level errors
    #[error("Proxy connection failed: {0}")]
    ProxyConnect(String),

    #[error("Proxy rejected by target with HTTP {status}")]
    ProxyRejected { status: u16 },

    #[error("Target not found: {url}")]
    TargetNotFound { url: String },

    #[error("No proxy passes selection")]
    PoolExhausted,

    #[error("Invalid proxy address: {0}")]
    InvalidAddress(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    // Client errors
    #[error(
        "All request strategies exhausted after {proxied_attempts} proxied and {direct_attempts} direct attempts: {last_error}"
    )]
    RequestsExhausted {
        proxied_attempts: u32,
        direct_attempts: u32,
        last_error: String,
    },

    // Persistence errors
    #[error("Snapshot persistence failed: {0}")]
    Persistence(String),

    #[error("Geolocation failed: {0}")]
    Geo(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for proxy pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    /// Whether this error should count against the proxy that carried the request.
    ///
    /// Timeouts, refused or reset connections and a 403 from the target are
    /// charged to the proxy. A 404 is a valid answer from the origin.
    pub fn is_proxy_failure(&self) -> bool {
        match self {
            PoolError::ProxyConnect(_) | PoolError::ProxyRejected { .. } => true,
            PoolError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Build a connect error from a transport failure
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PoolError::ProxyConnect(format!("timed out: {}", err))
        } else {
            PoolError::ProxyConnect(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_failure_classification() {
        assert!(PoolError::ProxyConnect("refused".to_string()).is_proxy_failure());
        assert!(PoolError::ProxyRejected { status: 403 }.is_proxy_failure());
        assert!(!PoolError::TargetNotFound {
            url: "http://example.com".to_string()
        }
        .is_proxy_failure());
        assert!(!PoolError::PoolExhausted.is_proxy_failure());
        assert!(!PoolError::Persistence("disk full".to_string()).is_proxy_failure());
    }

    #[test]
    fn test_error_messages() {
        let err = PoolError::RequestsExhausted {
            proxied_attempts: 2,
            direct_attempts: 3,
            last_error: "timed out".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("2 proxied"));
        assert!(msg.contains("3 direct"));

        let err = PoolError::SourceFetch {
            source_name: "geonode_api".to_string(),
            reason: "HTTP 500".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to fetch proxies from geonode_api: HTTP 500"
        );
    }
}
