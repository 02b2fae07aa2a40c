//! The seam between the HTTP client and whatever hands out proxies

use async_trait::async_trait;

use crate::proxy::models::{ProxyRecord, RequestOutcome};
use crate::proxy::pool::{PoolStats, ProxyPool};

/// Source of proxies for [`ResilientClient`](crate::client::ResilientClient)
#[async_trait]
pub trait ProxyProvider: Send + Sync {
    /// A proxy to use, or `None` to go direct
    async fn acquire(&self) -> Option<ProxyRecord>;

    /// Report the result of one proxied request
    fn report(&self, address: &str, outcome: RequestOutcome);

    /// Report the result of one direct request
    fn record_direct_outcome(&self, success: bool);

    fn stats(&self) -> Option<PoolStats> {
        None
    }
}

#[async_trait]
impl ProxyProvider for ProxyPool {
    async fn acquire(&self) -> Option<ProxyRecord> {
        ProxyPool::acquire(self).await
    }

    fn report(&self, address: &str, outcome: RequestOutcome) {
        let response_time = outcome.success.then_some(outcome.elapsed);
        self.report_outcome(address, outcome.success, response_time);
    }

    fn record_direct_outcome(&self, success: bool) {
        ProxyPool::record_direct_outcome(self, success);
    }

    fn stats(&self) -> Option<PoolStats> {
        Some(self.get_stats())
    }
}
