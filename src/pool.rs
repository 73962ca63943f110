//! Connection pool for worker HTTP connections
//!
//! One pooled client carries forwarded requests, a second one carries
//! liveness probes so probe traffic never competes for the same idle
//! connections as client traffic.

use crate::error::ProbeFailure;
use http_body_util::{Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests forwarded through the pool
    pub total_requests: AtomicU64,
    /// Total number of health probes
    pub health_checks: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_health_check(&self) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_health_checks(&self) -> u64 {
        self.health_checks.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            forwarded_requests: self.get_total_requests(),
            health_checks: self.get_health_checks(),
        }
    }
}

/// Point-in-time copy of [`PoolStats`] for status responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatsSnapshot {
    pub forwarded_requests: u64,
    pub health_checks: u64,
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per worker port
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A connection pool for HTTP connections to workers
pub struct ConnectionPool {
    /// Client for forwarded requests (bodies are buffered before forwarding)
    client: Client<HttpConnector, Full<Bytes>>,
    /// Dedicated client for health probes
    health_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let health_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            health_client,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a fully built request (absolute URI) through the pool
    pub async fn send_request(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>, hyper_util::client::legacy::Error> {
        self.stats.record_request();
        self.client.request(req).await
    }

    /// Issue a GET to a worker's health endpoint and return its status code
    pub async fn check_backend(&self, port: u16, path: &str) -> Result<StatusCode, ProbeFailure> {
        let uri = format!("http://127.0.0.1:{}{}", port, path);

        let req = Request::builder()
            .method("GET")
            .uri(&uri)
            .header("Connection", "keep-alive")
            .body(Empty::<Bytes>::new())?;

        self.stats.record_health_check();

        let response = self.health_client.request(req).await?;
        Ok(response.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();

        assert_eq!(stats.snapshot(), PoolStatsSnapshot { forwarded_requests: 0, health_checks: 0 });

        stats.record_request();
        stats.record_request();
        stats.record_health_check();
        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_health_checks(), 1);
        assert_eq!(stats.snapshot(), PoolStatsSnapshot { forwarded_requests: 2, health_checks: 1 });
    }

    #[tokio::test]
    async fn test_check_backend_nothing_listening() {
        let pool = ConnectionPool::new(PoolConfig::default());

        // Port 1 is privileged and never bound in test environments
        let result = pool.check_backend(1, "/health").await;
        assert!(matches!(result, Err(ProbeFailure::Connection(_))));
        assert_eq!(pool.stats().get_health_checks(), 1);
    }
}
