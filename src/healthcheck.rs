//! Liveness probing for worker services
//!
//! A freshly spawned worker finishes its own initialization asynchronously,
//! so readiness is established by probing its health endpoint a bounded
//! number of times with a fixed delay in between.

use crate::config::HealthConfig;
use crate::error::ProbeFailure;
use crate::pool::ConnectionPool;
use crate::registry::ServiceDescriptor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Retry policy for startup polling
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Number of probes before giving up
    pub max_attempts: u32,
    /// Fixed delay between probes
    pub interval: Duration,
    /// Timeout for each probe
    pub probe_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&HealthConfig> for RetryPolicy {
    fn from(config: &HealthConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            interval: config.interval(),
            probe_timeout: config.probe_timeout(),
        }
    }
}

/// Issues liveness probes against worker health endpoints
pub struct HealthChecker {
    pool: Arc<ConnectionPool>,
    policy: RetryPolicy,
}

impl HealthChecker {
    pub fn new(pool: Arc<ConnectionPool>, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    /// One liveness request. True only for a 2xx answer within `timeout`.
    pub async fn probe(&self, descriptor: &ServiceDescriptor, timeout: Duration) -> bool {
        match self.try_probe(descriptor, timeout).await {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    service = %descriptor.id,
                    port = descriptor.port,
                    error = %e,
                    "Health probe failed"
                );
                false
            }
        }
    }

    async fn try_probe(&self, descriptor: &ServiceDescriptor, timeout: Duration) -> Result<(), ProbeFailure> {
        let status = tokio::time::timeout(
            timeout,
            self.pool.check_backend(descriptor.port, &descriptor.health_path),
        )
        .await
        .map_err(|_| ProbeFailure::Timeout(timeout))??;

        if status.is_success() {
            Ok(())
        } else {
            Err(ProbeFailure::Status(status))
        }
    }

    /// Probe until the service answers or the attempts run out
    pub async fn poll_until_healthy(&self, descriptor: &ServiceDescriptor) -> bool {
        self.poll_until_healthy_while(descriptor, || true).await
    }

    /// Like [`poll_until_healthy`](Self::poll_until_healthy), but stops early
    /// once `keep_going` returns false (the result is no longer wanted).
    pub async fn poll_until_healthy_while<F>(&self, descriptor: &ServiceDescriptor, keep_going: F) -> bool
    where
        F: Fn() -> bool,
    {
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if !keep_going() {
                debug!(service = %descriptor.id, attempt, "Health polling abandoned");
                return false;
            }

            if self.probe(descriptor, self.policy.probe_timeout).await {
                info!(service = %descriptor.id, port = descriptor.port, attempt, "✓ {} is running", descriptor.name);
                return true;
            }

            if attempt < max_attempts {
                warn!(service = %descriptor.id, attempt, "Waiting for {}...", descriptor.name);
                tokio::time::sleep(self.policy.interval).await;
            }
        }

        error!(
            service = %descriptor.id,
            port = descriptor.port,
            attempts = max_attempts,
            "✗ {} failed to start",
            descriptor.name
        );
        false
    }
}
