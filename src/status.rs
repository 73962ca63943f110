//! On-demand status reporting. Every call probes; nothing is cached.

use crate::healthcheck::HealthChecker;
use crate::pool::{PoolStats, PoolStatsSnapshot};
use crate::process::{ProcessSupervisor, RestartGeneration, ServiceState};
use crate::registry::{Registry, ServiceDescriptor, ServiceId};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Probe result as reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

impl From<bool> for HealthState {
    fn from(healthy: bool) -> Self {
        if healthy {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSummary {
    pub name: String,
    pub state: HealthState,
    pub port: u16,
}

/// Response of `/api/status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub main_server: &'static str,
    pub services: BTreeMap<ServiceId, ServiceSummary>,
    pub ports: BTreeMap<String, u16>,
    pub pool: PoolStatsSnapshot,
}

/// Response of `/api/{slug}-status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub service: ServiceId,
    pub name: String,
    pub status: HealthState,
    pub port: u16,
    pub url: String,
    /// Supervisor's lifecycle view; `stopped` for external services
    pub worker: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<RestartGeneration>,
}

pub struct StatusAggregator {
    registry: Arc<Registry>,
    checker: Arc<HealthChecker>,
    supervisor: Arc<ProcessSupervisor>,
    pool_stats: Arc<PoolStats>,
    gateway_port: u16,
    probe_timeout: Duration,
}

impl StatusAggregator {
    pub fn new(
        registry: Arc<Registry>,
        checker: Arc<HealthChecker>,
        supervisor: Arc<ProcessSupervisor>,
        pool_stats: Arc<PoolStats>,
        gateway_port: u16,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            checker,
            supervisor,
            pool_stats,
            gateway_port,
            probe_timeout,
        }
    }

    /// Probe every registered service concurrently
    pub async fn status(&self) -> StatusReport {
        let probes = self.registry.iter().map(|descriptor| async move {
            let healthy = self.checker.probe(descriptor, self.probe_timeout).await;
            (descriptor, HealthState::from(healthy))
        });
        let results = join_all(probes).await;

        let mut services = BTreeMap::new();
        let mut ports = BTreeMap::new();
        ports.insert("main".to_string(), self.gateway_port);

        for (descriptor, state) in results {
            services.insert(
                descriptor.id,
                ServiceSummary {
                    name: descriptor.name.clone(),
                    state,
                    port: descriptor.port,
                },
            );
            ports.insert(descriptor.id.slug().to_string(), descriptor.port);
        }

        StatusReport {
            main_server: "online",
            services,
            ports,
            pool: self.pool_stats.snapshot(),
        }
    }

    /// Probe one service. `None` if it is not registered.
    pub async fn service_status(&self, id: ServiceId) -> Option<ServiceStatus> {
        let descriptor = self.registry.get(id)?;
        Some(self.probe_one(descriptor).await)
    }

    async fn probe_one(&self, descriptor: &ServiceDescriptor) -> ServiceStatus {
        let healthy = self.checker.probe(descriptor, self.probe_timeout).await;
        let handle = self.supervisor.current_handle(descriptor.id);

        ServiceStatus {
            service: descriptor.id,
            name: descriptor.name.clone(),
            status: HealthState::from(healthy),
            port: descriptor.port,
            url: descriptor.public_url(),
            worker: self.supervisor.lifecycle(descriptor.id),
            pid: handle.as_ref().map(|h| h.pid),
            generation: handle.map(|h| h.generation),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healthcheck::RetryPolicy;
    use crate::pool::{ConnectionPool, PoolConfig};
    use crate::registry::LaunchSpec;
    use std::time::Instant;
    use tokio::net::TcpListener;

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Accepts connections and never answers
    async fn silent_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        port
    }

    fn aggregator(descriptors: Vec<ServiceDescriptor>, probe_timeout: Duration) -> StatusAggregator {
        aggregator_with_supervisor(descriptors, probe_timeout).0
    }

    fn aggregator_with_supervisor(
        descriptors: Vec<ServiceDescriptor>,
        probe_timeout: Duration,
    ) -> (StatusAggregator, Arc<ProcessSupervisor>) {
        let registry = Arc::new(Registry::new(descriptors).unwrap());
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        let checker = Arc::new(HealthChecker::new(Arc::clone(&pool), RetryPolicy::default()));
        let supervisor = ProcessSupervisor::new(Arc::clone(&registry), Duration::from_secs(1));
        let aggregator = StatusAggregator::new(
            registry,
            checker,
            Arc::clone(&supervisor),
            pool.stats(),
            5000,
            probe_timeout,
        );
        (aggregator, supervisor)
    }

    #[tokio::test]
    async fn test_status_reports_unhealthy_services() {
        let verb_port = unused_port().await;
        let account_port = unused_port().await;
        let aggregator = aggregator(
            vec![
                ServiceDescriptor::external(ServiceId::Verb, verb_port),
                ServiceDescriptor::external(ServiceId::Account, account_port),
            ],
            Duration::from_millis(500),
        );

        let report = aggregator.status().await;
        assert_eq!(report.main_server, "online");
        assert_eq!(report.services.len(), 2);
        assert_eq!(report.services[&ServiceId::Verb].state, HealthState::Unhealthy);
        assert_eq!(report.ports["main"], 5000);
        assert_eq!(report.ports["database"], account_port);
        assert_eq!(report.pool.health_checks, 2);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["services"]["verb"]["state"], "unhealthy");
        assert_eq!(json["services"]["database"]["port"], account_port);
    }

    #[tokio::test]
    async fn test_status_probes_run_concurrently() {
        let mut descriptors = Vec::new();
        for id in [ServiceId::Sentence, ServiceId::Verb, ServiceId::Tense, ServiceId::Number] {
            descriptors.push(ServiceDescriptor::external(id, silent_port().await));
        }
        let aggregator = aggregator(descriptors, Duration::from_millis(300));

        let start = Instant::now();
        let report = aggregator.status().await;
        let elapsed = start.elapsed();

        assert!(report.services.values().all(|s| s.state == HealthState::Unhealthy));
        // Sequential probing would take at least 4 x 300ms
        assert!(elapsed < Duration::from_millis(1000), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_service_status() {
        let port = unused_port().await;
        let aggregator = aggregator(
            vec![ServiceDescriptor::external(ServiceId::Number, port)],
            Duration::from_millis(500),
        );

        let status = aggregator.service_status(ServiceId::Number).await.unwrap();
        assert_eq!(status.status, HealthState::Unhealthy);
        assert_eq!(status.worker, ServiceState::Stopped);
        assert_eq!(status.url, format!("http://localhost:{}", port));
        assert!(status.pid.is_none());

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["worker"], "stopped");
        assert!(json.get("pid").is_none());

        assert!(aggregator.service_status(ServiceId::Tense).await.is_none());
    }

    #[tokio::test]
    async fn test_stop_then_status_reports_unhealthy() {
        let port = unused_port().await;
        let (aggregator, supervisor) = aggregator_with_supervisor(
            vec![ServiceDescriptor::local(
                ServiceId::Matching,
                LaunchSpec::new(r#"sh -c "exec sleep 60""#),
                port,
            )],
            Duration::from_millis(300),
        );
        let descriptor = Arc::clone(supervisor.registry().get(ServiceId::Matching).unwrap());

        let handle = supervisor.start(&descriptor, 1).await.unwrap();
        let running = aggregator.service_status(ServiceId::Matching).await.unwrap();
        assert_eq!(running.worker, ServiceState::Starting);
        assert_eq!(running.pid, Some(handle.pid));
        assert_eq!(running.generation, Some(1));

        supervisor.stop(ServiceId::Matching).await;

        let stopped = aggregator.service_status(ServiceId::Matching).await.unwrap();
        assert_eq!(stopped.status, HealthState::Unhealthy);
        assert_eq!(stopped.worker, ServiceState::Stopped);
        assert!(stopped.pid.is_none());

        let json = serde_json::to_value(&stopped).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["worker"], "stopped");
    }
}
