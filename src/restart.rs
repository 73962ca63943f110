//! Background restarts of all workers
//!
//! Every trigger allocates a new generation and returns immediately. The
//! restart itself runs in a spawned task: it takes the restart lock, skips
//! itself if a newer generation was requested in the meantime, relaunches
//! every worker and then polls them until healthy. Polls belonging to a
//! superseded generation stop early and leave the lifecycle state alone.

use crate::healthcheck::HealthChecker;
use crate::process::{ProcessSupervisor, RestartGeneration, RestartOutcome, ServiceState};
use crate::registry::ServiceId;
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Summary of a finished restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestartReport {
    pub generation: RestartGeneration,
    pub outcome: RestartOutcome,
    pub healthy: Vec<ServiceId>,
    pub unhealthy: Vec<ServiceId>,
}

impl RestartReport {
    pub fn all_healthy(&self) -> bool {
        self.outcome.failed.is_empty() && self.unhealthy.is_empty()
    }
}

/// Handle to a triggered restart
pub struct RestartTicket {
    generation: RestartGeneration,
    handle: JoinHandle<Option<RestartReport>>,
}

impl RestartTicket {
    pub fn generation(&self) -> RestartGeneration {
        self.generation
    }

    /// Wait for the restart to finish. `None` if it was superseded by a newer
    /// one before completing.
    pub async fn wait(self) -> Option<RestartReport> {
        match self.handle.await {
            Ok(report) => report,
            Err(e) => {
                error!(generation = self.generation, error = %e, "Restart task failed");
                None
            }
        }
    }
}

pub struct RestartController {
    supervisor: Arc<ProcessSupervisor>,
    checker: Arc<HealthChecker>,
    /// Newest generation handed out
    latest: AtomicU64,
    /// Restart lock; holds the newest generation actually applied
    applied: Mutex<RestartGeneration>,
    /// Set by `shutdown`; no restart runs afterwards
    closed: AtomicBool,
}

impl RestartController {
    pub fn new(supervisor: Arc<ProcessSupervisor>, checker: Arc<HealthChecker>) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            checker,
            latest: AtomicU64::new(0),
            applied: Mutex::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn latest_generation(&self) -> RestartGeneration {
        self.latest.load(Ordering::SeqCst)
    }

    /// Start a restart of every worker in the background
    pub fn trigger(self: &Arc<Self>) -> RestartTicket {
        let generation = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        info!(generation, "Restart requested");

        let controller = Arc::clone(self);
        let handle = tokio::spawn(async move { controller.run(generation).await });

        RestartTicket { generation, handle }
    }

    /// Stop every worker and refuse all pending and future restarts.
    ///
    /// Waits for a restart that is mid-relaunch to finish spawning, then
    /// stops what it spawned. Polls still running are abandoned.
    pub async fn shutdown(&self) {
        let mut applied = self.applied.lock().await;
        self.closed.store(true, Ordering::SeqCst);

        let last = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        *applied = last;
        info!(generation = last, "Restarts closed for shutdown");

        self.supervisor.stop_all().await;
    }

    fn is_superseded(&self, generation: RestartGeneration) -> bool {
        self.closed.load(Ordering::SeqCst) || self.latest.load(Ordering::SeqCst) > generation
    }

    async fn run(&self, generation: RestartGeneration) -> Option<RestartReport> {
        let outcome = {
            let mut applied = self.applied.lock().await;
            if *applied >= generation || self.is_superseded(generation) {                debug!(generation, "Restart superseded by a newer one, skipping");
                return None;
            }

            let outcome = self.supervisor.restart_all(generation).await;
            *applied = generation;
            outcome
        };

        let registry = self.supervisor.registry();
        let polls = outcome
            .relaunched
            .iter()
            .filter_map(|id| registry.get(*id))
            .map(|descriptor| async move {
                let healthy = self
                    .checker
                    .poll_until_healthy_while(descriptor, || !self.is_superseded(generation))
                    .await;

                let state = if healthy {
                    ServiceState::Healthy
                } else {
                    ServiceState::Unhealthy
                };
                if !self.is_superseded(generation) {
                    self.supervisor
                        .set_lifecycle_if_generation(descriptor.id, generation, state);
                }
                (descriptor.id, healthy)
            });
        let results = join_all(polls).await;

        if self.is_superseded(generation) {
            debug!(generation, "Restart superseded while polling");
            return None;
        }

        let mut report = RestartReport {
            generation,
            outcome,
            healthy: Vec::new(),
            unhealthy: Vec::new(),
        };
        for (id, healthy) in results {
            if healthy {
                report.healthy.push(id);
            } else {
                report.unhealthy.push(id);
            }
        }

        if report.all_healthy() {
            info!(generation, services = report.healthy.len(), "System ready");
        } else {
            warn!(
                generation,
                healthy = report.healthy.len(),
                unhealthy = report.unhealthy.len(),
                failed = report.outcome.failed.len(),
                "System ready with degraded services"
            );
        }

        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healthcheck::RetryPolicy;
    use crate::pool::{ConnectionPool, PoolConfig};
    use crate::registry::{LaunchSpec, Registry, ServiceDescriptor};
    use http_body_util::Full;
    use hyper::body::{Bytes, Incoming};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::time::{Duration, Instant};
    use tokio::net::TcpListener;

    /// Answers `/health` with 200 on a fresh port
    async fn spawn_health_stub() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let service = service_fn(|_req: Request<Incoming>| async {
                        Ok::<_, hyper::Error>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .body(Full::new(Bytes::from_static(b"{\"status\":\"healthy\"}")))
                                .unwrap(),
                        )
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        port
    }

    /// Workers that run but never answer health probes, unless something
    /// else already listens on their port
    fn create_test_controller(ids: &[(ServiceId, u16)]) -> (Arc<RestartController>, Arc<ProcessSupervisor>) {
        let descriptors = ids
            .iter()
            .map(|(id, port)| {
                ServiceDescriptor::local(*id, LaunchSpec::new(r#"sh -c "exec sleep 60""#), *port)
            })
            .collect();
        let registry = Arc::new(Registry::new(descriptors).unwrap());
        let supervisor = ProcessSupervisor::new(registry, Duration::from_secs(1));
        let checker = Arc::new(HealthChecker::new(
            Arc::new(ConnectionPool::new(PoolConfig::default())),
            RetryPolicy {
                max_attempts: 2,
                interval: Duration::from_millis(20),
                probe_timeout: Duration::from_millis(100),
            },
        ));
        (RestartController::new(Arc::clone(&supervisor), checker), supervisor)
    }

    #[tokio::test]
    async fn test_trigger_allocates_generations() {
        let (controller, supervisor) = create_test_controller(&[(ServiceId::Verb, 46102)]);

        let ticket = controller.trigger();
        assert_eq!(ticket.generation(), 1);
        assert_eq!(controller.latest_generation(), 1);

        let report = ticket.wait().await.unwrap();
        assert_eq!(report.generation, 1);
        assert_eq!(report.outcome.relaunched, vec![ServiceId::Verb]);
        assert_eq!(report.unhealthy, vec![ServiceId::Verb]);
        assert!(!report.all_healthy());
        assert_eq!(supervisor.lifecycle(ServiceId::Verb), ServiceState::Unhealthy);

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_worker_reported_healthy_within_polling_window() {
        let port = spawn_health_stub().await;
        let (controller, supervisor) = create_test_controller(&[(ServiceId::Verb, port)]);

        let start = Instant::now();
        let report = controller.trigger().wait().await.unwrap();

        // 2 attempts x 20ms, plus slack for spawning
        assert!(start.elapsed() < Duration::from_millis(2 * 20 + 1000), "took {:?}", start.elapsed());
        assert_eq!(report.healthy, vec![ServiceId::Verb]);
        assert!(report.all_healthy());

        let handle = supervisor.current_handle(ServiceId::Verb).unwrap();
        assert_eq!(handle.generation, 1);
        assert_eq!(handle.lifecycle, ServiceState::Healthy);

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_shutdown_blocks_pending_restart() {
        let (controller, supervisor) = create_test_controller(&[
            (ServiceId::Verb, 46112),
            (ServiceId::Number, 46114),
        ]);

        let ticket = controller.trigger();
        controller.shutdown().await;

        assert!(ticket.wait().await.is_none());
        assert_eq!(supervisor.live_count(), 0);

        // Restarts after shutdown never spawn anything
        assert!(controller.trigger().wait().await.is_none());
        assert_eq!(supervisor.live_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_workers() {
        let (controller, supervisor) = create_test_controller(&[(ServiceId::Tense, 46113)]);

        controller.trigger().wait().await.unwrap();
        assert_eq!(supervisor.live_count(), 1);

        controller.shutdown().await;
        assert_eq!(supervisor.live_count(), 0);
        assert_eq!(supervisor.lifecycle(ServiceId::Tense), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_quick_restarts_leave_one_worker_per_service() {
        let (controller, supervisor) = create_test_controller(&[
            (ServiceId::Sentence, 46101),
            (ServiceId::Tense, 46103),
        ]);

        let first = controller.trigger();
        let second = controller.trigger();
        assert_eq!(second.generation(), 2);

        assert!(first.wait().await.is_none());
        let report = second.wait().await.unwrap();
        assert_eq!(report.generation, 2);

        assert_eq!(supervisor.live_count(), 2);
        for id in [ServiceId::Sentence, ServiceId::Tense] {
            assert_eq!(supervisor.current_handle(id).unwrap().generation, 2);
        }

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_superseded_poll_leaves_state_alone() {
        let (controller, supervisor) = create_test_controller(&[(ServiceId::Number, 46104)]);

        let first = controller.trigger();
        // Let generation 1 spawn and start polling
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = controller.trigger();

        let _ = first.wait().await;
        let report = second.wait().await.unwrap();
        assert_eq!(report.unhealthy, vec![ServiceId::Number]);

        let handle = supervisor.current_handle(ServiceId::Number).unwrap();
        assert_eq!(handle.generation, 2);
        assert_eq!(handle.lifecycle, ServiceState::Unhealthy);
        assert_eq!(supervisor.live_count(), 1);

        supervisor.stop_all().await;
    }
}
