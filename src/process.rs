use crate::error::LaunchError;
use crate::registry::{LaunchSpec, Registry, ServiceDescriptor, ServiceId};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a stopped worker's output drain may keep running before it is
/// aborted (grandchildren can hold the pipes open)
const DRAIN_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Monotonically increasing restart counter; every worker is tagged with the
/// generation that spawned it
pub type RestartGeneration = u64;

/// Lifecycle of a worker as seen by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// No live process
    Stopped,
    /// Spawned, waiting for the first successful health probe
    Starting,
    /// Answered a health probe after starting
    Healthy,
    /// Did not answer within the startup attempts
    Unhealthy,
}

/// Snapshot of a live worker. The child process itself never leaves the
/// supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandleInfo {
    pub service: ServiceId,
    pub pid: u32,
    pub generation: RestartGeneration,
    pub lifecycle: ServiceState,
}

/// Result of [`ProcessSupervisor::restart_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestartOutcome {
    pub relaunched: Vec<ServiceId>,
    pub failed: Vec<ServiceId>,
}

/// One running worker
struct WorkerProcess {
    child: Child,
    pid: u32,
    generation: RestartGeneration,
    lifecycle: Arc<Mutex<ServiceState>>,
    /// Set before the supervisor terminates the worker, so the drain task can
    /// tell a requested stop from a crash
    stopping: Arc<AtomicBool>,
    drain: JoinHandle<()>,
}

impl WorkerProcess {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn info(&self, service: ServiceId) -> HandleInfo {
        HandleInfo {
            service,
            pid: self.pid,
            generation: self.generation,
            lifecycle: *self.lifecycle.lock(),
        }
    }
}

/// Owns every worker process the gateway launches.
///
/// At most one worker per service is tracked; starting a service that
/// already has one stops the old worker before the new one is spawned, so the
/// port is free again. All table writers (`start`, `stop`, `restart_all`,
/// `stop_all`) are serialized through one async lock.
///
/// ```ignore
/// let supervisor = ProcessSupervisor::new(registry, Duration::from_secs(5));
/// // supervisor is already Arc<ProcessSupervisor>
/// ```
pub struct ProcessSupervisor {
    registry: Arc<Registry>,
    processes: DashMap<ServiceId, WorkerProcess>,
    writer: tokio::sync::Mutex<()>,
    grace_period: Duration,
}

impl ProcessSupervisor {
    pub fn new(registry: Arc<Registry>, grace_period: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry,
            processes: DashMap::new(),
            writer: tokio::sync::Mutex::new(()),
            grace_period,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Spawn a worker for `descriptor`, replacing any live worker of the same
    /// service
    pub async fn start(
        &self,
        descriptor: &ServiceDescriptor,
        generation: RestartGeneration,
    ) -> Result<HandleInfo, LaunchError> {
        let _guard = self.writer.lock().await;
        self.start_locked(descriptor, generation).await
    }

    /// Gracefully stop the worker of `id`. No-op if there is none.
    pub async fn stop(&self, id: ServiceId) {
        let _guard = self.writer.lock().await;
        self.stop_locked(id).await;
    }

    /// Stop the worker of `id` only if it was spawned by `generation`
    pub async fn stop_generation(&self, id: ServiceId, generation: RestartGeneration) -> bool {
        let _guard = self.writer.lock().await;

        let matches = self
            .processes
            .get(&id)
            .map(|p| p.generation == generation)
            .unwrap_or(false);

        if matches {
            self.stop_locked(id).await;
        } else {
            debug!(service = %id, generation, "No worker of this generation to stop");
        }
        matches
    }

    /// Stop every tracked worker, then spawn every launchable service.
    ///
    /// Returns once the new processes are spawned; health is not awaited.
    pub async fn restart_all(&self, generation: RestartGeneration) -> RestartOutcome {
        let _guard = self.writer.lock().await;

        let tracked: Vec<ServiceId> = self.processes.iter().map(|e| *e.key()).collect();
        for id in tracked {
            self.stop_locked(id).await;
        }

        let mut outcome = RestartOutcome::default();
        for descriptor in self.registry.launchable() {
            match self.start_locked(descriptor, generation).await {
                Ok(_) => outcome.relaunched.push(descriptor.id),
                Err(e) => {
                    error!(service = %descriptor.id, generation, error = %e, "Failed to relaunch worker");
                    outcome.failed.push(descriptor.id);
                }
            }
        }

        info!(
            generation,
            relaunched = outcome.relaunched.len(),
            failed = outcome.failed.len(),
            "Workers relaunched"
        );
        outcome
    }

    /// Snapshot of the live worker of `id`, if any
    pub fn current_handle(&self, id: ServiceId) -> Option<HandleInfo> {
        let mut process = self.processes.get_mut(&id)?;
        if process.is_alive() {
            Some(process.info(id))
        } else {
            None
        }
    }

    /// Supervisor's view of a worker's lifecycle
    pub fn lifecycle(&self, id: ServiceId) -> ServiceState {
        self.processes
            .get(&id)
            .map(|p| *p.lifecycle.lock())
            .unwrap_or(ServiceState::Stopped)
    }

    /// Record a probe result, but only for the worker of `generation`.
    /// Returns false if that worker has since been replaced or stopped.
    pub fn set_lifecycle_if_generation(
        &self,
        id: ServiceId,
        generation: RestartGeneration,
        state: ServiceState,
    ) -> bool {
        match self.processes.get(&id) {
            Some(process) if process.generation == generation => {
                let mut lifecycle = process.lifecycle.lock();
                // An exit observed by the drain task wins over a late probe
                if *lifecycle == ServiceState::Stopped {
                    return false;
                }
                *lifecycle = state;
                true
            }
            _ => false,
        }
    }

    /// Number of tracked workers whose process has not exited
    pub fn live_count(&self) -> usize {
        let mut live = 0;
        for mut entry in self.processes.iter_mut() {
            if entry.value_mut().is_alive() {
                live += 1;
            }
        }
        live
    }

    /// Stop all workers (gateway shutdown)
    pub async fn stop_all(&self) {
        let _guard = self.writer.lock().await;

        let ids: Vec<ServiceId> = self.processes.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.stop_locked(id).await;
        }
    }

    async fn start_locked(
        &self,
        descriptor: &ServiceDescriptor,
        generation: RestartGeneration,
    ) -> Result<HandleInfo, LaunchError> {
        let launch = descriptor
            .launch
            .as_ref()
            .ok_or(LaunchError::External(descriptor.id))?;

        let (mut cmd, program) = build_command(descriptor, launch)?;

        if let Some(ref dir) = launch.working_dir {
            if !dir.is_dir() {
                return Err(LaunchError::MissingWorkingDir {
                    service: descriptor.id,
                    dir: dir.display().to_string(),
                });
            }
        }

        // The port must be free before the replacement binds it
        if self.processes.contains_key(&descriptor.id) {
            self.stop_locked(descriptor.id).await;
        }

        info!(
            service = %descriptor.id,
            port = descriptor.port,
            generation,
            command = %launch.command,
            "Starting {}",
            descriptor.name
        );

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LaunchError::NotFound {
                service: descriptor.id,
                program: program.clone(),
            },
            _ => LaunchError::Spawn {
                service: descriptor.id,
                source: e,
            },
        })?;

        let Some(pid) = child.id() else {
            return Err(LaunchError::Spawn {
                service: descriptor.id,
                source: std::io::Error::other("worker exited before its pid was read"),
            });
        };
        let lifecycle = Arc::new(Mutex::new(ServiceState::Starting));
        let stopping = Arc::new(AtomicBool::new(false));

        let drain = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => spawn_output_drain(
                descriptor.id,
                pid,
                stdout,
                stderr,
                Arc::clone(&lifecycle),
                Arc::clone(&stopping),
            ),
            _ => tokio::spawn(async {}),
        };

        info!(service = %descriptor.id, pid, generation, "Worker process spawned");

        let process = WorkerProcess {
            child,
            pid,
            generation,
            lifecycle,
            stopping,
            drain,
        };
        let info = process.info(descriptor.id);
        self.processes.insert(descriptor.id, process);

        Ok(info)
    }

    /// Remove the worker from the table, then SIGTERM, wait for the grace
    /// period and SIGKILL if it is still running
    async fn stop_locked(&self, id: ServiceId) {
        let Some((_, mut process)) = self.processes.remove(&id) else {
            return;
        };

        process.stopping.store(true, Ordering::SeqCst);

        if process.is_alive() {
            match process.child.id() {
                #[cfg(unix)]
                Some(pid) => {
                    info!(service = %id, pid, "Sending SIGTERM to worker");
                    unsafe {
                        libc::kill(pid as i32, libc::SIGTERM);
                    }
                }
                _ => {
                    info!(service = %id, pid = process.pid, "Killing worker");
                    let _ = process.child.start_kill();
                }
            }

            match tokio::time::timeout(self.grace_period, process.child.wait()).await {
                Ok(Ok(status)) => {
                    info!(service = %id, ?status, "Worker exited gracefully");
                }
                Ok(Err(e)) => {
                    warn!(service = %id, error = %e, "Error waiting for worker to exit");
                }
                Err(_) => {
                    warn!(
                        service = %id,
                        grace_period_secs = self.grace_period.as_secs(),
                        "Grace period exceeded, sending SIGKILL"
                    );
                    let _ = process.child.kill().await;
                }
            }
        } else {
            debug!(service = %id, pid = process.pid, "Worker already exited");
        }

        *process.lifecycle.lock() = ServiceState::Stopped;

        if tokio::time::timeout(DRAIN_SHUTDOWN_TIMEOUT, &mut process.drain)
            .await
            .is_err()
        {
            process.drain.abort();
        }
    }
}

/// Build the worker command line: the configured command (shell-words split),
/// the extra args, then `--port <port>`. `PORT` is set as well.
fn build_command(
    descriptor: &ServiceDescriptor,
    launch: &LaunchSpec,
) -> Result<(Command, String), LaunchError> {
    let mut words = shell_words::split(&launch.command).map_err(|e| {
        LaunchError::InvalidCommand {
            service: descriptor.id,
            reason: e.to_string(),
        }
    })?;

    if words.is_empty() {
        return Err(LaunchError::EmptyCommand(descriptor.id));
    }
    let program = words.remove(0);

    let mut cmd = Command::new(&program);
    cmd.args(&words);
    cmd.args(&launch.args);
    cmd.arg("--port").arg(descriptor.port.to_string());
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    if let Some(ref working_dir) = launch.working_dir {
        cmd.current_dir(working_dir);
    }

    for (key, value) in &launch.env {
        cmd.env(key, value);
    }
    cmd.env("PORT", descriptor.port.to_string());

    Ok((cmd, program))
}

/// Re-emit worker output line by line. End of output without a requested
/// stop means the worker died on its own.
fn spawn_output_drain(
    service: ServiceId,
    pid: u32,
    stdout: ChildStdout,
    stderr: ChildStderr,
    lifecycle: Arc<Mutex<ServiceState>>,
    stopping: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout_reader.next_line(), if stdout_open => {
                    match line {
                        Ok(Some(line)) => info!(target: "worker", service = %service, "{}", line),
                        Ok(None) => stdout_open = false,
                        Err(e) => {
                            warn!(service = %service, error = %e, "Error reading worker stdout");
                            stdout_open = false;
                        }
                    }
                }
                line = stderr_reader.next_line(), if stderr_open => {
                    match line {
                        Ok(Some(line)) => info!(target: "worker", service = %service, stream = "stderr", "{}", line),
                        Ok(None) => stderr_open = false,
                        Err(e) => {
                            warn!(service = %service, error = %e, "Error reading worker stderr");
                            stderr_open = false;
                        }
                    }
                }
            }
        }

        if !stopping.load(Ordering::SeqCst) {
            error!(service = %service, pid, "ProcessExitedUnexpectedly: worker output closed without a stop request");
            *lifecycle.lock() = ServiceState::Stopped;
        }
    })
}
