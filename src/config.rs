use crate::registry::ServiceId;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listener and local content settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Request forwarding and status settings
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Health probing and startup polling
    #[serde(default)]
    pub health: HealthConfig,

    /// Worker process management
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Backend services, in registration order
    #[serde(default = "default_services")]
    pub services: Vec<ServiceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            gateway: GatewayConfig::default(),
            health: HealthConfig::default(),
            supervisor: SupervisorConfig::default(),
            services: default_services(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Public port of the gateway (default: 5000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Origin allowed by cross-origin responses (the frontend dev server)
    #[serde(default = "default_allowed_origin")]
    pub allowed_origin: String,

    /// Directory holding the static game pages
    #[serde(default = "default_static_dir")]
    pub static_dir: String,

    /// Directory holding the JSON dataset files
    #[serde(default = "default_dataset_dir")]
    pub dataset_dir: String,

    /// Maximum idle connections per backend port (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            allowed_origin: default_allowed_origin(),
            static_dir: default_static_dir(),
            dataset_dir: default_dataset_dir(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Timeout for a whole forwarded exchange in seconds (default: 10)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for each probe issued by the status endpoints in milliseconds
    #[serde(default = "default_status_probe_timeout")]
    pub status_probe_timeout_ms: u64,

    /// Probe a service before forwarding to it (default: false)
    #[serde(default)]
    pub probe_before_forward: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            status_probe_timeout_ms: default_status_probe_timeout(),
            probe_before_forward: false,
        }
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn status_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.status_probe_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Probes attempted before a starting worker is declared unhealthy
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed delay between attempts in milliseconds
    #[serde(default = "default_health_interval")]
    pub interval_ms: u64,

    /// Timeout for a single startup probe in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Default health endpoint path
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_ms: default_health_interval(),
            probe_timeout_ms: default_probe_timeout(),
            health_path: default_health_path(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl SupervisorConfig {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

/// Configuration for a single backend service
///
/// # Security Warning
///
/// The `command` and `args` fields allow arbitrary command execution.
/// Configuration files must be protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Which service this entry describes
    pub id: ServiceId,

    /// Display name used in logs (default: derived from the id)
    pub name: Option<String>,

    /// Port the worker listens on; passed to it as `--port`
    pub port: u16,

    /// Health check endpoint path (overrides default)
    pub health_path: Option<String>,

    /// Command line used to launch the worker. Absent for services that are
    /// run outside the gateway and only probed and proxied to.
    pub command: Option<String>,

    /// Extra arguments appended after the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the worker
    pub working_dir: Option<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ServiceConfig {
    /// Create a service config launched by the gateway
    pub fn local(id: ServiceId, command: &str, port: u16) -> Self {
        Self {
            id,
            name: None,
            port,
            health_path: None,
            command: Some(command.to_string()),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
        }
    }

    /// Create a service config for a worker managed elsewhere
    pub fn external(id: ServiceId, port: u16) -> Self {
        Self {
            id,
            name: None,
            port,
            health_path: None,
            command: None,
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
        }
    }

    pub fn health_path<'a>(&'a self, defaults: &'a HealthConfig) -> &'a str {
        self.health_path.as_deref().unwrap_or(&defaults.health_path)
    }

    /// Validate the service configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err(format!(
                "Service '{}': 'port' must be greater than 0",
                self.id
            ));
        }

        if let Some(ref command) = self.command {
            if command.trim().is_empty() {
                return Err(format!(
                    "Service '{}': 'command' must not be empty",
                    self.id
                ));
            }
        }

        if let Some(ref path) = self.health_path {
            if !path.starts_with('/') {
                return Err(format!(
                    "Service '{}': 'health_path' must start with '/'",
                    self.id
                ));
            }
        }

        Ok(())
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    5000
}

fn default_allowed_origin() -> String {
    "http://localhost:5173".to_string()
}

fn default_static_dir() -> String {
    "games".to_string()
}

fn default_dataset_dir() -> String {
    "dataset".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    10
}

fn default_status_probe_timeout() -> u64 {
    2000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_health_interval() -> u64 {
    1000
}

fn default_probe_timeout() -> u64 {
    5000
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_shutdown_grace_period() -> u64 {
    5
}

/// The stock layout: five game workers launched by the gateway on 5001-5005
/// and the account backend on 5006, which runs on its own.
fn default_services() -> Vec<ServiceConfig> {
    vec![
        ServiceConfig::local(ServiceId::Sentence, "python3 -u servers/sans_sent_game.py", 5001),
        ServiceConfig::local(ServiceId::Verb, "python3 -u servers/verb_game.py", 5002),
        ServiceConfig::local(ServiceId::Tense, "python3 -u servers/tense_game.py", 5003),
        ServiceConfig::local(ServiceId::Number, "python3 -u servers/number_game.py", 5004),
        ServiceConfig::local(ServiceId::Matching, "python3 -u servers/mtcGame.py", 5005),
        ServiceConfig::external(ServiceId::Account, 5006),
    ]
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.health.max_attempts == 0 {
            errors.push("health.max_attempts must be at least 1".to_string());
        }

        if !self.health.health_path.starts_with('/') {
            errors.push("health.health_path must start with '/'".to_string());
        }

        let mut seen_ids = HashSet::new();
        let mut seen_ports = HashMap::new();
        seen_ports.insert(self.server.port, "the gateway".to_string());

        for service in &self.services {
            if let Err(e) = service.validate() {
                errors.push(e);
            }

            if !seen_ids.insert(service.id) {
                errors.push(format!("Service '{}' is configured more than once", service.id));
            }

            if service.port != 0 {
                if let Some(owner) = seen_ports.insert(service.port, format!("service '{}'", service.id)) {
                    errors.push(format!(
                        "Service '{}': port {} is already used by {}",
                        service.id, service.port, owner
                    ));
                }
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
