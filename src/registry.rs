//! Static service registry
//!
//! Descriptors are built once from configuration and never mutated. Every
//! other component refers to services through [`ServiceId`], so an unknown
//! service can only ever be rejected while the configuration is parsed.

use crate::config::{Config, HealthConfig, ServiceConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Identifier of a backend service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceId {
    /// Sentence analysis game
    #[serde(rename = "sentence")]
    Sentence,
    /// Verb conjugation game
    #[serde(rename = "verb")]
    Verb,
    /// Tense question game
    #[serde(rename = "tense")]
    Tense,
    /// Number game
    #[serde(rename = "number")]
    Number,
    /// Matching game
    #[serde(rename = "mtc", alias = "matching")]
    Matching,
    /// User account backend
    #[serde(rename = "database", alias = "account")]
    Account,
}

impl ServiceId {
    pub const ALL: [ServiceId; 6] = [
        ServiceId::Sentence,
        ServiceId::Verb,
        ServiceId::Tense,
        ServiceId::Number,
        ServiceId::Matching,
        ServiceId::Account,
    ];

    /// Short name used in URLs (`/api/{slug}-status`) and logs
    pub fn slug(&self) -> &'static str {
        match self {
            ServiceId::Sentence => "sentence",
            ServiceId::Verb => "verb",
            ServiceId::Tense => "tense",
            ServiceId::Number => "number",
            ServiceId::Matching => "mtc",
            ServiceId::Account => "database",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.slug() == slug)
    }

    fn default_name(&self) -> &'static str {
        match self {
            ServiceId::Sentence => "Sentence Game",
            ServiceId::Verb => "Verb Game",
            ServiceId::Tense => "Tense Game",
            ServiceId::Number => "Number Game",
            ServiceId::Matching => "Matching Game",
            ServiceId::Account => "Database",
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// How to launch a worker process
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    /// Command line, split with shell quoting rules at launch time
    pub command: String,
    /// Arguments appended after the command line
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl LaunchSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
        }
    }
}

/// Immutable description of one backend service
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDescriptor {
    pub id: ServiceId,
    pub name: String,
    /// `None` for services that run outside the gateway
    pub launch: Option<LaunchSpec>,
    pub port: u16,
    pub health_path: String,
}

impl ServiceDescriptor {
    /// Descriptor for a worker the gateway launches
    pub fn local(id: ServiceId, launch: LaunchSpec, port: u16) -> Self {
        Self {
            id,
            name: id.default_name().to_string(),
            launch: Some(launch),
            port,
            health_path: "/health".to_string(),
        }
    }

    /// Descriptor for a worker managed elsewhere
    pub fn external(id: ServiceId, port: u16) -> Self {
        Self {
            id,
            name: id.default_name().to_string(),
            launch: None,
            port,
            health_path: "/health".to_string(),
        }
    }

    fn from_config(config: &ServiceConfig, health: &HealthConfig) -> Self {
        let launch = config.command.as_ref().map(|command| LaunchSpec {
            command: command.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.as_ref().map(PathBuf::from),
            env: config.env.clone(),
        });

        Self {
            id: config.id,
            name: config
                .name
                .clone()
                .unwrap_or_else(|| config.id.default_name().to_string()),
            launch,
            port: config.port,
            health_path: config.health_path(health).to_string(),
        }
    }

    pub fn is_external(&self) -> bool {
        self.launch.is_none()
    }

    /// Loopback address the gateway uses to reach the worker
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url(), self.health_path)
    }

    /// Address reported to clients in status responses
    pub fn public_url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("service '{0}' is registered more than once")]
    DuplicateService(ServiceId),
    #[error("port {port} is shared by '{first}' and '{second}'")]
    DuplicatePort {
        port: u16,
        first: ServiceId,
        second: ServiceId,
    },
}

/// Table of all registered services, in registration order
#[derive(Debug, Clone)]
pub struct Registry {
    services: Vec<Arc<ServiceDescriptor>>,
}

impl Registry {
    pub fn new(descriptors: Vec<ServiceDescriptor>) -> Result<Self, RegistryError> {
        let mut services: Vec<Arc<ServiceDescriptor>> = Vec::with_capacity(descriptors.len());

        for descriptor in descriptors {
            for existing in &services {
                if existing.id == descriptor.id {
                    return Err(RegistryError::DuplicateService(descriptor.id));
                }
                if existing.port == descriptor.port {
                    return Err(RegistryError::DuplicatePort {
                        port: descriptor.port,
                        first: existing.id,
                        second: descriptor.id,
                    });
                }
            }
            services.push(Arc::new(descriptor));
        }

        Ok(Self { services })
    }

    pub fn from_config(config: &Config) -> Result<Self, RegistryError> {
        Self::new(
            config
                .services
                .iter()
                .map(|s| ServiceDescriptor::from_config(s, &config.health))
                .collect(),
        )
    }

    pub fn get(&self, id: ServiceId) -> Option<&Arc<ServiceDescriptor>> {
        self.services.iter().find(|s| s.id == id)
    }

    pub fn contains(&self, id: ServiceId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServiceDescriptor>> {
        self.services.iter()
    }

    /// Services the gateway is responsible for launching
    pub fn launchable(&self) -> impl Iterator<Item = &Arc<ServiceDescriptor>> {
        self.services.iter().filter(|s| !s.is_external())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
