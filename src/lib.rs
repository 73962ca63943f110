//! Learngate - a supervisor and gateway for learning-game backends
//!
//! This library provides a single HTTP entry point that:
//! - Launches each game backend as a long-lived worker process
//! - Polls each worker's health endpoint before declaring it ready
//! - Proxies client requests to the right worker and normalizes failures
//! - Serves the static game pages and dataset files itself
//! - Reports aggregate health on demand
//! - Restarts all workers in the background without stopping the gateway

pub mod config;
pub mod content;
pub mod error;
pub mod healthcheck;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod registry;
pub mod restart;
pub mod routes;
pub mod status;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
