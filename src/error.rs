//! Error taxonomy and JSON error responses for the gateway

use crate::registry::ServiceId;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// No route for this path
    NotFound,
    /// Route exists but not for this method
    MethodNotAllowed,
    /// Request could not be read or rebuilt
    BadRequest,
    /// Service has no live worker
    ServiceNotRunning,
    /// Service did not answer a liveness probe
    ServiceUnhealthy,
    /// Forwarded request timed out
    ProxyTimeout,
    /// Failed to reach the service
    ProxyConnectionError,
    /// Static page or dataset file missing
    ContentNotFound,
    /// Static page or dataset file unreadable or malformed
    ContentUnreadable,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::NotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            GatewayErrorCode::ServiceNotRunning => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::ServiceUnhealthy => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::ProxyTimeout => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::ProxyConnectionError => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::ContentNotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::ContentUnreadable => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::NotFound => "NOT_FOUND",
            GatewayErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            GatewayErrorCode::BadRequest => "BAD_REQUEST",
            GatewayErrorCode::ServiceNotRunning => "SERVICE_NOT_RUNNING",
            GatewayErrorCode::ServiceUnhealthy => "SERVICE_UNHEALTHY",
            GatewayErrorCode::ProxyTimeout => "PROXY_TIMEOUT",
            GatewayErrorCode::ProxyConnectionError => "PROXY_CONNECTION_ERROR",
            GatewayErrorCode::ContentNotFound => "CONTENT_NOT_FOUND",
            GatewayErrorCode::ContentUnreadable => "CONTENT_UNREADABLE",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable diagnostic
    pub error: String,
    /// The error code
    pub code: GatewayErrorCode,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            error: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}","code":"{}","status":{}}}"#,
                self.error.replace('\"', "\\\""),
                self.code.as_header_value(),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// A worker could not be launched. Fatal to that one service only.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("service '{0}' is not launched by the gateway")]
    External(ServiceId),

    #[error("service '{0}' has an empty launch command")]
    EmptyCommand(ServiceId),

    #[error("service '{service}' has an invalid launch command: {reason}")]
    InvalidCommand { service: ServiceId, reason: String },

    #[error("launch target '{program}' for service '{service}' was not found")]
    NotFound { service: ServiceId, program: String },

    #[error("working directory '{dir}' for service '{service}' does not exist")]
    MissingWorkingDir { service: ServiceId, dir: String },

    #[error("failed to spawn service '{service}': {source}")]
    Spawn {
        service: ServiceId,
        #[source]
        source: std::io::Error,
    },
}

/// Why a single liveness probe failed. Never surfaced to callers of
/// `probe`, only logged.
#[derive(Debug, Error)]
pub enum ProbeFailure {
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(#[from] hyper_util::client::legacy::Error),

    #[error("health endpoint answered {0}")]
    Status(StatusCode),

    #[error("invalid probe request: {0}")]
    Request(#[from] http::Error),
}

/// A forwarded request did not produce a downstream response
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("no live worker")]
    NotRunning,

    #[error("health probe failed")]
    Unhealthy,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(#[from] hyper_util::client::legacy::Error),

    #[error("failed to read response body: {0}")]
    Body(#[from] hyper::Error),

    #[error("failed to read request body: {0}")]
    ClientBody(#[source] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] http::Error),
}

impl ForwardError {
    pub fn code(&self) -> GatewayErrorCode {
        match self {
            ForwardError::NotRunning => GatewayErrorCode::ServiceNotRunning,
            ForwardError::Unhealthy => GatewayErrorCode::ServiceUnhealthy,
            ForwardError::Timeout(_) => GatewayErrorCode::ProxyTimeout,
            ForwardError::Connection(_) | ForwardError::Body(_) => {
                GatewayErrorCode::ProxyConnectionError
            }
            ForwardError::Request(_) | ForwardError::ClientBody(_) => GatewayErrorCode::BadRequest,
        }
    }

    /// The client-facing response for this failure
    pub fn into_response(self, service: ServiceId) -> Response<BoxBody<Bytes, hyper::Error>> {
        match self {
            ForwardError::Request(e) => {
                json_error_response(GatewayErrorCode::BadRequest, format!("invalid request: {}", e))
            }
            ForwardError::ClientBody(e) => json_error_response(
                GatewayErrorCode::BadRequest,
                format!("invalid request body: {}", e),
            ),
            other => json_error_response(other.code(), format!("{} unavailable", service)),
        }
    }
}
