//! Error kinds and JSON error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Failure of a single runtime driver call
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The daemon (or the CLI talking to it) could not be reached
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    /// The runtime answered with an error
    #[error("runtime command failed: {0}")]
    CommandFailed(String),
    #[error("runtime call '{operation}' timed out after {}s", .after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

/// Every port in the configured range is taken
#[derive(Debug, Clone, thiserror::Error)]
#[error("no available ports in range {start}-{end}")]
pub struct PortsExhausted {
    pub start: u16,
    pub end: u16,
}

/// Failure of a lifecycle operation on an instance
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Docker daemon is not running: {0}")]
    DaemonUnavailable(String),
    #[error("Image '{image}' is not available: {reason}")]
    ImageUnavailable { image: String, reason: String },
    #[error(transparent)]
    PortsExhausted(#[from] PortsExhausted),
    #[error("{0}")]
    CommandFailed(String),
    #[error("{0}")]
    Timeout(String),
    /// The instance has no container to act on
    #[error("Instance has no container")]
    NotCreated,
    #[error("Registry error: {0:#}")]
    Registry(#[from] anyhow::Error),
}

impl From<RuntimeError> for LifecycleError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(msg) => LifecycleError::DaemonUnavailable(msg),
            RuntimeError::CommandFailed(msg) => LifecycleError::CommandFailed(msg),
            e @ RuntimeError::Timeout { .. } => LifecycleError::Timeout(e.to_string()),
        }
    }
}

impl LifecycleError {
    /// Machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleError::DaemonUnavailable(_) => "daemon_unavailable",
            LifecycleError::ImageUnavailable { .. } => "image_unavailable",
            LifecycleError::PortsExhausted(_) => "ports_exhausted",
            LifecycleError::CommandFailed(_) => "command_failed",
            LifecycleError::Timeout(_) => "timeout",
            LifecycleError::NotCreated => "not_created",
            LifecycleError::Registry(_) => "registry",
        }
    }

    /// HTTP status used when this error reaches an API caller
    pub fn status_code(&self) -> StatusCode {
        match self {
            LifecycleError::DaemonUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A reconciliation pass that could not run at all
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Docker daemon is not running, reconciliation skipped")]
    DaemonUnavailable,
    #[error("Registry error: {0:#}")]
    Registry(#[from] anyhow::Error),
}

impl ReconcileError {
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::DaemonUnavailable => "daemon_unavailable",
            ReconcileError::Registry(_) => "registry",
        }
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Path does not name an instance and a sub-path
    InvalidPath,
    /// No instance with that id
    NotFound,
    /// Instance exists but is not running
    NotRunning,
    /// Upstream timed out, refused, or failed otherwise
    ProxyFailure,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::InvalidPath => StatusCode::BAD_REQUEST,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::NotRunning => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::ProxyFailure => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::InvalidPath => "INVALID_PATH",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::NotRunning => "NOT_RUNNING",
            ProxyErrorCode::ProxyFailure => "PROXY_FAILURE",
        }
    }

    /// Summary placed in the `error` field of the JSON body
    pub fn summary(&self) -> &'static str {
        match self {
            ProxyErrorCode::InvalidPath => "Invalid API path",
            ProxyErrorCode::NotFound => "Instance not found",
            ProxyErrorCode::NotRunning => "Instance is not running",
            ProxyErrorCode::ProxyFailure => "Proxy request failed",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: Option<String>) -> Self {
        Self {
            error: error.into(),
            message,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"error":"{}"}}"#, self.error.replace('"', "\\\""))
        })
    }
}

/// Create a proxy error response with X-Proxy-Error header
pub fn proxy_error_response(
    code: ProxyErrorCode,
    message: Option<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(code.summary(), message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
