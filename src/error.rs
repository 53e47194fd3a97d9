//! Error types for the API gateway.

use http::StatusCode;
use std::io;
use thiserror::Error;

/// Errors that can occur during gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Failed to bind to the listener address.
    #[error("failed to bind listener to {addr}: {source}")]
    ListenerBind { addr: String, source: io::Error },

    /// HTTP protocol error.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed service instance registration.
    #[error("invalid service instance: {0}")]
    InvalidInstance(String),

    /// No route matches the request.
    #[error("no route found for {method} {path}")]
    RouteNotFound { method: String, path: String },

    /// Service has no healthy instances.
    #[error("service unavailable: {service}")]
    ServiceUnavailable { service: String },

    /// Maintenance mode is enabled; all forwarding is blocked.
    #[error("gateway is in maintenance mode")]
    MaintenanceMode,

    /// Transport failure while talking to a backend.
    #[error("upstream request to {target} failed: {source}")]
    UpstreamTransport {
        target: String,
        source: hyper_util::client::legacy::Error,
    },

    /// The outbound URI could not be constructed.
    #[error("failed to build upstream uri: {0}")]
    UpstreamUri(String),

    /// Outbound request exceeded its deadline.
    #[error("upstream request timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Request body exceeds the configured maximum.
    #[error("request body exceeds limit of {limit} bytes")]
    BodyTooLarge { limit: u64 },

    /// Rate limit admission was denied.
    #[error("{scope} rate limit exceeded for {path}")]
    RateLimitExceeded { scope: String, path: String },

    /// Deregister or discover referenced an unknown id or service.
    #[error("registry entry not found: {name}")]
    RegistryNotFound { name: String },
}

impl GatewayError {
    /// Maps the error to the HTTP status code surfaced to callers.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound { .. } | GatewayError::RegistryNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            GatewayError::ServiceUnavailable { .. } | GatewayError::MaintenanceMode => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::UpstreamTransport { .. } | GatewayError::UpstreamUri(_) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::InvalidConfig(_) | GatewayError::InvalidInstance(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
