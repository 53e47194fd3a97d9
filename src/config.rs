//! Configuration for the gateway.
//!
//! Process-level settings (listen addresses, timeouts, sweep intervals) come
//! from environment variables. The routing document — groups, routes, the
//! services map, and rate limit rules — is a structured TOML or JSON file
//! that can be reloaded as a unit at runtime.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid listen address format.
    #[error("invalid listen address '{addr}': {reason}")]
    InvalidListenAddr { addr: String, reason: String },

    /// Invalid admin address format.
    #[error("invalid admin address '{addr}': {reason}")]
    InvalidAdminAddr { addr: String, reason: String },

    /// Duplicate listen and admin addresses.
    #[error("listen address and admin address cannot be the same: {addr}")]
    DuplicateAddrs { addr: String },

    /// Invalid timeout value.
    #[error("invalid timeout value: {reason}")]
    InvalidTimeout { reason: String },

    /// A service entry has an unusable host.
    #[error("invalid host '{host}' for service '{service}': {reason}")]
    InvalidServiceHost {
        service: String,
        host: String,
        reason: String,
    },
}

/// Process-level gateway configuration loaded at startup.
///
/// Immutable after initialization. Loaded from environment variables with
/// fallback to defaults.
///
/// # Environment Variables
///
/// * `GATEWAY_LISTEN_ADDR` - Proxy listen address (default: "127.0.0.1:3000")
/// * `GATEWAY_ADMIN_ADDR` - Admin endpoint address (default: "127.0.0.1:9090")
/// * `GATEWAY_ROUTES_FILE` - Routing document path (default: "configs/gateway.toml")
/// * `GATEWAY_REQUEST_TIMEOUT_MS` - Default upstream timeout (default: 30000)
/// * `GATEWAY_HEALTH_INTERVAL_MS` - Health sweep interval (default: 30000)
/// * `GATEWAY_PROBE_TIMEOUT_MS` - Per-probe timeout (default: 5000)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address to listen on for proxied traffic.
    pub listen_addr: String,

    /// Address to serve admin endpoints on.
    pub admin_addr: String,

    /// Path to the routing document.
    pub routes_file: String,

    /// Default upstream request timeout, used when neither the caller, the
    /// route, nor the service specifies one.
    pub request_timeout: Duration,

    /// Interval between health sweeps.
    pub health_check_interval: Duration,

    /// Deadline for a single health probe.
    pub health_probe_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".to_string(),
            admin_addr: "127.0.0.1:9090".to_string(),
            routes_file: "configs/gateway.toml".to_string(),
            request_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            health_probe_timeout: Duration::from_secs(5),
        }
    }
}

fn env_ms(name: &str, default_ms: u64) -> Duration {
    let ms = env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}

impl GatewayConfig {
    /// Loads configuration from environment variables with fallback to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            listen_addr: env::var("GATEWAY_LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            admin_addr: env::var("GATEWAY_ADMIN_ADDR").unwrap_or(defaults.admin_addr),
            routes_file: env::var("GATEWAY_ROUTES_FILE").unwrap_or(defaults.routes_file),
            request_timeout: env_ms("GATEWAY_REQUEST_TIMEOUT_MS", 30000),
            health_check_interval: env_ms("GATEWAY_HEALTH_INTERVAL_MS", 30000),
            health_probe_timeout: env_ms("GATEWAY_PROBE_TIMEOUT_MS", 5000),
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if an address does not parse as a socket address,
    /// the listen and admin addresses collide, or a timeout is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidListenAddr {
                addr: self.listen_addr.clone(),
                reason: e.to_string(),
            })?;

        self.admin_addr
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidAdminAddr {
                addr: self.admin_addr.clone(),
                reason: e.to_string(),
            })?;

        if self.listen_addr == self.admin_addr {
            return Err(ConfigError::DuplicateAddrs {
                addr: self.listen_addr.clone(),
            });
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout {
                reason: "request timeout must be greater than zero".to_string(),
            });
        }

        if self.request_timeout > Duration::from_secs(3600) {
            return Err(ConfigError::InvalidTimeout {
                reason: "request timeout must not exceed 1 hour".to_string(),
            });
        }

        Ok(())
    }
}

/// A single route entry in the routing document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Unique route identifier.
    pub id: String,
    /// Path pattern: literal segments, `:param` segments, trailing `*` wildcard.
    pub pattern: String,
    /// Target logical service name.
    pub service: String,
    /// Allowed HTTP methods; empty means all.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Whether an authenticated identity is required.
    #[serde(default)]
    pub auth_required: bool,
    /// Roles allowed to use this route.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Per-route upstream timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Maximum request body size in bytes.
    pub max_body_size: Option<u64>,
    /// Strip the pattern's literal prefix before forwarding.
    #[serde(default)]
    pub strip_prefix: bool,
    /// Replace the path entirely before forwarding.
    pub rewrite_path: Option<String>,
    /// Static headers injected into the outbound request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// A path-prefix scope wrapping a set of routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteGroupConfig {
    /// Group name, used for diagnostics.
    pub name: String,
    /// Path prefix; routes inside match only under this prefix.
    pub prefix: String,
    /// Middleware names applied to every route in the group.
    #[serde(default)]
    pub middleware: Vec<String>,
    /// Routes contained in the group.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// A logical backend service entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Candidate hosts for this service.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Port shared by all hosts.
    pub port: u16,
    /// Health-check path probed by the sweep.
    #[serde(default = "default_health_check")]
    pub health_check: String,
    /// Service-level upstream timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Maximum request body size in bytes.
    pub max_body_size: Option<u64>,
    /// Static headers injected into the outbound request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_health_check() -> String {
    "/health".to_string()
}

/// A single rate limit rule: at most `requests` within `window_ms`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitRule {
    pub requests: usize,
    pub window_ms: u64,
}

impl LimitRule {
    /// Returns the window length as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Rate limiter settings for all scopes.
///
/// Each scope is independently enabled by providing its rule; an absent
/// rule disables that scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Master switch; when false no admission checks run.
    #[serde(default)]
    pub enabled: bool,
    /// Shared limit across all callers.
    pub global: Option<LimitRule>,
    /// Per-client-IP limit.
    pub per_ip: Option<LimitRule>,
    /// Per-authenticated-user limit.
    pub per_user: Option<LimitRule>,
    /// Per-endpoint limits, keyed by path.
    #[serde(default)]
    pub api: HashMap<String, LimitRule>,
}

/// The routing document: groups, ungrouped routes, the services map, and
/// rate limit rules. Reload replaces the route table and registry seed
/// built from it as a unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayDocument {
    /// Document version, informational only.
    pub version: Option<String>,
    /// Route groups.
    #[serde(default)]
    pub groups: Vec<RouteGroupConfig>,
    /// Ungrouped routes, matched after all groups.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// Logical service name to backend description.
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
    /// Rate limiter settings.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
}

impl GatewayDocument {
    /// Parses a routing document from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Parses a routing document from a JSON string.
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Validates service entries.
    ///
    /// Route patterns and cross-references are validated when the route
    /// table is built from this document.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, service) in &self.services {
            for host in &service.hosts {
                let candidate = format!("http://{}:{}", host, service.port);
                if url::Url::parse(&candidate).is_err() {
                    return Err(ConfigError::InvalidServiceHost {
                        service: name.clone(),
                        host: host.clone(),
                        reason: "does not form a valid http url".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}
