//! Route table and route matching.
//!
//! Routes map an HTTP method + path pattern to a logical backend service.
//! Patterns support literal segments, `:param` segments (one non-slash
//! segment each), and a trailing `*` wildcard spanning the rest of the
//! path. Every pattern is compiled to a regex once at table build time.
//!
//! Matching order is significant: groups are scanned in declaration order,
//! routes within a group in declaration order, then ungrouped routes.
//! The first route whose pattern and method set match wins.

use crate::config::{GatewayDocument, RouteConfig, RouteGroupConfig, ServiceConfig};
use crate::error::{GatewayError, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Rewrites escaped `:name` segments into named non-slash captures.
static PARAM_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/:([A-Za-z0-9_]+)").expect("param segment regex"));

/// Normalizes a path for comparison: trailing slashes are stripped and an
/// empty path becomes `/`.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// A compiled path pattern.
///
/// Anchored: the regex must match the full path, not merely a prefix,
/// except where a trailing `*` explicitly allows any suffix.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    regex: Regex,
    param_names: Vec<String>,
    literal_prefix: String,
}

impl PathPattern {
    /// Compiles a pattern, returning `InvalidConfig` if it cannot be
    /// translated into a matcher.
    pub fn compile(pattern: &str) -> Result<Self> {
        let raw = if pattern.ends_with('*') {
            pattern.to_string()
        } else {
            normalize_path(pattern)
        };

        let mut body = regex::escape(&raw);
        body = body.replace(r"\*", ".*");
        let body = PARAM_SEGMENT.replace_all(&body, "/(?P<$1>[^/]+)");
        let anchored = format!("^{}$", body);

        let regex = Regex::new(&anchored).map_err(|e| {
            GatewayError::InvalidConfig(format!("pattern '{}' does not compile: {}", pattern, e))
        })?;

        let param_names = raw
            .split('/')
            .filter_map(|segment| segment.strip_prefix(':'))
            .map(str::to_string)
            .collect();

        let literal_end = raw.find([':', '*']).unwrap_or(raw.len());
        let literal_prefix = raw[..literal_end].trim_end_matches('/').to_string();

        Ok(Self {
            raw,
            regex,
            param_names,
            literal_prefix,
        })
    }

    /// Returns the original pattern text.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns the literal portion of the pattern up to the first `:param`
    /// or `*`, used by strip-prefix forwarding.
    pub fn literal_prefix(&self) -> &str {
        &self.literal_prefix
    }

    /// Tests a normalized path against the pattern.
    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// Extracts named path parameters from a matching path.
    pub fn extract_params(&self, path: &str) -> HashMap<String, String> {
        let mut params = HashMap::new();
        if let Some(captures) = self.regex.captures(path) {
            for name in &self.param_names {
                if let Some(value) = captures.name(name) {
                    params.insert(name.clone(), value.as_str().to_string());
                }
            }
        }
        params
    }
}

/// A single routing rule, immutable between reloads.
#[derive(Debug, Clone)]
pub struct Route {
    /// Unique route identifier.
    pub id: String,
    /// Compiled path pattern, group prefix included.
    pub pattern: PathPattern,
    /// Target logical service name.
    pub service: String,
    /// Allowed methods, uppercased; empty means all.
    pub methods: Vec<String>,
    /// Whether an authenticated identity is required.
    pub auth_required: bool,
    /// Roles allowed to use this route.
    pub roles: Vec<String>,
    /// Per-route upstream timeout.
    pub timeout: Option<Duration>,
    /// Maximum request body size in bytes.
    pub max_body_size: Option<u64>,
    /// Strip the pattern's literal prefix before forwarding.
    pub strip_prefix: bool,
    /// Replace the path entirely before forwarding.
    pub rewrite_path: Option<String>,
    /// Static headers injected into the outbound request.
    pub headers: HashMap<String, String>,
}

impl Route {
    fn from_config(config: &RouteConfig, prefix: &str) -> Result<Self> {
        let prefix = prefix.trim_end_matches('/');
        let full_pattern = if prefix.is_empty() {
            config.pattern.clone()
        } else {
            // Group patterns are prefix-relative; a pattern that already
            // starts with the group prefix would compile to a doubled,
            // unreachable path.
            if config.pattern == prefix || config.pattern.starts_with(&format!("{}/", prefix)) {
                return Err(GatewayError::InvalidConfig(format!(
                    "route '{}' pattern '{}' repeats its group prefix '{}'",
                    config.id, config.pattern, prefix
                )));
            }
            format!("{}{}", prefix, config.pattern)
        };

        Ok(Self {
            id: config.id.clone(),
            pattern: PathPattern::compile(&full_pattern)?,
            service: config.service.clone(),
            methods: config.methods.iter().map(|m| m.to_uppercase()).collect(),
            auth_required: config.auth_required,
            roles: config.roles.clone(),
            timeout: config.timeout_ms.map(Duration::from_millis),
            max_body_size: config.max_body_size,
            strip_prefix: config.strip_prefix,
            rewrite_path: config.rewrite_path.clone(),
            headers: config.headers.clone(),
        })
    }

    /// Checks the method against the allowed set. An empty set or a
    /// literal `*` entry allows any method.
    pub fn allows_method(&self, method: &http::Method) -> bool {
        if self.methods.is_empty() {
            return true;
        }
        self.methods
            .iter()
            .any(|m| m == "*" || m == method.as_str())
    }

    /// Computes the outbound path after applying the route's rewrite policy.
    pub fn outbound_path(&self, path: &str) -> String {
        if let Some(rewrite) = &self.rewrite_path {
            return rewrite.clone();
        }

        if self.strip_prefix {
            let stripped = path
                .strip_prefix(self.pattern.literal_prefix())
                .unwrap_or(path);
            if stripped.is_empty() {
                return "/".to_string();
            }
            if !stripped.starts_with('/') {
                return format!("/{}", stripped);
            }
            return stripped.to_string();
        }

        path.to_string()
    }
}

/// A named backend service description, used to seed the registry and to
/// annotate outbound requests.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceDescriptor {
    /// Logical service name.
    pub name: String,
    /// Candidate hosts from configuration.
    pub hosts: Vec<String>,
    /// Port shared by all hosts.
    pub port: u16,
    /// Health-check path probed by the sweep.
    pub health_check: String,
    /// Service-level upstream timeout.
    #[serde(skip)]
    pub timeout: Option<Duration>,
    /// Maximum request body size in bytes.
    pub max_body_size: Option<u64>,
    /// Static headers injected into the outbound request.
    pub headers: HashMap<String, String>,
}

impl ServiceDescriptor {
    fn from_config(name: &str, config: &ServiceConfig) -> Self {
        Self {
            name: name.to_string(),
            hosts: config.hosts.clone(),
            port: config.port,
            health_check: config.health_check.clone(),
            timeout: config.timeout_ms.map(Duration::from_millis),
            max_body_size: config.max_body_size,
            headers: config.headers.clone(),
        }
    }
}

/// A path-prefix scope wrapping a set of routes.
#[derive(Debug, Clone)]
pub struct RouteGroup {
    pub name: String,
    pub prefix: String,
    pub middleware: Vec<String>,
    pub routes: Vec<Arc<Route>>,
}

impl RouteGroup {
    fn from_config(config: &RouteGroupConfig) -> Result<Self> {
        let prefix = normalize_path(&config.prefix);
        let routes = config
            .routes
            .iter()
            .map(|r| Route::from_config(r, &prefix).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: config.name.clone(),
            prefix,
            middleware: config.middleware.clone(),
            routes,
        })
    }
}

/// Result of a successful route match, produced fresh per request.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    /// The matched route.
    pub route: Arc<Route>,
    /// The resolved service descriptor.
    pub service: Arc<ServiceDescriptor>,
    /// Extracted path parameters.
    pub params: HashMap<String, String>,
}

/// Summary of a route for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct RouteSummary {
    pub id: String,
    pub pattern: String,
    pub service: String,
    pub methods: Vec<String>,
    pub auth_required: bool,
}

/// An immutable snapshot of routes and service descriptors, built from a
/// routing document and replaced wholesale on reload.
#[derive(Debug)]
pub struct RouteTable {
    groups: Vec<RouteGroup>,
    routes: Vec<Arc<Route>>,
    services: HashMap<String, Arc<ServiceDescriptor>>,
    built_at: SystemTime,
}

impl RouteTable {
    /// Builds a table from a routing document, compiling every pattern and
    /// verifying every route's target service exists.
    pub fn build(document: &GatewayDocument) -> Result<Self> {
        document
            .validate()
            .map_err(|e| GatewayError::InvalidConfig(e.to_string()))?;

        let services: HashMap<String, Arc<ServiceDescriptor>> = document
            .services
            .iter()
            .map(|(name, config)| {
                (
                    name.clone(),
                    Arc::new(ServiceDescriptor::from_config(name, config)),
                )
            })
            .collect();

        let groups = document
            .groups
            .iter()
            .map(RouteGroup::from_config)
            .collect::<Result<Vec<_>>>()?;

        let routes = document
            .routes
            .iter()
            .map(|r| Route::from_config(r, "").map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let table = Self {
            groups,
            routes,
            services,
            built_at: SystemTime::now(),
        };

        for route in table.all_routes() {
            if !table.services.contains_key(&route.service) {
                return Err(GatewayError::InvalidConfig(format!(
                    "route '{}' targets unknown service '{}'",
                    route.id, route.service
                )));
            }
        }

        Ok(table)
    }

    /// Finds the most specific matching route for a method + path.
    ///
    /// Groups are consulted first; a group is considered only when its
    /// prefix is a literal prefix of the path. Ungrouped routes are the
    /// fallback. Declaration order breaks ties.
    pub fn match_route(&self, method: &http::Method, path: &str) -> Option<RouteMatch> {
        let path = normalize_path(path);

        for group in &self.groups {
            if group.prefix != "/" && !path.starts_with(group.prefix.as_str()) {
                continue;
            }
            if let Some(found) = self.match_in(&group.routes, method, &path) {
                return Some(found);
            }
        }

        self.match_in(&self.routes, method, &path)
    }

    fn match_in(
        &self,
        routes: &[Arc<Route>],
        method: &http::Method,
        path: &str,
    ) -> Option<RouteMatch> {
        for route in routes {
            if !route.allows_method(method) || !route.pattern.matches(path) {
                continue;
            }
            let Some(service) = self.services.get(&route.service) else {
                continue;
            };
            debug!(route = %route.id, service = %route.service, "matched route");
            return Some(RouteMatch {
                route: Arc::clone(route),
                service: Arc::clone(service),
                params: route.pattern.extract_params(path),
            });
        }
        None
    }

    fn all_routes(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.groups
            .iter()
            .flat_map(|g| g.routes.iter())
            .chain(self.routes.iter())
    }

    /// Looks up a service descriptor by name.
    pub fn service(&self, name: &str) -> Option<Arc<ServiceDescriptor>> {
        self.services.get(name).cloned()
    }

    /// Returns all service descriptors.
    pub fn services(&self) -> impl Iterator<Item = &Arc<ServiceDescriptor>> {
        self.services.values()
    }

    /// Total number of routes, grouped and ungrouped.
    pub fn route_count(&self) -> usize {
        self.all_routes().count()
    }

    /// Number of configured services.
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// When this table was built.
    pub fn built_at(&self) -> SystemTime {
        self.built_at
    }

    /// Route summaries for the admin surface, in matching order.
    pub fn summaries(&self) -> Vec<RouteSummary> {
        self.all_routes()
            .map(|route| RouteSummary {
                id: route.id.clone(),
                pattern: route.pattern.as_str().to_string(),
                service: route.service.clone(),
                methods: route.methods.clone(),
                auth_required: route.auth_required,
            })
            .collect()
    }
}

/// Shared handle to the current route table.
///
/// Readers clone an `Arc` to the current snapshot; reload builds a new
/// table and swaps the reference, so readers never observe a partially
/// updated table.
#[derive(Debug)]
pub struct SharedRouteTable {
    inner: RwLock<Arc<RouteTable>>,
}

impl SharedRouteTable {
    /// Wraps an initial table.
    pub fn new(table: RouteTable) -> Self {
        Self {
            inner: RwLock::new(Arc::new(table)),
        }
    }

    /// Returns the current snapshot.
    pub fn current(&self) -> Arc<RouteTable> {
        Arc::clone(&self.inner.read())
    }

    /// Replaces the table wholesale.
    pub fn replace(&self, table: RouteTable) {
        *self.inner.write() = Arc::new(table);
    }

    /// When the current table was built; doubles as the last reload time.
    pub fn last_reload(&self) -> SystemTime {
        self.current().built_at()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayDocument;
    use http::Method;

    fn table_from_toml(content: &str) -> RouteTable {
        let doc = GatewayDocument::from_toml(content).unwrap();
        RouteTable::build(&doc).unwrap()
    }

    #[test]
    fn test_pattern_literal() {
        let pattern = PathPattern::compile("/api/users").unwrap();
        assert!(pattern.matches("/api/users"));
        assert!(!pattern.matches("/api/users/42"));
        assert!(!pattern.matches("/api"));
    }

    #[test]
    fn test_pattern_is_anchored() {
        let pattern = PathPattern::compile("/users").unwrap();
        assert!(!pattern.matches("/users/42"));
        assert!(!pattern.matches("/v1/users"));
    }

    #[test]
    fn test_pattern_params() {
        let pattern = PathPattern::compile("/orders/:id/items/:item_id").unwrap();
        assert!(pattern.matches("/orders/77/items/3"));
        assert!(!pattern.matches("/orders/77/items"));
        assert!(!pattern.matches("/orders/a/b/items/3"));

        let params = pattern.extract_params("/orders/77/items/3");
        assert_eq!(params["id"], "77");
        assert_eq!(params["item_id"], "3");
    }

    #[test]
    fn test_pattern_trailing_wildcard_spans_slashes() {
        let pattern = PathPattern::compile("/files*").unwrap();
        assert!(pattern.matches("/files"));
        assert!(pattern.matches("/files/a"));
        assert!(pattern.matches("/files/a/b/c"));
        assert!(!pattern.matches("/file"));
    }

    #[test]
    fn test_pattern_literal_prefix() {
        let pattern = PathPattern::compile("/api/v1/users*").unwrap();
        assert_eq!(pattern.literal_prefix(), "/api/v1/users");

        let pattern = PathPattern::compile("/orders/:id").unwrap();
        assert_eq!(pattern.literal_prefix(), "/orders");
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/users/"), "/users");
        assert_eq!(normalize_path("/users///"), "/users");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
    }

    const SIMPLE_DOC: &str = r#"
        [[routes]]
        id = "orders"
        pattern = "/orders/:id"
        service = "order-svc"
        methods = ["GET"]

        [services.order-svc]
        hosts = ["10.0.0.1"]
        port = 9000
    "#;

    #[test]
    fn test_match_basic() {
        let table = table_from_toml(SIMPLE_DOC);

        let found = table.match_route(&Method::GET, "/orders/77").unwrap();
        assert_eq!(found.route.id, "orders");
        assert_eq!(found.service.name, "order-svc");
        assert_eq!(found.params["id"], "77");
    }

    #[test]
    fn test_match_method_filter() {
        let table = table_from_toml(SIMPLE_DOC);
        assert!(table.match_route(&Method::POST, "/orders/77").is_none());
    }

    #[test]
    fn test_match_trailing_slash_normalized() {
        let table = table_from_toml(SIMPLE_DOC);
        assert!(table.match_route(&Method::GET, "/orders/77/").is_some());
    }

    #[test]
    fn test_match_not_found() {
        let table = table_from_toml(SIMPLE_DOC);
        assert!(table.match_route(&Method::GET, "/unknown").is_none());
    }

    #[test]
    fn test_method_case_insensitive_and_wildcard() {
        let doc = r#"
            [[routes]]
            id = "lower"
            pattern = "/a"
            service = "svc"
            methods = ["get", "post"]

            [[routes]]
            id = "star"
            pattern = "/b"
            service = "svc"
            methods = ["*"]

            [[routes]]
            id = "empty"
            pattern = "/c"
            service = "svc"

            [services.svc]
            hosts = ["10.0.0.1"]
            port = 9000
        "#;
        let table = table_from_toml(doc);

        assert!(table.match_route(&Method::GET, "/a").is_some());
        assert!(table.match_route(&Method::POST, "/a").is_some());
        assert!(table.match_route(&Method::DELETE, "/a").is_none());
        assert!(table.match_route(&Method::PATCH, "/b").is_some());
        assert!(table.match_route(&Method::DELETE, "/c").is_some());
    }

    #[test]
    fn test_declaration_order_breaks_ties() {
        let doc = r#"
            [[routes]]
            id = "first"
            pattern = "/things/:name"
            service = "svc"

            [[routes]]
            id = "second"
            pattern = "/things/special"
            service = "svc"

            [services.svc]
            hosts = ["10.0.0.1"]
            port = 9000
        "#;
        let table = table_from_toml(doc);

        let found = table.match_route(&Method::GET, "/things/special").unwrap();
        assert_eq!(found.route.id, "first");
    }

    #[test]
    fn test_group_prefix_prepended() {
        let doc = r#"
            [[groups]]
            name = "api"
            prefix = "/api/v1"

            [[groups.routes]]
            id = "users"
            pattern = "/users/:id"
            service = "user-svc"

            [services.user-svc]
            hosts = ["10.0.0.1"]
            port = 9000
        "#;
        let table = table_from_toml(doc);

        assert!(table.match_route(&Method::GET, "/api/v1/users/42").is_some());
        assert!(table.match_route(&Method::GET, "/users/42").is_none());
    }

    #[test]
    fn test_group_routes_win_over_global() {
        let doc = r#"
            [[groups]]
            name = "api"
            prefix = "/api"

            [[groups.routes]]
            id = "grouped"
            pattern = "/ping"
            service = "svc"

            [[routes]]
            id = "global"
            pattern = "/api/ping"
            service = "svc"

            [services.svc]
            hosts = ["10.0.0.1"]
            port = 9000
        "#;
        let table = table_from_toml(doc);

        let found = table.match_route(&Method::GET, "/api/ping").unwrap();
        assert_eq!(found.route.id, "grouped");
    }

    #[test]
    fn test_group_route_repeating_prefix_rejected() {
        let doc = GatewayDocument::from_toml(
            r#"
            [[groups]]
            name = "api"
            prefix = "/api/v1"

            [[groups.routes]]
            id = "doubled"
            pattern = "/api/v1/users/:id"
            service = "user-svc"

            [services.user-svc]
            hosts = ["10.0.0.1"]
            port = 9000
        "#,
        )
        .unwrap();

        assert!(matches!(
            RouteTable::build(&doc).unwrap_err(),
            GatewayError::InvalidConfig(_)
        ));
    }

    #[test]
    fn test_bundled_config_routes_are_reachable() {
        let doc = GatewayDocument::from_toml(include_str!("../configs/gateway.toml")).unwrap();
        let table = RouteTable::build(&doc).unwrap();

        assert!(table.match_route(&Method::GET, "/api/v1/users/42").is_some());
        let found = table
            .match_route(&Method::POST, "/api/v1/users/42/profile")
            .unwrap();
        assert_eq!(found.route.outbound_path("/api/v1/users/42/profile"), "/42/profile");
        assert!(table.match_route(&Method::GET, "/orders/77").is_some());
    }

    #[test]
    fn test_unknown_service_rejected_at_build() {
        let doc = GatewayDocument::from_toml(
            r#"
            [[routes]]
            id = "orphan"
            pattern = "/x"
            service = "missing"
        "#,
        )
        .unwrap();

        assert!(matches!(
            RouteTable::build(&doc).unwrap_err(),
            GatewayError::InvalidConfig(_)
        ));
    }

    #[test]
    fn test_outbound_path_strip_prefix() {
        let doc = r#"
            [[routes]]
            id = "users"
            pattern = "/api/v1/users*"
            service = "svc"
            strip_prefix = true

            [services.svc]
            hosts = ["10.0.0.1"]
            port = 9000
        "#;
        let table = table_from_toml(doc);

        let found = table
            .match_route(&Method::GET, "/api/v1/users/42/profile")
            .unwrap();
        assert_eq!(found.route.outbound_path("/api/v1/users/42/profile"), "/42/profile");
        assert_eq!(found.route.outbound_path("/api/v1/users"), "/");
    }

    #[test]
    fn test_outbound_path_rewrite() {
        let doc = r#"
            [[routes]]
            id = "legacy"
            pattern = "/legacy/ping"
            service = "svc"
            rewrite_path = "/ping"

            [services.svc]
            hosts = ["10.0.0.1"]
            port = 9000
        "#;
        let table = table_from_toml(doc);

        let found = table.match_route(&Method::GET, "/legacy/ping").unwrap();
        assert_eq!(found.route.outbound_path("/legacy/ping"), "/ping");
    }

    #[test]
    fn test_outbound_path_no_policy() {
        let table = table_from_toml(SIMPLE_DOC);
        let found = table.match_route(&Method::GET, "/orders/77").unwrap();
        assert_eq!(found.route.outbound_path("/orders/77"), "/orders/77");
    }

    #[test]
    fn test_shared_table_swap() {
        let table = table_from_toml(SIMPLE_DOC);
        let shared = SharedRouteTable::new(table);
        assert_eq!(shared.current().route_count(), 1);

        let replacement = table_from_toml(
            r#"
            [[routes]]
            id = "a"
            pattern = "/a"
            service = "svc"

            [[routes]]
            id = "b"
            pattern = "/b"
            service = "svc"

            [services.svc]
            hosts = ["10.0.0.1"]
            port = 9000
        "#,
        );
        shared.replace(replacement);
        assert_eq!(shared.current().route_count(), 2);
        assert!(shared
            .current()
            .match_route(&Method::GET, "/orders/77")
            .is_none());
    }

    #[test]
    fn test_summaries() {
        let table = table_from_toml(SIMPLE_DOC);
        let summaries = table.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, "orders");
        assert_eq!(summaries[0].pattern, "/orders/:id");
    }
}
