//! Proxy forwarding: resolve a matched route to a live instance, build the
//! outbound request, execute it, and relay the response.
//!
//! Per request the stages run strictly in sequence: rate-limit admission,
//! route match, instance discovery, forward. Callers always receive a
//! structured JSON error body on failure, never a raw connection reset.

use crate::error::{GatewayError, Result};
use crate::identity::RequestIdentity;
use crate::metrics::Metrics;
use crate::ratelimit::{AdmissionContext, GatewayRateLimiter, RateLimitRejection};
use crate::registry::ServiceRegistry;
use crate::route::{normalize_path, Route, ServiceDescriptor, SharedRouteTable};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::time::timeout;
use tower::Service;
use tracing::{debug, instrument, warn};

/// Shared maintenance-mode flag.
///
/// Explicitly injected into both the administrative toggler and the
/// forwarder rather than living in a global.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceFlag {
    inner: Arc<AtomicBool>,
}

impl MaintenanceFlag {
    /// Creates a flag in the disabled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether maintenance mode is enabled.
    pub fn enabled(&self) -> bool {
        self.inner.load(Ordering::Relaxed)
    }

    /// Sets the flag.
    pub fn set(&self, enabled: bool) {
        self.inner.store(enabled, Ordering::Relaxed);
    }

    /// Flips the flag and returns the new state.
    pub fn toggle(&self) -> bool {
        !self.inner.fetch_xor(true, Ordering::Relaxed)
    }
}

/// Proxy statistics for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStats {
    pub total_routes: usize,
    pub total_services: usize,
    /// Unix timestamp of the last route table reload.
    pub last_reload: u64,
    pub maintenance_mode: bool,
}

/// Forwards admitted requests to healthy backend instances.
pub struct ProxyForwarder {
    table: Arc<SharedRouteTable>,
    registry: Arc<ServiceRegistry>,
    client: Client<HttpConnector, Incoming>,
    maintenance: MaintenanceFlag,
    default_timeout: Duration,
}

impl ProxyForwarder {
    /// Creates a forwarder over the given route table and registry.
    pub fn new(
        table: Arc<SharedRouteTable>,
        registry: Arc<ServiceRegistry>,
        maintenance: MaintenanceFlag,
        default_timeout: Duration,
    ) -> Self {
        Self {
            table,
            registry,
            client: Client::builder(TokioExecutor::new()).build_http(),
            maintenance,
            default_timeout,
        }
    }

    /// Dispatches one request end to end.
    ///
    /// Maintenance mode short-circuits before route matching. The deadline
    /// is the caller's timeout if given, else the route's, else the
    /// service's, else the gateway default. Cancellation of the returned
    /// future aborts the upstream call.
    #[instrument(level = "debug", skip(self, req, identity), fields(method = %req.method(), path = %req.uri().path()))]
    pub async fn forward(
        &self,
        mut req: Request<Incoming>,
        identity: Option<&RequestIdentity>,
        client_addr: Option<IpAddr>,
        caller_timeout: Option<Duration>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>> {
        if self.maintenance.enabled() {
            return Err(GatewayError::MaintenanceMode);
        }

        let started = Instant::now();
        let method = req.method().clone();
        let path = normalize_path(req.uri().path());

        let table = self.table.current();
        let found = table
            .match_route(&method, &path)
            .ok_or_else(|| GatewayError::RouteNotFound {
                method: method.to_string(),
                path: path.clone(),
            })?;
        let route = &found.route;
        let service = &found.service;

        enforce_body_limit(req.headers(), route, service)?;

        let instances = self
            .registry
            .discover(&route.service)
            .map_err(|_| GatewayError::ServiceUnavailable {
                service: route.service.clone(),
            })?;
        // Selection is "first of the healthy list"; smarter balancing is
        // an extension point.
        let instance = instances
            .first()
            .ok_or_else(|| GatewayError::ServiceUnavailable {
                service: route.service.clone(),
            })?;

        let outbound_path = route.outbound_path(&path);
        let target = build_target_uri(
            &instance.address,
            instance.port,
            &outbound_path,
            req.uri().query(),
        )?;
        let target_display = target.to_string();

        let inbound_host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        *req.uri_mut() = target;

        let headers = req.headers_mut();
        apply_static_headers(headers, route, service);
        apply_forwarding_headers(headers, inbound_host.as_deref(), client_addr);
        if let Some(identity) = identity {
            identity.apply(headers);
        }

        let deadline = resolve_timeout(caller_timeout, route, service, self.default_timeout);

        match timeout(deadline, self.client.request(req)).await {
            Ok(Ok(response)) => {
                let status = response.status();
                let duration = started.elapsed();
                debug!(
                    target = %target_display,
                    status = status.as_u16(),
                    duration_ms = duration.as_millis() as u64,
                    "forwarded request"
                );
                Metrics::record_request(
                    method.as_str(),
                    status.as_u16(),
                    &route.service,
                    duration.as_secs_f64(),
                );

                let (mut parts, body) = response.into_parts();
                apply_response_headers(&mut parts.headers);
                Ok(Response::from_parts(parts, body.boxed()))
            }
            Ok(Err(e)) => {
                warn!(
                    target = %target_display,
                    duration_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "upstream request failed"
                );
                Err(GatewayError::UpstreamTransport {
                    target: target_display,
                    source: e,
                })
            }
            Err(_) => {
                warn!(
                    target = %target_display,
                    timeout_ms = deadline.as_millis() as u64,
                    "upstream request timed out"
                );
                Err(GatewayError::Timeout {
                    duration_ms: deadline.as_millis() as u64,
                })
            }
        }
    }

    /// Returns forwarding statistics.
    pub fn stats(&self) -> ProxyStats {
        let table = self.table.current();
        ProxyStats {
            total_routes: table.route_count(),
            total_services: table.service_count(),
            last_reload: table
                .built_at()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            maintenance_mode: self.maintenance.enabled(),
        }
    }

    /// The shared maintenance flag.
    pub fn maintenance(&self) -> &MaintenanceFlag {
        &self.maintenance
    }
}

/// Rejects requests whose declared body size exceeds the route or service
/// limit; the route-level limit wins when both are set.
fn enforce_body_limit(
    headers: &HeaderMap,
    route: &Route,
    service: &ServiceDescriptor,
) -> Result<()> {
    let limit = route.max_body_size.or(service.max_body_size);
    let (Some(limit), Some(length)) = (
        limit,
        headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok()),
    ) else {
        return Ok(());
    };

    if length > limit {
        return Err(GatewayError::BodyTooLarge { limit });
    }
    Ok(())
}

fn build_target_uri(address: &str, port: u16, path: &str, query: Option<&str>) -> Result<Uri> {
    let uri = match query {
        Some(query) => format!("http://{}:{}{}?{}", address, port, path, query),
        None => format!("http://{}:{}{}", address, port, path),
    };
    uri.parse()
        .map_err(|e| GatewayError::UpstreamUri(format!("{}: {}", uri, e)))
}

/// Layers static headers: route-level first, then service-level; later
/// layers win on conflict.
fn apply_static_headers(headers: &mut HeaderMap, route: &Route, service: &ServiceDescriptor) {
    for (key, value) in route.headers.iter().chain(service.headers.iter()) {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            warn!(header = %key, "skipping unrepresentable static header");
            continue;
        };
        headers.insert(name, value);
    }
}

fn apply_forwarding_headers(
    headers: &mut HeaderMap,
    inbound_host: Option<&str>,
    client_addr: Option<IpAddr>,
) {
    if let Some(host) = inbound_host {
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert("x-forwarded-host", value);
        }
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));

    if let Some(ip) = client_addr {
        let value = match headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) => format!("{}, {}", existing, ip),
            None => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert("x-forwarded-for", value);
        }
    }
}

/// Stamps response metadata identifying the gateway.
fn apply_response_headers(headers: &mut HeaderMap) {
    headers.insert("x-proxy-by", HeaderValue::from_static("rust-api-gateway"));
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    if let Ok(value) = HeaderValue::from_str(&now.to_string()) {
        headers.insert("x-proxy-time", value);
    }
}

/// Deadline precedence: caller, then route, then service, then default.
fn resolve_timeout(
    caller: Option<Duration>,
    route: &Route,
    service: &ServiceDescriptor,
    default: Duration,
) -> Duration {
    caller
        .or(route.timeout)
        .or(service.timeout)
        .unwrap_or(default)
}

/// Builds a JSON error body in the gateway's failure envelope.
fn json_body(value: serde_json::Value) -> BoxBody<Bytes, hyper::Error> {
    Full::new(Bytes::from(value.to_string()))
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(
    status: StatusCode,
    value: serde_json::Value,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(json_body(value))
        .unwrap_or_else(|_| Response::new(json_body(serde_json::json!({"status": "error"}))))
}

fn error_response(err: &GatewayError) -> Response<BoxBody<Bytes, hyper::Error>> {
    json_response(
        err.status(),
        serde_json::json!({
            "status": "error",
            "message": err.to_string(),
        }),
    )
}

fn rate_limited_response(
    rejection: &RateLimitRejection,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let err = GatewayError::RateLimitExceeded {
        scope: rejection.scope.to_string(),
        path: rejection.path.clone(),
    };
    let mut response = json_response(
        err.status(),
        serde_json::json!({
            "status": "error",
            "message": err.to_string(),
            "path": rejection.path,
        }),
    );

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&rejection.limit.to_string()) {
        headers.insert("x-ratelimit-limit", value);
    }
    let reset = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        + rejection.retry_after_secs();
    if let Ok(value) = HeaderValue::from_str(&reset.to_string()) {
        headers.insert("x-ratelimit-reset", value);
    }
    if let Ok(value) = HeaderValue::from_str(&rejection.retry_after_secs().to_string()) {
        headers.insert(http::header::RETRY_AFTER, value);
    }
    response
}

/// Per-request dispatch pipeline as a Tower service: rate-limit admission,
/// then forwarding. Cloned per connection with the peer address attached.
#[derive(Clone)]
pub struct GatewayService {
    forwarder: Arc<ProxyForwarder>,
    limiter: Arc<GatewayRateLimiter>,
    client_addr: Option<IpAddr>,
}

impl GatewayService {
    /// Creates the dispatch pipeline.
    pub fn new(forwarder: Arc<ProxyForwarder>, limiter: Arc<GatewayRateLimiter>) -> Self {
        Self {
            forwarder,
            limiter,
            client_addr: None,
        }
    }

    /// Returns a copy bound to a connection's peer address.
    pub fn for_peer(&self, peer: SocketAddr) -> Self {
        Self {
            client_addr: Some(peer.ip()),
            ..self.clone()
        }
    }

    async fn handle(self, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let started = Instant::now();

        let identity = RequestIdentity::from_headers(req.headers());

        let admission = self.limiter.check(&AdmissionContext {
            client_ip: self.client_addr,
            user_id: identity.as_ref().map(|i| i.user_id.as_str()),
            method: method.as_str(),
            path: &path,
        });
        if let Err(rejection) = admission {
            Metrics::record_rate_limited(&rejection.scope.to_string());
            Metrics::record_request(
                method.as_str(),
                StatusCode::TOO_MANY_REQUESTS.as_u16(),
                "none",
                started.elapsed().as_secs_f64(),
            );
            return rate_limited_response(&rejection);
        }

        match self
            .forwarder
            .forward(req, identity.as_ref(), self.client_addr, None)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(method = %method, path = %path, error = %e, "dispatch failed");
                Metrics::record_request(
                    method.as_str(),
                    e.status().as_u16(),
                    "none",
                    started.elapsed().as_secs_f64(),
                );
                error_response(&e)
            }
        }
    }
}

impl Service<Request<Incoming>> for GatewayService {
    type Response = Response<BoxBody<Bytes, hyper::Error>>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.handle(req).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayDocument;
    use crate::ratelimit::LimitScope;
    use crate::registry::HttpHealthProbe;
    use crate::route::RouteTable;
    use std::collections::HashMap;

    fn sample_route(timeout: Option<Duration>, max_body_size: Option<u64>) -> (Route, ServiceDescriptor) {
        let doc = GatewayDocument::from_toml(
            r#"
            [[routes]]
            id = "r"
            pattern = "/x"
            service = "svc"

            [services.svc]
            hosts = ["10.0.0.1"]
            port = 9000
        "#,
        )
        .unwrap();
        let table = RouteTable::build(&doc).unwrap();
        let found = table.match_route(&http::Method::GET, "/x").unwrap();
        let mut route = (*found.route).clone();
        route.timeout = timeout;
        route.max_body_size = max_body_size;
        (route, (*found.service).clone())
    }

    #[test]
    fn test_maintenance_flag() {
        let flag = MaintenanceFlag::new();
        assert!(!flag.enabled());
        assert!(flag.toggle());
        assert!(flag.enabled());
        flag.set(false);
        assert!(!flag.enabled());
    }

    #[test]
    fn test_resolve_timeout_precedence() {
        let (mut route, mut service) = sample_route(None, None);
        let default = Duration::from_secs(30);

        assert_eq!(resolve_timeout(None, &route, &service, default), default);

        service.timeout = Some(Duration::from_secs(20));
        assert_eq!(
            resolve_timeout(None, &route, &service, default),
            Duration::from_secs(20)
        );

        route.timeout = Some(Duration::from_secs(10));
        assert_eq!(
            resolve_timeout(None, &route, &service, default),
            Duration::from_secs(10)
        );

        assert_eq!(
            resolve_timeout(Some(Duration::from_secs(5)), &route, &service, default),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_static_header_layering_service_wins() {
        let (mut route, mut service) = sample_route(None, None);
        route.headers = HashMap::from([
            ("x-tier".to_string(), "route".to_string()),
            ("x-route-only".to_string(), "yes".to_string()),
        ]);
        service.headers = HashMap::from([("x-tier".to_string(), "service".to_string())]);

        let mut headers = HeaderMap::new();
        apply_static_headers(&mut headers, &route, &service);

        assert_eq!(headers.get("x-tier").unwrap(), "service");
        assert_eq!(headers.get("x-route-only").unwrap(), "yes");
    }

    #[test]
    fn test_forwarding_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));

        apply_forwarding_headers(
            &mut headers,
            Some("gateway.example"),
            Some("5.6.7.8".parse().unwrap()),
        );

        assert_eq!(headers.get("x-forwarded-host").unwrap(), "gateway.example");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "1.2.3.4, 5.6.7.8");
    }

    #[test]
    fn test_body_limit() {
        let (route, service) = sample_route(None, Some(10));

        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from_static("5"));
        assert!(enforce_body_limit(&headers, &route, &service).is_ok());

        headers.insert(
            http::header::CONTENT_LENGTH,
            HeaderValue::from_static("11"),
        );
        assert!(matches!(
            enforce_body_limit(&headers, &route, &service).unwrap_err(),
            GatewayError::BodyTooLarge { limit: 10 }
        ));

        // No declared length: nothing to enforce.
        let empty = HeaderMap::new();
        assert!(enforce_body_limit(&empty, &route, &service).is_ok());
    }

    #[test]
    fn test_build_target_uri() {
        let uri = build_target_uri("10.0.0.1", 9000, "/orders/77", None).unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.1:9000/orders/77");

        let uri = build_target_uri("10.0.0.1", 9000, "/orders", Some("page=2")).unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.1:9000/orders?page=2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rate_limited_response_shape() {
        let rejection = RateLimitRejection {
            scope: LimitScope::PerIp,
            limit: 10,
            window: Duration::from_secs(60),
            path: "/orders".to_string(),
        };
        let response = rate_limited_response(&rejection);

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "10");
        assert_eq!(response.headers().get("retry-after").unwrap(), "60");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "error");
        assert_eq!(parsed["path"], "/orders");
        assert_eq!(parsed["message"], "ip rate limit exceeded for /orders");
    }

    #[test]
    fn test_error_response_status() {
        let response = error_response(&GatewayError::MaintenanceMode);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(http::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stats_reflect_table() {
        let doc = GatewayDocument::from_toml(
            r#"
            [[routes]]
            id = "r"
            pattern = "/x"
            service = "svc"

            [services.svc]
            hosts = ["10.0.0.1"]
            port = 9000
        "#,
        )
        .unwrap();
        let table = Arc::new(SharedRouteTable::new(RouteTable::build(&doc).unwrap()));
        let registry = Arc::new(ServiceRegistry::new(Arc::new(HttpHealthProbe::new(
            Duration::from_secs(5),
        ))));
        let forwarder = ProxyForwarder::new(
            table,
            registry,
            MaintenanceFlag::new(),
            Duration::from_secs(30),
        );

        let stats = forwarder.stats();
        assert_eq!(stats.total_routes, 1);
        assert_eq!(stats.total_services, 1);
        assert!(!stats.maintenance_mode);
        assert!(stats.last_reload > 0);
    }
}
