//! Admin endpoints for health, metrics, and operational control.

use crate::error::GatewayError;
use crate::metrics::Metrics;
use crate::proxy::{MaintenanceFlag, ProxyForwarder};
use crate::ratelimit::GatewayRateLimiter;
use crate::registry::{ServiceInstance, ServiceRegistry};
use crate::route::SharedRouteTable;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{debug, info, warn};

/// Admin service for the operational surface.
///
/// Serves:
/// - `GET /health` - liveness check
/// - `GET /metrics` - Prometheus metrics in text format
/// - `GET /admin/routes` - current route table summary
/// - `GET /admin/proxy/stats` - forwarding statistics
/// - `GET /admin/ratelimit` - rate limiter statistics
/// - `POST /admin/ratelimit/reset?key=K` - clear one rate limit key
/// - `GET /admin/maintenance` - maintenance mode state
/// - `POST /admin/maintenance` - toggle maintenance mode
/// - `POST /admin/services/register` - register an instance (JSON body)
/// - `DELETE /admin/services/{id}` - deregister an instance
/// - `GET /admin/services/{name}` - healthy instances of a service
#[derive(Clone)]
pub struct AdminService {
    forwarder: Arc<ProxyForwarder>,
    registry: Arc<ServiceRegistry>,
    limiter: Arc<GatewayRateLimiter>,
    table: Arc<SharedRouteTable>,
    maintenance: MaintenanceFlag,
}

impl AdminService {
    /// Creates a new admin service over the shared gateway state.
    pub fn new(
        forwarder: Arc<ProxyForwarder>,
        registry: Arc<ServiceRegistry>,
        limiter: Arc<GatewayRateLimiter>,
        table: Arc<SharedRouteTable>,
        maintenance: MaintenanceFlag,
    ) -> Self {
        Self {
            forwarder,
            registry,
            limiter,
            table,
            maintenance,
        }
    }

    async fn handle_request(
        self,
        req: Request<Incoming>,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match (&method, path.as_str()) {
            (&Method::GET, "/health") => {
                debug!("health check requested");
                json_ok(&serde_json::json!({"status": "ok"}))
            }
            (&Method::GET, "/metrics") => match Metrics::encode() {
                Ok(metrics) => metrics_response(metrics),
                Err(e) => {
                    warn!("failed to encode metrics: {}", e);
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics")
                }
            },
            (&Method::GET, "/admin/routes") => json_ok(&self.table.current().summaries()),
            (&Method::GET, "/admin/proxy/stats") => json_ok(&self.forwarder.stats()),
            (&Method::GET, "/admin/ratelimit") => json_ok(&self.limiter.stats()),
            (&Method::POST, "/admin/ratelimit/reset") => {
                match query_param(req.uri().query(), "key") {
                    Some(key) => {
                        self.limiter.reset(&key);
                        info!(key = %key, "rate limit key reset");
                        json_ok(&serde_json::json!({"status": "ok", "key": key}))
                    }
                    None => error_response(StatusCode::BAD_REQUEST, "missing key parameter"),
                }
            }
            (&Method::GET, "/admin/maintenance") => {
                json_ok(&serde_json::json!({"enabled": self.maintenance.enabled()}))
            }
            (&Method::POST, "/admin/maintenance") => {
                let enabled = self.maintenance.toggle();
                info!(enabled, "maintenance mode toggled");
                json_ok(&serde_json::json!({"enabled": enabled}))
            }
            (&Method::POST, "/admin/services/register") => self.register_instance(req).await,
            (&Method::DELETE, _) => match strip_segment(&path, "/admin/services/") {
                Some(id) => match self.registry.deregister(id) {
                    Ok(()) => json_ok(&serde_json::json!({"status": "ok", "id": id})),
                    Err(e) => gateway_error_response(&e),
                },
                None => error_response(StatusCode::NOT_FOUND, "not found"),
            },
            (&Method::GET, _) => match strip_segment(&path, "/admin/services/") {
                Some(name) => match self.registry.discover(name) {
                    Ok(instances) => json_ok(&instances),
                    Err(e) => gateway_error_response(&e),
                },
                None => error_response(StatusCode::NOT_FOUND, "not found"),
            },
            _ => error_response(StatusCode::NOT_FOUND, "not found"),
        }
    }

    /// Registers an instance from a JSON request body.
    async fn register_instance(
        self,
        req: Request<Incoming>,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!("failed to read registration body: {}", e);
                return error_response(StatusCode::BAD_REQUEST, "unreadable body");
            }
        };

        let instance: ServiceInstance = match serde_json::from_slice(&body) {
            Ok(instance) => instance,
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("invalid instance: {}", e),
                );
            }
        };

        let id = instance.id.clone();
        match self.registry.register(instance) {
            Ok(()) => {
                let body = serde_json::json!({"status": "ok", "id": id});
                json_response(StatusCode::CREATED, &body)
            }
            Err(e) => gateway_error_response(&e),
        }
    }
}

/// Extracts one query parameter by name.
fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

/// Strips a literal path prefix, returning the non-empty remainder.
fn strip_segment<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    path.strip_prefix(prefix).filter(|rest| !rest.is_empty())
}

fn body_of(content: String) -> BoxBody<Bytes, hyper::Error> {
    Full::new(Bytes::from(content))
        .map_err(|never| match never {})
        .boxed()
}

fn json_response<T: Serialize>(
    status: StatusCode,
    value: &T,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = match serde_json::to_string(value) {
        Ok(body) => body,
        Err(e) => {
            warn!("failed to serialize admin response: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed");
        }
    };

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(body_of(body))
        .unwrap_or_else(|_| Response::new(body_of(String::new())))
}

fn json_ok<T: Serialize>(value: &T) -> Response<BoxBody<Bytes, hyper::Error>> {
    json_response(StatusCode::OK, value)
}

fn metrics_response(metrics: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body_of(metrics))
        .unwrap_or_else(|_| Response::new(body_of(String::new())))
}

fn error_response(status: StatusCode, message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = serde_json::json!({"status": "error", "message": message}).to_string();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(body_of(body))
        .unwrap_or_else(|_| Response::new(body_of(String::new())))
}

fn gateway_error_response(e: &GatewayError) -> Response<BoxBody<Bytes, hyper::Error>> {
    error_response(e.status(), &e.to_string())
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<BoxBody<Bytes, hyper::Error>>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.handle_request(req).await) })
    }
}
