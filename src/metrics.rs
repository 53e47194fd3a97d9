//! Prometheus metrics collection and export.

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::io;
use std::sync::{Arc, Mutex};

/// Labels for proxied request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// HTTP method (GET, POST, etc.)
    pub method: String,
    /// HTTP status code (200, 404, etc.)
    pub status: String,
    /// Target logical service, or "none" when no route matched.
    pub service: String,
}

/// Labels for rate limit rejection metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RejectionLabels {
    /// Rate limit scope (global, ip, user, api).
    pub scope: String,
}

/// Global metrics registry.
///
/// Initialized once at startup and shared across all tasks.
static METRICS: Lazy<Arc<Mutex<Metrics>>> = Lazy::new(|| Arc::new(Mutex::new(Metrics::new())));

/// Metrics collector for the gateway.
///
/// Request latency is exposed as a true histogram rather than any running
/// average, so percentile queries are left to the metrics backend.
pub struct Metrics {
    registry: Registry,
    requests_total: Family<RequestLabels, Counter>,
    request_duration_seconds: Family<RequestLabels, Histogram>,
    rate_limited_total: Family<RejectionLabels, Counter>,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "gateway_requests_total",
            "Total number of dispatched requests",
            requests_total.clone(),
        );

        let request_duration_seconds =
            Family::<RequestLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 10))
            });
        registry.register(
            "gateway_request_duration_seconds",
            "Dispatch latency in seconds",
            request_duration_seconds.clone(),
        );

        let rate_limited_total = Family::<RejectionLabels, Counter>::default();
        registry.register(
            "gateway_rate_limited_total",
            "Requests rejected by the rate limiter",
            rate_limited_total.clone(),
        );

        Self {
            registry,
            requests_total,
            request_duration_seconds,
            rate_limited_total,
        }
    }

    /// Records a dispatched request.
    pub fn record_request(method: &str, status: u16, service: &str, duration_secs: f64) {
        let labels = RequestLabels {
            method: method.to_string(),
            status: status.to_string(),
            service: service.to_string(),
        };

        if let Ok(metrics) = METRICS.lock() {
            metrics.requests_total.get_or_create(&labels).inc();
            metrics
                .request_duration_seconds
                .get_or_create(&labels)
                .observe(duration_secs);
        }
    }

    /// Records a rate limit rejection for a scope.
    pub fn record_rate_limited(scope: &str) {
        let labels = RejectionLabels {
            scope: scope.to_string(),
        };
        if let Ok(metrics) = METRICS.lock() {
            metrics.rate_limited_total.get_or_create(&labels).inc();
        }
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the mutex is poisoned.
    pub fn encode() -> Result<String, io::Error> {
        let metrics = METRICS
            .lock()
            .map_err(|e| io::Error::other(format!("mutex poisoned: {}", e)))?;

        let mut buffer = String::new();
        encode(&mut buffer, &metrics.registry)
            .map_err(|e| io::Error::other(format!("encoding error: {}", e)))?;

        Ok(buffer)
    }
}
