//! In-memory service registry with health sweeping and watch streams.
//!
//! Instances are keyed first by service name, then by instance id. Being
//! registered and being healthy are separate facts: configuration can
//! pre-declare every instance at boot while traffic is routed only to
//! instances that pass a live probe. A probe failure degrades status
//! rather than removing the instance, so transient blips do not destroy
//! registration history.

use crate::error::{GatewayError, Result};
use crate::route::ServiceDescriptor;
use async_trait::async_trait;
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Health status of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// One concrete, reachable deployment of a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Instance identifier, derived from service name + host for
    /// config-seeded instances.
    pub id: String,
    /// Logical service name.
    pub name: String,
    /// Network address.
    pub address: String,
    /// Port.
    pub port: u16,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form metadata.
    #[serde(default)]
    pub meta: HashMap<String, String>,
    /// Current health status.
    #[serde(default = "default_health")]
    pub health: HealthStatus,
    /// Last successful contact.
    #[serde(default = "SystemTime::now")]
    pub last_seen: SystemTime,
}

fn default_health() -> HealthStatus {
    HealthStatus::Healthy
}

impl ServiceInstance {
    /// Builds a config-seeded instance for one host of a service.
    pub fn from_host(service: &str, host: &str, port: u16) -> Self {
        Self {
            id: format!("{}-{}", service, host),
            name: service.to_string(),
            address: host.to_string(),
            port,
            tags: Vec::new(),
            meta: HashMap::new(),
            health: HealthStatus::Healthy,
            last_seen: SystemTime::now(),
        }
    }
}

/// Probes one instance's health endpoint. The sweep owns scheduling; the
/// probe owns a single check bounded by its own deadline.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Returns whether the endpoint answered successfully in time.
    async fn probe(&self, url: &str) -> bool;
}

/// HTTP GET health probe with an independent per-probe timeout, so a hung
/// backend cannot stall the sweep loop.
pub struct HttpHealthProbe {
    client: Client<HttpConnector, Empty<Bytes>>,
    probe_timeout: Duration,
}

impl HttpHealthProbe {
    /// Creates a probe with the given per-check deadline.
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            probe_timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, url: &str) -> bool {
        let uri: http::Uri = match url.parse() {
            Ok(uri) => uri,
            Err(e) => {
                warn!(url = %url, error = %e, "unparseable health url");
                return false;
            }
        };

        let request = match http::Request::builder()
            .method(http::Method::GET)
            .uri(uri)
            .body(Empty::<Bytes>::new())
        {
            Ok(request) => request,
            Err(_) => return false,
        };

        match timeout(self.probe_timeout, self.client.request(request)).await {
            Ok(Ok(response)) => response.status().is_success(),
            Ok(Err(e)) => {
                debug!(url = %url, error = %e, "health probe failed");
                false
            }
            // Abandoned: a stuck probe marks the instance unhealthy.
            Err(_) => false,
        }
    }
}

/// In-memory directory of named services to their live instances.
///
/// The instance map takes a read lock for discovery and an exclusive lock
/// for mutation; watch delivery happens outside the lock so a slow
/// subscriber never blocks registry mutation.
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, HashMap<String, ServiceInstance>>>,
    watchers: RwLock<HashMap<String, watch::Sender<Vec<ServiceInstance>>>>,
    health_paths: RwLock<HashMap<String, String>>,
    probe: Arc<dyn HealthProbe>,
}

impl ServiceRegistry {
    /// Creates an empty registry with the given health probe.
    pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            watchers: RwLock::new(HashMap::new()),
            health_paths: RwLock::new(HashMap::new()),
            probe,
        }
    }

    /// Seeds the registry from service descriptors: one instance per host,
    /// initially healthy. A service with no hosts is still created, so
    /// discovery can distinguish "registered but empty" from "unknown".
    pub fn bootstrap<'a>(&self, descriptors: impl Iterator<Item = &'a Arc<ServiceDescriptor>>) {
        for descriptor in descriptors {
            self.health_paths
                .write()
                .insert(descriptor.name.clone(), descriptor.health_check.clone());
            self.services
                .write()
                .entry(descriptor.name.clone())
                .or_default();

            for host in &descriptor.hosts {
                let instance = ServiceInstance::from_host(&descriptor.name, host, descriptor.port);
                if let Err(e) = self.register(instance) {
                    warn!(service = %descriptor.name, host = %host, error = %e,
                        "failed to seed instance");
                }
            }
        }
    }

    /// Upserts an instance under its service name and stamps last-seen.
    ///
    /// Registration always (re-)enters the instance as healthy.
    pub fn register(&self, mut instance: ServiceInstance) -> Result<()> {
        if instance.id.is_empty() {
            return Err(GatewayError::InvalidInstance("missing id".to_string()));
        }
        if instance.name.is_empty() {
            return Err(GatewayError::InvalidInstance(
                "missing service name".to_string(),
            ));
        }

        instance.health = HealthStatus::Healthy;
        instance.last_seen = SystemTime::now();
        let service = instance.name.clone();

        {
            let mut services = self.services.write();
            services
                .entry(service.clone())
                .or_default()
                .insert(instance.id.clone(), instance.clone());
        }

        info!(service = %service, id = %instance.id, address = %instance.address,
            "service instance registered");
        self.notify(&service);
        Ok(())
    }

    /// Removes an instance wherever it is found.
    pub fn deregister(&self, id: &str) -> Result<()> {
        let mut owner = None;
        {
            let mut services = self.services.write();
            for (service, instances) in services.iter_mut() {
                if instances.remove(id).is_some() {
                    owner = Some(service.clone());
                    break;
                }
            }
        }

        match owner {
            Some(service) => {
                info!(service = %service, id = %id, "service instance deregistered");
                self.notify(&service);
                Ok(())
            }
            None => Err(GatewayError::RegistryNotFound {
                name: id.to_string(),
            }),
        }
    }

    /// Returns the healthy instances of a service, sorted by id.
    ///
    /// A service that was never registered yields `RegistryNotFound`; a
    /// known service with zero healthy instances yields an empty list.
    pub fn discover(&self, service: &str) -> Result<Vec<ServiceInstance>> {
        let services = self.services.read();
        let instances = services
            .get(service)
            .ok_or_else(|| GatewayError::RegistryNotFound {
                name: service.to_string(),
            })?;

        let mut healthy: Vec<ServiceInstance> = instances
            .values()
            .filter(|i| i.health == HealthStatus::Healthy)
            .cloned()
            .collect();
        healthy.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(healthy)
    }

    /// Subscribes to the healthy-instance list of a service.
    ///
    /// The receiver's current value is the snapshot at subscription time;
    /// every registration, deregistration, or health change replaces it.
    /// Delivery is single-slot and overwriting: a slow subscriber may miss
    /// intermediate snapshots but always observes the latest state.
    pub fn watch(&self, service: &str) -> watch::Receiver<Vec<ServiceInstance>> {
        let mut watchers = self.watchers.write();
        watchers
            .entry(service.to_string())
            .or_insert_with(|| {
                let snapshot = self.healthy_snapshot(service);
                watch::channel(snapshot).0
            })
            .subscribe()
    }

    fn healthy_snapshot(&self, service: &str) -> Vec<ServiceInstance> {
        self.discover(service).unwrap_or_default()
    }

    /// Publishes the current snapshot to subscribers, outside any registry
    /// lock.
    fn notify(&self, service: &str) {
        let sender = self.watchers.read().get(service).cloned();
        if let Some(sender) = sender {
            let snapshot = self.healthy_snapshot(service);
            sender.send_replace(snapshot);
        }
    }

    /// Applies one probe outcome. Success refreshes last-seen; failure
    /// only degrades status. Subscribers are notified on change.
    fn record_probe(&self, service: &str, id: &str, healthy: bool) {
        let mut changed = false;
        {
            let mut services = self.services.write();
            let Some(instance) = services.get_mut(service).and_then(|m| m.get_mut(id)) else {
                return;
            };

            let old = instance.health;
            if healthy {
                instance.health = HealthStatus::Healthy;
                instance.last_seen = SystemTime::now();
            } else if instance.health == HealthStatus::Healthy {
                instance.health = HealthStatus::Unhealthy;
            }

            if old != instance.health {
                changed = true;
                info!(service = %service, id = %id,
                    old = %old, new = %instance.health,
                    "instance health changed");
            }
        }

        if changed {
            self.notify(service);
        }
    }

    /// Probes every known instance once.
    pub async fn sweep_once(self: &Arc<Self>) {
        let targets: Vec<(String, String, String)> = {
            let services = self.services.read();
            let health_paths = self.health_paths.read();
            services
                .iter()
                .flat_map(|(service, instances)| {
                    let path = health_paths
                        .get(service)
                        .map(String::as_str)
                        .unwrap_or("/health");
                    instances
                        .values()
                        .map(|i| {
                            (
                                service.clone(),
                                i.id.clone(),
                                format!("http://{}:{}{}", i.address, i.port, path),
                            )
                        })
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        let mut handles = Vec::with_capacity(targets.len());
        for (service, id, url) in targets {
            let registry = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let healthy = registry.probe.probe(&url).await;
                registry.record_probe(&service, &id, healthy);
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Spawns the background health sweep loop.
    pub fn start_sweep(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.sweep_once().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("stopping health sweep");
                        break;
                    }
                }
            }
        })
    }

    /// Number of known services.
    pub fn service_count(&self) -> usize {
        self.services.read().len()
    }

    /// Number of registered instances across all services.
    pub fn instance_count(&self) -> usize {
        self.services.read().values().map(HashMap::len).sum()
    }
}
