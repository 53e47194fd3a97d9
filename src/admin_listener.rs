//! Admin listener for health checks, metrics, and operational control.

use crate::admin::AdminService;
use crate::error::{GatewayError, Result};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::Service;
use tracing::{debug, error, info, instrument, warn};

/// Admin HTTP listener, served on a separate port from proxied traffic.
pub struct AdminListener {
    tcp_listener: TcpListener,
    admin_service: AdminService,
    addr: SocketAddr,
}

impl AdminListener {
    /// Binds to the specified address for admin endpoints.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::ListenerBind` if binding fails.
    #[instrument(level = "info", skip(admin_service))]
    pub async fn bind(addr: &str, admin_service: AdminService) -> Result<Self> {
        let tcp_listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        let local_addr = tcp_listener
            .local_addr()
            .map_err(|e| GatewayError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        info!("admin endpoint bound to {}", local_addr);

        Ok(Self {
            tcp_listener,
            admin_service,
            addr: local_addr,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves admin endpoints until a shutdown signal is received.
    #[instrument(level = "info", skip(self, shutdown_rx), fields(addr = %self.addr))]
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("serving admin endpoints");

        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("admin connection from {}", peer_addr);
                            let service = self.admin_service.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, service).await {
                                    error!("admin connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("failed to accept admin connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping admin listener");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handles a single admin TCP connection.
    #[instrument(level = "debug", skip(stream, service))]
    async fn handle_connection(stream: tokio::net::TcpStream, service: AdminService) -> Result<()> {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let mut service = service.clone();
            async move { service.call(req).await }
        });

        http1::Builder::new()
            .serve_connection(io, service)
            .await
            .map_err(GatewayError::Http)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayDocument;
    use crate::proxy::{MaintenanceFlag, ProxyForwarder};
    use crate::ratelimit::GatewayRateLimiter;
    use crate::registry::{HttpHealthProbe, ServiceRegistry};
    use crate::route::{RouteTable, SharedRouteTable};
    use std::sync::Arc;
    use std::time::Duration;

    fn test_admin_service() -> AdminService {
        let doc = GatewayDocument::from_toml(
            r#"
            [[routes]]
            id = "r"
            pattern = "/x"
            service = "svc"

            [services.svc]
            hosts = ["127.0.0.1"]
            port = 9000
        "#,
        )
        .unwrap();
        let table = Arc::new(SharedRouteTable::new(RouteTable::build(&doc).unwrap()));
        let registry = Arc::new(ServiceRegistry::new(Arc::new(HttpHealthProbe::new(
            Duration::from_secs(5),
        ))));
        let limiter = Arc::new(GatewayRateLimiter::disabled());
        let maintenance = MaintenanceFlag::new();
        let forwarder = Arc::new(ProxyForwarder::new(
            Arc::clone(&table),
            Arc::clone(&registry),
            maintenance.clone(),
            Duration::from_secs(30),
        ));
        AdminService::new(forwarder, registry, limiter, table, maintenance)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_admin_listener_bind() {
        let listener = AdminListener::bind("127.0.0.1:0", test_admin_service()).await;
        assert!(listener.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_admin_listener_bind_invalid_address() {
        let listener = AdminListener::bind("999.999.999.999:0", test_admin_service()).await;
        assert!(listener.is_err());
    }
}
