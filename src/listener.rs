//! TCP listener for the public gateway port.
//!
//! Accepts HTTP/1.1 connections and hands each one a copy of the dispatch
//! pipeline bound to the connection's peer address, so per-IP rate limiting
//! and `X-Forwarded-For` propagation see the real client.

use crate::error::{GatewayError, Result};
use crate::proxy::GatewayService;
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

/// Gateway HTTP listener that accepts connections and spawns handler tasks.
pub struct Listener {
    tcp_listener: TcpListener,
    gateway_service: GatewayService,
    addr: SocketAddr,
}

impl Listener {
    /// Binds to the specified address.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::ListenerBind` if binding fails.
    #[instrument(level = "info", skip(gateway_service))]
    pub async fn bind(addr: &str, gateway_service: GatewayService) -> Result<Self> {
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

        info!("bound to {}", local_addr);

        Ok(Self {
            tcp_listener,
            gateway_service,
            addr: local_addr,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves incoming connections until a shutdown signal is received.
    ///
    /// Spawns a new task for each connection. Gracefully shuts down when
    /// the shutdown receiver triggers.
    #[instrument(level = "info", skip(self, shutdown_rx), fields(addr = %self.addr))]
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("serving connections");

        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("accepted connection from {}", peer_addr);
                            let service = self.gateway_service.for_peer(peer_addr);

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, service).await {
                                    error!("connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping listener");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handles a single HTTP/1.1 connection.
    #[instrument(level = "debug", skip_all)]
    async fn handle_connection(
        stream: tokio::net::TcpStream,
        service: GatewayService,
    ) -> Result<()> {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let mut svc = service.clone();
            async move { svc.call(req).await }
        });

        http1::Builder::new()
            .serve_connection(io, service)
            .await
            .map_err(GatewayError::Http)
    }
}
