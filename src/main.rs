use rust_api_gateway::admin::AdminService;
use rust_api_gateway::admin_listener::AdminListener;
use rust_api_gateway::config::{GatewayConfig, GatewayDocument};
use rust_api_gateway::listener::Listener;
use rust_api_gateway::proxy::{GatewayService, MaintenanceFlag, ProxyForwarder};
use rust_api_gateway::ratelimit::GatewayRateLimiter;
use rust_api_gateway::registry::{HttpHealthProbe, ServiceRegistry};
use rust_api_gateway::route::{RouteTable, SharedRouteTable};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Rust API Gateway");

    if let Err(e) = run().await {
        error!("fatal error: {}", e);
        std::process::exit(1);
    }
}

/// Loads the routing document from the configured file.
///
/// A missing file yields an empty document so the gateway can start and
/// be populated through the admin surface.
fn load_document(path: &str) -> Result<GatewayDocument, Box<dyn std::error::Error>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("routes file {} not readable ({}), starting empty", path, e);
            return Ok(GatewayDocument::default());
        }
    };

    let document = if path.ends_with(".json") {
        GatewayDocument::from_json(&content)?
    } else {
        GatewayDocument::from_toml(&content)?
    };
    document.validate()?;
    Ok(document)
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = GatewayConfig::from_env();
    config.validate()?;
    info!(
        "config: gateway={}, admin={}, routes={}, timeout={}ms",
        config.listen_addr,
        config.admin_addr,
        config.routes_file,
        config.request_timeout.as_millis()
    );

    let document = load_document(&config.routes_file)?;
    let table = Arc::new(SharedRouteTable::new(RouteTable::build(&document)?));
    info!(
        "route table built: {} routes, {} services",
        table.current().route_count(),
        table.current().service_count()
    );

    let registry = Arc::new(ServiceRegistry::new(Arc::new(HttpHealthProbe::new(
        config.health_probe_timeout,
    ))));
    registry.bootstrap(table.current().services());
    info!("registry seeded with {} instances", registry.instance_count());

    let limiter = Arc::new(GatewayRateLimiter::from_settings(&document.rate_limit));
    let maintenance = MaintenanceFlag::new();

    let forwarder = Arc::new(ProxyForwarder::new(
        Arc::clone(&table),
        Arc::clone(&registry),
        maintenance.clone(),
        config.request_timeout,
    ));
    let gateway_service = GatewayService::new(Arc::clone(&forwarder), Arc::clone(&limiter));
    let admin_service = AdminService::new(
        forwarder,
        Arc::clone(&registry),
        limiter,
        table,
        maintenance,
    );

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    let gateway_listener = Listener::bind(&config.listen_addr, gateway_service).await?;
    info!("gateway listening on {}", gateway_listener.local_addr());

    let admin_listener = AdminListener::bind(&config.admin_addr, admin_service).await?;
    info!(
        "admin endpoints on {} (/health, /metrics, /admin/*)",
        admin_listener.local_addr()
    );

    let sweep_task = registry.start_sweep(config.health_check_interval, shutdown_tx.subscribe());

    let mut gateway_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = gateway_listener.serve(shutdown_rx).await {
                error!("gateway listener error: {}", e);
            }
        }
    });

    let mut admin_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = admin_listener.serve(shutdown_rx).await {
                error!("admin listener error: {}", e);
            }
        }
    });

    let mut gateway_finished = false;
    let mut admin_finished = false;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, initiating graceful shutdown");
        }
        res = &mut gateway_task => {
            gateway_finished = true;
            match res {
                Ok(()) => info!("gateway task completed"),
                Err(err) => error!("gateway task join error: {}", err),
            }
        }
        res = &mut admin_task => {
            admin_finished = true;
            match res {
                Ok(()) => info!("admin task completed"),
                Err(err) => error!("admin task join error: {}", err),
            }
        }
    }

    let _ = shutdown_tx.send(());

    if !gateway_finished {
        match gateway_task.await {
            Ok(()) => info!("gateway task completed"),
            Err(err) => error!("gateway task join error: {}", err),
        }
    }

    if !admin_finished {
        match admin_task.await {
            Ok(()) => info!("admin task completed"),
            Err(err) => error!("admin task join error: {}", err),
        }
    }

    if let Err(err) = sweep_task.await {
        error!("health sweep join error: {}", err);
    }

    info!("shutdown complete");
    Ok(())
}
