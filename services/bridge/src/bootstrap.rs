//! Startup sequence: load config, fetch vendor devices, build the registry,
//! spawn one Forwarder per broker in use, start the Health Reflector, and
//! await shutdown. Mirrors `services/server`'s `main.rs` shutdown handling
//! and `forwarder::main`'s fatal-on-config-failure style.

use crate::config::{self, BridgeConfig, BrokerCatalog};
use crate::forwarder::Forwarder;
use crate::health_http::{self, HealthState};
use crate::registry::{self, RegistryBuildResult};
use bridge_protocol::Device;
use bridge_vendor_api::VendorApiClient;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

const VENDOR_API_BASE_URL: &str = "https://hame.cloud";

#[derive(Debug)]
pub enum BootstrapError {
    Config(String),
    VendorApi(String),
    Forwarder(String),
    NoDevices,
    Bind(String),
}

impl std::fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootstrapError::Config(s) => write!(f, "config error: {s}"),
            BootstrapError::VendorApi(s) => write!(f, "vendor API error: {s}"),
            BootstrapError::Forwarder(s) => write!(f, "forwarder startup error: {s}"),
            BootstrapError::NoDevices => write!(f, "no devices survived registry construction"),
            BootstrapError::Bind(s) => write!(f, "failed to bind health endpoint: {s}"),
        }
    }
}

impl std::error::Error for BootstrapError {}

pub async fn run() -> Result<(), BootstrapError> {
    let cfg = config::load_bridge_config().map_err(|e| BootstrapError::Config(e.to_string()))?;
    let catalog =
        config::load_broker_catalog().map_err(|e| BootstrapError::Config(e.to_string()))?;
    info!(
        devices = cfg.devices.len(),
        brokers = catalog.len(),
        "config loaded"
    );

    let vendor_devices = if cfg.username.is_empty() {
        Vec::new()
    } else {
        let client = VendorApiClient::new(VENDOR_API_BASE_URL, &cfg.username, &cfg.password);
        client
            .fetch_devices()
            .await
            .map_err(|e| BootstrapError::VendorApi(e.to_string()))?
    };
    info!(count = vendor_devices.len(), "vendor device list fetched");

    let RegistryBuildResult { devices, errors } = registry::build_registry(
        &vendor_devices,
        &cfg.devices,
        &catalog,
        cfg.default_broker_id.as_deref(),
        cfg.inverse_forwarding,
        &cfg.inverse_forwarding_device_ids,
    );
    for err in &errors {
        warn!(device_id = %err.device_id, reason = %err.reason, "device registry entry rejected");
    }
    if devices.is_empty() {
        return Err(BootstrapError::NoDevices);
    }
    info!(count = devices.len(), rejected = errors.len(), "device registry built");

    let forwarders = spawn_forwarders(&cfg, &catalog, devices)?;

    let health_state = HealthState::new(forwarders.clone());
    let router = health_http::build_router(health_state);
    let listener = tokio::net::TcpListener::bind(&cfg.health_bind)
        .await
        .map_err(|e| BootstrapError::Bind(e.to_string()))?;
    info!(addr = %cfg.health_bind, "health endpoint listening");

    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
        {
            error!(error = %err, "health server error");
        }
    });

    let _ = server.await;

    for forwarder in forwarders.values() {
        forwarder.shutdown();
    }
    info!("bridge shut down gracefully");
    Ok(())
}

fn spawn_forwarders(
    cfg: &BridgeConfig,
    catalog: &BrokerCatalog,
    devices: Vec<Device>,
) -> Result<HashMap<String, Arc<Forwarder>>, BootstrapError> {
    let mut by_broker: HashMap<String, Vec<Device>> = HashMap::new();
    for device in devices {
        by_broker.entry(device.broker_id.clone()).or_default().push(device);
    }

    let mut forwarders = HashMap::with_capacity(by_broker.len());
    for (broker_id, devices) in by_broker {
        let Some(broker) = catalog.get(&broker_id) else {
            warn!(broker_id, "devices reference a broker missing from the catalog, skipping");
            continue;
        };
        let forwarder = Forwarder::spawn(devices, broker.clone(), cfg.inverse_forwarding, &cfg.broker_url)
            .map_err(|e| BootstrapError::Forwarder(e.to_string()))?;
        forwarders.insert(broker_id, Arc::new(forwarder));
    }
    Ok(forwarders)
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
