mod router;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use prometheus::Registry;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ecoflow_api::{create_backend, Backend};
use ecoflow_core::{Config, DeviceCatalog, DeviceInfo};
use ecoflow_metrics::{Analytics, DeviceLabels};

use crate::worker::Worker;

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Connect with retries and resolve the device identity.
async fn establish_session(
    backend: &Arc<dyn Backend>,
    sn: &str,
    attempts: u32,
    retry_timeout: Duration,
) -> Option<DeviceInfo> {
    for attempt in 1..=attempts {
        match backend.connect().await {
            Ok(()) => match backend.get_device(sn).await {
                Ok(device) => return device,
                Err(e) => error!("Device lookup failed: {}", e),
            },
            Err(e) => error!("Connection attempt {} failed: {}", attempt, e),
        }
        if attempt < attempts {
            info!("Retrying in {} seconds...", retry_timeout.as_secs());
            tokio::time::sleep(retry_timeout).await;
        }
    }
    None
}

/// Label value precedence: the API answer wins when it is informative, then
/// the environment override, then the static catalog.
fn resolve_product_name(
    device: &DeviceInfo,
    config: &Config,
    catalog: &DeviceCatalog,
    sn: &str,
) -> String {
    if !device.product_name.is_empty() && device.product_name != "Unknown" {
        return device.product_name.clone();
    }
    config
        .device
        .product_name
        .clone()
        .or_else(|| catalog.product_name(sn))
        .unwrap_or_else(|| "Unknown".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ecoflow_core::config::load_dotenv();
    init_tracing(&std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()));

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(1);
    }
    config.log_summary();

    let registry = Registry::new();
    let analytics = Arc::new(Analytics::new(&registry, &config.exporter.metrics_prefix)?);
    let catalog = DeviceCatalog::load(config.device.devices_json.as_deref());

    let backend = match create_backend(&config, catalog.clone(), analytics.clone()) {
        Ok(backend) => backend,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let sn = match config.device.sn.clone() {
        Some(sn) => sn,
        None => {
            error!("ECOFLOW_DEVICE_SN must be set");
            std::process::exit(1);
        }
    };

    let device = match establish_session(
        &backend,
        &sn,
        config.worker.establish_attempts,
        config.worker.retry_timeout,
    )
    .await
    {
        Some(device) => device,
        None => {
            error!(
                "Failed to establish a session for device {} after {} attempts",
                sn, config.worker.establish_attempts
            );
            std::process::exit(1);
        }
    };

    let labels = DeviceLabels {
        device: sn.clone(),
        device_name: catalog.resolve_device_name(
            &sn,
            Some(&device.name),
            config.device.name.as_deref(),
        ),
        product_name: resolve_product_name(&device, &config, &catalog, &sn),
        general_key: catalog.resolve_general_key(&sn, config.device.general_key.as_deref()),
    };
    info!(
        "Starting exporter for device: {} ({})",
        labels.device_name, labels.product_name
    );

    let app = router::router(registry.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.exporter.port))
        .await
        .with_context(|| format!("failed to bind exporter port {}", config.exporter.port))?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });
    info!(
        "Prometheus metrics available at http://0.0.0.0:{}",
        config.exporter.port
    );

    let worker = Worker::new(
        backend.clone(),
        &registry,
        &config.exporter.metrics_prefix,
        labels,
        analytics.clone(),
        &config.worker,
    )?;

    tokio::select! {
        _ = worker.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal. Exiting...");
            backend.disconnect().await;
        }
    }

    Ok(())
}
