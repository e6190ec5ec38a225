//! Runner fleet dispatcher daemon.
//!
//! Loads configuration from the environment, then runs the reconciliation
//! loop until interrupted. The first Ctrl-C lets the current cycle finish; a
//! second one exits immediately.

use std::sync::Arc;

use anyhow::Result;
use fleet_dispatcher::hypervisor::ProxmoxClient;
use fleet_dispatcher::queue::GitHubClient;
use fleet_dispatcher::{Config, Dispatcher, DispatcherConfig};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting runner dispatcher");

    let config = Config::from_env()?;
    info!(
        proxmox_url = %config.proxmox.url,
        repository = %config.repo_url,
        global_cap = config.global_cap,
        "Configuration loaded"
    );

    let hypervisor = Arc::new(ProxmoxClient::new(&config.proxmox)?);
    let queue = Arc::new(GitHubClient::new(&config.github)?);
    let dispatcher = Dispatcher::new(DispatcherConfig::from(&config), hypervisor, queue);
    for pool in dispatcher.pools() {
        info!(
            pool = pool.name(),
            node = pool.node(),
            template = pool.template(),
            labels = %pool.labels_csv(),
            vmid_range = %pool.vmid_range(),
            max_runners = pool.max_runners().unwrap_or(0),
            "Configured pool"
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handle = tokio::spawn(async move { dispatcher.run(shutdown_rx).await });

    tokio::select! {
        result = &mut handle => {
            if let Err(e) = result {
                error!(error = %e, "Dispatcher task panicked");
            }
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, finishing current cycle");
        }
    }

    let _ = shutdown_tx.send(true);

    tokio::select! {
        result = handle => {
            if let Err(e) = result {
                error!(error = %e, "Dispatcher task panicked");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Received second shutdown signal, exiting immediately");
        }
    }

    info!("Dispatcher shutdown complete");
    Ok(())
}
