//! chainward service - periodic unconfirmed-transaction reconciliation
//!
//! Loads configuration, wires the chain client, keystore, store and fee
//! estimator together, and drives the resender on its configured interval.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{error, info};

use chainward::chain::RpcClient;
use chainward::config::Settings;
use chainward::keystore::{KeyStore, StaticKeyStore};
use chainward::metrics::MetricsServer;
use chainward::store::InMemoryTxStore;
use chainward::tx::resender::run_resend_loop;
use chainward::tx::{AttemptBuilder, GasEstimator, Resender};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting chainward v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load()?;
    info!(
        "Loaded configuration for chain {} ({} RPC endpoints)",
        settings.chain.chain_id,
        settings.chain.rpc_urls.len()
    );

    let client = Arc::new(RpcClient::new(settings.chain.clone())?);
    let keystore = Arc::new(StaticKeyStore::from_env(
        &settings.keystore,
        settings.chain.chain_id,
    )?);
    info!(
        "Keystore loaded with {} enabled addresses",
        keystore.enabled_addresses().len()
    );

    let store = Arc::new(InMemoryTxStore::new());
    let estimator = Arc::new(GasEstimator::new(client.clone()));
    let builder = AttemptBuilder::new(settings.chain.chain_id, estimator, keystore.clone());
    let resender = Arc::new(Resender::new(
        settings.resender.clone(),
        client,
        store,
        keystore,
        builder,
    ));

    // Metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Resend loop; cycles never overlap
    let shutdown = Arc::new(Notify::new());
    let resend_handle = tokio::spawn(run_resend_loop(resender, shutdown.clone()));

    info!("chainward instance {} is running", settings.service.instance_id);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");
    shutdown.notify_waiters();
    let _ = resend_handle.await;
    if let Some(handle) = metrics_handle {
        handle.abort();
    }

    info!("chainward stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,chainward=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
