//! SmartReader gateway entry point
//!
//! Architecture:
//! - One broker session per process, shared by reference
//! - Workers as tokio tasks with a watch-channel shutdown signal
//! - Every command state transition is a guarded store update

use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use tracing::{error, info, warn};

use smartreader_gateway::api::{self, ApiState};
use smartreader_gateway::config::GatewayConfig;
use smartreader_gateway::mqtt::BrokerSession;
use smartreader_gateway::pump::{CommandPublisher, PublisherPump};
use smartreader_gateway::reaper::Reaper;
use smartreader_gateway::router::InboundRouter;
use smartreader_gateway::scheduler::Scheduler;
use smartreader_gateway::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("======================================");
    info!("  SmartReader Gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("======================================");

    let config = match GatewayConfig::load() {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            info!("  MQTT broker: {}:{}", cfg.mqtt.broker, cfg.mqtt.port);
            info!("  API bind: {}", cfg.api.bind);
            info!("  Database: {}", cfg.store.database_url);
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    if config.api.api_key.is_none() {
        warn!("API_KEY is not set; every HTTP request will be rejected");
    }

    let shutdown = setup_shutdown_handler();

    if let Err(e) = run_gateway(config, shutdown).await {
        error!("Gateway error: {e}");
        std::process::exit(1);
    }

    info!("Gateway shutdown complete");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

/// Setup Ctrl+C handler for graceful shutdown
fn setup_shutdown_handler() -> tokio::sync::watch::Receiver<bool> {
    let (tx, rx) = tokio::sync::watch::channel(false);

    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        let _ = tx.send(true);
    })
    .expect("Error setting Ctrl-C handler");

    rx
}

/// Wire the store, broker session, workers and HTTP listener together and
/// run until shutdown.
async fn run_gateway(
    config: GatewayConfig,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    // Step 1: Durable store
    let store = Store::connect(&config.store.database_url)
        .await
        .context("Failed to initialize store")?;

    // Step 2: Broker session. Connection failures after this point are
    // handled by the session's own reconnect policy; commands accumulate in
    // the queue and the reaper keeps the lifecycle moving either way.
    let (session, inbound_rx) = BrokerSession::new(config.mqtt.clone());
    if let Err(e) = session.connect().await {
        error!("Initial MQTT connect failed: {e}");
        return Err(e).context("Failed to start broker session");
    }

    // Step 3: Inbound router
    let inbound = InboundRouter::new(store.clone());
    let router_handle = tokio::spawn(inbound.clone().run(inbound_rx, shutdown.clone()));

    // Step 4: Publisher pump
    let publisher: Arc<dyn CommandPublisher> = session.clone();
    let pump = PublisherPump::new(
        store.clone(),
        publisher,
        config.firmware_url_base.clone(),
        Duration::from_secs(config.workers.pump_interval_secs),
    );
    let pump_handle = tokio::spawn(pump.run(shutdown.clone()));

    // Step 5: Reaper and scheduler
    let reaper = Reaper::new(
        store.clone(),
        Duration::from_secs(config.workers.reap_interval_secs),
        Duration::from_secs(config.workers.reap_after_secs),
    );
    let reaper_handle = tokio::spawn(reaper.run(shutdown.clone()));

    let scheduler = Scheduler::new(
        store.clone(),
        Duration::from_secs(config.workers.scheduler_interval_secs),
    );
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown.clone()));

    // Step 6: Ingress API
    let state = ApiState {
        store,
        inbound,
        session: Some(session.clone()),
        api_key: config.api.api_key.clone(),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.api.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.api.bind))?;
    info!("Ingress API listening on {}", config.api.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown.clone()))
        .await
        .context("HTTP server error")?;

    // Workers finish their in-flight iteration and exit on the shutdown
    // signal; anything left PROCESSING is reaped after the next startup.
    info!("Waiting for workers to finish...");
    let _ = tokio::join!(router_handle, pump_handle, reaper_handle, scheduler_handle);

    session.disconnect().await;
    Ok(())
}

async fn wait_for_shutdown(mut shutdown: tokio::sync::watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}
