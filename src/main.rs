//! ==============================================================================
//! main.rs - plant relay entry point
//! ==============================================================================
//!
//! purpose:
//!     bridges water-treatment plant telemetry from an mqtt broker to browser
//!     dashboards over websocket, and carries motor ON/OFF commands back.
//!
//! responsibilities:
//!     - load configuration and start logging
//!     - build the shared store, the fanout hub and the liveness watchdog
//!     - run the mqtt bridge (subscribe telemetry, publish commands)
//!     - serve the websocket endpoint and the small json api
//!     - shut both down on ctrl-c
//!
//! architecture:
//!
//!     ┌────────────────────────────────────────────────────────────────┐
//!     │                       relay (this process)                      │
//!     │  ┌──────────────┐    ┌─────────┐    ┌───────────────────────┐   │
//!     │  │ mqtt bridge  │───>│   hub   │───>│ websocket sessions    │   │
//!     │  │ (broker.rs)  │    │ + store │    │ (server.rs, 1/client) │   │
//!     │  └──────▲───────┘    └────▲────┘    └──────────┬────────────┘   │
//!     │         │                 │ status update      │ motor_control  │
//!     │         │           ┌─────┴──────┐             │                │
//!     │         └───────────│  command   │<────────────┘                │
//!     │          publish    │ (command.rs)│                             │
//!     │                     └────────────┘                              │
//!     └────────────────────────────────────────────────────────────────┘
//!              ▲ sensor topic   │ command topic
//!              │                ▼
//!     ┌────────────────────────────────────┐
//!     │            mqtt broker             │
//!     └────────────────────────────────────┘
//!
//! ==============================================================================

mod broker;
mod command;
mod config;
mod domain;
mod heartbeat;
mod hub;
mod notify;
mod server;
mod store;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: load configuration and start logging
    let (config, config_note) = config::RelayConfig::load_or_default();
    init_logging(&config.logging);
    tracing::info!("[CONFIG] {}", config_note);
    config.log_summary();

    // step 2: shared state
    let store: Arc<dyn store::TelemetryStore> = Arc::new(store::MemoryStore::new());
    let hub = hub::Hub::new(store.clone(), config.fanout.capacity);
    let heartbeat = Arc::new(heartbeat::Heartbeat::spawn(config.liveness.window()));
    let notifier = Arc::new(notify::Notifier::new(config.notifications.clone(), store.clone())?);

    // step 3: mqtt bridge and the command path on top of it
    let (bridge, eventloop) = broker::MqttBridge::connect(&config.broker);
    let bridge = Arc::new(bridge);
    let dispatcher = Arc::new(command::CommandDispatcher::new(
        bridge.clone(),
        hub.clone(),
        config.broker.command_topic.clone(),
        &config.commands,
    ));
    let ingest = broker::TelemetryIngest::new(
        hub.clone(),
        heartbeat.clone(),
        Some(notifier.clone()),
        config.broker.sensor_topic.clone(),
        config.logging.show_sensor_data,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let broker_task = tokio::spawn({
        let bridge = bridge.clone();
        async move { bridge.run(eventloop, ingest, shutdown_rx).await }
    });

    // step 4: log plant reachability transitions
    let mut liveness = heartbeat.subscribe();
    let window = heartbeat.window();
    tokio::spawn(async move {
        while liveness.changed().await.is_ok() {
            if *liveness.borrow_and_update() {
                tracing::info!("[LIVENESS] telemetry flowing");
            } else {
                tracing::warn!("[LIVENESS] no telemetry for {:?}, plant marked disconnected", window);
            }
        }
    });

    // step 5: web server until ctrl-c
    let address = config.server_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {}", address))?;
    tracing::info!("[STARTUP] ✓ Relay live at http://{} (websocket at /ws)", address);

    let state = server::RelayState { hub, dispatcher, heartbeat, notifier };
    server::serve(listener, state, shutdown_signal()).await?;

    // step 6: stop the broker loop
    let _ = shutdown_tx.send(true);
    if let Err(e) = broker_task.await {
        tracing::warn!("[SHUTDOWN] broker task ended abnormally: {}", e);
    }
    tracing::info!("[SHUTDOWN] done");
    Ok(())
}

fn init_logging(logging: &config::LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("[SHUTDOWN] could not listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("[SHUTDOWN] ctrl-c received");
}
