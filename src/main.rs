mod api;
mod automation;
mod button;
mod config;
mod device;
mod dispatch;
mod error;
mod intents;
mod mqtt;
mod registry;
mod scene;
mod store;
mod voice;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use automation::AutomationEngine;
use dispatch::Dispatcher;
use intents::IntentGenerator;
use mqtt::Commander;
use registry::Registry;
use scene::SceneEngine;
use store::Store;
use websocket::WsHub;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(config::Config::load(None)?);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.logging.level)
                .unwrap_or_else(|_| EnvFilter::new("info,sumika=debug")),
        )
        .init();
    error::set_debug(config.logging.debug);

    tracing::info!("Starting Sumika v{}", env!("CARGO_PKG_VERSION"));

    // ── Storage ──────────────────────────────────────────
    let store = Arc::new(Store::open(&config.database.data_dir)?);
    let intents = Arc::new(IntentGenerator::new(
        store.clone(),
        config.voice.intents_path.clone(),
    ));

    // ── Component wiring ─────────────────────────────────
    // Everything downstream of a command ends up on this channel; the MQTT
    // client drains it once started.
    let (cmd_tx, cmd_rx) = mqtt::command_channel();
    let commander = Commander::new(cmd_tx, &config.mqtt.base_topic);

    let registry = Arc::new(Registry::new(store.clone(), intents.clone(), commander.clone()));
    let scenes = Arc::new(SceneEngine::new(
        store.clone(),
        registry.clone(),
        commander.clone(),
    ));
    let engine = Arc::new(AutomationEngine::new(
        store.clone(),
        registry.clone(),
        scenes.clone(),
        commander.clone(),
    ));
    let hub = Arc::new(WsHub::new(config.websocket.queue_capacity));
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), hub.clone(), engine.clone()));

    // Intent table reflects the loaded document before anything mutates
    intents.regenerate_logged();

    // ── Long-running services ────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mqtt_handle = mqtt::start(
        config.mqtt.clone(),
        dispatcher,
        registry.clone(),
        cmd_rx,
        shutdown_rx.clone(),
    );

    let voice_handle = if config.voice.enabled {
        Some(voice::spawn(
            config.voice.clone(),
            registry.clone(),
            commander.clone(),
            hub.clone(),
            shutdown_rx.clone(),
        ))
    } else {
        tracing::info!("voice worker disabled");
        None
    };

    // ── HTTP + WebSocket ─────────────────────────────────
    let app_state = api::AppState {
        config: config.clone(),
        store: store.clone(),
        registry,
        engine,
        scenes,
        hub: hub.clone(),
        commander,
        started_at: std::time::Instant::now(),
    };
    let app = api::router(app_state).merge(websocket::router(
        hub.clone(),
        config.websocket.ping_interval_secs,
    ));

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    tracing::info!("Listening on {}", config.bind_addr());

    let mut serve_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = serve_shutdown.changed().await;
        })
        .await?;

    // ── Shutdown: voice worker, hub, MQTT, final save ────
    if let Some(handle) = voice_handle {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
    hub.close();
    let _ = tokio::time::timeout(Duration::from_secs(2), mqtt_handle).await;

    if let Err(e) = store.save_all() {
        tracing::error!("final document save failed: {}", e);
    }

    tracing::info!("Sumika shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { tracing::info!("Received SIGINT, shutting down"); }
        _ = terminate => { tracing::info!("Received SIGTERM, shutting down"); }
    }
}
