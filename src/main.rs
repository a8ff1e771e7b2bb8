//! Pulse node — real-time presence relay.
//!
//! Entry point that wires configuration, the shared store, the sentry,
//! and the presence engine together.

use std::sync::Arc;

use tracing_subscriber::{EnvFilter, fmt};

use pulse_core::config::AppConfig;
use pulse_core::error::AppError;
use pulse_core::traits::store::StoreProvider;
use pulse_presence::engine::PresenceEngine;
use pulse_presence::sentry::Sentry;
use pulse_store::StoreManager;

#[tokio::main]
async fn main() {
    let config = match load_configuration() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config);

    if let Err(e) = run(config).await {
        tracing::error!("Node error: {e}");
        std::process::exit(1);
    }
}

/// Load configuration from file and environment
fn load_configuration() -> Result<AppConfig, AppError> {
    let env = std::env::var("PULSE_ENV").unwrap_or_else(|_| "development".to_string());
    AppConfig::load(&env)
}

/// Initialize tracing/logging
fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
        _ => {
            fmt().pretty().with_env_filter(filter).with_target(true).init();
        }
    }
}

/// Main node run function
async fn run(config: AppConfig) -> Result<(), AppError> {
    tracing::info!("Starting Pulse v{}", env!("CARGO_PKG_VERSION"));

    let node_name = if config.node.name.is_empty() {
        format!("node-{}", &uuid::Uuid::new_v4().to_string()[..8])
    } else {
        config.node.name.clone()
    };

    // ── Step 1: shared store ─────────────────────────────────────
    tracing::info!("Initializing store (provider: {})...", config.store.provider);
    let store = StoreManager::new(&config.store).await?;
    if !store.health_check().await? {
        return Err(AppError::service_unavailable(
            "Store did not answer health check",
        ));
    }
    let store: Arc<dyn StoreProvider> = Arc::new(store);
    tracing::info!("Store initialized");

    // ── Step 2: sentry ───────────────────────────────────────────
    let sentry = Arc::new(Sentry::new(
        node_name.clone(),
        config.node.host.clone(),
        config.node.port,
        config.sentry.clone(),
        Arc::clone(&store),
    ));

    // ── Step 3: presence engine ──────────────────────────────────
    let engine = PresenceEngine::new(Arc::clone(&store), sentry, config.presence.clone());
    engine.start().await?;
    tracing::info!(node = %node_name, "Pulse node running");

    // ── Step 4: graceful shutdown ────────────────────────────────
    shutdown_signal().await;
    tracing::info!("Shutdown signal received, stopping node...");
    engine.shutdown().await;
    tracing::info!("Pulse node shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
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
