mod bridge;
mod config;
mod db;
mod digest;
mod errors;
mod health;
mod metrics;
mod model;
mod notify;
mod polling;
mod rest;
mod retention;
mod store;
#[cfg(test)]
mod testing;
mod tokens;
mod validate;

use axum::{routing::get, Router};
use bridge::{BridgeApi, HueClient};
use clap::Parser;
use config::{Cli, Command, Settings};
use digest::DigestScheduler;
use health::HealthEvaluator;
use notify::{LogMailer, SummaryRenderer};
use polling::PollingOrchestrator;
use retention::RetentionSweeper;
use std::sync::Arc;
use store::Store;
use tokens::TokenLifecycleManager;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = cli.settings;
    info!(
        "Database: {}",
        settings.database_url.split('@').last().unwrap_or("***")
    );

    // Connect to database
    let pool = match db::make_pool(&settings.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };
    let store: Arc<dyn Store> = Arc::new(db::PgStore::new(pool));

    match cli.command {
        Some(Command::Reactivate { hub_id }) => {
            if let Err(e) = store.reactivate_hub(hub_id).await {
                error!("Failed to reactivate hub {}: {}", hub_id, e);
                std::process::exit(1);
            }
            info!("Hub {} is active again", hub_id);
        }
        Some(Command::Run) | None => {
            if let Err(e) = run(settings, store).await {
                error!("{}", e);
                std::process::exit(1);
            }
        }
    }
}

async fn run(settings: Settings, store: Arc<dyn Store>) -> anyhow::Result<()> {
    info!("Starting HubWatch");
    info!("Bridge API: {}", settings.bridge_api_url);
    info!("HTTP server: {}", settings.http_addr);

    // Initialize metrics
    metrics::init_metrics();

    let bridge: Arc<dyn BridgeApi> = Arc::new(HueClient::new(&settings.bridge())?);
    let health = HealthEvaluator::new(settings.health());
    let cancel = CancellationToken::new();

    let orchestrator = PollingOrchestrator::new(
        store.clone(),
        bridge.clone(),
        settings.polling()?,
        health,
        RetentionSweeper::new(settings.retention()),
    );
    let tokens = TokenLifecycleManager::new(store.clone(), bridge, settings.tokens()?);
    let digests = DigestScheduler::new(
        store.clone(),
        Arc::new(SummaryRenderer::new(store.clone())),
        Arc::new(LogMailer),
        settings.digest()?,
    );

    // Spawn polling, token refresh and digest loops
    let mut polling_handle = tokio::spawn(orchestrator.run(cancel.clone()));
    let mut tokens_handle = tokio::spawn(tokens.run(cancel.clone()));
    let mut digest_handle = tokio::spawn(digests.run(cancel.clone()));

    // Build HTTP app with REST API and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(store, health));

    let listener = tokio::net::TcpListener::bind(&settings.http_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", settings.http_addr, e))?;
    info!("HTTP server listening on {}", settings.http_addr);

    let server_cancel = cancel.clone();
    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
            .unwrap_or_else(|e| {
                error!("HTTP server error: {}", e);
            });
    });

    tokio::select! {
        _ = &mut polling_handle => {
            error!("Polling task terminated");
        }
        _ = &mut tokens_handle => {
            error!("Token refresh task terminated");
        }
        _ = &mut digest_handle => {
            error!("Digest task terminated");
        }
        _ = &mut server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    cancel.cancel();
    // Wait for the loops to observe cancellation
    for handle in [polling_handle, tokens_handle, digest_handle, server_handle] {
        if !handle.is_finished() {
            let _ = handle.await;
        }
    }

    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
