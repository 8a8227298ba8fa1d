use std::sync::Arc;

use mini_exchange::api::{self, AppState};
use mini_exchange::config::Settings;
use mini_exchange::engine::Engine;
use mini_exchange::persistence;
use mini_exchange::startup;
use mini_exchange::store::{PostgresStore, Store};
use mini_exchange::utils::shutdown_token;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::load()?;
    let shutdown = shutdown_token();

    let store: Arc<dyn Store> = Arc::new(PostgresStore::connect(&settings.database_url).await?);

    let (tx, rx) = persistence::channel();
    let engine = Arc::new(Engine::new(store.clone(), tx, settings.price_ring_capacity));

    startup::restore(&engine, &store).await?;

    let webhook_client = reqwest::Client::new();
    let flush_loop = persistence::spawn_flush_loop(
        engine.clone(),
        store.clone(),
        rx,
        webhook_client.clone(),
        settings.webhook_timeout,
        settings.flush_interval,
    );

    let state = AppState {
        engine,
        store,
        admin_api_key: settings.admin_api_key.clone(),
        webhook_client,
        webhook_timeout: settings.webhook_timeout,
        flush_interval: settings.flush_interval,
        flush_loop: Arc::new(tokio::sync::Mutex::new(Some(flush_loop))),
    };

    if state.admin_api_key.is_none() {
        tracing::warn!("EXCHANGE_ADMIN_API_KEY not set — admin routes are unreachable");
    }

    let app = api::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    tracing::info!(addr = %settings.bind_addr, "exchange listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    tracing::info!("shutting down, draining persistence queue");
    if let Some(handle) = state.flush_loop.lock().await.take() {
        handle.stop().await;
    }

    Ok(())
}
