mod auth;
mod config;
mod config_registry;
mod credential;
mod error;
mod http_client;
mod proxy;
mod scheduler;
mod store;
mod surface;

use std::sync::Arc;

use clap::Parser;

use config::{Args, BootstrapConfig};
use config_registry::ConfigRegistry;
use credential::CredentialPool;
use proxy::ProxyEngine;
use scheduler::Scheduler;
use store::Store;
use surface::AppState;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let bootstrap = BootstrapConfig::load(&args).unwrap_or_else(|e| {
        tracing::error!("failed to load configuration: {e}");
        std::process::exit(1);
    });

    let store = match Store::connect(&bootstrap.database_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("failed to connect to store: {e}");
            std::process::exit(1);
        }
    };

    let (restart_tx, restart_rx) = tokio::sync::mpsc::unbounded_channel();
    let config_registry = Arc::new(ConfigRegistry::new(store.clone(), Some(restart_tx)));

    seed_bootstrap_config(&config_registry, &bootstrap).await;

    if config_registry.access_keys().await.is_empty() || config_registry.admin_key().await.is_none() {
        tracing::error!("ACCESS_KEY and ADMIN_KEY must both be configured before first run");
        std::process::exit(1);
    }

    let credentials = Arc::new(CredentialPool::new(store.clone(), config_registry.clone()));
    for secret in bootstrap.seed_credentials() {
        if let Err(e) = credentials.add(&secret).await {
            tracing::warn!("failed to seed credential: {e}");
        }
    }

    let http_client = http_client::build_client().unwrap_or_else(|e| {
        tracing::error!("failed to build HTTP client: {e}");
        std::process::exit(1);
    });

    let engine = Arc::new(ProxyEngine::new(http_client.clone(), credentials.clone(), config_registry.clone()));
    let auth = Arc::new(auth::AuthGate::new(store.clone(), config_registry.clone()));

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        credentials.clone(),
        config_registry.clone(),
        http_client.clone(),
    ));
    let _scheduler_task = scheduler.spawn(restart_rx);

    let state = AppState {
        engine,
        auth,
        production: bootstrap.is_production(),
    };

    let app = surface::build_router(state);

    let addr = format!("{}:{}", bootstrap.host, bootstrap.port);
    tracing::info!("listening on {addr}");
    tracing::info!("  ANY  /v1beta/*path");
    tracing::info!("  POST /login");
    tracing::info!("  POST /logout");

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

async fn seed_bootstrap_config(registry: &ConfigRegistry, bootstrap: &BootstrapConfig) {
    registry.begin_bulk();

    if let Some(access_key) = &bootstrap.access_key {
        if registry.get("ACCESS_KEY").await.ok().flatten().is_none() {
            registry.set("ACCESS_KEY", access_key).await.ok();
        }
    }
    if let Some(admin_key) = &bootstrap.admin_key {
        if registry.get("ADMIN_KEY").await.ok().flatten().is_none() {
            registry.set("ADMIN_KEY", admin_key).await.ok();
        }
    }
    if registry.get("GEMINI_API_BASE_URL").await.ok().flatten().is_none() {
        registry
            .set("GEMINI_API_BASE_URL", &bootstrap.gemini_api_base_url)
            .await
            .ok();
    }

    registry.end_bulk(false);
}
