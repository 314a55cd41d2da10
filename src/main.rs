//! Photo Geolocation Service
//!
//! Predicts where a photo was taken with a GeoCLIP worker on the CPU.
//! Exposes a REST (Axum) API.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use geolocate::api::rest::{create_rest_router, AppState};
use geolocate::config::Config;
use geolocate::engine::{GeoClipLoader, ModelCache};
use geolocate::service::LocateService;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder().with_target(false);
    match EnvFilter::try_from_default_env() {
        Ok(filter) => subscriber.with_env_filter(filter).init(),
        Err(_) => subscriber.with_max_level(Level::INFO).init(),
    }

    info!("Starting Photo Geolocation Service v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = Config::resolve_path();
    let config = Config::load(&config_path).unwrap_or_else(|e| {
        info!("Using default config ({}: {})", config_path, e);
        Config::default()
    });

    info!("Configuration loaded:");
    info!("  REST port: {}", config.server.rest_port);
    info!("  Device: {}", config.inference.device);
    info!("  Worker: {} {}", config.model.python, config.model.worker_script.display());
    info!("  Max image side: {}px", config.preprocess.max_dimension);
    info!("  Serialized calls: {}", config.inference.serialize_calls);

    // Model is constructed lazily, once per process
    let loader = Arc::new(GeoClipLoader::new(&config.model, &config.inference.device));
    let cache = Arc::new(ModelCache::new(
        loader,
        &config.inference.device,
        config.inference.serialize_calls,
    ));

    let service = Arc::new(LocateService::new(cache, config.clone()));

    if config.inference.preload {
        let service = service.clone();
        tokio::spawn(async move {
            match service.warm_up().await {
                Ok(load_time) => info!("GeoCLIP model ready (loaded in {:?})", load_time),
                Err(e) => warn!("Model preload failed, will retry on first request: {}", e),
            }
        });
    }

    let app_state = Arc::new(AppState {
        service,
        start_time: Instant::now(),
    });

    let rest_router = create_rest_router(app_state);

    let addr = format!("0.0.0.0:{}", config.server.rest_port);
    let listener = TcpListener::bind(&addr).await?;
    info!("REST API listening on http://{}", addr);
    info!("Photo Geolocation Service is ready!");

    axum::serve(listener, rest_router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Goodbye!");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received, cleaning up...");
}
