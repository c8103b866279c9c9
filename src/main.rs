//! # Healthvoice Backend - Main Application Entry Point
//!
//! Wires the whole service together:
//!
//! 1. Load configuration (TOML file + environment variables) and validate it
//! 2. Initialize structured logging
//! 3. Open the SQLite job store and create the schema
//! 4. Build the resource coordinator (models stay unloaded until first use)
//! 5. Spawn the background scheduler with a cancellation token
//! 6. Serve the HTTP API until SIGINT/SIGTERM, then drain the scheduler
//!
//! Shutdown is cooperative: the cancellation token is checked between
//! scheduler iterations, so an in-flight job always finishes before the
//! worker task exits.

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod models;
mod retrieval;
mod scoring;
mod state;
mod store;
mod templates;
mod worker;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::{AppCoordinator, AppState};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;
    let config = Arc::new(config);

    info!("Starting healthvoice-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}:{}", config.server.host, config.server.port);

    let pool = store::init_pool(&config.storage.database_path()).await?;
    let coordinator = Arc::new(AppCoordinator::new(config.models.clone()));
    let app_state = AppState::new(config.clone(), pool, coordinator.clone());

    // The scheduler owns job processing for the whole process lifetime.
    let cancel = CancellationToken::new();
    let worker_task = tokio::spawn(worker::scheduler::run(
        app_state.worker_context(),
        cancel.clone(),
    ));

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let server_state = app_state.clone();

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .service(
                web::scope("/api")
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/transcripts/upload", web::post().to(handlers::transcripts::upload))
                    .route("/transcripts/record", web::post().to(handlers::transcripts::record))
                    .route("/transcripts", web::get().to(handlers::transcripts::list))
                    .route("/transcripts/{id}", web::get().to(handlers::transcripts::get))
                    .route("/transcripts/{id}", web::delete().to(handlers::transcripts::delete))
                    .route("/transcripts/{id}/start", web::post().to(handlers::transcripts::start))
                    .route("/transcripts/{id}/retry", web::post().to(handlers::transcripts::retry))
                    .route("/transcripts/{id}/text", web::get().to(handlers::transcripts::download_text))
                    .route("/transcripts/{id}/report", web::get().to(handlers::transcripts::download_report))
                    .route("/transcripts/{id}/questions", web::post().to(handlers::questions::create))
                    .route("/transcripts/{id}/questions", web::get().to(handlers::questions::list))
                    .route("/questions/{id}", web::delete().to(handlers::questions::delete)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    // Let any in-flight job finish, then release the models.
    cancel.cancel();
    if let Err(e) = worker_task.await {
        error!("Worker task error: {}", e);
    }
    coordinator.unload_all().await;

    info!("Server stopped gracefully");
    Ok(())
}

/// Structured logging with an env-filter override (`RUST_LOG`).
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "healthvoice_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolves when SIGTERM or SIGINT arrives.
async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("Failed to install SIGTERM handler");
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .expect("Failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}
