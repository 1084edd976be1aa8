//! # Translation Relay - Main Application Entry Point
//!
//! A live translation relay: browsers join rooms over WebSocket and stream
//! microphone audio; each room keeps one streaming connection to the
//! translation backend and fans translated text and speech back out to
//! every member.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: every connection, room and backend session is a task
//! - **Arc<dyn Trait>**: store, reverse translator and session gate are chosen
//!   at startup and shared by every room
//! - **CancellationToken**: one shutdown signal reaches every room
//!
//! ## Application Architecture:
//! - **config**: defaults, `config.toml` and environment variables
//! - **room**: room registry, per-room event loop, client queues
//! - **translation**: backend protocol, transcript assembly, reverse translation
//! - **audio**: client buffering and sample-rate conversion
//! - **store**: ordered per-room message history (memory or Redis)
//! - **monitor**: room, connection and task bookkeeping
//! - **websocket / handlers / health**: the HTTP surface
//! - **error**: HTTP error responses and domain error types

mod audio;
mod auth;
mod config;
mod error;
mod handlers;
mod health;
mod message;
mod middleware;
mod monitor;
mod room;
mod state;
mod store;
mod translation;
mod websocket;

#[cfg(test)]
mod test_support;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use monitor::Monitor;
use room::{RelayContext, RoomRegistry};
use state::AppState;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use translation::reverse::HttpReverseTranslator;

/// ## What this function does:
/// 1. **Loads configuration** and refuses to start on invalid settings
/// 2. **Connects the shared services**: message store, session gate
/// 3. **Builds the room registry** every WebSocket join goes through
/// 4. **Serves HTTP** until SIGINT/SIGTERM, then stops every room
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;
    let config = Arc::new(config);

    info!("Starting translation-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!("Translation backend: {}", config.translation.api_url);

    let store = store::connect(&config.store).await?;
    let gate = auth::build_gate(&config.auth).await?;
    let monitor = Monitor::new();

    let registry = Arc::new(RoomRegistry::new(RelayContext {
        config: Arc::clone(&config),
        store,
        translator: Arc::new(HttpReverseTranslator::new(&config.reverse)),
        monitor: Arc::clone(&monitor),
    }));

    let app_state = AppState::new(Arc::clone(&config), Arc::clone(&registry), monitor, gate);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // middleware runs in reverse order of registration for responses
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .route("/ws", web::get().to(websocket::room_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config)),
            )
            .service(
                web::scope("/system")
                    .route("/translation-status", web::get().to(handlers::translation_status))
                    .route("/room-status/{room_id}", web::get().to(handlers::room_status))
                    .route(
                        "/close-translation/{room_id}",
                        web::post().to(handlers::close_translation),
                    )
                    .route("/runtime", web::get().to(health::runtime_status)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .disable_signals()
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
        _ = shutdown.cancelled() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    registry.shutdown();
    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls the filter; without it the relay logs its own
/// modules at debug and actix at info.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "translation_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Cancel `shutdown` on SIGTERM or SIGINT.
fn setup_signal_handlers(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!("Failed to install signal handlers ({}), falling back to Ctrl+C", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
