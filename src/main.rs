//! # Voice Chat Backend - Main Application Entry Point
//!
//! Real-time voice conversation server: clients stream microphone audio over a WebSocket and
//! receive transcripts, the assistant's text reply and synthesized speech back on the same
//! connection.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: Every connection and every session pipeline is an async task
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Errors propagate with `?` up to `main`
//! - **CancellationToken**: One shutdown signal observed by the server and background tasks
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (defaults, config.toml, environment variables)
//! - **audio / turn / text**: Frame codec, voice-end detection, sentence splitting
//! - **adapters**: Speech-to-text, language model and speech synthesis providers
//! - **pipeline**: Per-session orchestrator and its stages
//! - **session**: Session handles and the registry
//! - **websocket**: The `/ws` gateway actor
//! - **health / handlers / middleware**: Management HTTP API and request metrics

mod adapters;
mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod pipeline;
mod session;
mod state;
mod text;
mod turn;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Creates shared application state** (config, metrics, session registry)
/// 4. **Starts the idle session sweeper**
/// 5. **Runs the HTTP/WebSocket server** until a shutdown signal arrives
#[actix_web::main]
async fn main() -> Result<()> {
    // Missing .env is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        stt = %config.providers.stt,
        llm = %config.providers.llm,
        tts = %config.providers.tts,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );

    let app_state = web::Data::new(AppState::new(config.clone()));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());
    let sweeper = tokio::spawn(sweep_idle_sessions(app_state.clone(), shutdown.clone()));

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(server_state.clone())
            // Middleware runs in reverse order of registration for responses
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .route("/ws", web::get().to(websocket::voice_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::get().to(handlers::get_session))
                    .route("/sessions/{id}", web::delete().to(handlers::close_session)),
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
        _ = shutdown.cancelled() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    shutdown.cancel();
    app_state.sessions.shutdown_all();
    if let Err(e) = sweeper.await {
        warn!("Session sweeper ended abnormally: {}", e);
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize tracing.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Log filter, defaults to "voice_chat_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_chat_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Cancel `shutdown` on SIGTERM or Ctrl+C.
fn setup_signal_handlers(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    }
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Received SIGINT");
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C");
            }
        }

        shutdown.cancel();
    });
}

/// Periodically close sessions with no inbound traffic.
///
/// Reads the config on every tick, so `session.idle_timeout_secs` updates apply to
/// existing sessions.
async fn sweep_idle_sessions(state: web::Data<AppState>, shutdown: CancellationToken) {
    let interval = Duration::from_secs(state.get_config().session.cleanup_interval_secs.max(1));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let max_idle = Duration::from_secs(state.get_config().session.idle_timeout_secs);
                let removed = state.sessions.remove_idle(max_idle);
                for id in &removed {
                    info!(session_id = %id, "Closed idle session");
                    state.record_session_closed();
                }
            }
        }
    }
}
