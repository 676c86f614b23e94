//! # Voice Relay Server - Main Application Entry Point
//!
//! Starts the Actix-web server that relays browser voice sessions to
//! per-session speech engine subprocesses.
//!
//! ## Startup:
//! 1. **Loads `.env`**, then configuration (defaults, `config.toml`, `APP_*`)
//! 2. **Sets up tracing**
//! 3. **Creates shared state**: config, relay counters, parked sessions
//! 4. **Starts the idle reaper** when `relay.detached_idle_timeout_secs` is set
//! 5. **Serves** health, metrics, config and `/ws/voice` until SIGINT/SIGTERM
//!
//! ## Shutdown:
//! The server stops accepting connections, then every parked engine is killed.
//! Engines still bound to a connection die with their handle.

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use sim_voice_backend::config::AppConfig;
use sim_voice_backend::state::AppState;
use sim_voice_backend::{handlers, health, websocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        command = %config.engine.command,
        max_sessions = config.relay.max_concurrent_sessions,
        require_token = config.relay.require_token,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers()?;

    if let Some(secs) = config.relay.detached_idle_timeout_secs {
        info!("Reaping parked sessions idle for more than {}s", secs);
        tokio::spawn(websocket::run_idle_reaper(app_state.clone(), Duration::from_secs(secs)));
    }

    info!("Starting HTTP server on {}", bind_addr);

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
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/voice", web::get().to(websocket::voice_websocket))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    let stopped = app_state.sessions.stop_all();
    info!(stopped, "Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` wins; otherwise relay debug logs and actix info logs.
/// Engine stderr is logged under the `engine` target.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sim_voice_backend=debug,engine=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

#[cfg(unix)]
fn setup_signal_handlers() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers() -> Result<()> {
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C");
            SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
        }
    });
    Ok(())
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
