//! # Call Translation Bridge
//!
//! Bridges two telephone calls through a speech-translation service. A
//! client calls in; the bridge dials the operator, and once both legs
//! stream audio each side hears the other translated into its own language
//! while observer pages follow live transcripts.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **audio**: mu-law codec, resampling, mixing, frame chunking
//! - **pool**: worker-thread pools that run the audio transforms off the
//!   async runtime
//! - **call**: call sessions, their registry, telephony REST client and the
//!   per-leg coordinator
//! - **translation**: the translation service protocol and client
//! - **bridge**: the per-leg relay loop between telephony and translation
//! - **transcript**: transcript fan-out to observers
//! - **websocket / handlers / health**: the HTTP and websocket surface
//! - **error / state**: error taxonomy and shared application state
//!
//! ## Shutdown:
//! SIGINT or SIGTERM stop the HTTP server gracefully; the offload pools are
//! closed afterwards so no transform outlives the server.

mod audio;
mod bridge;
mod call;
mod config;
mod error;
mod handlers;
mod health;
mod pool;
mod state;
mod transcript;
mod translation;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::config::AppConfig;
use crate::state::AppState;
use tracing::{debug, error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting call-translation-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Listening on {}:{}, public host {}",
        config.server.host, config.server.port, config.server.public_host
    );
    debug!(config = %config.redacted(), "effective configuration");

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = web::Data::new(AppState::new(config)?);
    let server_state = app_state.clone();

    let server = HttpServer::new(move || {
        // Transcript observers are browser pages on other origins
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(server_state.clone())
            .wrap(cors)
            .wrap(TracingLogger::default())
            .route("/twiml/client", web::post().to(handlers::incoming_call))
            .route("/voice/callback/{session_id}", web::post().to(handlers::status_callback))
            .route("/voice/{role}/{session_id}", web::get().to(websocket::media_stream))
            .route("/transcriptions", web::get().to(websocket::transcription_stream))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/config", web::get().to(handlers::get_config)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .disable_signals()
    .shutdown_timeout(10)
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
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    app_state.pools.close_all().await;
    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls the filter; the default keeps this crate at debug.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_translation_bridge=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received SIGINT");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}
