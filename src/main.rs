//! # Visual Translator Service
//!
//! Boots the HTTP/WebSocket server around the pipeline core:
//! 1. Load `.env`, set up tracing, load and validate configuration
//! 2. Build shared state (model registry, result cache, session manager)
//!    and restore the cache snapshot
//! 3. Serve until SIGINT/SIGTERM, then end all camera sessions and persist
//!    the cache snapshot

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use visual_translator_core::config::AppConfig;
use visual_translator_core::state::AppState;
use visual_translator_core::{handlers, health, middleware, websocket};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        target_language = %config.pipeline.target_language,
        model_store = %config.models.store_dir,
        "Configuration loaded"
    );

    let app_state = AppState::new(config.clone())?;
    if let Err(err) = app_state.restore_cache().await {
        warn!("Starting with a cold cache: {:#}", err);
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
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
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/models", web::get().to(handlers::list_models))
                    .route("/models/load", web::post().to(handlers::load_model))
                    .route("/cache", web::get().to(handlers::cache_stats))
                    .route("/languages", web::get().to(handlers::list_languages))
                    .route("/translate", web::post().to(handlers::translate_text))
                    .route("/summarize", web::post().to(handlers::summarize_text)),
            )
            .route("/ws/camera", web::get().to(websocket::camera_websocket))
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
        signal = wait_for_shutdown() => {
            match signal {
                Ok(name) => info!("Received {}, stopping server...", name),
                Err(e) => error!("Signal handling failed, stopping server: {}", e),
            }
            server_handle.stop(true).await;
        }
    }

    if let Err(err) = app_state.shutdown().await {
        error!("Shutdown incomplete: {:#}", err);
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "visual_translator_core=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves with the name of the first SIGTERM/SIGINT received.
#[cfg(unix)]
async fn wait_for_shutdown() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl-C")
}
