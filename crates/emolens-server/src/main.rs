mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use emolens_analysis::HttpAnalyzer;
use emolens_api::auth::{AppState, AppStateInner};
use emolens_api::storage::ImageStore;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "emolens=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    if config.has_placeholder_secret() {
        warn!("EMOLENS_JWT_SECRET is unset or a placeholder; sessions are forgeable. Set it before deploying.");
    }

    // Init database, storage and the analyzer client
    let db = emolens_db::Database::open(&config.db_path)?;
    let store = ImageStore::new(config.upload_dir.clone(), config.results_dir.clone()).await?;
    let analyzer = HttpAnalyzer::new(config.analyzer_url.clone(), config.analyzer_timeout)?;
    info!("Emotion analyzer at {}", config.analyzer_url);

    let state: AppState = Arc::new(AppStateInner {
        db,
        store,
        analyzer: Arc::new(analyzer),
        jwt_secret: config.jwt_secret.clone(),
        token_ttl: config.token_ttl,
        secure_cookies: config.secure_cookies,
        display_offset: config.display_offset,
        max_upload_bytes: config.max_upload_bytes,
    });

    let app = emolens_api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("emolens listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
