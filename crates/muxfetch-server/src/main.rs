mod config;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::Method;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use muxfetch_engine::{FfmpegMuxer, HttpVariantSource, SessionManager, Storage, YtDlpResolver};

use crate::config::Config;
use crate::routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "muxfetch=debug,muxfetch_engine=debug,muxfetch_gateway=debug,tower_http=debug".into()
            }),
        )
        .init();

    let config = Config::from_env()?;

    let storage = Arc::new(Storage::new(config.work_dir.clone()).await?);
    let purged = storage.purge_orphans().await?;
    if purged > 0 {
        info!("Removed {} leftover files from a previous run", purged);
    }

    let sessions = SessionManager::new(
        config.engine(),
        storage,
        Arc::new(YtDlpResolver::new(config.ytdlp_path.clone())),
        Arc::new(HttpVariantSource::new(reqwest::Client::new())),
        Arc::new(FfmpegMuxer::new(config.ffmpeg_path.clone())),
    );

    // Browser clients read the file name, so it must be exposed.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::any())
        .expose_headers([routes::FILE_NAME_HEADER]);

    let app = routes::router(AppState {
        sessions: sessions.clone(),
    })
    .layer(cors)
    .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Muxfetch listening on {}", addr);
    info!(
        "Merge weight {}, progress every {:?}",
        config.merge_weight, config.progress_interval
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sessions.shutdown().await;
    info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
