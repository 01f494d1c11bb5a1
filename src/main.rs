use imagecache::{config::CacheSettings, router, trim::spawn_trim_task, AppState};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

/// Image cache server entry point.
///
/// Configuration comes from `IMAGECACHE_*` environment variables (see
/// `CacheSettings::from_env`); a malformed setting aborts startup.
///
/// Other environment variables:
/// - `PORT`: HTTP listen port (default: 8080)
/// - `RUST_LOG`: Logging verbosity (default: "imagecache=debug,tower_http=debug")
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imagecache=debug,tower_http=debug".into()),
        )
        .init();

    let settings = CacheSettings::from_env()?;
    tracing::info!(
        backend = settings.backend.kind(),
        stream = settings.stream_cached_image,
        max_age_days = settings.max_age.as_secs() / 86_400,
        "Starting image cache server"
    );

    let trim = settings.trim_cache.then_some(settings.trim_interval);
    let state = AppState::from_settings(settings).await?;

    let cancel = CancellationToken::new();
    let trim_task = trim.map(|interval| spawn_trim_task(state.cache.clone(), interval, cancel.clone()));

    let app = router(state);

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Server listening on {}", addr);

    let shutdown = cancel.clone();
    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutting down");
        shutdown.cancel();
    })
    .await?;

    cancel.cancel();
    if let Some(task) = trim_task {
        let _ = task.await;
    }
    Ok(())
}
