use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use scenesync::axum::{redirect_router, router, spawn_tick_loop, RelayState};
use scenesync::{RelayConfig, SessionRegistry};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "persistence")]
use scenesync::{PersistenceManager, RoomArchive};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RelayConfig::load();
    info!("Starting scene relay with {:?}", config);

    #[allow(unused_mut)]
    let mut registry = SessionRegistry::new().with_idle_ttl(config.room_idle);

    #[cfg(feature = "persistence")]
    if let Some(path) = &config.storage_path {
        let archive = RoomArchive::new(path);
        archive.prepare().await?;
        info!("Archiving rooms under {}", path.display());
        registry = registry.with_archive(archive);
    }

    let registry = Arc::new(registry);

    #[cfg(feature = "persistence")]
    let mut persistence = config.storage_path.as_ref().map(|_| {
        let mut manager = PersistenceManager::new(registry.clone());
        manager.set_check_interval(config.persist_interval);
        manager.start();
        manager
    });

    let ticker = spawn_tick_loop(registry.clone(), config.tick_interval());
    let mut state = RelayState::new(registry.clone());
    if let Some(public) = &config.public_path {
        info!("Serving client files from {}", public.display());
        state = state.with_public_path(public);
    }
    let app = router(state);

    match config.tls() {
        Some((cert, key)) => {
            let tls = RustlsConfig::from_pem_file(cert, key).await?;
            let handle = Handle::new();
            tokio::spawn(shutdown_on_ctrl_c(handle.clone()));

            let redirect = axum_server::bind(config.http_addr())
                .handle(handle.clone())
                .serve(redirect_router(config.port_https).into_make_service());
            tokio::spawn(async move {
                if let Err(e) = redirect.await {
                    tracing::error!("Redirect listener failed: {}", e);
                }
            });

            info!("Relay listening on wss://{}", config.https_addr());
            info!("Redirecting http://{} to HTTPS", config.http_addr());
            axum_server::bind_rustls(config.https_addr(), tls)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            let listener = TcpListener::bind(config.http_addr()).await?;
            info!("Relay listening on ws://{}", config.http_addr());
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
        }
    }

    info!("Shutting down relay");
    ticker.abort();
    #[cfg(feature = "persistence")]
    if let Some(manager) = persistence.as_mut() {
        manager.stop().await;
    }
    registry.teardown().await;

    Ok(())
}

async fn shutdown_on_ctrl_c(handle: Handle) {
    let _ = tokio::signal::ctrl_c().await;
    handle.graceful_shutdown(Some(Duration::from_secs(5)));
}
