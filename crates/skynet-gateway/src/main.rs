use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info, warn};

mod app;
mod http;
mod stop;

use app::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skynet_gateway=info,tower_http=info".into()),
        )
        .init();

    // Explicit path > SKYNET_CONFIG env > ./skynet.toml (skynet_core::config::BrokerConfig::load).
    let config_path = std::env::var("SKYNET_CONFIG").ok();
    let config = skynet_core::config::BrokerConfig::load(config_path.as_deref())
        .map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))?;

    let host = config.server.host.clone();
    let port = config.server.port;

    let state = AppState::new(config)?;
    state.start().await;

    let router = app::build_router(Arc::clone(&state));

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!(%addr, "skynet-gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await?;

    shutdown_state.shutdown().await;
    info!("skynet-gateway exited cleanly");
    Ok(())
}

/// SIGINT/SIGTERM (and SIGBREAK on Windows) chain onto axum's graceful
/// shutdown (§5): the first signal returns and lets `axum::serve` drain
/// in-flight requests before `AppState::shutdown` runs; a second signal
/// while that drain is in progress kills every registered CLI subprocess
/// and force-exits with code 130, mirroring the source's "second signal
/// forces process exit" behavior.
async fn wait_for_shutdown_signal() {
    first_signal().await;
    warn!("shutdown signal received, draining in-flight requests");

    tokio::spawn(async {
        first_signal().await;
        error!("second shutdown signal received, forcing exit");
        skynet_cli::registry::kill_all_best_effort();
        std::process::exit(130);
    });
}

#[cfg(unix)]
async fn first_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(windows)]
async fn first_signal() {
    let ctrl_break = tokio::signal::windows::ctrl_break();
    match ctrl_break {
        Ok(mut cb) => {
            tokio::select! {
                _ = cb.recv() => {}
                _ = tokio::signal::ctrl_c().await => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
