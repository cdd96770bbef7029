//! Process entrypoint (spec §6): wires `DispatchCore` to its collaborator
//! backends, rebuilds in-flight timers, starts the background sweeper and
//! cache-eviction loops, and serves the HTTP surface until a shutdown
//! signal arrives.
//!
//! Router/listener shape grounded on `adamtc007-ob-poc/rust/src/bin/dsl_api.rs`
//! (`Router::new().route(...).with_state(state)` + `TcpListener::bind` +
//! `axum::serve`), adapted to carry an `Arc<DispatchCore>` as state instead
//! of a database pool, and to shut down cooperatively via a
//! `CancellationToken` rather than running forever.

mod routes;
mod transports;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use dispatch_core::config::Config;
use dispatch_core::core::DispatchCore;
use dispatch_core::sweeper;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();
    let route_backend = transports::build_route_backend(&config.routing);
    let device_transport = Box::new(transports::LoggingDeviceTransport);
    let core = DispatchCore::new(config, route_backend, device_transport);

    info!("connecting device channel");
    core.device.reconnect().await;

    info!("rebuilding in-flight timers after restart");
    DispatchCore::rebuild_timers_on_startup(&core).await;

    let cancel = CancellationToken::new();
    let sweeper_handle = sweeper::spawn_loop(core.clone(), cancel.clone());
    let cache_sweep_handle = spawn_cache_sweep_loop(core.clone(), cancel.clone());

    let app = Router::new()
        .route("/healthz", get(routes::healthz))
        .route("/faults", post(routes::create_fault))
        .route("/dispatch/run", post(routes::run_dispatch))
        .route("/gps", post(routes::post_gps))
        .route("/routes/calculate", get(routes::calculate_route))
        .with_state(core);

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await.expect("failed to bind HTTP listener");
    info!(%addr, "dispatch server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .expect("HTTP server failed");

    cancel.cancel();
    let _ = sweeper_handle.await;
    let _ = cache_sweep_handle.await;
}

fn spawn_cache_sweep_loop(core: Arc<DispatchCore>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CACHE_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    core.cache.sweep_expired();
                }
                _ = cancel.cancelled() => break,
            }
        }
    })
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received, draining in-flight work");
    cancel.cancel();
}
