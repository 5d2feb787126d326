//! HTTP server setup and lifecycle.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use tokio::signal;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::background::BackgroundTasks;
use crate::config::Config;
use crate::gateway::Gateway;
use crate::handlers;
use crate::session::FileSessionStore;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

// ============================================================================
// Server Setup
// ============================================================================

pub fn build_app(state: AppState, request_timeout_seconds: u64) -> Router {
    let api_v1 = Router::new()
        .route("/connections", post(handlers::create_connection))
        .route("/connections/{id}", delete(handlers::delete_connection))
        .route("/requests", post(handlers::submit_request))
        .route("/sessions", get(handlers::list_sessions))
        .route("/diagnostics", get(handlers::diagnostics))
        .with_state(state.clone())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(request_timeout_seconds),
        ));

    Router::new()
        .route("/livez", get(handlers::livez))
        .route("/readyz", get(handlers::readyz))
        .route("/version", get(handlers::version))
        .nest("/v1", api_v1)
        .with_state(state)
}

/// Run the gateway until a shutdown signal arrives.
pub async fn serve(config: Config) -> Result<()> {
    let store = Arc::new(FileSessionStore::new(config.session.path.clone()));
    let gateway = Arc::new(Gateway::new(&config, store));

    let recovered = gateway.recover().await?;
    info!(recovered, "Session recovery complete");

    // Periodic housekeeping: scope leak reports, idle scope collection and
    // coalescer eviction on one cadence, session sweeping on its own.
    let background = BackgroundTasks::new();
    {
        let gateway = gateway.clone();
        background.spawn_periodic("maintenance", Duration::from_secs(30), move || {
            let gateway = gateway.clone();
            async move { gateway.maintenance_pass() }
        });
    }
    {
        let gateway = gateway.clone();
        background.spawn_periodic(
            "session-sweep",
            config.session.cleanup_interval(),
            move || {
                let gateway = gateway.clone();
                async move {
                    gateway.sweep_sessions().await;
                }
            },
        );
    }

    let state = AppState { gateway };
    let app = build_app(state, config.server.request_timeout_seconds);

    let ip: IpAddr = config
        .server
        .host
        .parse()
        .with_context(|| format!("invalid bind host '{}'", config.server.host))?;
    let addr = SocketAddr::new(ip, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(addr = %addr, "Starting server");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    background.shutdown().await;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
