//! Gateway service entry point.
//!
//! Arrow-data streaming gateway between browser clients and reverse-
//! tunneled data connectors.

use anyhow::Result;
use external_services::{ControlPlaneClient, RevocationListener};
use gateway::{create_router, AppState, ConnectorRegistry, SessionManager};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Cadence of the edge heartbeat towards the control plane.
const EDGE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Arrow streaming gateway");

    // Read configuration from environment
    let http_port: u16 = env::var("HTTP_PORT")
        .unwrap_or_else(|_| "8081".to_string())
        .parse()
        .expect("HTTP_PORT must be a number");
    let flight_port: u16 = env::var("FLIGHT_PORT")
        .unwrap_or_else(|_| "8815".to_string())
        .parse()
        .expect("FLIGHT_PORT must be a number");
    let metrics_port: u16 = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9093".to_string())
        .parse()
        .expect("METRICS_PORT must be a number");
    let edge_id = env::var("EDGE_ID").ok();

    info!("Configuration:");
    info!("  HTTP_PORT: {}", http_port);
    info!("  FLIGHT_PORT: {}", flight_port);
    info!("  METRICS_PORT: {}", metrics_port);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
        .expect("Failed to start Prometheus exporter");
    info!("Prometheus metrics server started on port {}", metrics_port);

    // Control plane client for session validation
    let control_plane = ControlPlaneClient::from_env()?;
    info!("Control plane URL: {}", control_plane.base_url());

    // Session manager with its expiry sweeper
    let sessions = Arc::new(SessionManager::new(Arc::new(control_plane.clone())));
    let _sweeper = sessions.start_sweeper();

    // Redis subscriber for real-time revocation events. A dead bus
    // only delays revocations; the listener keeps retrying.
    match RevocationListener::from_env() {
        Ok(listener) => {
            let sink = Arc::clone(&sessions);
            tokio::spawn(listener.run(sink));
        }
        Err(e) => {
            warn!("revocation listener not started (revocations delayed): {e}");
        }
    }

    // Edge heartbeat towards the control plane, when this edge has an
    // identity.
    if let Some(edge_id) = edge_id {
        let control_plane = control_plane.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(EDGE_HEARTBEAT_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if let Err(e) = control_plane.edge_heartbeat(&edge_id).await {
                    warn!(%edge_id, "edge heartbeat failed: {e}");
                }
            }
        });
    }

    // Connector registry shared by both tunnel endpoints
    let registry = Arc::new(ConnectorRegistry::from_env());

    let state = Arc::new(AppState {
        sessions,
        registry,
    });

    // gRPC tunnel endpoint for connectors
    let grpc_state = Arc::clone(&state);
    let grpc_handle = tokio::spawn(async move {
        if let Err(e) = gateway::tunnel::grpc::serve(grpc_state, flight_port).await {
            error!("gRPC tunnel server error: {e}");
        }
    });

    // HTTP server: client streams, WebSocket tunnels, health
    let app = create_router(Arc::clone(&state));
    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);
    info!("  Stream:  ws://{}/stream/{{session_id}}", addr);
    info!("  Connect: ws://{}/ws/connect", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    grpc_handle.abort();
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
