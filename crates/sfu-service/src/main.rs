//! SFU service
//!
//! # Servers
//!
//! - WebSocket signaling (default: 0.0.0.0:4000, path `/sfu`)
//! - HTTP health and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Install the Prometheus metrics recorder
//! 3. Start the registry actor on the loopback forwarding engine
//! 4. Start the health server
//! 5. Bind and start the signaling server, then report ready
//! 6. Wait for shutdown signal

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sfu_service::config::Config;
use sfu_service::engine::LoopbackEngine;
use sfu_service::observability::{health_router, init_metrics_recorder, HealthState};
use sfu_service::registry::{RegistryActorHandle, RegistrySettings};
use sfu_service::signaling::SignalingServer;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound on waiting for in-flight connections to finish cleanup.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sfu_service=info,sfu=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting SFU service");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        signaling_bind_address = %config.signaling_bind_address,
        signaling_path = %config.signaling_path,
        health_bind_address = %config.health_bind_address,
        listen_ip = %config.listen_ip,
        announced_ip = ?config.announced_ip,
        max_peers_per_room = config.max_peers_per_room,
        max_producers_per_peer = config.max_producers_per_peer,
        "Configuration loaded successfully"
    );

    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let health_state = Arc::new(HealthState::new(config.instance_id.clone()));
    let shutdown_token = CancellationToken::new();

    let registry = RegistryActorHandle::new(
        Arc::new(LoopbackEngine::new()),
        RegistrySettings::from_config(&config),
        // Stopped explicitly after connections have drained.
        CancellationToken::new(),
    );
    info!("Registry actor started");

    // Health server: bind before spawning to fail fast.
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;
    let app = health_router(Arc::clone(&health_state), Some(prometheus_handle))
        .layer(TraceLayer::new_for_http());
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    let health_task = tokio::spawn(async move {
        let server = axum::serve(health_listener, app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });
    info!(addr = %health_addr, "Health server started");

    let signaling = SignalingServer::bind(
        &config.signaling_bind_address,
        config.signaling_path.clone(),
        registry.clone(),
    )
    .await
    .map_err(|e| {
        error!(error = %e, "Failed to start signaling server");
        e
    })?;
    let signaling_addr = signaling.local_addr()?;
    let signaling_task = tokio::spawn(signaling.run(shutdown_token.child_token()));
    info!(addr = %signaling_addr, path = %config.signaling_path, "Signaling server started");

    health_state.set_ready();
    info!("SFU service running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");
    health_state.set_not_ready();

    // Stops the listener and every connection; each runs its own cleanup.
    shutdown_token.cancel();
    if tokio::time::timeout(SHUTDOWN_GRACE, signaling_task).await.is_err() {
        warn!("Signaling server did not stop within grace period");
    }

    if let Err(e) = registry.shutdown().await {
        warn!(error = %e, "Registry shutdown error");
    }
    let _ = health_task.await;

    info!("SFU service shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Without signal handlers the service cannot shut down gracefully"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Without signal handlers the service cannot shut down gracefully"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
