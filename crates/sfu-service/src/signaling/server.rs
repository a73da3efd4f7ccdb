//! WebSocket signaling listener.

use super::connection::serve_connection;
use crate::errors::SfuError;
use crate::registry::RegistryActorHandle;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Accepts WebSocket upgrades on a single fixed path.
pub struct SignalingServer {
    listener: TcpListener,
    registry: RegistryActorHandle,
    path: String,
}

impl SignalingServer {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns [`SfuError::Io`] if the address cannot be bound.
    pub async fn bind(
        addr: &str,
        path: impl Into<String>,
        registry: RegistryActorHandle,
    ) -> Result<Self, SfuError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SfuError::Io(format!("failed to bind signaling listener to {addr}: {e}")))?;
        Ok(Self::from_listener(listener, path, registry))
    }

    /// Wrap an already-bound listener.
    #[must_use]
    pub fn from_listener(
        listener: TcpListener,
        path: impl Into<String>,
        registry: RegistryActorHandle,
    ) -> Self {
        Self {
            listener,
            registry,
            path: path.into(),
        }
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns [`SfuError::Io`] if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, SfuError> {
        self.listener
            .local_addr()
            .map_err(|e| SfuError::Io(format!("failed to read local address: {e}")))
    }

    /// Accept connections until `cancel` fires. Each connection runs on its
    /// own task with a child token.
    #[instrument(skip_all, name = "sfu.signaling.server", fields(path = %self.path))]
    pub async fn run(self, cancel: CancellationToken) {
        info!(target: "sfu.signaling", path = %self.path, "Signaling server accepting");

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!(target: "sfu.signaling", "Signaling server shutting down");
                    break;
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let registry = self.registry.clone();
                            let path = self.path.clone();
                            let token = cancel.child_token();
                            tokio::spawn(async move {
                                accept_connection(stream, peer, path, registry, token).await;
                            });
                        }
                        Err(e) => {
                            warn!(target: "sfu.signaling", error = %e, "Accept failed");
                        }
                    }
                }
            }
        }
    }
}

async fn accept_connection(
    stream: TcpStream,
    peer: SocketAddr,
    path: String,
    registry: RegistryActorHandle,
    cancel: CancellationToken,
) {
    let check_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if request.uri().path() == path {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(Some("Not Found".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, check_path).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(target: "sfu.signaling", peer = %peer, error = %e, "WebSocket handshake rejected");
            return;
        }
    };

    if let Err(e) = serve_connection(ws, peer, registry, cancel).await {
        error!(target: "sfu.signaling", peer = %peer, error = %e, "Connection failed");
    }
}
