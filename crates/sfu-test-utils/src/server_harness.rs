//! Test server harness for end-to-end testing
//!
//! Provides `TestSfuServer` for spawning real signaling servers in tests.

use sfu_service::config::DEFAULT_SIGNALING_PATH;
use sfu_service::engine::{EngineStats, LoopbackEngine};
use sfu_service::registry::{RegistryActorHandle, RegistrySettings};
use sfu_service::signaling::SignalingServer;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Test harness for spawning an SFU signaling server in tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_capabilities() -> anyhow::Result<()> {
///     let server = TestSfuServer::spawn().await?;
///     let mut client = RawSignalingClient::connect(&server.url()).await?;
///     // ...
///     Ok(())
/// }
/// ```
pub struct TestSfuServer {
    addr: SocketAddr,
    path: String,
    engine: LoopbackEngine,
    registry: RegistryActorHandle,
    cancel_token: CancellationToken,
    _handle: JoinHandle<()>,
}

impl TestSfuServer {
    /// Spawn a server with default settings (no caps).
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with(RegistrySettings::default()).await
    }

    /// Spawn a server with custom registry settings.
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Serve the default signaling path
    /// - Use an in-process loopback engine
    pub async fn spawn_with(settings: RegistrySettings) -> Result<Self, anyhow::Error> {
        let engine = LoopbackEngine::new();
        let registry = RegistryActorHandle::new(
            Arc::new(engine.clone()),
            settings,
            CancellationToken::new(),
        );

        let server = SignalingServer::bind("127.0.0.1:0", DEFAULT_SIGNALING_PATH, registry.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;
        let addr = server
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(server.run(cancel_token.clone()));

        Ok(Self {
            addr,
            path: DEFAULT_SIGNALING_PATH.to_string(),
            engine,
            registry,
            cancel_token,
            _handle: handle,
        })
    }

    /// WebSocket URL of the signaling endpoint.
    pub fn url(&self) -> String {
        self.url_for_path(&self.path)
    }

    /// WebSocket URL for an arbitrary path on the same listener.
    pub fn url_for_path(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Registry behind the server, for inspecting rooms.
    pub fn registry(&self) -> &RegistryActorHandle {
        &self.registry
    }

    /// Engine behind the server, for failure injection.
    pub fn engine(&self) -> &LoopbackEngine {
        &self.engine
    }

    /// Counts of open engine objects.
    pub fn engine_stats(&self) -> EngineStats {
        self.engine.stats()
    }

    /// Number of rooms currently registered.
    pub async fn room_count(&self) -> usize {
        self.registry.room_count().await.unwrap()
    }
}

impl Drop for TestSfuServer {
    fn drop(&mut self) {
        // Stop accepting, stop the registry, and abort the accept loop so
        // nothing outlives the test.
        self.cancel_token.cancel();
        self.registry.cancel();
        self._handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw_client::RawSignalingClient;
    use serde_json::json;

    #[tokio::test]
    async fn test_server_spawns_successfully() -> Result<(), anyhow::Error> {
        let server = TestSfuServer::spawn().await?;

        assert!(server.url().starts_with("ws://127.0.0.1:"));
        assert!(server.url().ends_with(DEFAULT_SIGNALING_PATH));
        assert!(server.addr().ip().is_loopback());
        assert!(server.addr().port() > 0);

        let mut client = RawSignalingClient::connect(&server.url()).await?;
        let response = client
            .request("r1", None, "CAPABILITIES_REQUEST", json!({}))
            .await?;
        assert_eq!(response["type"], "CAPABILITIES_RESPONSE");
        assert_eq!(server.room_count().await, 1);
        assert_eq!(server.engine_stats().routers, 1);

        Ok(())
    }
}
