//! One WebSocket signaling connection.
//!
//! Frames are read and handled strictly in arrival order. Replies and pushes
//! share one bounded outbound queue drained by a writer task, so the registry
//! never waits on a slow socket.

use super::handler::SignalingHandler;
use crate::errors::SfuError;
use crate::observability::metrics;
use crate::registry::RegistryActorHandle;
use futures::{SinkExt, StreamExt};
use signaling_protocol::codec::encode_response;
use signaling_protocol::Response;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Outbound frames buffered per connection before pushes are dropped.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 128;

/// How long the writer may keep flushing after the read side has finished.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Serve an upgraded WebSocket until the peer closes it or `cancel` fires.
///
/// Registry cleanup for the connection has completed when this returns.
#[instrument(skip_all, name = "sfu.signaling.connection", fields(peer = %peer))]
pub async fn serve_connection<S>(
    ws: WebSocketStream<S>,
    peer: SocketAddr,
    registry: RegistryActorHandle,
    cancel: CancellationToken,
) -> Result<(), SfuError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = sink.send(Message::Text(frame)).await {
                debug!(target: "sfu.signaling", error = %e, "WebSocket send failed");
                return;
            }
        }
        let _ = sink.close().await;
    });
    let writer_abort = writer.abort_handle();

    let connection_id = registry.bind_connection(outbound_tx.clone()).await?;
    let handler = SignalingHandler::new(registry.clone(), connection_id);
    metrics::connection_opened();
    info!(target: "sfu.signaling", connection_id = %connection_id, "Connection opened");

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(target: "sfu.signaling", connection_id = %connection_id, "Connection cancelled");
                break;
            }

            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handler.handle_frame(&text, &outbound_tx).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let response = Response::error("MALFORMED", "Binary frames are not supported");
                        if let Ok(frame) = encode_response(None, &response) {
                            let _ = outbound_tx.send(frame).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // Ping/pong are answered by tungstenite.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(
                            target: "sfu.signaling",
                            connection_id = %connection_id,
                            error = %e,
                            "WebSocket read failed"
                        );
                        break;
                    }
                }
            }
        }
    }

    // Other peers hear PRODUCER_CLOSED before this returns.
    if let Err(e) = registry.disconnect(connection_id).await {
        warn!(
            target: "sfu.signaling",
            connection_id = %connection_id,
            error = %e,
            "Registry cleanup failed"
        );
    }
    metrics::connection_closed();

    drop(handler);
    drop(outbound_tx);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        writer_abort.abort();
    }

    info!(target: "sfu.signaling", connection_id = %connection_id, "Connection closed");
    Ok(())
}
