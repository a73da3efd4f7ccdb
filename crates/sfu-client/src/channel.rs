//! Signaling channel.
//!
//! One WebSocket per session. Requests carry a fresh request id and wait for
//! the response echoing it; responses may arrive in any order. Frames without
//! a request id are pushes and are handed to the single notification
//! subscriber. When the socket closes every pending request fails with
//! [`ChannelError::Closed`].

use crate::config::ClientConfig;
use crate::errors::ChannelError;
use async_trait::async_trait;
use common::types::{ParticipantId, RequestId, RoomId};
use futures::{future, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use signaling_protocol::codec::{decode_server_message, encode_request};
use signaling_protocol::{Envelope, Push, Request, Response, ServerMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Capacity of the outgoing frame queue.
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

type PendingReply = oneshot::Sender<Result<Response, ChannelError>>;

#[derive(Default)]
struct PendingTable {
    closed: bool,
    waiting: HashMap<RequestId, PendingReply>,
}

/// A connected signaling channel bound to one room and participant.
pub struct SignalingChannel {
    room_id: RoomId,
    participant_id: ParticipantId,
    outbound: mpsc::Sender<String>,
    pending: Arc<Mutex<PendingTable>>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<Push>>>,
    request_timeout: Option<Duration>,
    cancel_token: CancellationToken,
}

impl SignalingChannel {
    /// Build a channel over an already established frame transport.
    ///
    /// `outbound` carries encoded request frames to the socket writer and
    /// `inbound` yields server text frames until the socket closes.
    pub fn spawn<S>(
        outbound: mpsc::Sender<String>,
        inbound: S,
        room_id: RoomId,
        participant_id: ParticipantId,
        request_timeout: Option<Duration>,
    ) -> Self
    where
        S: Stream<Item = String> + Send + Unpin + 'static,
    {
        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();

        tokio::spawn(read_frames(
            inbound,
            Arc::clone(&pending),
            push_tx,
            cancel_token.clone(),
        ));

        Self {
            room_id,
            participant_id,
            outbound,
            pending,
            notifications: Mutex::new(Some(push_rx)),
            request_timeout,
            cancel_token,
        }
    }

    /// Open a WebSocket to `url` and build a channel over it.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Connect`] when the handshake fails.
    #[instrument(skip_all, fields(url = %url, room_id = %room_id))]
    pub async fn connect(
        url: &str,
        room_id: RoomId,
        participant_id: ParticipantId,
        request_timeout: Option<Duration>,
    ) -> Result<Self, ChannelError> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        let (mut sink, stream) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_CAPACITY);
        let channel_cancel = CancellationToken::new();

        let writer_cancel = channel_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = writer_cancel.cancelled() => break,
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = sink.send(Message::Text(frame)).await {
                            debug!(target: "sfu.client.channel", error = %e, "Socket write failed");
                            break;
                        }
                    }
                }
            }
            let _ = sink.close().await;
        });

        let inbound = Box::pin(
            stream
                .take_while(|message| future::ready(message.is_ok()))
                .filter_map(|message| {
                    future::ready(match message {
                        Ok(Message::Text(text)) => Some(text),
                        _ => None,
                    })
                }),
        );

        let channel = Self::spawn(
            outbound_tx,
            inbound,
            room_id,
            participant_id,
            request_timeout,
        );
        // Closing the channel also stops the writer.
        let parent = channel.cancel_token.clone();
        tokio::spawn(async move {
            parent.cancelled().await;
            channel_cancel.cancel();
        });

        info!(target: "sfu.client.channel", "Signaling channel connected");
        Ok(channel)
    }

    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    /// Send a request and wait for its correlated response.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Server`] when the server answers with `ERROR`
    /// - [`ChannelError::Closed`] when the socket closes first
    /// - [`ChannelError::Timeout`] when a request timeout is configured and elapses
    pub async fn request(&self, request: Request) -> Result<Response, ChannelError> {
        let request_id = RequestId::generate();
        let envelope = Envelope::new(
            self.room_id.clone(),
            self.participant_id.clone(),
            request_id.clone(),
        );
        let frame = encode_request(&envelope, &request)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return Err(ChannelError::Closed);
            }
            pending.waiting.insert(request_id.clone(), tx);
        }

        debug!(
            target: "sfu.client.channel",
            request_id = %request_id,
            request_type = request.type_name(),
            "Sending request"
        );

        if self.outbound.send(frame).await.is_err() {
            self.pending.lock().waiting.remove(&request_id);
            return Err(ChannelError::Closed);
        }

        let outcome = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.lock().waiting.remove(&request_id);
                    return Err(ChannelError::Timeout(limit));
                }
            },
            None => rx.await,
        };

        let response = outcome.map_err(|_| ChannelError::Closed)??;
        match response {
            Response::Error { error, message } => Err(ChannelError::Server {
                code: error,
                message,
            }),
            other => Ok(other),
        }
    }

    /// Take the push subscription. Only the first caller gets it.
    pub fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<Push>> {
        self.notifications.lock().take()
    }

    /// Number of requests still waiting for a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().waiting.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pending.lock().closed
    }

    /// Close the socket. Pending requests fail with [`ChannelError::Closed`].
    pub fn close(&self) {
        self.cancel_token.cancel();
        fail_pending(&self.pending);
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

fn fail_pending(pending: &Mutex<PendingTable>) {
    let drained: Vec<PendingReply> = {
        let mut table = pending.lock();
        table.closed = true;
        table.waiting.drain().map(|(_, reply)| reply).collect()
    };
    for reply in drained {
        let _ = reply.send(Err(ChannelError::Closed));
    }
}

async fn read_frames<S>(
    mut inbound: S,
    pending: Arc<Mutex<PendingTable>>,
    pushes: mpsc::UnboundedSender<Push>,
    cancel_token: CancellationToken,
) where
    S: Stream<Item = String> + Send + Unpin + 'static,
{
    loop {
        let frame = tokio::select! {
            () = cancel_token.cancelled() => break,
            frame = inbound.next() => frame,
        };
        let Some(frame) = frame else {
            debug!(target: "sfu.client.channel", "Socket closed by server");
            break;
        };

        match decode_server_message(&frame) {
            Ok(ServerMessage::Response {
                request_id: Some(request_id),
                response,
            }) => {
                let waiter = pending.lock().waiting.remove(&request_id);
                match waiter {
                    Some(reply) => {
                        let _ = reply.send(Ok(response));
                    }
                    None => {
                        debug!(
                            target: "sfu.client.channel",
                            request_id = %request_id,
                            "Response for unknown request"
                        );
                    }
                }
            }
            Ok(ServerMessage::Response {
                request_id: None,
                response,
            }) => {
                warn!(
                    target: "sfu.client.channel",
                    response_type = response.type_name(),
                    "Uncorrelated response"
                );
            }
            Ok(ServerMessage::Push(push)) => {
                // Dropped when nobody subscribed.
                let _ = pushes.send(push);
            }
            Err(e) => {
                warn!(target: "sfu.client.channel", error = %e, "Undecodable server frame");
            }
        }
    }

    fail_pending(&pending);
}

/// Opens signaling channels for a session.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(
        &self,
        room_id: &RoomId,
        participant_id: &ParticipantId,
    ) -> Result<SignalingChannel, ChannelError>;
}

/// Connector dialing a fixed WebSocket URL.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    request_timeout: Option<Duration>,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, request_timeout: Option<Duration>) -> Self {
        Self {
            url: url.into(),
            request_timeout,
        }
    }

    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.signaling_url.clone(), config.request_timeout)
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(
        &self,
        room_id: &RoomId,
        participant_id: &ParticipantId,
    ) -> Result<SignalingChannel, ChannelError> {
        SignalingChannel::connect(
            &self.url,
            room_id.clone(),
            participant_id.clone(),
            self.request_timeout,
        )
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use common::types::ProducerId;
    use serde_json::{json, Value};
    use signaling_protocol::rtp::MediaKind;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    struct Harness {
        channel: Arc<SignalingChannel>,
        sent: mpsc::Receiver<String>,
        server: mpsc::UnboundedSender<String>,
    }

    fn harness(timeout: Option<Duration>) -> Harness {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let channel = SignalingChannel::spawn(
            out_tx,
            UnboundedReceiverStream::new(in_rx),
            RoomId::new("r1"),
            ParticipantId::new("alice"),
            timeout,
        );
        Harness {
            channel: Arc::new(channel),
            sent: out_rx,
            server: in_tx,
        }
    }

    fn request_id_of(frame: &str) -> String {
        let value: Value = serde_json::from_str(frame).unwrap();
        value["requestId"].as_str().unwrap().to_string()
    }

    fn produced(request_id: &str, producer: &str) -> String {
        json!({"type": "PRODUCED", "requestId": request_id, "producerId": producer}).to_string()
    }

    fn close_producer(id: &str) -> Request {
        Request::CloseProducer {
            producer_id: ProducerId::new(id),
        }
    }

    #[tokio::test]
    async fn test_request_carries_envelope() {
        let mut h = harness(None);
        let channel = Arc::clone(&h.channel);
        let task = tokio::spawn(async move { channel.request(Request::CapabilitiesRequest).await });

        let frame = h.sent.recv().await.unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "CAPABILITIES_REQUEST");
        assert_eq!(value["roomId"], "r1");
        assert_eq!(value["participantId"], "alice");

        let reply = json!({
            "type": "CAPABILITIES_RESPONSE",
            "requestId": value["requestId"],
            "roomId": "r1",
            "rtpCapabilities": {"codecs": []}
        });
        h.server.send(reply.to_string()).unwrap();

        let response = task.await.unwrap().unwrap();
        assert_eq!(response.type_name(), "CAPABILITIES_RESPONSE");
    }

    #[tokio::test]
    async fn test_responses_in_reverse_order_resolve_their_own_requests() {
        let mut h = harness(None);
        let first = {
            let channel = Arc::clone(&h.channel);
            tokio::spawn(async move { channel.request(close_producer("p1")).await })
        };
        let first_id = request_id_of(&h.sent.recv().await.unwrap());
        let second = {
            let channel = Arc::clone(&h.channel);
            tokio::spawn(async move { channel.request(close_producer("p2")).await })
        };
        let second_id = request_id_of(&h.sent.recv().await.unwrap());
        assert_ne!(first_id, second_id);

        h.server.send(produced(&second_id, "second")).unwrap();
        h.server.send(produced(&first_id, "first")).unwrap();

        match first.await.unwrap().unwrap() {
            Response::Produced { producer_id } => assert_eq!(producer_id.as_str(), "first"),
            other => panic!("unexpected {other:?}"),
        }
        match second.await.unwrap().unwrap() {
            Response::Produced { producer_id } => assert_eq!(producer_id.as_str(), "second"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.channel.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_error_response_rejects_request() {
        let mut h = harness(None);
        let channel = Arc::clone(&h.channel);
        let task = tokio::spawn(async move { channel.request(close_producer("p1")).await });

        let id = request_id_of(&h.sent.recv().await.unwrap());
        let reply = json!({
            "type": "ERROR",
            "requestId": id,
            "error": "PRODUCER_NOT_FOUND",
            "message": "Producer not found: p1"
        });
        h.server.send(reply.to_string()).unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.server_code(), Some("PRODUCER_NOT_FOUND"));
    }

    #[tokio::test]
    async fn test_close_rejects_pending_requests() {
        let mut h = harness(None);
        let channel = Arc::clone(&h.channel);
        let task = tokio::spawn(async move { channel.request(close_producer("p1")).await });
        h.sent.recv().await.unwrap();

        drop(h.server);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
        assert!(h.channel.is_closed());

        let after = h.channel.request(Request::CapabilitiesRequest).await;
        assert!(matches!(after, Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn test_pushes_delivered_to_subscriber_once() {
        let h = harness(None);
        let mut pushes = h.channel.take_notifications().unwrap();
        assert!(h.channel.take_notifications().is_none());

        let push = json!({
            "type": "NEW_PRODUCER",
            "roomId": "r1",
            "producerId": "p9",
            "participantId": "bob",
            "kind": "video"
        });
        h.server.send(push.to_string()).unwrap();

        match pushes.recv().await.unwrap() {
            Push::NewProducer { kind, producer_id, .. } => {
                assert_eq!(kind, MediaKind::Video);
                assert_eq!(producer_id.as_str(), "p9");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_garbage_frames_are_skipped() {
        let mut h = harness(None);
        let channel = Arc::clone(&h.channel);
        let task = tokio::spawn(async move { channel.request(close_producer("p1")).await });
        let id = request_id_of(&h.sent.recv().await.unwrap());

        h.server.send("not json".to_string()).unwrap();
        h.server
            .send(json!({"type": "ERROR", "requestId": null, "error": "MALFORMED"}).to_string())
            .unwrap();
        h.server.send(produced(&id, "p1")).unwrap();

        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_pending_entry() {
        let mut h = harness(Some(Duration::from_millis(500)));
        let channel = Arc::clone(&h.channel);
        let task = tokio::spawn(async move { channel.request(close_producer("p1")).await });
        h.sent.recv().await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));
        assert_eq!(h.channel.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_explicit_close() {
        let h = harness(None);
        h.channel.close();
        assert!(h.channel.is_closed());
        assert!(matches!(
            h.channel.request(Request::CapabilitiesRequest).await,
            Err(ChannelError::Closed)
        ));
    }
}
