//! Per-frame request handling.
//!
//! Each text frame is validated in stages before anything touches the
//! registry: envelope, room id, typed payload, participant id. Any failure
//! becomes an `ERROR` response that echoes the request id when one could be
//! read. The connection stays open either way.

use crate::errors::SfuError;
use crate::observability::metrics;
use crate::registry::{ConnectionId, RegistryActorHandle, RequestContext};
use serde_json::Value;
use signaling_protocol::codec::{decode_envelope, decode_payload, encode_response};
use signaling_protocol::rtp::TransportDirection;
use signaling_protocol::{Envelope, Request, Response};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Metrics label for frames whose type could not be determined.
const UNKNOWN_TYPE_LABEL: &str = "UNKNOWN";

/// Result of handling one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Encoded response frame.
    pub frame: String,
    /// Whether existing producers should be announced after the reply.
    pub announce_existing: bool,
}

/// Handles requests arriving on one connection.
#[derive(Clone)]
pub struct SignalingHandler {
    registry: RegistryActorHandle,
    connection_id: ConnectionId,
}

impl SignalingHandler {
    #[must_use]
    pub fn new(registry: RegistryActorHandle, connection_id: ConnectionId) -> Self {
        Self {
            registry,
            connection_id,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Handle a frame and queue the reply, followed by any late-joiner
    /// announcements.
    pub async fn handle_frame(&self, text: &str, outbound: &mpsc::Sender<String>) {
        let Some(reply) = self.process(text).await else {
            return;
        };
        if outbound.send(reply.frame).await.is_err() {
            debug!(
                target: "sfu.signaling",
                connection_id = %self.connection_id,
                "Outbound queue closed before reply"
            );
            return;
        }
        if reply.announce_existing {
            if let Err(e) = self.registry.announce_existing(self.connection_id).await {
                warn!(
                    target: "sfu.signaling",
                    connection_id = %self.connection_id,
                    error = %e,
                    "Failed to announce existing producers"
                );
            }
        }
    }

    /// Decode, dispatch and encode one frame.
    ///
    /// Returns `None` only if the reply itself could not be encoded.
    pub async fn process(&self, text: &str) -> Option<Reply> {
        let started = Instant::now();

        let (envelope, value) = match decode_envelope(text) {
            Ok(parts) => parts,
            Err(e) => {
                let err = SfuError::from(e);
                metrics::record_signaling_request(
                    UNKNOWN_TYPE_LABEL,
                    err.error_code(),
                    started.elapsed(),
                );
                return self.error_reply(&Envelope::default(), &err);
            }
        };

        let request_type = type_label(&envelope);
        let result = self.dispatch(&envelope, value).await;
        let status = match &result {
            Ok(_) => "success",
            Err(e) => e.error_code(),
        };
        metrics::record_signaling_request(request_type, status, started.elapsed());

        match result {
            Ok((response, announce_existing)) => {
                match encode_response(envelope.request_id.as_ref(), &response) {
                    Ok(frame) => Some(Reply {
                        frame,
                        announce_existing,
                    }),
                    Err(e) => {
                        warn!(
                            target: "sfu.signaling",
                            connection_id = %self.connection_id,
                            error = %e,
                            "Failed to encode response"
                        );
                        self.error_reply(&envelope, &SfuError::Internal(e.to_string()))
                    }
                }
            }
            Err(err) => self.error_reply(&envelope, &err),
        }
    }

    async fn dispatch(
        &self,
        envelope: &Envelope,
        value: Value,
    ) -> Result<(Response, bool), SfuError> {
        let room_id = envelope
            .room_id
            .clone()
            .filter(|room| !room.is_blank())
            .ok_or(SfuError::MissingRoomId)?;

        let request = decode_payload(envelope, value)?;

        let participant_id = envelope
            .participant_id
            .clone()
            .filter(|p| !p.as_str().trim().is_empty());
        if request.requires_participant() && participant_id.is_none() {
            return Err(SfuError::MissingParticipantId);
        }

        let ctx = RequestContext::new(self.connection_id, room_id, participant_id);
        let registry = &self.registry;

        match request {
            Request::CapabilitiesRequest => Ok((registry.capabilities(ctx).await?, false)),
            Request::CreateTransport { direction } => {
                let response = registry.create_transport(ctx, direction).await?;
                Ok((response, direction == TransportDirection::Recv))
            }
            Request::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => Ok((
                registry
                    .connect_transport(ctx, transport_id, dtls_parameters)
                    .await?,
                false,
            )),
            Request::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => Ok((
                registry
                    .produce(ctx, transport_id, kind, rtp_parameters)
                    .await?,
                false,
            )),
            Request::CloseProducer { producer_id } => {
                Ok((registry.close_producer(ctx, producer_id).await?, false))
            }
            Request::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
            } => Ok((
                registry
                    .consume(ctx, transport_id, producer_id, rtp_capabilities)
                    .await?,
                false,
            )),
            Request::ResumeConsumer { consumer_id } => {
                Ok((registry.resume_consumer(ctx, consumer_id).await?, false))
            }
        }
    }

    fn error_reply(&self, envelope: &Envelope, err: &SfuError) -> Option<Reply> {
        match err {
            SfuError::Engine(_) | SfuError::Internal(_) => warn!(
                target: "sfu.signaling",
                connection_id = %self.connection_id,
                code = err.error_code(),
                error = %err,
                "Request failed"
            ),
            _ => debug!(
                target: "sfu.signaling",
                connection_id = %self.connection_id,
                code = err.error_code(),
                error = %err,
                "Request rejected"
            ),
        }

        let response = Response::error(err.error_code(), err.client_message());
        match encode_response(envelope.request_id.as_ref(), &response) {
            Ok(frame) => Some(Reply {
                frame,
                announce_existing: false,
            }),
            Err(e) => {
                warn!(target: "sfu.signaling", error = %e, "Failed to encode error response");
                None
            }
        }
    }
}

/// Bounded metrics label for the frame's declared type.
fn type_label(envelope: &Envelope) -> &'static str {
    envelope
        .message_type
        .as_deref()
        .and_then(|t| Request::TYPES.iter().copied().find(|known| *known == t))
        .unwrap_or(UNKNOWN_TYPE_LABEL)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::engine::LoopbackEngine;
    use crate::registry::RegistrySettings;
    use serde_json::json;
    use signaling_protocol::codec::decode_server_message;
    use signaling_protocol::ServerMessage;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    async fn handler() -> (SignalingHandler, mpsc::Receiver<String>) {
        let registry = RegistryActorHandle::new(
            Arc::new(LoopbackEngine::new()),
            RegistrySettings::default(),
            CancellationToken::new(),
        );
        let (tx, rx) = mpsc::channel(16);
        let connection_id = registry.bind_connection(tx).await.unwrap();
        (SignalingHandler::new(registry, connection_id), rx)
    }

    async fn reply_for(handler: &SignalingHandler, frame: serde_json::Value) -> ServerMessage {
        let reply = handler.process(&frame.to_string()).await.unwrap();
        decode_server_message(&reply.frame).unwrap()
    }

    fn error_code(message: &ServerMessage) -> (Option<String>, String) {
        match message {
            ServerMessage::Response {
                request_id,
                response: Response::Error { error, .. },
            } => (request_id.as_ref().map(|r| r.as_str().to_string()), error.clone()),
            other => panic!("expected error response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_null_request_id() {
        let (handler, _rx) = handler().await;
        let reply = handler.process("{not json").await.unwrap();
        let message = decode_server_message(&reply.frame).unwrap();
        assert_eq!(error_code(&message), (None, "MALFORMED".to_string()));
    }

    #[tokio::test]
    async fn test_missing_room_id() {
        let (handler, _rx) = handler().await;
        let message = reply_for(
            &handler,
            json!({"type": "CAPABILITIES_REQUEST", "requestId": "q1", "roomId": "  "}),
        )
        .await;
        assert_eq!(
            error_code(&message),
            (Some("q1".to_string()), "NO_ROOM_ID".to_string())
        );
    }

    #[tokio::test]
    async fn test_unknown_type_echoes_request_id() {
        let (handler, _rx) = handler().await;
        let message = reply_for(
            &handler,
            json!({"type": "SHOUT", "requestId": "q2", "roomId": "r1", "participantId": "p"}),
        )
        .await;
        assert_eq!(
            error_code(&message),
            (Some("q2".to_string()), "UNKNOWN_TYPE".to_string())
        );
    }

    #[tokio::test]
    async fn test_wrongly_typed_envelope_fields_echo_request_id() {
        let (handler, _rx) = handler().await;

        let message = reply_for(
            &handler,
            json!({"type": "PRODUCE", "requestId": "q1", "roomId": 5}),
        )
        .await;
        assert_eq!(
            error_code(&message),
            (Some("q1".to_string()), "NO_ROOM_ID".to_string())
        );

        let message = reply_for(
            &handler,
            json!({"type": "CREATE_TRANSPORT", "requestId": "q2", "roomId": "r1",
                   "participantId": ["p"], "direction": "send"}),
        )
        .await;
        assert_eq!(
            error_code(&message),
            (Some("q2".to_string()), "INVALID_PAYLOAD".to_string())
        );
    }

    #[tokio::test]
    async fn test_invalid_payload_for_known_type() {
        let (handler, _rx) = handler().await;
        let message = reply_for(
            &handler,
            json!({"type": "CREATE_TRANSPORT", "requestId": "q3", "roomId": "r1",
                   "participantId": "p", "direction": "sideways"}),
        )
        .await;
        assert_eq!(error_code(&message).1, "INVALID_PAYLOAD");
    }

    #[tokio::test]
    async fn test_participant_required_except_for_capabilities() {
        let (handler, _rx) = handler().await;

        let message = reply_for(
            &handler,
            json!({"type": "CAPABILITIES_REQUEST", "requestId": "q4", "roomId": "r1"}),
        )
        .await;
        assert!(matches!(
            message,
            ServerMessage::Response {
                response: Response::CapabilitiesResponse { .. },
                ..
            }
        ));

        let message = reply_for(
            &handler,
            json!({"type": "CREATE_TRANSPORT", "requestId": "q5", "roomId": "r1",
                   "direction": "send"}),
        )
        .await;
        assert_eq!(error_code(&message).1, "NO_PARTICIPANT_ID");
    }

    #[tokio::test]
    async fn test_recv_transport_requests_announcement() {
        let (handler, _rx) = handler().await;

        let send = handler
            .process(
                &json!({"type": "CREATE_TRANSPORT", "requestId": "s", "roomId": "r1",
                        "participantId": "p", "direction": "send"})
                .to_string(),
            )
            .await
            .unwrap();
        assert!(!send.announce_existing);

        let recv = handler
            .process(
                &json!({"type": "CREATE_TRANSPORT", "requestId": "r", "roomId": "r1",
                        "participantId": "p", "direction": "recv"})
                .to_string(),
            )
            .await
            .unwrap();
        assert!(recv.announce_existing);
    }

    #[tokio::test]
    async fn test_handle_frame_queues_reply() {
        let (handler, _pushes) = handler().await;
        let (tx, mut rx) = mpsc::channel(4);

        handler
            .handle_frame(
                &json!({"type": "RESUME_CONSUMER", "requestId": "q6", "roomId": "r1",
                        "participantId": "p", "consumerId": "missing"})
                .to_string(),
                &tx,
            )
            .await;

        let frame = rx.recv().await.unwrap();
        let message = decode_server_message(&frame).unwrap();
        assert_eq!(
            error_code(&message),
            (Some("q6".to_string()), "CONSUMER_NOT_FOUND".to_string())
        );
    }

    #[test]
    fn test_type_label_is_bounded() {
        let known = Envelope {
            message_type: Some("PRODUCE".to_string()),
            ..Envelope::default()
        };
        let unknown = Envelope {
            message_type: Some("x".repeat(64)),
            ..Envelope::default()
        };
        assert_eq!(type_label(&known), "PRODUCE");
        assert_eq!(type_label(&unknown), UNKNOWN_TYPE_LABEL);
    }
}
