//! Wire-level signaling client.
//!
//! Sends hand-built JSON frames and reads raw server frames. Pushes that
//! arrive while waiting for a response are buffered so they can be asserted
//! on afterwards.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use signaling_protocol::rtp::MediaKind;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::fixtures::{client_dtls_json, produce_payload, router_capabilities_json};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long `request` waits for its response.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_REQUEST: AtomicU64 = AtomicU64::new(1);

/// Raw JSON signaling client.
pub struct RawSignalingClient {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    pushes: VecDeque<Value>,
}

/// Transports and producers set up for one participant.
#[derive(Debug, Clone, Default)]
pub struct ParticipantSetup {
    pub send_transport_id: String,
    pub recv_transport_id: String,
    pub producer_ids: Vec<String>,
}

impl RawSignalingClient {
    /// Connect to a signaling URL.
    pub async fn connect(url: &str) -> Result<Self, anyhow::Error> {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to {}: {}", url, e))?;
        let (sink, stream) = ws.split();
        Ok(Self {
            sink,
            stream,
            pushes: VecDeque::new(),
        })
    }

    /// Send a raw text frame.
    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), anyhow::Error> {
        self.sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Send a binary frame.
    pub async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), anyhow::Error> {
        self.sink.send(Message::Binary(bytes)).await?;
        Ok(())
    }

    pub async fn send_json(&mut self, value: &Value) -> Result<(), anyhow::Error> {
        self.send_text(value.to_string()).await
    }

    /// Next text frame within `wait`, parsed as JSON. `None` on timeout or close.
    pub async fn next_frame(&mut self, wait: Duration) -> Option<Value> {
        loop {
            let message = tokio::time::timeout(wait, self.stream.next()).await.ok()??;
            match message {
                Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    /// Send a request and wait for the response echoing its request id.
    ///
    /// `participant` is omitted from the frame when `None`. `payload` must be
    /// a JSON object; its fields are merged into the envelope.
    pub async fn request(
        &mut self,
        room: &str,
        participant: Option<&str>,
        message_type: &str,
        payload: Value,
    ) -> Result<Value, anyhow::Error> {
        let request_id = format!("req-{}", NEXT_REQUEST.fetch_add(1, Ordering::Relaxed));
        let mut frame = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => anyhow::bail!("payload must be an object, got {}", other),
        };
        frame.insert("type".to_string(), json!(message_type));
        frame.insert("roomId".to_string(), json!(room));
        frame.insert("requestId".to_string(), json!(request_id));
        if let Some(participant) = participant {
            frame.insert("participantId".to_string(), json!(participant));
        }
        self.send_json(&Value::Object(frame)).await?;
        self.wait_for_response(&request_id).await
    }

    /// Read frames until the response for `request_id`, buffering pushes.
    pub async fn wait_for_response(&mut self, request_id: &str) -> Result<Value, anyhow::Error> {
        let deadline = tokio::time::Instant::now() + RESPONSE_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let frame = self
                .next_frame(remaining)
                .await
                .ok_or_else(|| anyhow::anyhow!("no response for {}", request_id))?;
            match frame.get("requestId") {
                Some(id) if id == request_id => return Ok(frame),
                Some(_) => continue,
                None => self.pushes.push_back(frame),
            }
        }
    }

    /// Next push, from the buffer or the socket.
    pub async fn next_push(&mut self, wait: Duration) -> Option<Value> {
        if let Some(push) = self.pushes.pop_front() {
            return Some(push);
        }
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let frame = self.next_frame(remaining).await?;
            if frame.get("requestId").is_none() {
                return Some(frame);
            }
        }
    }

    /// Every push that arrives within `window`, buffered ones first.
    pub async fn collect_pushes(&mut self, window: Duration) -> Vec<Value> {
        let mut collected: Vec<Value> = self.pushes.drain(..).collect();
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.next_frame(remaining).await {
                Some(frame) if frame.get("requestId").is_none() => collected.push(frame),
                Some(_) => continue,
                None => break,
            }
        }
        collected
    }

    /// Create a transport and return its id.
    pub async fn create_transport(
        &mut self,
        room: &str,
        participant: &str,
        direction: &str,
    ) -> Result<String, anyhow::Error> {
        let response = self
            .request(
                room,
                Some(participant),
                "CREATE_TRANSPORT",
                json!({ "direction": direction }),
            )
            .await?;
        anyhow::ensure!(
            response["type"] == "TRANSPORT_CREATED",
            "unexpected response: {}",
            response
        );
        response["params"]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("transport id missing: {}", response))
    }

    pub async fn connect_transport(
        &mut self,
        room: &str,
        participant: &str,
        transport_id: &str,
    ) -> Result<Value, anyhow::Error> {
        self.request(
            room,
            Some(participant),
            "CONNECT_TRANSPORT",
            json!({ "transportId": transport_id, "dtlsParameters": client_dtls_json() }),
        )
        .await
    }

    /// Produce `kind` on `transport_id` and return the producer id.
    pub async fn produce(
        &mut self,
        room: &str,
        participant: &str,
        transport_id: &str,
        kind: MediaKind,
    ) -> Result<String, anyhow::Error> {
        let response = self
            .request(
                room,
                Some(participant),
                "PRODUCE",
                produce_payload(transport_id, kind),
            )
            .await?;
        anyhow::ensure!(
            response["type"] == "PRODUCED",
            "unexpected response: {}",
            response
        );
        response["producerId"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("producer id missing: {}", response))
    }

    pub async fn consume(
        &mut self,
        room: &str,
        participant: &str,
        transport_id: &str,
        producer_id: &str,
    ) -> Result<Value, anyhow::Error> {
        self.request(
            room,
            Some(participant),
            "CONSUME",
            json!({
                "transportId": transport_id,
                "producerId": producer_id,
                "rtpCapabilities": router_capabilities_json(),
            }),
        )
        .await
    }

    /// Create and connect both transports, then produce each of `kinds`.
    pub async fn join_and_produce(
        &mut self,
        room: &str,
        participant: &str,
        kinds: &[MediaKind],
    ) -> Result<ParticipantSetup, anyhow::Error> {
        let send_transport_id = self.create_transport(room, participant, "send").await?;
        self.connect_transport(room, participant, &send_transport_id)
            .await?;
        let recv_transport_id = self.create_transport(room, participant, "recv").await?;
        self.connect_transport(room, participant, &recv_transport_id)
            .await?;

        let mut producer_ids = Vec::with_capacity(kinds.len());
        for kind in kinds {
            producer_ids.push(
                self.produce(room, participant, &send_transport_id, *kind)
                    .await?,
            );
        }

        Ok(ParticipantSetup {
            send_transport_id,
            recv_transport_id,
            producer_ids,
        })
    }

    /// Close the socket.
    pub async fn close(mut self) {
        let _ = self.sink.close().await;
    }
}
