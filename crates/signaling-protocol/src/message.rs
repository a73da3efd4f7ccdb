//! Signaling message types.
//!
//! Every frame is a JSON object discriminated by its `type` field. Requests
//! additionally carry the envelope fields `roomId`, `participantId`, and
//! `requestId`; responses echo `requestId`; pushes carry `roomId` and never a
//! `requestId`.

use crate::rtp::{
    DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, TransportDirection, TransportParams,
};
use common::types::{ConsumerId, ParticipantId, ProducerId, RequestId, RoomId, TransportId};
use serde::{Deserialize, Serialize};

/// Envelope fields shared by every client request.
///
/// Parsed leniently before the typed payload so that errors can still echo
/// the request id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type", default, skip_serializing)]
    pub message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

impl Envelope {
    /// Build an envelope for an outgoing request.
    #[must_use]
    pub fn new(room_id: RoomId, participant_id: ParticipantId, request_id: RequestId) -> Self {
        Self {
            message_type: None,
            room_id: Some(room_id),
            participant_id: Some(participant_id),
            request_id: Some(request_id),
        }
    }
}

/// Client to server request payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    /// Ask for the room router's codec capabilities.
    CapabilitiesRequest,

    /// Create a WebRTC transport for the sender.
    #[serde(rename_all = "camelCase")]
    CreateTransport { direction: TransportDirection },

    /// Finish the transport's DTLS handshake.
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },

    /// Publish a track on a send transport.
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    /// Close one of the sender's producers.
    #[serde(rename_all = "camelCase")]
    CloseProducer { producer_id: ProducerId },

    /// Subscribe to a remote producer on a recv transport.
    #[serde(rename_all = "camelCase")]
    Consume {
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },

    /// Start media flow on a paused consumer.
    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: ConsumerId },
}

impl Request {
    /// Every request type the server understands.
    pub const TYPES: &'static [&'static str] = &[
        "CAPABILITIES_REQUEST",
        "CREATE_TRANSPORT",
        "CONNECT_TRANSPORT",
        "PRODUCE",
        "CLOSE_PRODUCER",
        "CONSUME",
        "RESUME_CONSUMER",
    ];

    /// Wire name of this request. Also used as a bounded metrics label.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::CapabilitiesRequest => "CAPABILITIES_REQUEST",
            Request::CreateTransport { .. } => "CREATE_TRANSPORT",
            Request::ConnectTransport { .. } => "CONNECT_TRANSPORT",
            Request::Produce { .. } => "PRODUCE",
            Request::CloseProducer { .. } => "CLOSE_PRODUCER",
            Request::Consume { .. } => "CONSUME",
            Request::ResumeConsumer { .. } => "RESUME_CONSUMER",
        }
    }

    /// Whether the request must name a participant.
    ///
    /// Only the capabilities query is answerable with a room id alone.
    #[must_use]
    pub fn requires_participant(&self) -> bool {
        !matches!(self, Request::CapabilitiesRequest)
    }
}

/// Server to client responses, correlated by request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Response {
    #[serde(rename_all = "camelCase")]
    CapabilitiesResponse {
        room_id: RoomId,
        rtp_capabilities: RtpCapabilities,
    },

    #[serde(rename_all = "camelCase")]
    TransportCreated {
        room_id: RoomId,
        direction: TransportDirection,
        params: TransportParams,
    },

    #[serde(rename_all = "camelCase")]
    TransportConnected { transport_id: TransportId },

    #[serde(rename_all = "camelCase")]
    Produced { producer_id: ProducerId },

    #[serde(rename_all = "camelCase")]
    ProducerClosedAck { producer_id: ProducerId },

    #[serde(rename_all = "camelCase")]
    Consumed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    #[serde(rename_all = "camelCase")]
    ConsumerResumed { consumer_id: ConsumerId },

    /// Failure of the correlated request. `error` is a stable code such as
    /// `TRANSPORT_NOT_FOUND`; `message` is human readable.
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Response {
    /// Every response type a client may receive.
    pub const TYPES: &'static [&'static str] = &[
        "CAPABILITIES_RESPONSE",
        "TRANSPORT_CREATED",
        "TRANSPORT_CONNECTED",
        "PRODUCED",
        "PRODUCER_CLOSED_ACK",
        "CONSUMED",
        "CONSUMER_RESUMED",
        "ERROR",
    ];

    /// Build an error response.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Response::Error {
            error: code.into(),
            message: Some(message.into()),
        }
    }

    /// Wire name of this response.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Response::CapabilitiesResponse { .. } => "CAPABILITIES_RESPONSE",
            Response::TransportCreated { .. } => "TRANSPORT_CREATED",
            Response::TransportConnected { .. } => "TRANSPORT_CONNECTED",
            Response::Produced { .. } => "PRODUCED",
            Response::ProducerClosedAck { .. } => "PRODUCER_CLOSED_ACK",
            Response::Consumed { .. } => "CONSUMED",
            Response::ConsumerResumed { .. } => "CONSUMER_RESUMED",
            Response::Error { .. } => "ERROR",
        }
    }
}

/// Uncorrelated server notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Push {
    /// Another participant in the room started producing.
    #[serde(rename_all = "camelCase")]
    NewProducer {
        room_id: RoomId,
        producer_id: ProducerId,
        participant_id: ParticipantId,
        kind: MediaKind,
    },

    /// A producer in the room closed. Consumers of it are gone.
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        room_id: RoomId,
        participant_id: ParticipantId,
        producer_id: ProducerId,
    },
}

impl Push {
    /// Every push type a client may receive.
    pub const TYPES: &'static [&'static str] = &["NEW_PRODUCER", "PRODUCER_CLOSED"];

    /// Room the push belongs to.
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        match self {
            Push::NewProducer { room_id, .. } | Push::ProducerClosed { room_id, .. } => room_id,
        }
    }

    /// Producer the push is about.
    #[must_use]
    pub fn producer_id(&self) -> &ProducerId {
        match self {
            Push::NewProducer { producer_id, .. } | Push::ProducerClosed { producer_id, .. } => {
                producer_id
            }
        }
    }
}

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Response to a request. The id is absent only when the server could not
    /// read the request at all.
    Response {
        request_id: Option<RequestId>,
        response: Response,
    },
    /// Push notification.
    Push(Push),
}
