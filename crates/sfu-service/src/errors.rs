//! SFU service error types.
//!
//! Every error that reaches a client is converted into an `ERROR` response
//! carrying a stable wire code from [`SfuError::error_code`]. Engine and
//! internal details are logged server-side but not exposed to clients.

use crate::engine::EngineError;
use common::types::{ConsumerId, ParticipantId, ProducerId, RoomId, TransportId};
use signaling_protocol::CodecError;
use thiserror::Error;

/// SFU service error type.
#[derive(Debug, Error)]
pub enum SfuError {
    /// Frame could not be read as a JSON object.
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Request did not name a room.
    #[error("Request has no room id")]
    MissingRoomId,

    /// Request needs a participant id but has none.
    #[error("Request has no participant id")]
    MissingParticipantId,

    /// `type` is absent or not a request type.
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// Known request type with invalid fields.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Connection is bound to a different room.
    #[error("Connection is bound to room {bound}, request named {requested}")]
    RoomMismatch { bound: RoomId, requested: RoomId },

    /// Connection is bound to a different participant.
    #[error("Participant mismatch: {0}")]
    ParticipantMismatch(ParticipantId),

    /// Room has reached its peer cap.
    #[error("Room {0} is full")]
    RoomFull(RoomId),

    /// Peer has reached its producer cap.
    #[error("Producer limit reached for {0}")]
    ProducerLimit(ParticipantId),

    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),

    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),

    /// Consumer capabilities are incompatible with the producer.
    #[error("Cannot consume producer {0}")]
    CannotConsume(ProducerId),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),

    /// Forwarding engine failure.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Socket or listener failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SfuError {
    /// Returns the wire error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            SfuError::Malformed(_) => "MALFORMED",
            SfuError::MissingRoomId => "NO_ROOM_ID",
            SfuError::MissingParticipantId => "NO_PARTICIPANT_ID",
            SfuError::UnknownType(_) => "UNKNOWN_TYPE",
            SfuError::InvalidPayload(_) => "INVALID_PAYLOAD",
            SfuError::RoomMismatch { .. } => "ROOM_MISMATCH",
            SfuError::ParticipantMismatch(_) => "PARTICIPANT_MISMATCH",
            SfuError::RoomFull(_) => "ROOM_FULL",
            SfuError::ProducerLimit(_) => "PRODUCER_LIMIT",
            SfuError::TransportNotFound(_) => "TRANSPORT_NOT_FOUND",
            SfuError::ProducerNotFound(_) => "PRODUCER_NOT_FOUND",
            SfuError::CannotConsume(_) => "CANNOT_CONSUME",
            SfuError::ConsumerNotFound(_) => "CONSUMER_NOT_FOUND",
            SfuError::Engine(_) => "ENGINE_ERROR",
            SfuError::Config(_) | SfuError::Io(_) | SfuError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            SfuError::Engine(_) => "Media engine rejected the request".to_string(),
            SfuError::Config(_) | SfuError::Io(_) | SfuError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<CodecError> for SfuError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Malformed(msg) => SfuError::Malformed(msg),
            CodecError::UnknownType(t) => SfuError::UnknownType(t),
            CodecError::InvalidPayload {
                message_type,
                reason,
            } => SfuError::InvalidPayload(format!("{message_type}: {reason}")),
            CodecError::Serialize(e) => SfuError::Internal(format!("serialization: {e}")),
        }
    }
}
