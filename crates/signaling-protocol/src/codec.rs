//! Codec for encoding and decoding signaling frames.
//!
//! Requests are decoded in two stages. [`decode_envelope`] reads only the
//! shared envelope, so a reply can always echo the request id.
//! [`decode_payload`] then validates the typed fields for the announced type.

use crate::message::{Envelope, Push, Request, Response, ServerMessage};
use common::types::{ParticipantId, RequestId, RoomId};
use serde_json::{Map, Value};

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Frame is not a JSON object
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// `type` is missing or not a known message type
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// Known type whose fields failed validation
    #[error("Invalid payload for {message_type}: {reason}")]
    InvalidPayload {
        message_type: String,
        reason: String,
    },

    /// Serialization failed
    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn parse_object(text: &str) -> Result<Map<String, Value>, CodecError> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(CodecError::Malformed(format!(
            "expected JSON object, got {}",
            json_kind(&other)
        ))),
        Err(e) => Err(CodecError::Malformed(e.to_string())),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_field(map: &Map<String, Value>) -> Option<&str> {
    map.get("type").and_then(Value::as_str)
}

/// Envelope keys that must be strings when present.
const ENVELOPE_STRING_FIELDS: [&str; 3] = ["roomId", "participantId", "requestId"];

fn string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Decode only the envelope of a client frame.
///
/// Each envelope field is read on its own; a field with the wrong JSON type
/// reads as absent here and is rejected by [`decode_payload`]. This keeps the
/// request id available for the error reply.
///
/// Returns the envelope together with the raw object for [`decode_payload`].
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if the frame is not a JSON object.
pub fn decode_envelope(text: &str) -> Result<(Envelope, Value), CodecError> {
    let map = parse_object(text)?;
    let envelope = Envelope {
        message_type: string_field(&map, "type"),
        room_id: string_field(&map, "roomId").map(RoomId::new),
        participant_id: string_field(&map, "participantId").map(ParticipantId::new),
        request_id: string_field(&map, "requestId").map(RequestId::new),
    };
    Ok((envelope, Value::Object(map)))
}

/// Validate the typed payload of a client frame.
///
/// # Errors
///
/// Returns [`CodecError::UnknownType`] when `type` is absent or not a request
/// type, and [`CodecError::InvalidPayload`] when the fields for a known type
/// do not validate.
pub fn decode_payload(envelope: &Envelope, value: Value) -> Result<Request, CodecError> {
    let message_type = envelope.message_type.clone().unwrap_or_default();
    if !Request::TYPES.contains(&message_type.as_str()) {
        return Err(CodecError::UnknownType(message_type));
    }

    for key in ENVELOPE_STRING_FIELDS {
        if let Some(field) = value.get(key).filter(|v| !v.is_string() && !v.is_null()) {
            return Err(CodecError::InvalidPayload {
                message_type,
                reason: format!("{key} must be a string, got {}", json_kind(field)),
            });
        }
    }

    serde_json::from_value::<Request>(value).map_err(|e| CodecError::InvalidPayload {
        message_type,
        reason: e.to_string(),
    })
}

/// Decode a full client request.
///
/// # Errors
///
/// See [`decode_envelope`] and [`decode_payload`].
pub fn decode_request(text: &str) -> Result<(Envelope, Request), CodecError> {
    let (envelope, value) = decode_envelope(text)?;
    let request = decode_payload(&envelope, value)?;
    Ok((envelope, request))
}

fn into_object(value: Value) -> Result<Map<String, Value>, CodecError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(CodecError::Malformed(format!(
            "message serialized to {}",
            json_kind(&other)
        ))),
    }
}

/// Encode a client request with its envelope fields.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_request(envelope: &Envelope, request: &Request) -> Result<String, CodecError> {
    let mut map = into_object(serde_json::to_value(request)?)?;
    if let Value::Object(fields) = serde_json::to_value(envelope)? {
        map.extend(fields);
    }
    Ok(serde_json::to_string(&Value::Object(map))?)
}

/// Encode a response, echoing the request id.
///
/// A missing request id is written as `null`.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_response(
    request_id: Option<&RequestId>,
    response: &Response,
) -> Result<String, CodecError> {
    let mut map = into_object(serde_json::to_value(response)?)?;
    map.insert("requestId".to_string(), serde_json::to_value(request_id)?);
    Ok(serde_json::to_string(&Value::Object(map))?)
}

/// Encode a push notification.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_push(push: &Push) -> Result<String, CodecError> {
    Ok(serde_json::to_string(push)?)
}

/// Decode a server frame as either a correlated response or a push.
///
/// Any frame carrying a `requestId` key is a response.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] for non-object frames,
/// [`CodecError::UnknownType`] for unrecognized types, and
/// [`CodecError::InvalidPayload`] when fields fail validation.
pub fn decode_server_message(text: &str) -> Result<ServerMessage, CodecError> {
    let map = parse_object(text)?;
    let message_type = type_field(&map).unwrap_or_default().to_string();

    if map.contains_key("requestId") {
        if !Response::TYPES.contains(&message_type.as_str()) {
            return Err(CodecError::UnknownType(message_type));
        }
        let request_id = match map.get("requestId") {
            Some(Value::String(id)) => Some(RequestId::new(id.clone())),
            _ => None,
        };
        let response = serde_json::from_value::<Response>(Value::Object(map)).map_err(|e| {
            CodecError::InvalidPayload {
                message_type: message_type.clone(),
                reason: e.to_string(),
            }
        })?;
        return Ok(ServerMessage::Response {
            request_id,
            response,
        });
    }

    if !Push::TYPES.contains(&message_type.as_str()) {
        return Err(CodecError::UnknownType(message_type));
    }
    let push = serde_json::from_value::<Push>(Value::Object(map)).map_err(|e| {
        CodecError::InvalidPayload {
            message_type,
            reason: e.to_string(),
        }
    })?;
    Ok(ServerMessage::Push(push))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::rtp::{MediaKind, TransportDirection};
    use common::types::{ParticipantId, ProducerId, RoomId, TransportId};

    #[test]
    fn test_request_carries_envelope_fields() {
        let envelope = Envelope::new(
            RoomId::new("r1"),
            ParticipantId::new("alice"),
            RequestId::new("req-1"),
        );
        let text = encode_request(
            &envelope,
            &Request::CreateTransport {
                direction: TransportDirection::Send,
            },
        )
        .unwrap();

        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "CREATE_TRANSPORT");
        assert_eq!(value["roomId"], "r1");
        assert_eq!(value["participantId"], "alice");
        assert_eq!(value["requestId"], "req-1");
        assert_eq!(value["direction"], "send");
    }

    #[test]
    fn test_decode_request_with_camel_case_fields() {
        let text = r#"{
            "type": "CLOSE_PRODUCER",
            "roomId": "r1",
            "participantId": "bob",
            "requestId": "x",
            "producerId": "p-7"
        }"#;
        let (envelope, request) = decode_request(text).unwrap();
        assert_eq!(envelope.request_id, Some(RequestId::new("x")));
        assert_eq!(
            request,
            Request::CloseProducer {
                producer_id: ProducerId::new("p-7")
            }
        );
    }

    #[test]
    fn test_capabilities_request_ignores_extra_fields() {
        let text = r#"{"type":"CAPABILITIES_REQUEST","roomId":"r1","requestId":"1"}"#;
        let (_, request) = decode_request(text).unwrap();
        assert_eq!(request, Request::CapabilitiesRequest);
        assert!(!request.requires_participant());
    }

    #[test]
    fn test_unknown_type_keeps_request_id() {
        let text = r#"{"type":"JUMP","roomId":"r1","requestId":"abc"}"#;
        let (envelope, value) = decode_envelope(text).unwrap();
        assert_eq!(envelope.request_id, Some(RequestId::new("abc")));

        let err = decode_payload(&envelope, value).unwrap_err();
        assert!(matches!(err, CodecError::UnknownType(t) if t == "JUMP"));
    }

    #[test]
    fn test_missing_type_is_unknown() {
        let err = decode_request(r#"{"roomId":"r1"}"#).unwrap_err();
        assert!(matches!(err, CodecError::UnknownType(t) if t.is_empty()));
    }

    #[test]
    fn test_known_type_with_missing_field_is_invalid_payload() {
        let text = r#"{"type":"CONNECT_TRANSPORT","roomId":"r1","requestId":"1","transportId":"t"}"#;
        let err = decode_request(text).unwrap_err();
        match err {
            CodecError::InvalidPayload {
                message_type,
                reason,
            } => {
                assert_eq!(message_type, "CONNECT_TRANSPORT");
                assert!(reason.contains("dtlsParameters"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_wrongly_typed_envelope_field_keeps_request_id() {
        let text = r#"{"type":"CREATE_TRANSPORT","requestId":"q1","roomId":"r1","participantId":7,"direction":"send"}"#;
        let (envelope, value) = decode_envelope(text).unwrap();
        assert_eq!(envelope.request_id, Some(RequestId::new("q1")));
        assert_eq!(envelope.participant_id, None);

        match decode_payload(&envelope, value).unwrap_err() {
            CodecError::InvalidPayload { reason, .. } => assert!(reason.contains("participantId")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_non_object_is_malformed() {
        assert!(matches!(
            decode_request("[1,2]"),
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(
            decode_request("not json"),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_response_echoes_request_id() {
        let text = encode_response(
            Some(&RequestId::new("q")),
            &Response::TransportConnected {
                transport_id: TransportId::new("t1"),
            },
        )
        .unwrap();

        match decode_server_message(&text).unwrap() {
            ServerMessage::Response {
                request_id,
                response,
            } => {
                assert_eq!(request_id, Some(RequestId::new("q")));
                assert_eq!(
                    response,
                    Response::TransportConnected {
                        transport_id: TransportId::new("t1")
                    }
                );
            }
            ServerMessage::Push(p) => panic!("expected response, got {p:?}"),
        }
    }

    #[test]
    fn test_error_response_without_request_id_is_null() {
        let text = encode_response(None, &Response::error("UNKNOWN_TYPE", "nope")).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert!(value["requestId"].is_null());
        assert_eq!(value["type"], "ERROR");
        assert_eq!(value["error"], "UNKNOWN_TYPE");

        match decode_server_message(&text).unwrap() {
            ServerMessage::Response { request_id, .. } => assert!(request_id.is_none()),
            ServerMessage::Push(p) => panic!("expected response, got {p:?}"),
        }
    }

    #[test]
    fn test_push_has_no_request_id() {
        let push = Push::NewProducer {
            room_id: RoomId::new("r1"),
            producer_id: ProducerId::new("p1"),
            participant_id: ParticipantId::new("alice"),
            kind: MediaKind::Video,
        };
        let text = encode_push(&push).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert!(value.get("requestId").is_none());
        assert_eq!(value["type"], "NEW_PRODUCER");
        assert_eq!(value["participantId"], "alice");

        assert_eq!(
            decode_server_message(&text).unwrap(),
            ServerMessage::Push(push)
        );
    }

    #[test]
    fn test_unknown_server_type() {
        let err = decode_server_message(r#"{"type":"HELLO"}"#).unwrap_err();
        assert!(matches!(err, CodecError::UnknownType(t) if t == "HELLO"));
    }
}
