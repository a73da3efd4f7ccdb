//! Client error types.
//!
//! Capture failures map to fixed user-facing messages so that a UI can show
//! them verbatim.

use common::types::TransportId;
use signaling_protocol::rtp::MediaKind;
use signaling_protocol::CodecError;
use std::time::Duration;
use thiserror::Error;

/// Shown when a join fails for a reason other than a device error.
pub const JOIN_FAILED_MESSAGE: &str = "Could not join the room.";

/// Signaling channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Failed to connect: {0}")]
    Connect(String),

    /// The socket closed before a response arrived.
    #[error("WS_CLOSED")]
    Closed,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The server answered with an `ERROR` response.
    #[error("{code}: {}", message.as_deref().unwrap_or(""))]
    Server {
        code: String,
        message: Option<String>,
    },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Expected {expected}, got {actual}")]
    UnexpectedResponse {
        expected: &'static str,
        actual: &'static str,
    },
}

impl ChannelError {
    /// Wire error code for server errors.
    #[must_use]
    pub fn server_code(&self) -> Option<&str> {
        match self {
            ChannelError::Server { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Local negotiation errors.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// Router and local codec sets do not intersect.
    #[error("No codecs in common with the router")]
    NoCommonCodecs,

    #[error("Device has not been loaded with router capabilities")]
    NotLoaded,

    #[error("Cannot produce {0}")]
    CannotProduce(MediaKind),

    #[error("Transport {0} is closed")]
    TransportClosed(TransportId),
}

/// Capture device errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("Permission denied")]
    PermissionDenied,

    #[error("No {0} device found")]
    NotFound(MediaKind),

    #[error("Device busy")]
    Busy,

    #[error("Capture failed: {0}")]
    Other(String),
}

impl CaptureError {
    /// Message suitable for showing to the user.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            CaptureError::PermissionDenied => {
                "Permission denied. Please allow camera/microphone access in your browser settings."
            }
            CaptureError::NotFound(_) => "No camera device found.",
            CaptureError::Busy => "Camera is busy (used by another app/tab).",
            CaptureError::Other(_) => "Could not access microphone/camera.",
        }
    }
}

/// Session controller errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("NO_TOKEN")]
    NoToken,

    #[error("NO_ROOM_ID")]
    NoRoomId,

    /// A live toggle was requested outside `JOINED`.
    #[error("Not joined")]
    NotJoined,

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Message suitable for showing after a failed join.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            SessionError::Capture(e) => e.user_message(),
            _ => JOIN_FAILED_MESSAGE,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_user_messages() {
        assert_eq!(
            CaptureError::PermissionDenied.user_message(),
            "Permission denied. Please allow camera/microphone access in your browser settings."
        );
        assert_eq!(
            CaptureError::NotFound(MediaKind::Video).user_message(),
            "No camera device found."
        );
        assert_eq!(
            CaptureError::Busy.user_message(),
            "Camera is busy (used by another app/tab)."
        );
        assert_eq!(
            CaptureError::Other("driver".to_string()).user_message(),
            "Could not access microphone/camera."
        );
    }

    #[test]
    fn test_session_user_message_prefers_capture() {
        assert_eq!(
            SessionError::from(CaptureError::Busy).user_message(),
            "Camera is busy (used by another app/tab)."
        );
        assert_eq!(
            SessionError::from(ChannelError::Closed).user_message(),
            JOIN_FAILED_MESSAGE
        );
        assert_eq!(SessionError::NoToken.to_string(), "NO_TOKEN");
    }

    #[test]
    fn test_server_code() {
        let err = ChannelError::Server {
            code: "TRANSPORT_NOT_FOUND".to_string(),
            message: Some("Transport not found: t1".to_string()),
        };
        assert_eq!(err.server_code(), Some("TRANSPORT_NOT_FOUND"));
        assert_eq!(err.to_string(), "TRANSPORT_NOT_FOUND: Transport not found: t1");
        assert_eq!(ChannelError::Closed.server_code(), None);
    }
}
