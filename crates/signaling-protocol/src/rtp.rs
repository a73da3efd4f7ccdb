//! RTP, ICE, and DTLS parameter types exchanged during negotiation.
//!
//! These mirror the shapes a WebRTC forwarding engine hands out and accepts.
//! The signaling layer treats them as opaque payloads apart from codec
//! matching, which both ends need for capability checks.

use common::types::TransportId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of media carried by a track, producer, or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl MediaKind {
    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a transport, from the participant's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    /// Carries the participant's own media to the server
    Send,
    /// Carries remote media from the server to the participant
    Recv,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDirection::Send => f.write_str("send"),
            TransportDirection::Recv => f.write_str("recv"),
        }
    }
}

/// One codec a router or endpoint can handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
}

impl RtpCodecCapability {
    /// Returns true if both entries describe the same codec.
    ///
    /// Mime types compare case-insensitively. Audio codecs with no channel
    /// count are treated as mono.
    #[must_use]
    pub fn matches(&self, other: &RtpCodecCapability) -> bool {
        self.kind == other.kind
            && self.mime_type.eq_ignore_ascii_case(&other.mime_type)
            && self.clock_rate == other.clock_rate
            && (self.kind == MediaKind::Video
                || self.channels.unwrap_or(1) == other.channels.unwrap_or(1))
    }
}

/// Set of codecs supported by a router or an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodecCapability>,
}

impl RtpCapabilities {
    /// Find the entry matching `codec`, if any.
    #[must_use]
    pub fn find_matching(&self, codec: &RtpCodecCapability) -> Option<&RtpCodecCapability> {
        self.codecs.iter().find(|c| c.matches(codec))
    }

    /// First codec of the given kind.
    #[must_use]
    pub fn codec_for_kind(&self, kind: MediaKind) -> Option<&RtpCodecCapability> {
        self.codecs.iter().find(|c| c.kind == kind)
    }

    /// Returns true if at least one codec of `kind` is present.
    #[must_use]
    pub fn supports(&self, kind: MediaKind) -> bool {
        self.codec_for_kind(kind).is_some()
    }

    /// Returns true if an entry matches the codec used by `parameters`.
    #[must_use]
    pub fn accepts(&self, kind: MediaKind, parameters: &RtpCodecParameters) -> bool {
        self.codecs
            .iter()
            .any(|c| c.matches(&parameters.as_capability(kind)))
    }
}

/// Codec entry inside concrete RTP send/receive parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
}

impl RtpCodecParameters {
    /// View this entry as a capability of the given kind, for matching.
    #[must_use]
    pub fn as_capability(&self, kind: MediaKind) -> RtpCodecCapability {
        RtpCodecCapability {
            kind,
            mime_type: self.mime_type.clone(),
            clock_rate: self.clock_rate,
            channels: self.channels,
            preferred_payload_type: Some(self.payload_type),
        }
    }
}

/// Encoding (simulcast layer) entry. Only single-layer sending is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    pub ssrc: u32,
}

/// Concrete RTP parameters of a producer or consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
}

impl RtpParameters {
    /// The codec media is actually sent with.
    #[must_use]
    pub fn primary_codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs.first()
    }
}

/// ICE credentials of a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

/// Transport protocol of an ICE candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceProtocol {
    Udp,
    Tcp,
}

/// One ICE candidate the server listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub protocol: IceProtocol,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
}

/// DTLS role of an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

/// Certificate fingerprint used to authenticate the DTLS handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS parameters of one side of a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Everything a client needs to build its local side of a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Payload type assigned to Opus by the fixed router codec set.
pub const OPUS_PAYLOAD_TYPE: u8 = 100;

/// Payload type assigned to VP8 by the fixed router codec set.
pub const VP8_PAYLOAD_TYPE: u8 = 101;

/// The codec set every room router is configured with: one audio codec and
/// one video codec.
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: Some(2),
            preferred_payload_type: Some(OPUS_PAYLOAD_TYPE),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: None,
            preferred_payload_type: Some(VP8_PAYLOAD_TYPE),
        },
    ]
}
