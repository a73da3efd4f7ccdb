//! Wire fixtures shared by protocol tests.

use serde_json::{json, Value};
use signaling_protocol::rtp::{
    default_media_codecs, DtlsFingerprint, DtlsParameters, DtlsRole, MediaKind, RtpCapabilities,
    RtpCodecParameters, RtpEncodingParameters, RtpParameters, OPUS_PAYLOAD_TYPE, VP8_PAYLOAD_TYPE,
};

/// Capabilities every room router is created with.
pub fn router_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: default_media_codecs(),
    }
}

/// Send parameters the default router accepts for `kind`.
pub fn rtp_parameters(kind: MediaKind) -> RtpParameters {
    let codec = match kind {
        MediaKind::Audio => RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: OPUS_PAYLOAD_TYPE,
            clock_rate: 48_000,
            channels: Some(2),
        },
        MediaKind::Video => RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: VP8_PAYLOAD_TYPE,
            clock_rate: 90_000,
            channels: None,
        },
    };
    RtpParameters {
        mid: Some(kind.as_str().to_string()),
        codecs: vec![codec],
        encodings: vec![RtpEncodingParameters { ssrc: 1111 }],
    }
}

/// Send parameters no default router accepts.
pub fn unsupported_rtp_parameters() -> RtpParameters {
    RtpParameters {
        mid: None,
        codecs: vec![RtpCodecParameters {
            mime_type: "video/AV1".to_string(),
            payload_type: 35,
            clock_rate: 90_000,
            channels: None,
        }],
        encodings: vec![RtpEncodingParameters { ssrc: 2222 }],
    }
}

/// Client-side DTLS parameters.
pub fn client_dtls() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "AB:CD:EF:01:23:45:67:89".to_string(),
        }],
    }
}

pub fn rtp_parameters_json(kind: MediaKind) -> Value {
    serde_json::to_value(rtp_parameters(kind)).unwrap()
}

pub fn client_dtls_json() -> Value {
    serde_json::to_value(client_dtls()).unwrap()
}

pub fn router_capabilities_json() -> Value {
    serde_json::to_value(router_capabilities()).unwrap()
}

/// Payload of a `PRODUCE` request on `transport_id`.
pub fn produce_payload(transport_id: &str, kind: MediaKind) -> Value {
    json!({
        "transportId": transport_id,
        "kind": kind.as_str(),
        "rtpParameters": rtp_parameters_json(kind),
    })
}
