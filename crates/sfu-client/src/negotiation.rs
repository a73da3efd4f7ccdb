//! Local negotiation context.
//!
//! [`Device`] holds the codecs both ends support once loaded with the room's
//! router capabilities. Transports, producers and consumers are the local
//! halves of the server-side objects; each closes at most once.

use crate::errors::NegotiationError;
use crate::media::MediaTrack;
use common::types::{ConsumerId, ProducerId, TransportId};
use rand::distributions::Alphanumeric;
use rand::Rng;
use signaling_protocol::rtp::{
    DtlsFingerprint, DtlsParameters, DtlsRole, MediaKind, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpEncodingParameters, RtpParameters, TransportDirection, TransportParams,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Codecs the local endpoint can encode and decode.
#[must_use]
pub fn local_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: Some(2),
            preferred_payload_type: Some(111),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: None,
            preferred_payload_type: Some(96),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            clock_rate: 90_000,
            channels: None,
            preferred_payload_type: Some(102),
        },
    ]
}

/// Local negotiation device.
#[derive(Debug, Clone)]
pub struct Device {
    local: Vec<RtpCodecCapability>,
    loaded: Option<RtpCapabilities>,
    next_mid: Arc<AtomicU32>,
}

impl Default for Device {
    fn default() -> Self {
        Self::with_codecs(local_codecs())
    }
}

impl Device {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_codecs(local: Vec<RtpCodecCapability>) -> Self {
        Self {
            local,
            loaded: None,
            next_mid: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Load the router capabilities, keeping only codecs both ends support.
    ///
    /// Kept entries use the router's payload types.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::NoCommonCodecs`] when nothing matches.
    pub fn load(&mut self, router: &RtpCapabilities) -> Result<(), NegotiationError> {
        let codecs: Vec<RtpCodecCapability> = router
            .codecs
            .iter()
            .filter(|codec| self.local.iter().any(|local| local.matches(codec)))
            .cloned()
            .collect();
        if codecs.is_empty() {
            return Err(NegotiationError::NoCommonCodecs);
        }
        self.loaded = Some(RtpCapabilities { codecs });
        Ok(())
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// Negotiated capabilities, sent with `CONSUME`.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::NotLoaded`] before [`Device::load`].
    pub fn rtp_capabilities(&self) -> Result<&RtpCapabilities, NegotiationError> {
        self.loaded.as_ref().ok_or(NegotiationError::NotLoaded)
    }

    #[must_use]
    pub fn can_produce(&self, kind: MediaKind) -> bool {
        self.loaded.as_ref().is_some_and(|caps| caps.supports(kind))
    }

    /// RTP parameters for sending `track`.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::CannotProduce`] when no negotiated codec
    /// carries the track's kind.
    pub fn send_parameters(&self, track: &MediaTrack) -> Result<RtpParameters, NegotiationError> {
        let kind = track.kind();
        let codec = self
            .rtp_capabilities()?
            .codec_for_kind(kind)
            .ok_or(NegotiationError::CannotProduce(kind))?;
        let payload_type = codec
            .preferred_payload_type
            .ok_or(NegotiationError::CannotProduce(kind))?;

        Ok(RtpParameters {
            mid: Some(self.next_mid.fetch_add(1, Ordering::Relaxed).to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: codec.mime_type.clone(),
                payload_type,
                clock_rate: codec.clock_rate,
                channels: codec.channels,
            }],
            encodings: vec![RtpEncodingParameters {
                ssrc: rand::thread_rng().gen(),
            }],
        })
    }

    /// Local half of a server transport.
    #[must_use]
    pub fn create_transport(&self, params: TransportParams, direction: TransportDirection) -> LocalTransport {
        LocalTransport::new(params, direction)
    }
}

/// Local half of a WebRTC transport.
#[derive(Debug)]
pub struct LocalTransport {
    params: TransportParams,
    direction: TransportDirection,
    local_dtls: DtlsParameters,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl LocalTransport {
    fn new(params: TransportParams, direction: TransportDirection) -> Self {
        let digest: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        Self {
            params,
            direction,
            local_dtls: DtlsParameters {
                role: DtlsRole::Client,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: digest,
                }],
            },
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> &TransportId {
        &self.params.id
    }

    #[must_use]
    pub fn direction(&self) -> TransportDirection {
        self.direction
    }

    /// Server-side parameters this transport was built from.
    #[must_use]
    pub fn remote_params(&self) -> &TransportParams {
        &self.params
    }

    /// DTLS parameters sent with `CONNECT_TRANSPORT`.
    #[must_use]
    pub fn dtls_parameters(&self) -> &DtlsParameters {
        &self.local_dtls
    }

    /// Returns true the first time, when `CONNECT_TRANSPORT` should be sent.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::TransportClosed`] on a closed transport.
    pub fn begin_connect(&self) -> Result<bool, NegotiationError> {
        if self.is_closed() {
            return Err(NegotiationError::TransportClosed(self.params.id.clone()));
        }
        Ok(!self.connected.swap(true, Ordering::AcqRel))
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Fails if the transport is closed.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::TransportClosed`].
    pub fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.is_closed() {
            Err(NegotiationError::TransportClosed(self.params.id.clone()))
        } else {
            Ok(())
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns true if this call closed it.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Local half of a producer. Does not own the track's lifetime.
#[derive(Debug)]
pub struct LocalProducer {
    id: ProducerId,
    track: MediaTrack,
    closed: AtomicBool,
}

impl LocalProducer {
    #[must_use]
    pub fn new(id: ProducerId, track: MediaTrack) -> Self {
        Self {
            id,
            track,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> &ProducerId {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.track.kind()
    }

    #[must_use]
    pub fn track(&self) -> &MediaTrack {
        &self.track
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns true if this call closed it.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Local half of a consumer. Owns its remote track.
#[derive(Debug)]
pub struct LocalConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    rtp_parameters: RtpParameters,
    track: MediaTrack,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl LocalConsumer {
    /// New consumers start paused, matching the server side.
    #[must_use]
    pub fn new(
        id: ConsumerId,
        producer_id: ProducerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Self {
        let track = MediaTrack::remote(kind, format!("remote-{producer_id}"));
        Self {
            id,
            producer_id,
            rtp_parameters,
            track,
            paused: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> &ConsumerId {
        &self.id
    }

    #[must_use]
    pub fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.track.kind()
    }

    #[must_use]
    pub fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    #[must_use]
    pub fn track(&self) -> &MediaTrack {
        &self.track
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn mark_resumed(&self) {
        self.paused.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close and stop the remote track. Returns true if this call closed it.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.track.stop();
        }
        first
    }
}
