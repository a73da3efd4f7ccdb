//! Forwarding engine capability interface.
//!
//! The registry never touches packets. It only sequences calls against these
//! traits and holds the returned handles. A production deployment plugs a
//! real WebRTC media engine in behind them; [`loopback::LoopbackEngine`] is
//! the in-process implementation used by the binary and the tests.

pub mod loopback;

use async_trait::async_trait;
use common::types::{ConsumerId, ProducerId, TransportId};
use signaling_protocol::rtp::{
    DtlsParameters, MediaKind, RtpCapabilities, RtpCodecCapability, RtpParameters,
    TransportParams,
};
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

pub use loopback::{EngineStats, LoopbackEngine};

/// Errors reported by the forwarding engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The target object was already closed.
    #[error("Already closed: {0}")]
    Closed(String),

    /// The transport was already connected.
    #[error("Transport already connected: {0}")]
    AlreadyConnected(TransportId),

    /// RTP parameters name a codec the router does not offer.
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// No open producer with this id in the router.
    #[error("Unknown producer: {0}")]
    UnknownProducer(ProducerId),

    /// Consumer capabilities share no codec with the producer.
    #[error("Incompatible capabilities for producer {0}")]
    IncompatibleCapabilities(ProducerId),

    /// Parameters failed validation.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Closing an object failed.
    #[error("Close failed: {0}")]
    CloseFailed(String),
}

/// Network options for new WebRTC transports.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub listen_ip: IpAddr,
    pub announced_ip: Option<IpAddr>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl TransportOptions {
    /// UDP and TCP enabled, UDP preferred.
    #[must_use]
    pub fn new(listen_ip: IpAddr, announced_ip: Option<IpAddr>) -> Self {
        Self {
            listen_ip,
            announced_ip,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}

/// Entry point of a forwarding engine.
#[async_trait]
pub trait ForwardingEngine: Send + Sync {
    /// Create a router configured with a fixed codec set.
    async fn create_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<dyn Router>, EngineError>;
}

/// Per-room engine context holding the negotiated codec set.
#[async_trait]
pub trait Router: Send + Sync {
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether a consumer with `rtp_capabilities` can receive `producer_id`.
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn create_webrtc_transport(
        &self,
        options: &TransportOptions,
    ) -> Result<Box<dyn WebRtcTransport>, EngineError>;

    fn close(&self) -> Result<(), EngineError>;
}

/// One negotiated network path for a participant.
#[async_trait]
pub trait WebRtcTransport: Send + Sync {
    fn id(&self) -> &TransportId;

    /// Parameters the client needs to build its side of the transport.
    fn params(&self) -> TransportParams;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Box<dyn EngineProducer>, EngineError>;

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Box<dyn EngineConsumer>, EngineError>;

    fn close(&self) -> Result<(), EngineError>;
}

/// Engine handle for an incoming track.
pub trait EngineProducer: Send + Sync {
    fn id(&self) -> &ProducerId;
    fn kind(&self) -> MediaKind;
    fn close(&self) -> Result<(), EngineError>;
}

/// Engine handle for a subscription to a producer.
#[async_trait]
pub trait EngineConsumer: Send + Sync {
    fn id(&self) -> &ConsumerId;
    fn producer_id(&self) -> &ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    fn is_paused(&self) -> bool;

    /// Start media flow. Fails once the source producer is gone.
    async fn resume(&self) -> Result<(), EngineError>;

    fn close(&self) -> Result<(), EngineError>;
}
