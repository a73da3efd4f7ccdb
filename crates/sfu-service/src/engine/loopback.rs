//! In-process forwarding engine.
//!
//! Implements the full capability surface without moving media: it mints
//! ids and ICE/DTLS parameters, validates codecs against the router's set,
//! tracks which producers are open so consumers can be checked and resumed,
//! and counts open objects. Tests can make upcoming `close()` calls fail to
//! exercise best-effort teardown.

use super::{
    EngineConsumer, EngineError, EngineProducer, ForwardingEngine, Router, TransportOptions,
    WebRtcTransport,
};
use async_trait::async_trait;
use common::types::{ConsumerId, ProducerId, TransportId};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use signaling_protocol::rtp::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, IceProtocol,
    MediaKind, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters,
    RtpParameters, TransportParams,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// First port handed out to transport candidates.
const FIRST_MEDIA_PORT: u16 = 40_000;

/// Counts of open engine objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub routers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

#[derive(Debug)]
struct EngineShared {
    routers: AtomicUsize,
    transports: AtomicUsize,
    producers: AtomicUsize,
    consumers: AtomicUsize,
    pending_close_failures: AtomicUsize,
    next_port: AtomicU16,
    next_mid: AtomicU32,
}

impl EngineShared {
    fn take_close_failure(&self) -> bool {
        self.pending_close_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Mark an object closed once, honoring injected failures.
    fn close_object(
        &self,
        closed: &AtomicBool,
        counter: &AtomicUsize,
        what: &str,
    ) -> Result<bool, EngineError> {
        if closed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if self.take_close_failure() {
            return Err(EngineError::CloseFailed(what.to_string()));
        }
        if closed.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        counter.fetch_sub(1, Ordering::SeqCst);
        Ok(true)
    }
}

/// In-process engine. Cloning shares the same counters.
#[derive(Debug, Clone)]
pub struct LoopbackEngine {
    shared: Arc<EngineShared>,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(EngineShared {
                routers: AtomicUsize::new(0),
                transports: AtomicUsize::new(0),
                producers: AtomicUsize::new(0),
                consumers: AtomicUsize::new(0),
                pending_close_failures: AtomicUsize::new(0),
                next_port: AtomicU16::new(FIRST_MEDIA_PORT),
                next_mid: AtomicU32::new(0),
            }),
        }
    }

    /// Snapshot of currently open objects.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            routers: self.shared.routers.load(Ordering::SeqCst),
            transports: self.shared.transports.load(Ordering::SeqCst),
            producers: self.shared.producers.load(Ordering::SeqCst),
            consumers: self.shared.consumers.load(Ordering::SeqCst),
        }
    }

    /// Make the next `count` close calls on any object fail.
    pub fn fail_next_closes(&self, count: usize) {
        self.shared
            .pending_close_failures
            .store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl ForwardingEngine for LoopbackEngine {
    async fn create_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<dyn Router>, EngineError> {
        if media_codecs.is_empty() {
            return Err(EngineError::InvalidParameters(
                "router needs at least one codec".to_string(),
            ));
        }
        self.shared.routers.fetch_add(1, Ordering::SeqCst);
        let router = LoopbackRouter {
            id: uuid::Uuid::new_v4().to_string(),
            state: Arc::new(RouterState {
                capabilities: RtpCapabilities {
                    codecs: media_codecs,
                },
                producers: Mutex::new(HashMap::new()),
            }),
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        };
        debug!(target: "sfu.engine", router_id = %router.id, "Router created");
        Ok(Arc::new(router))
    }
}

#[derive(Debug, Clone)]
struct ProducerRecord {
    kind: MediaKind,
    codec: RtpCodecParameters,
}

#[derive(Debug)]
struct RouterState {
    capabilities: RtpCapabilities,
    producers: Mutex<HashMap<ProducerId, ProducerRecord>>,
}

impl RouterState {
    fn producer(&self, producer_id: &ProducerId) -> Option<ProducerRecord> {
        self.producers.lock().get(producer_id).cloned()
    }

    /// Capability entry of `rtp_capabilities` that can receive the producer.
    fn consumable_codec(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Option<(ProducerRecord, RtpCodecCapability)> {
        let record = self.producer(producer_id)?;
        let matched = rtp_capabilities
            .find_matching(&record.codec.as_capability(record.kind))?
            .clone();
        Some((record, matched))
    }
}

struct LoopbackRouter {
    id: String,
    state: Arc<RouterState>,
    shared: Arc<EngineShared>,
    closed: AtomicBool,
}

#[async_trait]
impl Router for LoopbackRouter {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.state.capabilities.clone()
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        self.state
            .consumable_codec(producer_id, rtp_capabilities)
            .is_some()
    }

    async fn create_webrtc_transport(
        &self,
        options: &TransportOptions,
    ) -> Result<Box<dyn WebRtcTransport>, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed(format!("router {}", self.id)));
        }

        let id = TransportId::generate();
        let port = self.shared.next_port.fetch_add(1, Ordering::SeqCst);
        let params = TransportParams {
            id: id.clone(),
            ice_parameters: IceParameters {
                username_fragment: random_token(16),
                password: random_token(32),
                ice_lite: true,
            },
            ice_candidates: build_candidates(options, port),
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![random_fingerprint()],
            },
        };

        self.shared.transports.fetch_add(1, Ordering::SeqCst);
        debug!(target: "sfu.engine", transport_id = %id, port, "Transport created");

        Ok(Box::new(LoopbackTransport {
            id,
            params,
            router: Arc::clone(&self.state),
            shared: Arc::clone(&self.shared),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    fn close(&self) -> Result<(), EngineError> {
        self.shared
            .close_object(&self.closed, &self.shared.routers, "router")
            .map(|_| ())
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn random_fingerprint() -> DtlsFingerprint {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    let value = bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":");
    DtlsFingerprint {
        algorithm: "sha-256".to_string(),
        value,
    }
}

fn build_candidates(options: &TransportOptions, port: u16) -> Vec<IceCandidate> {
    let ip = options.announced_ip.unwrap_or(options.listen_ip).to_string();
    let (udp_priority, tcp_priority) = if options.prefer_udp {
        (1_076_302_079, 1_076_276_479)
    } else {
        (1_076_276_479, 1_076_302_079)
    };

    let mut candidates = Vec::with_capacity(2);
    if options.enable_udp {
        candidates.push(IceCandidate {
            foundation: "udpcandidate".to_string(),
            priority: udp_priority,
            ip: ip.clone(),
            protocol: IceProtocol::Udp,
            port,
            candidate_type: "host".to_string(),
        });
    }
    if options.enable_tcp {
        candidates.push(IceCandidate {
            foundation: "tcpcandidate".to_string(),
            priority: tcp_priority,
            ip,
            protocol: IceProtocol::Tcp,
            port,
            candidate_type: "host".to_string(),
        });
    }
    candidates
}

struct LoopbackTransport {
    id: TransportId,
    params: TransportParams,
    router: Arc<RouterState>,
    shared: Arc<EngineShared>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackTransport {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed(format!("transport {}", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl WebRtcTransport for LoopbackTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn params(&self) -> TransportParams {
        self.params.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        self.ensure_open()?;
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::InvalidParameters(
                "dtlsParameters has no fingerprints".to_string(),
            ));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyConnected(self.id.clone()));
        }
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Box<dyn EngineProducer>, EngineError> {
        self.ensure_open()?;
        let codec = rtp_parameters
            .primary_codec()
            .ok_or_else(|| EngineError::InvalidParameters("rtpParameters has no codecs".to_string()))?
            .clone();
        if !self.router.capabilities.accepts(kind, &codec) {
            return Err(EngineError::UnsupportedCodec(codec.mime_type));
        }

        let id = ProducerId::generate();
        self.router
            .producers
            .lock()
            .insert(id.clone(), ProducerRecord { kind, codec });
        self.shared.producers.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(LoopbackProducer {
            id,
            kind,
            router: Arc::clone(&self.router),
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        }))
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Box<dyn EngineConsumer>, EngineError> {
        self.ensure_open()?;
        if self.router.producer(producer_id).is_none() {
            return Err(EngineError::UnknownProducer(producer_id.clone()));
        }
        let (record, matched) = self
            .router
            .consumable_codec(producer_id, rtp_capabilities)
            .ok_or_else(|| EngineError::IncompatibleCapabilities(producer_id.clone()))?;

        let mid = self.shared.next_mid.fetch_add(1, Ordering::SeqCst);
        let rtp_parameters = RtpParameters {
            mid: Some(mid.to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: matched.mime_type.clone(),
                payload_type: matched
                    .preferred_payload_type
                    .unwrap_or(record.codec.payload_type),
                clock_rate: matched.clock_rate,
                channels: matched.channels,
            }],
            encodings: vec![RtpEncodingParameters {
                ssrc: rand::thread_rng().gen(),
            }],
        };

        self.shared.consumers.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackConsumer {
            id: ConsumerId::generate(),
            producer_id: producer_id.clone(),
            kind: record.kind,
            rtp_parameters,
            router: Arc::clone(&self.router),
            shared: Arc::clone(&self.shared),
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
        }))
    }

    fn close(&self) -> Result<(), EngineError> {
        self.shared
            .close_object(&self.closed, &self.shared.transports, "transport")
            .map(|_| ())
    }
}

struct LoopbackProducer {
    id: ProducerId,
    kind: MediaKind,
    router: Arc<RouterState>,
    shared: Arc<EngineShared>,
    closed: AtomicBool,
}

impl EngineProducer for LoopbackProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) -> Result<(), EngineError> {
        if self
            .shared
            .close_object(&self.closed, &self.shared.producers, "producer")?
        {
            self.router.producers.lock().remove(&self.id);
        }
        Ok(())
    }
}

struct LoopbackConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    router: Arc<RouterState>,
    shared: Arc<EngineShared>,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl EngineConsumer for LoopbackConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed(format!("consumer {}", self.id)));
        }
        if self.router.producer(&self.producer_id).is_none() {
            return Err(EngineError::UnknownProducer(self.producer_id.clone()));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<(), EngineError> {
        self.shared
            .close_object(&self.closed, &self.shared.consumers, "consumer")
            .map(|_| ())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use signaling_protocol::rtp::{default_media_codecs, OPUS_PAYLOAD_TYPE};

    fn options() -> TransportOptions {
        TransportOptions::new("127.0.0.1".parse().unwrap(), None)
    }

    fn opus_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 111,
                clock_rate: 48_000,
                channels: Some(2),
            }],
            encodings: vec![RtpEncodingParameters { ssrc: 1234 }],
        }
    }

    fn client_caps() -> RtpCapabilities {
        RtpCapabilities {
            codecs: default_media_codecs(),
        }
    }

    #[tokio::test]
    async fn test_transport_params_use_announced_ip() {
        let engine = LoopbackEngine::new();
        let router = engine.create_router(default_media_codecs()).await.unwrap();
        let announced = TransportOptions::new(
            "0.0.0.0".parse().unwrap(),
            Some("198.51.100.4".parse().unwrap()),
        );

        let transport = router.create_webrtc_transport(&announced).await.unwrap();
        let params = transport.params();

        assert_eq!(params.id, *transport.id());
        assert_eq!(params.ice_candidates.len(), 2);
        assert!(params.ice_candidates.iter().all(|c| c.ip == "198.51.100.4"));
        assert_eq!(params.dtls_parameters.fingerprints.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let engine = LoopbackEngine::new();
        let router = engine.create_router(default_media_codecs()).await.unwrap();
        let transport = router.create_webrtc_transport(&options()).await.unwrap();
        let dtls = DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![random_fingerprint()],
        };

        transport.connect(dtls.clone()).await.unwrap();
        assert!(matches!(
            transport.connect(dtls).await,
            Err(EngineError::AlreadyConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_produce_rejects_codec_outside_router_set() {
        let engine = LoopbackEngine::new();
        let router = engine.create_router(default_media_codecs()).await.unwrap();
        let transport = router.create_webrtc_transport(&options()).await.unwrap();

        let mut params = opus_parameters();
        if let Some(codec) = params.codecs.first_mut() {
            codec.mime_type = "audio/PCMU".to_string();
            codec.clock_rate = 8000;
            codec.channels = None;
        }

        assert!(matches!(
            transport.produce(MediaKind::Audio, params).await,
            Err(EngineError::UnsupportedCodec(_))
        ));
    }

    #[tokio::test]
    async fn test_consumer_uses_router_payload_type_and_starts_paused() {
        let engine = LoopbackEngine::new();
        let router = engine.create_router(default_media_codecs()).await.unwrap();
        let send = router.create_webrtc_transport(&options()).await.unwrap();
        let recv = router.create_webrtc_transport(&options()).await.unwrap();

        let producer = send
            .produce(MediaKind::Audio, opus_parameters())
            .await
            .unwrap();
        assert!(router.can_consume(producer.id(), &client_caps()));

        let consumer = recv
            .consume(producer.id(), &client_caps(), true)
            .await
            .unwrap();
        assert!(consumer.is_paused());
        assert_eq!(consumer.kind(), MediaKind::Audio);
        let codec = consumer.rtp_parameters().codecs.first().cloned().unwrap();
        assert_eq!(codec.payload_type, OPUS_PAYLOAD_TYPE);

        consumer.resume().await.unwrap();
        assert!(!consumer.is_paused());
    }

    #[tokio::test]
    async fn test_resume_fails_after_producer_closes() {
        let engine = LoopbackEngine::new();
        let router = engine.create_router(default_media_codecs()).await.unwrap();
        let send = router.create_webrtc_transport(&options()).await.unwrap();
        let recv = router.create_webrtc_transport(&options()).await.unwrap();
        let producer = send
            .produce(MediaKind::Audio, opus_parameters())
            .await
            .unwrap();
        let consumer = recv
            .consume(producer.id(), &client_caps(), true)
            .await
            .unwrap();

        producer.close().unwrap();

        assert!(!router.can_consume(producer.id(), &client_caps()));
        assert!(matches!(
            consumer.resume().await,
            Err(EngineError::UnknownProducer(_))
        ));
    }

    #[tokio::test]
    async fn test_consume_with_incompatible_caps() {
        let engine = LoopbackEngine::new();
        let router = engine.create_router(default_media_codecs()).await.unwrap();
        let send = router.create_webrtc_transport(&options()).await.unwrap();
        let recv = router.create_webrtc_transport(&options()).await.unwrap();
        let producer = send
            .produce(MediaKind::Audio, opus_parameters())
            .await
            .unwrap();

        let video_only = RtpCapabilities {
            codecs: default_media_codecs()
                .into_iter()
                .filter(|c| c.kind == MediaKind::Video)
                .collect(),
        };

        assert!(!router.can_consume(producer.id(), &video_only));
        assert!(matches!(
            recv.consume(producer.id(), &video_only, true).await,
            Err(EngineError::IncompatibleCapabilities(_))
        ));
    }

    #[tokio::test]
    async fn test_stats_and_injected_close_failures() {
        let engine = LoopbackEngine::new();
        let router = engine.create_router(default_media_codecs()).await.unwrap();
        let transport = router.create_webrtc_transport(&options()).await.unwrap();
        let producer = transport
            .produce(MediaKind::Audio, opus_parameters())
            .await
            .unwrap();

        assert_eq!(
            engine.stats(),
            EngineStats {
                routers: 1,
                transports: 1,
                producers: 1,
                consumers: 0,
            }
        );

        engine.fail_next_closes(1);
        assert!(producer.close().is_err());
        assert_eq!(engine.stats().producers, 1);

        producer.close().unwrap();
        transport.close().unwrap();
        // Second close is a no-op.
        transport.close().unwrap();
        router.close().unwrap();
        assert_eq!(engine.stats(), EngineStats::default());
    }
}
