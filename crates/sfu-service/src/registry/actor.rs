//! `RegistryActor` - owner of every room, peer and connection binding.
//!
//! All registry state lives inside one actor task. Handlers on each
//! connection talk to it through [`RegistryActorHandle`], so every mutation
//! of a room is serialized by the mailbox. Two simultaneous first requests
//! for the same unknown room therefore create exactly one router.
//!
//! # Cleanup order
//!
//! When a connection goes away, its peer's producers are announced closed to
//! the rest of the room first, then consumers, producers and transports are
//! closed in that order. Each close is best-effort: a failure is logged and
//! counted, and the remaining closes still run. The room is removed once it
//! has no peers left.

use super::messages::{ConnectionId, RegistryMessage, RequestContext, RoomSnapshot};
use super::room::{PeerSession, ProducerInfo, Room};
use crate::config::Config;
use crate::engine::{EngineError, ForwardingEngine, TransportOptions, WebRtcTransport};
use crate::errors::SfuError;
use crate::observability::metrics;
use common::types::{ConsumerId, ParticipantId, ProducerId, RoomId, TransportId};
use signaling_protocol::codec::encode_push;
use signaling_protocol::rtp::{
    default_media_codecs, DtlsParameters, MediaKind, RtpCapabilities, RtpCodecCapability,
    RtpParameters, TransportDirection,
};
use signaling_protocol::{Push, Response};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Mailbox size for the registry actor.
const REGISTRY_CHANNEL_BUFFER: usize = 1024;

/// Static settings for the registry.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Codec set every room router is created with.
    pub media_codecs: Vec<RtpCodecCapability>,
    pub transport_options: TransportOptions,
    /// Zero means unlimited.
    pub max_peers_per_room: usize,
    /// Zero means unlimited.
    pub max_producers_per_peer: usize,
}

impl RegistrySettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            media_codecs: default_media_codecs(),
            transport_options: TransportOptions::new(config.listen_ip, config.announced_ip),
            max_peers_per_room: config.max_peers_per_room,
            max_producers_per_peer: config.max_producers_per_peer,
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            media_codecs: default_media_codecs(),
            transport_options: TransportOptions::new(
                std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
                None,
            ),
            max_peers_per_room: 0,
            max_producers_per_peer: 0,
        }
    }
}

/// Handle to the registry actor.
#[derive(Clone)]
pub struct RegistryActorHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RegistryActorHandle {
    /// Spawn the registry actor and return a handle to it.
    #[must_use]
    pub fn new(
        engine: Arc<dyn ForwardingEngine>,
        settings: RegistrySettings,
        cancel_token: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let actor = RegistryActor::new(engine, settings, receiver, cancel_token.clone());
        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryMessage,
    ) -> Result<T, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Register a connection. Pushes for it are written to `outbound`.
    pub async fn bind_connection(
        &self,
        outbound: mpsc::Sender<String>,
    ) -> Result<ConnectionId, SfuError> {
        self.call(|respond_to| RegistryMessage::BindConnection {
            outbound,
            respond_to,
        })
        .await
    }

    pub async fn capabilities(&self, ctx: RequestContext) -> Result<Response, SfuError> {
        self.call(|respond_to| RegistryMessage::Capabilities { ctx, respond_to })
            .await?
    }

    pub async fn create_transport(
        &self,
        ctx: RequestContext,
        direction: TransportDirection,
    ) -> Result<Response, SfuError> {
        self.call(|respond_to| RegistryMessage::CreateTransport {
            ctx,
            direction,
            respond_to,
        })
        .await?
    }

    pub async fn connect_transport(
        &self,
        ctx: RequestContext,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<Response, SfuError> {
        self.call(|respond_to| RegistryMessage::ConnectTransport {
            ctx,
            transport_id,
            dtls_parameters,
            respond_to,
        })
        .await?
    }

    pub async fn produce(
        &self,
        ctx: RequestContext,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Response, SfuError> {
        self.call(|respond_to| RegistryMessage::Produce {
            ctx,
            transport_id,
            kind,
            rtp_parameters,
            respond_to,
        })
        .await?
    }

    pub async fn close_producer(
        &self,
        ctx: RequestContext,
        producer_id: ProducerId,
    ) -> Result<Response, SfuError> {
        self.call(|respond_to| RegistryMessage::CloseProducer {
            ctx,
            producer_id,
            respond_to,
        })
        .await?
    }

    pub async fn consume(
        &self,
        ctx: RequestContext,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<Response, SfuError> {
        self.call(|respond_to| RegistryMessage::Consume {
            ctx,
            transport_id,
            producer_id,
            rtp_capabilities,
            respond_to,
        })
        .await?
    }

    pub async fn resume_consumer(
        &self,
        ctx: RequestContext,
        consumer_id: ConsumerId,
    ) -> Result<Response, SfuError> {
        self.call(|respond_to| RegistryMessage::ResumeConsumer {
            ctx,
            consumer_id,
            respond_to,
        })
        .await?
    }

    /// Announce already-open producers to a connection. Returns how many
    /// pushes were queued.
    pub async fn announce_existing(&self, connection_id: ConnectionId) -> Result<usize, SfuError> {
        self.call(|respond_to| RegistryMessage::AnnounceExisting {
            connection_id,
            respond_to,
        })
        .await
    }

    /// Tear down everything the connection owns. Resolves after cleanup.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> Result<(), SfuError> {
        self.call(|respond_to| RegistryMessage::Disconnect {
            connection_id,
            respond_to,
        })
        .await
    }

    pub async fn room_count(&self) -> Result<usize, SfuError> {
        self.call(|respond_to| RegistryMessage::RoomCount { respond_to })
            .await
    }

    pub async fn peer_snapshot(&self, room_id: RoomId) -> Result<Option<RoomSnapshot>, SfuError> {
        self.call(|respond_to| RegistryMessage::PeerSnapshot {
            room_id,
            respond_to,
        })
        .await
    }

    /// Close every room and stop the actor.
    pub async fn shutdown(&self) -> Result<(), SfuError> {
        self.call(|respond_to| RegistryMessage::Shutdown { respond_to })
            .await
    }

    /// Cancel the actor without draining.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Registry view of one signaling connection.
struct ConnectionEntry {
    outbound: mpsc::Sender<String>,
    room_id: Option<RoomId>,
    participant_id: Option<ParticipantId>,
    /// Producers this connection has been told about.
    announced: HashSet<ProducerId>,
}

pub struct RegistryActor {
    engine: Arc<dyn ForwardingEngine>,
    settings: RegistrySettings,
    receiver: mpsc::Receiver<RegistryMessage>,
    cancel_token: CancellationToken,
    rooms: HashMap<RoomId, Room>,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    next_connection_id: u64,
}

impl RegistryActor {
    fn new(
        engine: Arc<dyn ForwardingEngine>,
        settings: RegistrySettings,
        receiver: mpsc::Receiver<RegistryMessage>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            engine,
            settings,
            receiver,
            cancel_token,
            rooms: HashMap::new(),
            connections: HashMap::new(),
            next_connection_id: 1,
        }
    }

    #[instrument(skip_all, name = "sfu.registry")]
    async fn run(mut self) {
        info!(target: "sfu.registry", "RegistryActor started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "sfu.registry", "RegistryActor received cancellation signal");
                    self.close_all_rooms();
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(RegistryMessage::Shutdown { respond_to }) => {
                            self.close_all_rooms();
                            let _ = respond_to.send(());
                            break;
                        }
                        Some(message) => self.handle_message(message).await,
                        None => {
                            info!(target: "sfu.registry", "RegistryActor channel closed, exiting");
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.registry",
            rooms_remaining = self.rooms.len(),
            connections_remaining = self.connections.len(),
            "RegistryActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::BindConnection {
                outbound,
                respond_to,
            } => {
                let _ = respond_to.send(self.bind_connection(outbound));
            }

            RegistryMessage::Capabilities { ctx, respond_to } => {
                let result = self.capabilities(&ctx).await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::CreateTransport {
                ctx,
                direction,
                respond_to,
            } => {
                let result = self.create_transport(&ctx, direction).await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::ConnectTransport {
                ctx,
                transport_id,
                dtls_parameters,
                respond_to,
            } => {
                let result = self
                    .connect_transport(&ctx, &transport_id, dtls_parameters)
                    .await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::Produce {
                ctx,
                transport_id,
                kind,
                rtp_parameters,
                respond_to,
            } => {
                let result = self
                    .produce(&ctx, &transport_id, kind, rtp_parameters)
                    .await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::CloseProducer {
                ctx,
                producer_id,
                respond_to,
            } => {
                let result = self.close_producer(&ctx, &producer_id).await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::Consume {
                ctx,
                transport_id,
                producer_id,
                rtp_capabilities,
                respond_to,
            } => {
                let result = self
                    .consume(&ctx, &transport_id, &producer_id, &rtp_capabilities)
                    .await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::ResumeConsumer {
                ctx,
                consumer_id,
                respond_to,
            } => {
                let result = self.resume_consumer(&ctx, &consumer_id).await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::AnnounceExisting {
                connection_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.announce_existing(connection_id));
            }

            RegistryMessage::Disconnect {
                connection_id,
                respond_to,
            } => {
                self.disconnect(connection_id);
                let _ = respond_to.send(());
            }

            RegistryMessage::RoomCount { respond_to } => {
                let _ = respond_to.send(self.rooms.len());
            }

            RegistryMessage::PeerSnapshot {
                room_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.rooms.get(&room_id).map(Room::snapshot));
            }

            // Handled in `run` so the loop can exit.
            RegistryMessage::Shutdown { respond_to } => {
                let _ = respond_to.send(());
            }
        }
    }

    fn bind_connection(&mut self, outbound: mpsc::Sender<String>) -> ConnectionId {
        let connection_id = ConnectionId::new(self.next_connection_id);
        self.next_connection_id += 1;
        self.connections.insert(
            connection_id,
            ConnectionEntry {
                outbound,
                room_id: None,
                participant_id: None,
                announced: HashSet::new(),
            },
        );
        debug!(target: "sfu.registry", connection_id = %connection_id, "Connection bound");
        connection_id
    }

    // ------------------------------------------------------------------
    // Room and peer lifecycle
    // ------------------------------------------------------------------

    /// Return the room, creating it with a fresh router if unknown.
    async fn get_or_create_room(&mut self, room_id: &RoomId) -> Result<&mut Room, SfuError> {
        if !self.rooms.contains_key(room_id) {
            let router = self
                .engine
                .create_router(self.settings.media_codecs.clone())
                .await?;
            self.rooms
                .insert(room_id.clone(), Room::new(room_id.clone(), router));
            metrics::set_rooms_active(self.rooms.len());
            info!(target: "sfu.registry", room_id = %room_id, "Room created");
        }
        self.rooms
            .get_mut(room_id)
            .ok_or_else(|| SfuError::Internal("room vanished after creation".to_string()))
    }

    /// Apply connection binding rules, then join the connection to the room.
    async fn enter_room(&mut self, ctx: &RequestContext) -> Result<(), SfuError> {
        let entry = self
            .connections
            .get(&ctx.connection_id)
            .ok_or_else(|| SfuError::Internal(format!("{} is not registered", ctx.connection_id)))?;

        if let Some(bound) = &entry.room_id {
            if bound != &ctx.room_id {
                return Err(SfuError::RoomMismatch {
                    bound: bound.clone(),
                    requested: ctx.room_id.clone(),
                });
            }
        }

        let mut superseded = Vec::new();
        if let Some(requested) = &ctx.participant_id {
            match &entry.participant_id {
                Some(bound) if bound != requested => {
                    return Err(SfuError::ParticipantMismatch(requested.clone()));
                }
                Some(_) => {}
                None => {
                    superseded = self
                        .connections
                        .iter()
                        .filter(|(id, other)| {
                            **id != ctx.connection_id
                                && other.room_id.as_ref() == Some(&ctx.room_id)
                                && other.participant_id.as_ref() == Some(requested)
                        })
                        .map(|(id, _)| *id)
                        .collect();
                }
            }
        }

        // A participant reconnecting takes over from its previous connection,
        // whose own disconnect may not have arrived yet.
        for previous in superseded {
            info!(
                target: "sfu.registry",
                room_id = %ctx.room_id,
                previous = %previous,
                connection_id = %ctx.connection_id,
                "Participant reclaimed by new connection"
            );
            self.disconnect(previous);
        }

        // The room may have been removed and recreated since the last request.
        self.get_or_create_room(&ctx.room_id)
            .await?
            .add_connection(ctx.connection_id);

        if let Some(entry) = self.connections.get_mut(&ctx.connection_id) {
            entry.room_id.get_or_insert_with(|| ctx.room_id.clone());
            if let Some(participant_id) = &ctx.participant_id {
                entry
                    .participant_id
                    .get_or_insert_with(|| participant_id.clone());
            }
        }
        Ok(())
    }

    /// Enter the room and make sure the requesting participant has a peer.
    async fn ensure_peer(&mut self, ctx: &RequestContext) -> Result<&mut PeerSession, SfuError> {
        let participant_id = ctx
            .participant_id
            .clone()
            .ok_or(SfuError::MissingParticipantId)?;
        self.enter_room(ctx).await?;

        let max_peers = self.settings.max_peers_per_room;
        let room = self.room_mut(&ctx.room_id)?;
        if room.peer(&participant_id).is_none() {
            if max_peers > 0 && room.peer_count() >= max_peers {
                return Err(SfuError::RoomFull(ctx.room_id.clone()));
            }
            room.insert_peer(PeerSession::new(participant_id.clone(), ctx.connection_id));
            debug!(
                target: "sfu.registry",
                room_id = %ctx.room_id,
                participant_id = %participant_id,
                "Peer created"
            );
            self.publish_peer_count();
        }

        self.room_mut(&ctx.room_id)?
            .peer_mut(&participant_id)
            .ok_or_else(|| SfuError::Internal("peer vanished after creation".to_string()))
    }

    fn room_mut(&mut self, room_id: &RoomId) -> Result<&mut Room, SfuError> {
        self.rooms
            .get_mut(room_id)
            .ok_or_else(|| SfuError::Internal(format!("room {room_id} not found")))
    }

    /// Close everything a peer owns and drop it from its room. The room is
    /// removed when no peers remain.
    fn cleanup_peer(&mut self, room_id: &RoomId, participant_id: &ParticipantId) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return;
        };
        let Some(mut peer) = room.remove_peer(participant_id) else {
            return;
        };

        for consumer in peer.drain_consumers() {
            close_quietly("consumer", consumer.id().as_str(), consumer.close());
        }
        for producer in peer.drain_producers() {
            close_quietly("producer", producer.id().as_str(), producer.close());
            for consumer in room.remove_consumers_of(producer.id()) {
                close_quietly("consumer", consumer.id().as_str(), consumer.close());
            }
        }
        for transport in peer.drain_transports() {
            close_quietly(
                "transport",
                transport.handle.id().as_str(),
                transport.handle.close(),
            );
        }

        info!(
            target: "sfu.registry",
            room_id = %room_id,
            participant_id = %participant_id,
            peers_remaining = room.peer_count(),
            "Peer cleaned up"
        );

        if !room.has_peers() {
            self.remove_room(room_id);
        }
        self.publish_peer_count();
    }

    fn remove_room(&mut self, room_id: &RoomId) {
        if let Some(room) = self.rooms.remove(room_id) {
            close_quietly("router", room_id.as_str(), room.router().close());
            metrics::set_rooms_active(self.rooms.len());
            info!(target: "sfu.registry", room_id = %room_id, "Room removed");
        }
    }

    fn close_all_rooms(&mut self) {
        let peers: Vec<(RoomId, ParticipantId)> = self
            .rooms
            .values()
            .flat_map(|room| {
                room.snapshot()
                    .peers
                    .into_iter()
                    .map(|p| (room.id().clone(), p.participant_id))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (room_id, participant_id) in peers {
            self.cleanup_peer(&room_id, &participant_id);
        }
        let empty_rooms: Vec<RoomId> = self.rooms.keys().cloned().collect();
        for room_id in empty_rooms {
            self.remove_room(&room_id);
        }
        self.connections.clear();
    }

    fn publish_peer_count(&self) {
        metrics::set_peers_active(self.rooms.values().map(Room::peer_count).sum());
    }

    // ------------------------------------------------------------------
    // Request operations
    // ------------------------------------------------------------------

    async fn capabilities(&mut self, ctx: &RequestContext) -> Result<Response, SfuError> {
        self.enter_room(ctx).await?;
        let rtp_capabilities = self.room_mut(&ctx.room_id)?.router().rtp_capabilities();
        Ok(Response::CapabilitiesResponse {
            room_id: ctx.room_id.clone(),
            rtp_capabilities,
        })
    }

    async fn create_transport(
        &mut self,
        ctx: &RequestContext,
        direction: TransportDirection,
    ) -> Result<Response, SfuError> {
        self.ensure_peer(ctx).await?;
        let router = self.room_mut(&ctx.room_id)?.router();
        let transport: Arc<dyn WebRtcTransport> = Arc::from(
            router
                .create_webrtc_transport(&self.settings.transport_options)
                .await?,
        );
        let params = transport.params();

        self.ensure_peer(ctx)
            .await?
            .insert_transport(direction, Arc::clone(&transport));

        debug!(
            target: "sfu.registry",
            room_id = %ctx.room_id,
            transport_id = %params.id,
            direction = %direction,
            "Transport created"
        );

        Ok(Response::TransportCreated {
            room_id: ctx.room_id.clone(),
            direction,
            params,
        })
    }

    async fn connect_transport(
        &mut self,
        ctx: &RequestContext,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<Response, SfuError> {
        let transport = self
            .ensure_peer(ctx)
            .await?
            .transport(transport_id)
            .map(|t| Arc::clone(&t.handle))
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;

        transport.connect(dtls_parameters).await?;

        Ok(Response::TransportConnected {
            transport_id: transport_id.clone(),
        })
    }

    async fn produce(
        &mut self,
        ctx: &RequestContext,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Response, SfuError> {
        let max_producers = self.settings.max_producers_per_peer;
        let peer = self.ensure_peer(ctx).await?;
        let participant_id = peer.participant_id().clone();
        if max_producers > 0 && peer.producer_count() >= max_producers {
            return Err(SfuError::ProducerLimit(participant_id));
        }
        let transport = peer
            .transport(transport_id)
            .map(|t| Arc::clone(&t.handle))
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;

        let producer = transport.produce(kind, rtp_parameters).await?;
        let producer_id = producer.id().clone();
        self.ensure_peer(ctx).await?.insert_producer(producer);

        info!(
            target: "sfu.registry",
            room_id = %ctx.room_id,
            participant_id = %participant_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );

        let info = ProducerInfo {
            producer_id: producer_id.clone(),
            participant_id,
            kind,
        };
        let others = self.room_mut(&ctx.room_id)?.connections_except(ctx.connection_id);
        for connection_id in others {
            self.announce(connection_id, &ctx.room_id, &info);
        }

        Ok(Response::Produced { producer_id })
    }

    async fn close_producer(
        &mut self,
        ctx: &RequestContext,
        producer_id: &ProducerId,
    ) -> Result<Response, SfuError> {
        let peer = self.ensure_peer(ctx).await?;
        let participant_id = peer.participant_id().clone();
        let producer = peer
            .remove_producer(producer_id)
            .ok_or_else(|| SfuError::ProducerNotFound(producer_id.clone()))?;

        close_quietly("producer", producer_id.as_str(), producer.close());
        let room = self.room_mut(&ctx.room_id)?;
        for consumer in room.remove_consumers_of(producer_id) {
            close_quietly("consumer", consumer.id().as_str(), consumer.close());
        }
        let others = room.connections_except(ctx.connection_id);

        let push = Push::ProducerClosed {
            room_id: ctx.room_id.clone(),
            participant_id,
            producer_id: producer_id.clone(),
        };
        for connection_id in others {
            self.push_to(connection_id, &push);
        }

        Ok(Response::ProducerClosedAck {
            producer_id: producer_id.clone(),
        })
    }

    async fn consume(
        &mut self,
        ctx: &RequestContext,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<Response, SfuError> {
        self.ensure_peer(ctx).await?;
        let room = self.room_mut(&ctx.room_id)?;
        if room.find_producer(producer_id).is_none() {
            return Err(SfuError::ProducerNotFound(producer_id.clone()));
        }
        let router = room.router();
        if !router.can_consume(producer_id, rtp_capabilities) {
            return Err(SfuError::CannotConsume(producer_id.clone()));
        }

        let transport = self
            .ensure_peer(ctx)
            .await?
            .transport(transport_id)
            .map(|t| Arc::clone(&t.handle))
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;

        let consumer = transport
            .consume(producer_id, rtp_capabilities, true)
            .await
            .map_err(|e| match e {
                EngineError::UnknownProducer(id) => SfuError::ProducerNotFound(id),
                EngineError::IncompatibleCapabilities(id) => SfuError::CannotConsume(id),
                other => SfuError::Engine(other),
            })?;

        let response = Response::Consumed {
            consumer_id: consumer.id().clone(),
            producer_id: producer_id.clone(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
        };
        self.ensure_peer(ctx).await?.insert_consumer(Arc::from(consumer));

        Ok(response)
    }

    async fn resume_consumer(
        &mut self,
        ctx: &RequestContext,
        consumer_id: &ConsumerId,
    ) -> Result<Response, SfuError> {
        let consumer = self
            .ensure_peer(ctx)
            .await?
            .consumer(consumer_id)
            .ok_or_else(|| SfuError::ConsumerNotFound(consumer_id.clone()))?;

        match consumer.resume().await {
            Ok(()) => Ok(Response::ConsumerResumed {
                consumer_id: consumer_id.clone(),
            }),
            Err(EngineError::UnknownProducer(_) | EngineError::Closed(_)) => {
                // Source is gone; the consumer went with it.
                if let Some(stale) = self.ensure_peer(ctx).await?.remove_consumer(consumer_id) {
                    close_quietly("consumer", consumer_id.as_str(), stale.close());
                }
                Err(SfuError::ConsumerNotFound(consumer_id.clone()))
            }
            Err(other) => Err(other.into()),
        }
    }

    // ------------------------------------------------------------------
    // Pushes
    // ------------------------------------------------------------------

    fn announce_existing(&mut self, connection_id: ConnectionId) -> usize {
        let Some(entry) = self.connections.get(&connection_id) else {
            return 0;
        };
        let Some(room_id) = entry.room_id.clone() else {
            return 0;
        };
        let participant_id = entry.participant_id.clone();
        let Some(room) = self.rooms.get(&room_id) else {
            return 0;
        };

        let existing = room.producers_excluding(participant_id.as_ref());
        existing
            .iter()
            .filter(|info| self.announce(connection_id, &room_id, info))
            .count()
    }

    /// Send `NEW_PRODUCER` unless this connection already heard about it.
    fn announce(&mut self, connection_id: ConnectionId, room_id: &RoomId, info: &ProducerInfo) -> bool {
        let Some(entry) = self.connections.get_mut(&connection_id) else {
            return false;
        };
        if !entry.announced.insert(info.producer_id.clone()) {
            return false;
        }
        let push = Push::NewProducer {
            room_id: room_id.clone(),
            producer_id: info.producer_id.clone(),
            participant_id: info.participant_id.clone(),
            kind: info.kind,
        };
        self.push_to(connection_id, &push)
    }

    /// Queue a push on a connection without waiting.
    fn push_to(&self, connection_id: ConnectionId, push: &Push) -> bool {
        let Some(entry) = self.connections.get(&connection_id) else {
            return false;
        };
        let frame = match encode_push(push) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "sfu.registry", error = %e, "Failed to encode push");
                return false;
            }
        };
        match entry.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    target: "sfu.registry",
                    connection_id = %connection_id,
                    producer_id = %push.producer_id(),
                    "Outbound queue full, push dropped"
                );
                metrics::record_push_dropped();
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    target: "sfu.registry",
                    connection_id = %connection_id,
                    "Outbound queue closed, push skipped"
                );
                false
            }
        }
    }

    fn disconnect(&mut self, connection_id: ConnectionId) {
        let Some(entry) = self.connections.remove(&connection_id) else {
            return;
        };
        let Some(room_id) = entry.room_id else {
            return;
        };

        let owned_peer = entry.participant_id.filter(|participant_id| {
            self.rooms
                .get(&room_id)
                .and_then(|room| room.peer(participant_id))
                .is_some_and(|peer| peer.connection_id() == connection_id)
        });

        if let Some(room) = self.rooms.get_mut(&room_id) {
            room.remove_connection(connection_id);
        }

        match owned_peer {
            Some(participant_id) => {
                let closing: Vec<ProducerInfo> = self
                    .rooms
                    .get(&room_id)
                    .and_then(|room| room.peer(&participant_id))
                    .map(PeerSession::producer_infos)
                    .unwrap_or_default();
                let others = self
                    .rooms
                    .get(&room_id)
                    .map(|room| room.connections_except(connection_id))
                    .unwrap_or_default();

                for info in &closing {
                    let push = Push::ProducerClosed {
                        room_id: room_id.clone(),
                        participant_id: info.participant_id.clone(),
                        producer_id: info.producer_id.clone(),
                    };
                    for other in &others {
                        self.push_to(*other, &push);
                    }
                }

                self.cleanup_peer(&room_id, &participant_id);
            }
            None => {
                let empty = self.rooms.get(&room_id).is_some_and(|room| !room.has_peers());
                if empty {
                    self.remove_room(&room_id);
                }
            }
        }

        debug!(target: "sfu.registry", connection_id = %connection_id, "Connection released");
    }
}

/// Log and count a failed close; never propagate it.
fn close_quietly(resource: &'static str, id: &str, result: Result<(), EngineError>) {
    if let Err(e) = result {
        warn!(
            target: "sfu.registry",
            resource,
            id,
            error = %e,
            "Close failed, continuing cleanup"
        );
        metrics::record_close_failure(resource);
    }
}
