//! Room and peer aggregates owned by the registry actor.
//!
//! Collections are private. Callers go through the named insert/remove
//! operations so that a handle is always reachable from exactly one place.

use super::messages::{ConnectionId, PeerSnapshot, RoomSnapshot};
use crate::engine::{EngineConsumer, EngineProducer, Router, WebRtcTransport};
use common::types::{ConsumerId, ParticipantId, ProducerId, RoomId, TransportId};
use signaling_protocol::rtp::{MediaKind, TransportDirection};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// A transport tagged with the direction it was created for.
pub struct PeerTransport {
    pub direction: TransportDirection,
    pub handle: Arc<dyn WebRtcTransport>,
}

/// Producer announcement data: owner and kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub participant_id: ParticipantId,
    pub kind: MediaKind,
}

/// One participant's engine resources within a room.
pub struct PeerSession {
    participant_id: ParticipantId,
    connection_id: ConnectionId,
    transports: HashMap<TransportId, PeerTransport>,
    producers: HashMap<ProducerId, Box<dyn EngineProducer>>,
    consumers: HashMap<ConsumerId, Arc<dyn EngineConsumer>>,
}

impl PeerSession {
    pub fn new(participant_id: ParticipantId, connection_id: ConnectionId) -> Self {
        Self {
            participant_id,
            connection_id,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn insert_transport(
        &mut self,
        direction: TransportDirection,
        handle: Arc<dyn WebRtcTransport>,
    ) {
        self.transports
            .insert(handle.id().clone(), PeerTransport { direction, handle });
    }

    pub fn transport(&self, transport_id: &TransportId) -> Option<&PeerTransport> {
        self.transports.get(transport_id)
    }

    pub fn insert_producer(&mut self, producer: Box<dyn EngineProducer>) {
        self.producers.insert(producer.id().clone(), producer);
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    pub fn has_producer(&self, producer_id: &ProducerId) -> bool {
        self.producers.contains_key(producer_id)
    }

    pub fn remove_producer(&mut self, producer_id: &ProducerId) -> Option<Box<dyn EngineProducer>> {
        self.producers.remove(producer_id)
    }

    /// Announcement data for every open producer.
    pub fn producer_infos(&self) -> Vec<ProducerInfo> {
        self.producers
            .values()
            .map(|p| ProducerInfo {
                producer_id: p.id().clone(),
                participant_id: self.participant_id.clone(),
                kind: p.kind(),
            })
            .collect()
    }

    pub fn insert_consumer(&mut self, consumer: Arc<dyn EngineConsumer>) {
        self.consumers.insert(consumer.id().clone(), consumer);
    }

    pub fn consumer(&self, consumer_id: &ConsumerId) -> Option<Arc<dyn EngineConsumer>> {
        self.consumers.get(consumer_id).cloned()
    }

    pub fn remove_consumer(&mut self, consumer_id: &ConsumerId) -> Option<Arc<dyn EngineConsumer>> {
        self.consumers.remove(consumer_id)
    }

    /// Remove every consumer fed by `producer_id`.
    pub fn remove_consumers_of(&mut self, producer_id: &ProducerId) -> Vec<Arc<dyn EngineConsumer>> {
        let ids: Vec<ConsumerId> = self
            .consumers
            .values()
            .filter(|c| c.producer_id() == producer_id)
            .map(|c| c.id().clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.consumers.remove(id))
            .collect()
    }

    pub fn drain_consumers(&mut self) -> Vec<Arc<dyn EngineConsumer>> {
        self.consumers.drain().map(|(_, c)| c).collect()
    }

    pub fn drain_producers(&mut self) -> Vec<Box<dyn EngineProducer>> {
        self.producers.drain().map(|(_, p)| p).collect()
    }

    pub fn drain_transports(&mut self) -> Vec<PeerTransport> {
        self.transports.drain().map(|(_, t)| t).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty() && self.producers.is_empty() && self.consumers.is_empty()
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        let mut producers: Vec<(ProducerId, MediaKind)> = self
            .producers
            .values()
            .map(|p| (p.id().clone(), p.kind()))
            .collect();
        producers.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        PeerSnapshot {
            participant_id: self.participant_id.clone(),
            connection_id: self.connection_id,
            transports: self.transports.len(),
            producers,
            consumers: self.consumers.len(),
        }
    }
}

/// A room: one router plus the peers and connections attached to it.
pub struct Room {
    id: RoomId,
    router: Arc<dyn Router>,
    peers: HashMap<ParticipantId, PeerSession>,
    connections: BTreeSet<ConnectionId>,
    created_at: i64,
}

impl Room {
    pub fn new(id: RoomId, router: Arc<dyn Router>) -> Self {
        Self {
            id,
            router,
            peers: HashMap::new(),
            connections: BTreeSet::new(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn router(&self) -> Arc<dyn Router> {
        Arc::clone(&self.router)
    }

    pub fn peer(&self, participant_id: &ParticipantId) -> Option<&PeerSession> {
        self.peers.get(participant_id)
    }

    pub fn peer_mut(&mut self, participant_id: &ParticipantId) -> Option<&mut PeerSession> {
        self.peers.get_mut(participant_id)
    }

    pub fn insert_peer(&mut self, peer: PeerSession) {
        self.peers.insert(peer.participant_id().clone(), peer);
    }

    pub fn remove_peer(&mut self, participant_id: &ParticipantId) -> Option<PeerSession> {
        self.peers.remove(participant_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn has_peers(&self) -> bool {
        !self.peers.is_empty()
    }

    pub fn add_connection(&mut self, connection_id: ConnectionId) {
        self.connections.insert(connection_id);
    }

    pub fn remove_connection(&mut self, connection_id: ConnectionId) {
        self.connections.remove(&connection_id);
    }

    /// Connections in the room other than `connection_id`.
    pub fn connections_except(&self, connection_id: ConnectionId) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .copied()
            .filter(|c| *c != connection_id)
            .collect()
    }

    /// Owner and kind of an open producer anywhere in the room.
    pub fn find_producer(&self, producer_id: &ProducerId) -> Option<ProducerInfo> {
        self.peers
            .values()
            .flat_map(PeerSession::producer_infos)
            .find(|info| &info.producer_id == producer_id)
    }

    /// Open producers not owned by `participant_id`.
    pub fn producers_excluding(&self, participant_id: Option<&ParticipantId>) -> Vec<ProducerInfo> {
        self.peers
            .values()
            .filter(|peer| Some(peer.participant_id()) != participant_id)
            .flat_map(PeerSession::producer_infos)
            .collect()
    }

    /// Remove every consumer of `producer_id` from every peer.
    pub fn remove_consumers_of(&mut self, producer_id: &ProducerId) -> Vec<Arc<dyn EngineConsumer>> {
        self.peers
            .values_mut()
            .flat_map(|peer| peer.remove_consumers_of(producer_id))
            .collect()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        let mut peers: Vec<PeerSnapshot> = self.peers.values().map(PeerSession::snapshot).collect();
        peers.sort_by(|a, b| a.participant_id.as_str().cmp(b.participant_id.as_str()));
        RoomSnapshot {
            room_id: self.id.clone(),
            created_at: self.created_at,
            connections: self.connections.len(),
            peers,
        }
    }
}
