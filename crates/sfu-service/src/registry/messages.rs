//! Message types for the registry actor.

use crate::errors::SfuError;
use common::types::{ConsumerId, ParticipantId, ProducerId, RoomId, TransportId};
use signaling_protocol::rtp::{
    DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, TransportDirection,
};
use signaling_protocol::Response;
use std::fmt;
use tokio::sync::{mpsc, oneshot};

/// Identifies one signaling connection for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    #[must_use]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Addressing of one request: the connection it arrived on and the envelope
/// ids it carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub connection_id: ConnectionId,
    pub room_id: RoomId,
    pub participant_id: Option<ParticipantId>,
}

impl RequestContext {
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        room_id: RoomId,
        participant_id: Option<ParticipantId>,
    ) -> Self {
        Self {
            connection_id,
            room_id,
            participant_id,
        }
    }
}

/// Resource counts for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub participant_id: ParticipantId,
    pub connection_id: ConnectionId,
    pub transports: usize,
    pub producers: Vec<(ProducerId, MediaKind)>,
    pub consumers: usize,
}

/// Point-in-time view of one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub created_at: i64,
    pub connections: usize,
    pub peers: Vec<PeerSnapshot>,
}

impl RoomSnapshot {
    /// Snapshot of a single peer, if present.
    #[must_use]
    pub fn peer(&self, participant_id: &ParticipantId) -> Option<&PeerSnapshot> {
        self.peers
            .iter()
            .find(|p| &p.participant_id == participant_id)
    }
}

type Reply<T> = oneshot::Sender<Result<T, SfuError>>;

/// Messages handled by the registry actor.
pub enum RegistryMessage {
    /// Register a new connection and its outbound push queue.
    BindConnection {
        outbound: mpsc::Sender<String>,
        respond_to: oneshot::Sender<ConnectionId>,
    },

    Capabilities {
        ctx: RequestContext,
        respond_to: Reply<Response>,
    },

    CreateTransport {
        ctx: RequestContext,
        direction: TransportDirection,
        respond_to: Reply<Response>,
    },

    ConnectTransport {
        ctx: RequestContext,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
        respond_to: Reply<Response>,
    },

    Produce {
        ctx: RequestContext,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        respond_to: Reply<Response>,
    },

    CloseProducer {
        ctx: RequestContext,
        producer_id: ProducerId,
        respond_to: Reply<Response>,
    },

    Consume {
        ctx: RequestContext,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        respond_to: Reply<Response>,
    },

    ResumeConsumer {
        ctx: RequestContext,
        consumer_id: ConsumerId,
        respond_to: Reply<Response>,
    },

    /// Push `NEW_PRODUCER` for every open producer the connection has not
    /// been told about yet.
    AnnounceExisting {
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<usize>,
    },

    /// Connection closed: broadcast closures and clean up its peer.
    Disconnect {
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<()>,
    },

    RoomCount {
        respond_to: oneshot::Sender<usize>,
    },

    PeerSnapshot {
        room_id: RoomId,
        respond_to: oneshot::Sender<Option<RoomSnapshot>>,
    },

    /// Close every room and stop the actor.
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

impl fmt::Debug for RegistryMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistryMessage::BindConnection { .. } => "BindConnection",
            RegistryMessage::Capabilities { .. } => "Capabilities",
            RegistryMessage::CreateTransport { .. } => "CreateTransport",
            RegistryMessage::ConnectTransport { .. } => "ConnectTransport",
            RegistryMessage::Produce { .. } => "Produce",
            RegistryMessage::CloseProducer { .. } => "CloseProducer",
            RegistryMessage::Consume { .. } => "Consume",
            RegistryMessage::ResumeConsumer { .. } => "ResumeConsumer",
            RegistryMessage::AnnounceExisting { .. } => "AnnounceExisting",
            RegistryMessage::Disconnect { .. } => "Disconnect",
            RegistryMessage::RoomCount { .. } => "RoomCount",
            RegistryMessage::PeerSnapshot { .. } => "PeerSnapshot",
            RegistryMessage::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(7).to_string(), "conn-7");
        assert_eq!(ConnectionId::new(7).value(), 7);
    }

    #[test]
    fn test_room_snapshot_peer_lookup() {
        let snapshot = RoomSnapshot {
            room_id: RoomId::from("r1"),
            created_at: 0,
            connections: 1,
            peers: vec![PeerSnapshot {
                participant_id: ParticipantId::from("alice"),
                connection_id: ConnectionId::new(1),
                transports: 2,
                producers: vec![],
                consumers: 0,
            }],
        };

        assert_eq!(
            snapshot
                .peer(&ParticipantId::from("alice"))
                .map(|p| p.transports),
            Some(2)
        );
        assert!(snapshot.peer(&ParticipantId::from("bob")).is_none());
    }
}
