use crate::{PeerIdentity, RemoteStream};

/// Kinds of events published on the [`EventBus`](crate::EventBus).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    PeerJoined,
    PeerLeft,
    Stream,
    SpeakingChanged,
    Disconnected,
}

impl EventKind {
    /// Every kind, in declaration order
    pub const ALL: [EventKind; 6] = [
        EventKind::Connected,
        EventKind::PeerJoined,
        EventKind::PeerLeft,
        EventKind::Stream,
        EventKind::SpeakingChanged,
        EventKind::Disconnected,
    ];

    /// Wire name understood by external consumers
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::PeerJoined => "peer_joined",
            EventKind::PeerLeft => "peer_left",
            EventKind::Stream => "stream",
            EventKind::SpeakingChanged => "speaking_changed",
            EventKind::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the mesh core to external consumers
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// The signaling link registered us under `id`
    Connected {
        /// Our identity for this connection
        id: PeerIdentity,
    },

    /// A call session became active
    PeerJoined {
        /// Remote participant
        peer: PeerIdentity,
        /// Name parsed from the identity token
        display_name: String,
    },

    /// A call session closed, whatever the cause
    PeerLeft {
        /// Remote participant
        peer: PeerIdentity,
    },

    /// Remote media is available for a peer
    Stream {
        /// Remote participant
        peer: PeerIdentity,
        /// Handle on the remote audio
        media: RemoteStream,
    },

    /// A remote participant started or stopped speaking
    SpeakingChanged {
        /// Remote participant
        peer: PeerIdentity,
        /// New classification
        is_speaking: bool,
    },

    /// We left the mesh on purpose
    Disconnected,
}

impl MeshEvent {
    /// The kind this event is dispatched under
    pub fn kind(&self) -> EventKind {
        match self {
            MeshEvent::Connected { .. } => EventKind::Connected,
            MeshEvent::PeerJoined { .. } => EventKind::PeerJoined,
            MeshEvent::PeerLeft { .. } => EventKind::PeerLeft,
            MeshEvent::Stream { .. } => EventKind::Stream,
            MeshEvent::SpeakingChanged { .. } => EventKind::SpeakingChanged,
            MeshEvent::Disconnected => EventKind::Disconnected,
        }
    }

    /// The remote peer this event concerns, if any
    pub fn peer(&self) -> Option<&PeerIdentity> {
        match self {
            MeshEvent::PeerJoined { peer, .. }
            | MeshEvent::PeerLeft { peer }
            | MeshEvent::Stream { peer, .. }
            | MeshEvent::SpeakingChanged { peer, .. } => Some(peer),
            MeshEvent::Connected { .. } | MeshEvent::Disconnected => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_match_wire_names() {
        let names: Vec<&str> = EventKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "connected",
                "peer_joined",
                "peer_left",
                "stream",
                "speaking_changed",
                "disconnected"
            ]
        );
    }

    #[test]
    fn event_reports_its_kind_and_peer() {
        let peer = PeerIdentity::format("amy", 1);
        let event = MeshEvent::SpeakingChanged {
            peer: peer.clone(),
            is_speaking: true,
        };
        assert_eq!(event.kind(), EventKind::SpeakingChanged);
        assert_eq!(event.peer(), Some(&peer));
        assert_eq!(MeshEvent::Disconnected.peer(), None);
    }
}
