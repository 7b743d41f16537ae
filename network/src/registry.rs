//! One call session per remote identity.
//!
//! The registry is owned by the coordinating actor and mutated only there.
//! Negotiation runs inside the [`CallConnector`]; it reports back through
//! [`SessionEvent`]s tagged with the [`SessionId`] it was started for, so
//! reports about a session that has since been replaced are ignored.

use crate::signaling::{Signal, SignalBody};
use log::{debug, info, warn};
use mesh_core::{
    CallDirection, CallSession, CallState, Error, EventBus, LocalStream, MeshEvent, PeerIdentity,
    RemoteStream, SessionId,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// What negotiation reports about a session
#[derive(Debug, Clone)]
pub enum SessionEventKind {
    /// First remote media frame arrived
    RemoteMedia(RemoteStream),
    /// The remote side hung up or the connection closed
    Closed,
    /// Negotiation or transport failed
    Failed(String),
    /// Still negotiating when the call timeout elapsed
    TimedOut,
}

/// Report from a running negotiation
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub peer: PeerIdentity,
    pub session: SessionId,
    pub kind: SessionEventKind,
}

/// Everything a connector needs to run one session
#[derive(Clone)]
pub struct SessionContext {
    pub local: PeerIdentity,
    pub peer: PeerIdentity,
    pub session: SessionId,
    pub connection_id: String,
    pub local_stream: LocalStream,
    /// Negotiation messages for the signaling link
    pub signals: mpsc::UnboundedSender<Signal>,
    /// Progress reports for the registry
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionContext {
    /// Send a negotiation message to the remote peer
    pub fn signal(&self, body: SignalBody) {
        let _ = self.signals.send(Signal {
            src: self.local.clone(),
            dst: self.peer.clone(),
            connection_id: self.connection_id.clone(),
            body,
        });
    }

    /// Report progress to the registry
    pub fn report(&self, kind: SessionEventKind) {
        let _ = self.events.send(SessionEvent {
            peer: self.peer.clone(),
            session: self.session,
            kind,
        });
    }
}

/// Handle on a running negotiation
pub trait CallLink: Send {
    /// Hand over a negotiation message from the remote peer
    fn deliver(&mut self, signal: Signal);

    /// Tear the session down and tell the remote peer
    fn hang_up(&mut self);
}

/// Starts negotiations. Both methods return immediately; the work runs in
/// the background and reports through [`SessionContext::events`].
pub trait CallConnector: Send + Sync {
    /// Place a call
    fn dial(&self, ctx: SessionContext) -> Result<Box<dyn CallLink>, Error>;

    /// Answer an incoming offer
    fn answer(&self, ctx: SessionContext, offer: Signal) -> Result<Box<dyn CallLink>, Error>;
}

/// Registry transition the owner reacts to
#[derive(Debug, Clone)]
pub enum SessionChange {
    Activated(CallSession),
    Closed(CallSession),
}

struct Entry {
    session: CallSession,
    connection_id: String,
    link: Box<dyn CallLink>,
}

/// Fresh connection id in the PeerJS format
pub fn new_connection_id() -> String {
    format!("mc_{}", uuid::Uuid::new_v4().simple())
}

/// Call sessions keyed by remote identity
pub struct CallRegistry {
    connector: Arc<dyn CallConnector>,
    bus: EventBus,
    sessions: HashMap<PeerIdentity, Entry>,
    next_session: u64,
    call_timeout: Duration,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    signals_tx: mpsc::UnboundedSender<Signal>,
}

impl CallRegistry {
    /// Create a new registry
    pub fn new(
        connector: Arc<dyn CallConnector>,
        bus: EventBus,
        call_timeout: Duration,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
        signals_tx: mpsc::UnboundedSender<Signal>,
    ) -> Self {
        Self {
            connector,
            bus,
            sessions: HashMap::new(),
            next_session: 0,
            call_timeout,
            events_tx,
            signals_tx,
        }
    }

    pub fn contains(&self, peer: &PeerIdentity) -> bool {
        self.sessions.contains_key(peer)
    }

    /// Snapshot of the session with `peer`
    pub fn get(&self, peer: &PeerIdentity) -> Option<CallSession> {
        self.sessions.get(peer).map(|e| e.session.clone())
    }

    /// Whether `session` is still the registered session for `peer`
    pub fn is_live(&self, peer: &PeerIdentity, session: SessionId) -> bool {
        self.sessions
            .get(peer)
            .map_or(false, |e| e.session.id == session && e.session.state != CallState::Closed)
    }

    /// Snapshots of every session, ordered by session id
    pub fn sessions(&self) -> Vec<CallSession> {
        let mut all: Vec<CallSession> = self.sessions.values().map(|e| e.session.clone()).collect();
        all.sort_by_key(|s| s.id);
        all
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn context(
        &mut self,
        local: &PeerIdentity,
        peer: &PeerIdentity,
        connection_id: String,
        local_stream: &LocalStream,
    ) -> SessionContext {
        self.next_session += 1;
        SessionContext {
            local: local.clone(),
            peer: peer.clone(),
            session: SessionId(self.next_session),
            connection_id,
            local_stream: local_stream.clone(),
            signals: self.signals_tx.clone(),
            events: self.events_tx.clone(),
        }
    }

    fn insert(
        &mut self,
        ctx_peer: PeerIdentity,
        session: SessionId,
        direction: CallDirection,
        connection_id: String,
        link: Box<dyn CallLink>,
    ) -> CallSession {
        let snapshot = CallSession {
            peer: ctx_peer.clone(),
            id: session,
            direction,
            state: CallState::Calling,
            media: None,
        };
        self.sessions.insert(
            ctx_peer.clone(),
            Entry {
                session: snapshot.clone(),
                connection_id,
                link,
            },
        );

        // Abandon the call if it never becomes active
        let events = self.events_tx.clone();
        let timeout = self.call_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(SessionEvent {
                peer: ctx_peer,
                session,
                kind: SessionEventKind::TimedOut,
            });
        });

        snapshot
    }

    /// Call `peer`. Returns the existing session when there already is one.
    pub fn initiate(
        &mut self,
        local: &PeerIdentity,
        peer: PeerIdentity,
        local_stream: &LocalStream,
    ) -> Result<CallSession, Error> {
        if let Some(existing) = self.sessions.get(&peer) {
            debug!("Already in a session with {}, not calling again", peer);
            return Ok(existing.session.clone());
        }
        if &peer == local {
            return Err(Error::InvalidIdentity("Cannot call ourselves".to_string()));
        }

        let ctx = self.context(local, &peer, new_connection_id(), local_stream);
        let session = ctx.session;
        let connection_id = ctx.connection_id.clone();
        info!("Calling {} (session {})", peer, session);

        let link = self.connector.dial(ctx)?;
        Ok(self.insert(peer, session, CallDirection::Outbound, connection_id, link))
    }

    /// Answer an incoming offer. A peer already in a session keeps it and
    /// the new offer is dropped, except when both sides dialled each other:
    /// then the side with the greater identity abandons its own call and
    /// answers, while the other keeps waiting for that answer.
    pub fn accept(
        &mut self,
        local: &PeerIdentity,
        offer: Signal,
        local_stream: &LocalStream,
    ) -> Result<CallSession, Error> {
        if !matches!(offer.body, SignalBody::Offer { .. }) {
            return Err(Error::Negotiation(format!(
                "Expected an offer from {}",
                offer.src
            )));
        }
        let peer = offer.src.clone();
        let crossed = self.sessions.get(&peer).map_or(false, |e| {
            e.session.direction == CallDirection::Outbound && e.session.state == CallState::Calling
        });
        if crossed && local > &peer {
            if let Some(abandoned) = self.sessions.remove(&peer) {
                // Dropped without hanging up; the peer still waits on its own call
                info!(
                    "Calls with {} crossed, answering theirs instead of session {}",
                    peer, abandoned.session.id
                );
            }
        } else if let Some(existing) = self.sessions.get(&peer) {
            debug!(
                "Ignoring offer {} from {}: session {} exists",
                offer.connection_id, peer, existing.session.id
            );
            return Ok(existing.session.clone());
        }

        let ctx = self.context(local, &peer, offer.connection_id.clone(), local_stream);
        let session = ctx.session;
        let connection_id = ctx.connection_id.clone();
        info!("Answering call from {} (session {})", peer, session);

        let link = self.connector.answer(ctx, offer)?;
        Ok(self.insert(peer, session, CallDirection::Inbound, connection_id, link))
    }

    /// Route a negotiation message that is not a new offer. Returns the
    /// session closed by a LEAVE, if any.
    pub fn deliver(&mut self, signal: Signal) -> Option<CallSession> {
        let Some(entry) = self.sessions.get_mut(&signal.src) else {
            debug!("No session with {}, dropping {:?}", signal.src, signal.body);
            return None;
        };

        // Server-generated LEAVE/EXPIRE carry no connection id
        let matches = signal.connection_id.is_empty() || signal.connection_id == entry.connection_id;
        if !matches {
            debug!(
                "Signal for connection {} does not match session {}",
                signal.connection_id, entry.session.id
            );
            return None;
        }

        if signal.body == SignalBody::Leave {
            let peer = signal.src.clone();
            return self.finish(&peer, "remote hung up", false);
        }
        entry.link.deliver(signal);
        None
    }

    /// Apply a report from a negotiation
    pub fn handle_event(&mut self, event: SessionEvent) -> Option<SessionChange> {
        if !self.is_live(&event.peer, event.session) {
            debug!(
                "Ignoring report for stale session {} with {}",
                event.session, event.peer
            );
            return None;
        }

        match event.kind {
            SessionEventKind::RemoteMedia(stream) => self
                .activate(&event.peer, stream)
                .map(SessionChange::Activated),
            SessionEventKind::Closed => self
                .finish(&event.peer, "connection closed", true)
                .map(SessionChange::Closed),
            SessionEventKind::Failed(reason) => {
                warn!("Session with {} failed: {}", event.peer, reason);
                self.finish(&event.peer, "negotiation failed", true)
                    .map(SessionChange::Closed)
            }
            SessionEventKind::TimedOut => {
                let calling = self
                    .sessions
                    .get(&event.peer)
                    .map_or(false, |e| e.session.state == CallState::Calling);
                if !calling {
                    return None;
                }
                warn!("Call with {} timed out", event.peer);
                self.finish(&event.peer, "timed out", true)
                    .map(SessionChange::Closed)
            }
        }
    }

    fn activate(&mut self, peer: &PeerIdentity, stream: RemoteStream) -> Option<CallSession> {
        let entry = self.sessions.get_mut(peer)?;
        if entry.session.state != CallState::Calling {
            return None;
        }
        entry.session.state = CallState::Active;
        entry.session.media = Some(stream.clone());
        let snapshot = entry.session.clone();

        info!("Session {} with {} is active", snapshot.id, peer);
        self.bus.publish(MeshEvent::Stream {
            peer: peer.clone(),
            media: stream,
        });
        self.bus.publish(MeshEvent::PeerJoined {
            peer: peer.clone(),
            display_name: peer.display_name(),
        });
        Some(snapshot)
    }

    /// Close the session with `peer`
    pub fn close(&mut self, peer: &PeerIdentity) -> Option<CallSession> {
        self.finish(peer, "closed locally", true)
    }

    /// Close every session
    pub fn close_all(&mut self) -> Vec<CallSession> {
        let mut peers: Vec<(SessionId, PeerIdentity)> = self
            .sessions
            .values()
            .map(|e| (e.session.id, e.session.peer.clone()))
            .collect();
        peers.sort();
        peers
            .into_iter()
            .filter_map(|(_, peer)| self.close(&peer))
            .collect()
    }

    fn finish(&mut self, peer: &PeerIdentity, reason: &str, hang_up: bool) -> Option<CallSession> {
        let mut entry = self.sessions.remove(peer)?;
        if hang_up {
            entry.link.hang_up();
        }
        entry.session.state = CallState::Closed;
        if let Some(media) = &entry.session.media {
            media.end();
        }

        info!("Session {} with {} closed: {}", entry.session.id, peer, reason);
        self.bus.publish(MeshEvent::PeerLeft { peer: peer.clone() });
        Some(entry.session)
    }
}
