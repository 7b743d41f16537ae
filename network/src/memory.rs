//! In-process signaling hub and loopback media, for tests.
//!
//! The hub plays the rendezvous server: clients register identities, the
//! listing reports them, and signals are relayed by destination. The
//! loopback connector "negotiates" through the same signals and then pipes
//! each side's [`LocalStream`] into a [`RemoteStream`] on the other side.

use crate::directory::PeerListing;
use crate::registry::{CallConnector, CallLink, SessionContext, SessionEventKind};
use crate::signaling::{
    Signal, SignalBody, SignalingChannel, SignalingTransport, TransportEvent, TransportEventKind,
};
use async_trait::async_trait;
use log::debug;
use mesh_core::{Error, LocalStream, PeerIdentity, RemoteStream};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Client {
    epoch: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Default)]
struct HubState {
    clients: HashMap<PeerIdentity, Client>,
    /// Local streams published per connection id
    media: HashMap<String, HashMap<PeerIdentity, LocalStream>>,
    relayed: usize,
}

/// Shared in-memory rendezvous
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
    refuse_connections: Arc<AtomicBool>,
    listing_unavailable: Arc<AtomicBool>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport { hub: self.clone() }
    }

    pub fn listing(&self) -> MemoryListing {
        MemoryListing { hub: self.clone() }
    }

    pub fn connector(&self) -> LoopbackConnector {
        LoopbackConnector { hub: self.clone() }
    }

    /// Registered identities, sorted
    pub fn peers(&self) -> Vec<PeerIdentity> {
        let mut peers: Vec<PeerIdentity> = self.state().clients.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Number of signals relayed so far
    pub fn relayed(&self) -> usize {
        self.state().relayed
    }

    /// Make new registrations fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Make the listing fail
    pub fn set_listing_unavailable(&self, unavailable: bool) {
        self.listing_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Drop a client's connection as if the network failed
    pub fn sever(&self, identity: &PeerIdentity) -> bool {
        let Some(client) = self.state().clients.remove(identity) else {
            return false;
        };
        let _ = client.events.send(TransportEvent {
            epoch: client.epoch,
            kind: TransportEventKind::Lost("severed".to_string()),
        });
        true
    }

    fn relay(&self, signal: Signal) {
        let mut state = self.state();
        state.relayed += 1;
        match state.clients.get(&signal.dst) {
            Some(client) => {
                let _ = client.events.send(TransportEvent {
                    epoch: client.epoch,
                    kind: TransportEventKind::Signal(signal),
                });
            }
            None => {
                // Bounce an EXPIRE back, like the rendezvous server does
                if let Some(sender) = state.clients.get(&signal.src) {
                    let _ = sender.events.send(TransportEvent {
                        epoch: sender.epoch,
                        kind: TransportEventKind::Signal(Signal {
                            src: signal.dst.clone(),
                            dst: signal.src.clone(),
                            connection_id: String::new(),
                            body: SignalBody::Leave,
                        }),
                    });
                }
            }
        }
    }

    fn publish_media(&self, connection_id: &str, identity: &PeerIdentity, stream: &LocalStream) {
        self.state()
            .media
            .entry(connection_id.to_string())
            .or_default()
            .insert(identity.clone(), stream.clone());
    }

    fn media_of(&self, connection_id: &str, identity: &PeerIdentity) -> Option<LocalStream> {
        self.state()
            .media
            .get(connection_id)
            .and_then(|m| m.get(identity))
            .cloned()
    }

    fn withdraw_media(&self, connection_id: &str, identity: &PeerIdentity) {
        let mut state = self.state();
        if let Some(streams) = state.media.get_mut(connection_id) {
            streams.remove(identity);
            if streams.is_empty() {
                state.media.remove(connection_id);
            }
        }
    }
}

/// Signaling transport registering with a [`MemoryHub`]
pub struct MemoryTransport {
    hub: MemoryHub,
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    async fn open(
        &self,
        identity: PeerIdentity,
        epoch: u64,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn SignalingChannel>, Error> {
        if self.hub.refuse_connections.load(Ordering::SeqCst) {
            return Err(Error::Signaling("Connection refused".to_string()));
        }
        let mut state = self.hub.state();
        if state.clients.contains_key(&identity) {
            return Err(Error::Signaling("ID is taken".to_string()));
        }
        state.clients.insert(identity.clone(), Client { epoch, events });
        debug!("Hub registered {}", identity);

        Ok(Box::new(MemoryChannel {
            hub: self.hub.clone(),
            identity,
            epoch,
        }))
    }
}

struct MemoryChannel {
    hub: MemoryHub,
    identity: PeerIdentity,
    epoch: u64,
}

impl SignalingChannel for MemoryChannel {
    fn send(&self, signal: Signal) -> Result<(), Error> {
        let registered = self
            .hub
            .state()
            .clients
            .get(&self.identity)
            .map_or(false, |c| c.epoch == self.epoch);
        if !registered {
            return Err(Error::Signaling("Not registered".to_string()));
        }
        self.hub.relay(signal);
        Ok(())
    }

    fn close(&self) {
        let mut state = self.hub.state();
        if state
            .clients
            .get(&self.identity)
            .map_or(false, |c| c.epoch == self.epoch)
        {
            state.clients.remove(&self.identity);
            debug!("Hub unregistered {}", self.identity);
        }
    }
}

/// Directory listing served by a [`MemoryHub`]
pub struct MemoryListing {
    hub: MemoryHub,
}

#[async_trait]
impl PeerListing for MemoryListing {
    async fn list(&self) -> Result<Vec<PeerIdentity>, Error> {
        if self.hub.listing_unavailable.load(Ordering::SeqCst) {
            return Err(Error::Directory("Listing unavailable".to_string()));
        }
        Ok(self.hub.peers())
    }
}

/// Connector whose media never leaves the process
pub struct LoopbackConnector {
    hub: MemoryHub,
}

impl LoopbackConnector {
    fn link(&self, ctx: SessionContext) -> LoopbackLink {
        self.hub
            .publish_media(&ctx.connection_id, &ctx.local, &ctx.local_stream);
        LoopbackLink {
            hub: self.hub.clone(),
            ctx,
            cancel: CancellationToken::new(),
            piping: false,
        }
    }
}

impl CallConnector for LoopbackConnector {
    fn dial(&self, ctx: SessionContext) -> Result<Box<dyn CallLink>, Error> {
        let link = self.link(ctx);
        link.ctx.signal(SignalBody::Offer {
            sdp: "loopback".to_string(),
        });
        Ok(Box::new(link))
    }

    fn answer(&self, ctx: SessionContext, offer: Signal) -> Result<Box<dyn CallLink>, Error> {
        if !matches!(offer.body, SignalBody::Offer { .. }) {
            return Err(Error::Negotiation("Expected an offer".to_string()));
        }
        let mut link = self.link(ctx);
        link.ctx.signal(SignalBody::Answer {
            sdp: "loopback".to_string(),
        });
        link.start_pipe()?;
        Ok(Box::new(link))
    }
}

struct LoopbackLink {
    hub: MemoryHub,
    ctx: SessionContext,
    cancel: CancellationToken,
    piping: bool,
}

impl LoopbackLink {
    /// Pipe the remote side's capture into a fresh remote stream
    fn start_pipe(&mut self) -> Result<(), Error> {
        if self.piping {
            return Ok(());
        }
        let source = self
            .hub
            .media_of(&self.ctx.connection_id, &self.ctx.peer)
            .ok_or_else(|| Error::Negotiation(format!("{} published no media", self.ctx.peer)))?;
        self.piping = true;

        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let remote = RemoteStream::new(
                format!("{}-audio", ctx.connection_id),
                ctx.peer.clone(),
                source.sample_rate(),
            );
            let mut frames = source.subscribe();
            let mut announced = false;
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = source.ended() => {
                        // The other side released its capture
                        ctx.report(SessionEventKind::Closed);
                        break;
                    }
                    frame = frames.recv() => frame,
                };
                match frame {
                    Ok(samples) => {
                        remote.push_samples(&samples);
                        if !announced {
                            announced = true;
                            ctx.report(SessionEventKind::RemoteMedia(remote.clone()));
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
            remote.end();
        });
        Ok(())
    }
}

impl CallLink for LoopbackLink {
    fn deliver(&mut self, signal: Signal) {
        match signal.body {
            SignalBody::Answer { .. } => {
                if let Err(e) = self.start_pipe() {
                    self.ctx.report(SessionEventKind::Failed(e.to_string()));
                }
            }
            other => debug!("Loopback ignores {:?}", other),
        }
    }

    fn hang_up(&mut self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            self.ctx.signal(SignalBody::Leave);
        }
    }
}

impl Drop for LoopbackLink {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.hub
            .withdraw_media(&self.ctx.connection_id, &self.ctx.local);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registration_and_relay() {
        let hub = MemoryHub::new();
        let transport = hub.transport();
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let amy = PeerIdentity::format("amy", 1);
        let bob = PeerIdentity::format("bob", 2);

        let a = transport.open(amy.clone(), 1, a_tx.clone()).await.unwrap();
        let _b = transport.open(bob.clone(), 7, b_tx).await.unwrap();
        assert!(transport.open(amy.clone(), 2, a_tx).await.is_err());
        assert_eq!(hub.listing().list().await.unwrap(), vec![amy.clone(), bob.clone()]);

        a.send(Signal {
            src: amy.clone(),
            dst: bob.clone(),
            connection_id: "mc_1".to_string(),
            body: SignalBody::Leave,
        })
        .unwrap();
        let event = b_rx.recv().await.unwrap();
        assert_eq!(event.epoch, 7);
        assert!(matches!(event.kind, TransportEventKind::Signal(_)));

        a.close();
        assert_eq!(hub.peers(), vec![bob]);
    }

    #[tokio::test]
    async fn signal_to_unknown_peer_bounces_leave() {
        let hub = MemoryHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let amy = PeerIdentity::format("amy", 1);
        let ghost = PeerIdentity::format("ghost", 9);

        let a = hub.transport().open(amy.clone(), 1, tx).await.unwrap();
        a.send(Signal {
            src: amy,
            dst: ghost.clone(),
            connection_id: "mc_1".to_string(),
            body: SignalBody::Offer {
                sdp: "loopback".to_string(),
            },
        })
        .unwrap();

        match rx.recv().await.unwrap().kind {
            TransportEventKind::Signal(signal) => {
                assert_eq!(signal.src, ghost);
                assert_eq!(signal.body, SignalBody::Leave);
            }
            other => panic!("Expected bounced signal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn sever_reports_loss() {
        let hub = MemoryHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let amy = PeerIdentity::format("amy", 1);
        let _a = hub.transport().open(amy.clone(), 3, tx).await.unwrap();

        assert!(hub.sever(&amy));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.epoch, 3);
        assert!(matches!(event.kind, TransportEventKind::Lost(_)));
        assert!(hub.peers().is_empty());
    }

    #[tokio::test]
    async fn released_capture_closes_the_far_side() {
        let hub = MemoryHub::new();
        let connector = hub.connector();
        let amy = PeerIdentity::format("amy", 1);
        let bob = PeerIdentity::format("bob", 2);
        let amy_stream = LocalStream::new(48000);

        let context = |local: &PeerIdentity, peer: &PeerIdentity, stream: &LocalStream| {
            let (signals, signals_rx) = mpsc::unbounded_channel();
            let (events, events_rx) = mpsc::unbounded_channel();
            let ctx = SessionContext {
                local: local.clone(),
                peer: peer.clone(),
                session: mesh_core::SessionId(1),
                connection_id: "mc_1".to_string(),
                local_stream: stream.clone(),
                signals,
                events,
            };
            (ctx, signals_rx, events_rx)
        };

        let (amy_ctx, mut amy_signals, _amy_events) = context(&amy, &bob, &amy_stream);
        let _amy_link = connector.dial(amy_ctx).unwrap();
        let offer = amy_signals.recv().await.unwrap();

        let (bob_ctx, _bob_signals, mut bob_events) =
            context(&bob, &amy, &LocalStream::new(48000));
        let _bob_link = connector.answer(bob_ctx, offer).unwrap();

        amy_stream.end();
        let event = bob_events.recv().await.unwrap();
        assert_eq!(event.peer, amy);
        assert!(matches!(event.kind, SessionEventKind::Closed));
    }
}
