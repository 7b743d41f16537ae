//! The coordinating actor.
//!
//! One task owns the signaling link, the call registry, the capture
//! controller and the detector handles, and is the only place they are
//! mutated. Anything that can take a while (capture acquisition, connect
//! attempts, retry delays, directory queries) is spawned under the session
//! cancellation token and reports back as an internal message, so the actor
//! keeps handling events meanwhile and `leave()` can interrupt all of it.

use crate::commands::MeshCommand;
use crate::handle::MeshHandle;
use audio::{DetachHandle, MediaCaptureController, SpeakingActivityDetector, SpeakingEdge};
use log::{debug, error, info, warn};
use mesh_core::{
    CallSession, ConnectionState, Error, EventBus, LocalStream, MeshEvent, PeerIdentity, SessionId,
};
use network::{
    CallRegistry, ConnectAttempt, ConnectOutcome, LinkStep, NetworkStack, PeerDirectory,
    ReconnectPolicy, SessionChange, SessionEvent, Signal, SignalBody, SignalingLink,
    TransportEvent, TransportEventKind,
};
use settings_manager::Settings;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Commands queued before senders wait
const COMMAND_BUFFER: usize = 32;

/// Point-in-time view of a coordinator
#[derive(Debug, Clone, Default)]
pub struct MeshSnapshot {
    /// Between a successful join and the matching leave
    pub joined: bool,
    pub state: ConnectionState,
    /// Registered identity while connected
    pub local_identity: Option<PeerIdentity>,
    /// Call sessions ordered by session id
    pub sessions: Vec<CallSession>,
    pub muted: bool,
    /// Directory queries completed since the coordinator started
    pub discovery_rounds: u64,
}

enum Phase {
    Idle,
    Acquiring {
        display_name: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Joined,
}

/// Results of spawned work
enum Internal {
    CaptureReady {
        generation: u64,
        capture: MediaCaptureController,
        result: Result<LocalStream, Error>,
    },
    ConnectDone(ConnectOutcome),
    RetryDue { epoch: u64 },
    DiscoveryDue { epoch: u64 },
    Listing { epoch: u64, peers: Vec<PeerIdentity> },
}

/// Detector attached to an active session
struct Tracked {
    session: SessionId,
    detach: DetachHandle,
    liveness: CancellationToken,
}

impl Tracked {
    fn stop(self) {
        self.liveness.cancel();
        self.detach.detach();
    }
}

/// Mesh coordination actor
pub struct MeshCoordinator {
    bus: EventBus,
    link: SignalingLink,
    registry: CallRegistry,
    directory: PeerDirectory,
    detector: SpeakingActivityDetector,
    /// `None` while an acquisition task holds it
    capture: Option<MediaCaptureController>,
    local_stream: Option<LocalStream>,
    muted: bool,
    phase: Phase,
    /// Bumped by every leave; stale capture results are recognised by it
    generation: u64,
    session_token: CancellationToken,
    discovery_delay: Duration,
    discovery_rounds: u64,
    detectors: HashMap<PeerIdentity, Tracked>,
    command_rx: mpsc::Receiver<MeshCommand>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    signals_rx: mpsc::UnboundedReceiver<Signal>,
    edges_rx: mpsc::UnboundedReceiver<SpeakingEdge>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
}

impl MeshCoordinator {
    /// Create a new coordinator and the handle that drives it
    pub fn new(
        settings: &Settings,
        stack: NetworkStack,
        capture: MediaCaptureController,
    ) -> (Self, MeshHandle) {
        let bus = EventBus::new();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (edges_tx, edges_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let link = SignalingLink::new(
            stack.transport.clone(),
            bus.clone(),
            ReconnectPolicy::from_settings(&settings.reconnect),
            transport_tx,
        );
        let registry = CallRegistry::new(
            stack.connector.clone(),
            bus.clone(),
            settings.call_timeout(),
            session_tx,
            signals_tx,
        );
        let directory =
            PeerDirectory::new(stack.listing.clone(), settings.discovery.namespace.clone());
        let detector = SpeakingActivityDetector::new(&settings.speaking, edges_tx);

        let coordinator = Self {
            bus,
            link,
            registry,
            directory,
            detector,
            capture: Some(capture),
            local_stream: None,
            muted: false,
            phase: Phase::Idle,
            generation: 0,
            session_token: CancellationToken::new(),
            discovery_delay: settings.discovery.delay(),
            discovery_rounds: 0,
            detectors: HashMap::new(),
            command_rx,
            transport_rx,
            session_rx,
            signals_rx,
            edges_rx,
            internal_tx,
            internal_rx,
        };
        (coordinator, MeshHandle::new(command_tx))
    }

    /// Create a coordinator and run it on its own task
    pub fn spawn(
        settings: &Settings,
        stack: NetworkStack,
        capture: MediaCaptureController,
    ) -> (MeshHandle, JoinHandle<Result<(), Error>>) {
        let (coordinator, handle) = Self::new(settings, stack, capture);
        (handle, tokio::spawn(coordinator.run()))
    }

    /// Run the coordinator until shut down or every handle is dropped
    pub async fn run(mut self) -> Result<(), Error> {
        info!("Mesh coordinator started");
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    let keep_running = match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            debug!("All mesh handles dropped");
                            self.leave();
                            false
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }

                Some(event) = self.transport_rx.recv() => self.handle_transport_event(event),

                Some(event) = self.session_rx.recv() => self.handle_session_event(event),

                // Negotiation messages from running sessions
                Some(signal) = self.signals_rx.recv() => self.link.send(signal),

                Some(edge) = self.edges_rx.recv() => self.handle_speaking_edge(edge),

                Some(message) = self.internal_rx.recv() => self.handle_internal(message),
            }
        }
        info!("Mesh coordinator stopped");
        Ok(())
    }

    /// Returns false once the coordinator should stop
    fn handle_command(&mut self, command: MeshCommand) -> bool {
        debug!("Mesh command: {:?}", command);
        match command {
            MeshCommand::Join {
                display_name,
                reply,
            } => self.join(display_name, reply),
            MeshCommand::Leave { reply } => {
                self.leave();
                let _ = reply.send(());
            }
            MeshCommand::SetMuted(muted) => self.set_muted(muted),
            MeshCommand::Subscribe {
                kind,
                handler,
                reply,
            } => {
                let _ = reply.send(self.bus.subscribe(kind, handler));
            }
            MeshCommand::Unsubscribe { kind, id, reply } => {
                let _ = reply.send(self.bus.unsubscribe(kind, id));
            }
            MeshCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            MeshCommand::Shutdown => {
                info!("Received shutdown command");
                self.leave();
                return false;
            }
        }
        true
    }

    fn snapshot(&self) -> MeshSnapshot {
        let state = self.link.current_state();
        MeshSnapshot {
            joined: matches!(self.phase, Phase::Joined),
            state,
            local_identity: self
                .link
                .identity()
                .filter(|_| state == ConnectionState::Connected)
                .cloned(),
            sessions: self.registry.sessions(),
            muted: self.muted,
            discovery_rounds: self.discovery_rounds,
        }
    }

    fn join(&mut self, display_name: String, reply: oneshot::Sender<Result<(), Error>>) {
        match self.phase {
            Phase::Joined => {
                if self.link.current_state() == ConnectionState::Disconnected {
                    info!("Joined but offline, reconnecting as {}", display_name);
                    if let Some(attempt) = self.link.prepare_connect(&display_name) {
                        self.spawn_connect(attempt);
                    }
                } else {
                    debug!("Already joined, ignoring join");
                }
                let _ = reply.send(Ok(()));
                return;
            }
            Phase::Acquiring { .. } => {
                let _ = reply.send(Err(Error::InvalidState(
                    "A join is already in progress".to_string(),
                )));
                return;
            }
            Phase::Idle => {}
        }

        let Some(mut capture) = self.capture.take() else {
            let _ = reply.send(Err(Error::InvalidState(
                "Capture is still being released".to_string(),
            )));
            return;
        };

        info!("Joining as {}", display_name);
        let generation = self.generation;
        let token = self.session_token.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => Err(Error::Cancelled),
                result = capture.acquire() => result,
            };
            let _ = internal.send(Internal::CaptureReady {
                generation,
                capture,
                result,
            });
        });

        self.phase = Phase::Acquiring {
            display_name,
            reply,
        };
    }

    fn leave(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {
                debug!("Not joined, nothing to leave");
                return;
            }
            Phase::Acquiring { reply, .. } => {
                info!("Join interrupted by leave");
                let _ = reply.send(Err(Error::Cancelled));
            }
            Phase::Joined => {
                info!("Leaving the mesh");
                for (_, tracked) in self.detectors.drain() {
                    tracked.stop();
                }
                let closed = self.registry.close_all();
                debug!("Closed {} session(s)", closed.len());
                // Let the hang-ups reach the peers before the link goes down
                while let Ok(signal) = self.signals_rx.try_recv() {
                    self.link.send(signal);
                }
                self.link.disconnect();
            }
        }

        self.session_token.cancel();
        self.session_token = CancellationToken::new();
        self.generation += 1;

        if let Some(capture) = &mut self.capture {
            capture.release();
        }
        self.local_stream = None;
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        match (&mut self.capture, &self.local_stream) {
            (Some(capture), _) => capture.set_muted(muted),
            // Applied when an acquisition in flight hands the capture back
            (None, Some(stream)) => stream.set_muted(muted),
            (None, None) => {}
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::CaptureReady {
                generation,
                capture,
                result,
            } => self.capture_ready(generation, capture, result),
            Internal::ConnectDone(outcome) => {
                let step = self.link.finish_connect(outcome);
                self.follow(step);
            }
            Internal::RetryDue { epoch } => {
                if let Some(attempt) = self.link.retry(epoch) {
                    self.spawn_connect(attempt);
                }
            }
            Internal::DiscoveryDue { epoch } => self.start_discovery(epoch),
            Internal::Listing { epoch, peers } => self.form_mesh(epoch, peers),
        }
    }

    fn capture_ready(
        &mut self,
        generation: u64,
        mut capture: MediaCaptureController,
        result: Result<LocalStream, Error>,
    ) {
        if generation != self.generation {
            // The join was abandoned by leave()
            capture.release();
            self.capture = Some(capture);
            return;
        }

        let display_name = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Acquiring {
                display_name,
                reply,
            } => match result {
                Ok(stream) => {
                    capture.set_muted(self.muted);
                    self.local_stream = Some(stream);
                    self.phase = Phase::Joined;
                    let _ = reply.send(Ok(()));
                    display_name
                }
                Err(e) => {
                    error!("Failed to acquire capture: {}", e);
                    self.capture = Some(capture);
                    let _ = reply.send(Err(e));
                    return;
                }
            },
            other => {
                self.phase = other;
                capture.release();
                self.capture = Some(capture);
                return;
            }
        };
        self.capture = Some(capture);

        if let Some(attempt) = self.link.prepare_connect(&display_name) {
            self.spawn_connect(attempt);
        }
    }

    fn spawn_connect(&self, attempt: ConnectAttempt) {
        debug!(
            "Connecting as {} (epoch {})",
            attempt.identity(),
            attempt.epoch()
        );
        let token = self.session_token.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                outcome = attempt.open() => {
                    let _ = internal.send(Internal::ConnectDone(outcome));
                }
            }
        });
    }

    /// Deliver `message` after `delay` unless the session is cancelled first
    fn schedule(&self, delay: Duration, message: Internal) {
        let token = self.session_token.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = internal.send(message);
                }
            }
        });
    }

    fn follow(&mut self, step: LinkStep) {
        match step {
            LinkStep::Connected(identity) => {
                debug!(
                    "Connected as {}, discovering peers in {:?}",
                    identity, self.discovery_delay
                );
                self.schedule(
                    self.discovery_delay,
                    Internal::DiscoveryDue {
                        epoch: self.link.epoch(),
                    },
                );
            }
            LinkStep::Retry { delay, epoch } => {
                self.schedule(delay, Internal::RetryDue { epoch });
            }
            LinkStep::GaveUp => {
                warn!("Signaling unavailable, staying disconnected");
            }
            LinkStep::Ignored => {}
        }
    }

    fn start_discovery(&self, epoch: u64) {
        if !self.link.accepts(epoch) {
            debug!("Skipping discovery for outdated connection (epoch {})", epoch);
            return;
        }
        let directory = self.directory.clone();
        let token = self.session_token.clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                peers = directory.fetch() => {
                    let _ = internal.send(Internal::Listing { epoch, peers });
                }
            }
        });
    }

    /// Call every listed peer not already in a session
    fn form_mesh(&mut self, epoch: u64, peers: Vec<PeerIdentity>) {
        if !self.link.accepts(epoch) {
            debug!("Dropping listing for outdated connection (epoch {})", epoch);
            return;
        }
        let (Some(local), Some(stream)) = (self.link.identity().cloned(), self.local_stream.clone())
        else {
            return;
        };

        self.discovery_rounds += 1;
        let registry = &self.registry;
        let candidates = self
            .directory
            .filter(peers, &local, |peer| registry.contains(peer));
        info!(
            "Discovery round {}: {} peer(s) to call",
            self.discovery_rounds,
            candidates.len()
        );

        for peer in candidates {
            if let Err(e) = self.registry.initiate(&local, peer.clone(), &stream) {
                warn!("Failed to call {}: {}", peer, e);
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event.kind {
            TransportEventKind::Lost(reason) => {
                let step = self.link.on_transport_lost(event.epoch, &reason);
                self.follow(step);
            }
            TransportEventKind::Signal(signal) => {
                if !self.link.accepts(event.epoch) {
                    debug!("Dropping signal from {} on an outdated connection", signal.src);
                    return;
                }
                self.handle_signal(signal);
            }
        }
    }

    fn handle_signal(&mut self, signal: Signal) {
        if matches!(signal.body, SignalBody::Offer { .. }) {
            let (Some(local), Some(stream)) =
                (self.link.identity().cloned(), self.local_stream.clone())
            else {
                debug!("Not joined, ignoring offer from {}", signal.src);
                return;
            };
            let peer = signal.src.clone();
            // Incoming calls are answered automatically
            if let Err(e) = self.registry.accept(&local, signal, &stream) {
                warn!("Failed to answer {}: {}", peer, e);
            }
            return;
        }

        if let Some(closed) = self.registry.deliver(signal) {
            self.session_closed(&closed);
        }
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match self.registry.handle_event(event) {
            Some(SessionChange::Activated(session)) => self.session_activated(session),
            Some(SessionChange::Closed(session)) => self.session_closed(&session),
            None => {}
        }
    }

    fn session_activated(&mut self, session: CallSession) {
        let Some(media) = session.media else {
            return;
        };
        let liveness = self.session_token.child_token();
        let detach = self
            .detector
            .attach(session.peer.clone(), media, liveness.clone());
        let tracked = Tracked {
            session: session.id,
            detach,
            liveness,
        };
        if let Some(previous) = self.detectors.insert(session.peer, tracked) {
            previous.stop();
        }
    }

    fn session_closed(&mut self, session: &CallSession) {
        let owned = self
            .detectors
            .get(&session.peer)
            .map_or(false, |t| t.session == session.id);
        if owned {
            if let Some(tracked) = self.detectors.remove(&session.peer) {
                tracked.stop();
            }
        }
    }

    fn handle_speaking_edge(&mut self, edge: SpeakingEdge) {
        let session = self
            .detectors
            .get(&edge.peer)
            .filter(|t| t.detach.id() == edge.detector && !t.detach.is_detached())
            .map(|t| t.session);

        match session {
            Some(session) if self.registry.is_live(&edge.peer, session) => {
                debug!(
                    "{} {} (energy {:.1})",
                    edge.peer,
                    if edge.is_speaking { "started speaking" } else { "stopped speaking" },
                    edge.energy
                );
                self.bus.publish(MeshEvent::SpeakingChanged {
                    peer: edge.peer,
                    is_speaking: edge.is_speaking,
                });
            }
            _ => debug!("Dropping edge from detached detector {:?}", edge.detector),
        }
    }
}
