//! Control connection to the rendezvous endpoint.
//!
//! [`SignalingLink`] owns the [`ConnectionState`] and the reconnection policy.
//! The transport underneath is pluggable through [`SignalingTransport`]. Each
//! connection attempt is stamped with an epoch; events from older epochs are
//! ignored, so a transport torn down by `disconnect()` can never schedule a
//! reconnect.

use crate::reconnect::ReconnectPolicy;
use async_trait::async_trait;
use log::{debug, info, warn};
use mesh_core::{ConnectionState, Error, EventBus, MeshEvent, PeerIdentity};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// ICE candidate as exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Body of a negotiation message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalBody {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidate),
    /// The peer is gone or hung up
    Leave,
}

/// Negotiation message relayed by the signaling endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub src: PeerIdentity,
    pub dst: PeerIdentity,
    /// Identifies the call the message belongs to
    pub connection_id: String,
    pub body: SignalBody,
}

/// What a transport reports after it opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    /// Inbound negotiation message
    Signal(Signal),
    /// The connection dropped
    Lost(String),
}

/// Event from the transport, tagged with the epoch of the attempt that
/// opened it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub epoch: u64,
    pub kind: TransportEventKind,
}

/// Open connection to the signaling endpoint
pub trait SignalingChannel: Send + Sync {
    /// Queue a message for the endpoint
    fn send(&self, signal: Signal) -> Result<(), Error>;

    /// Close the connection without reporting it as lost
    fn close(&self);
}

/// Factory for signaling connections
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Register `identity` with the endpoint. Resolves once the endpoint has
    /// accepted the registration. Inbound traffic and loss are reported on
    /// `events`, tagged with `epoch`.
    async fn open(
        &self,
        identity: PeerIdentity,
        epoch: u64,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Box<dyn SignalingChannel>, Error>;
}

/// A connection attempt prepared by the link. Opening it does not borrow the
/// link, so the owner can keep handling other work meanwhile.
pub struct ConnectAttempt {
    epoch: u64,
    identity: PeerIdentity,
    transport: Arc<dyn SignalingTransport>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

/// Result of an opened [`ConnectAttempt`]
pub struct ConnectOutcome {
    epoch: u64,
    identity: PeerIdentity,
    result: Result<Box<dyn SignalingChannel>, Error>,
}

impl ConnectAttempt {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Identity being registered
    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Run the attempt against the transport
    pub async fn open(self) -> ConnectOutcome {
        let result = self
            .transport
            .open(self.identity.clone(), self.epoch, self.events)
            .await;
        ConnectOutcome {
            epoch: self.epoch,
            identity: self.identity,
            result,
        }
    }
}

impl ConnectOutcome {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Failure message, if the attempt failed
    pub fn error(&self) -> Option<String> {
        self.result.as_ref().err().map(|e| e.to_string())
    }
}

/// What the owner of the link should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStep {
    /// Registered under this identity
    Connected(PeerIdentity),
    /// Call [`SignalingLink::retry`] with `epoch` after `delay`
    Retry { delay: Duration, epoch: u64 },
    /// Every retry was used; the link is Disconnected
    GaveUp,
    /// The event belonged to an outdated attempt
    Ignored,
}

/// Signaling connection with reconnection policy
pub struct SignalingLink {
    transport: Arc<dyn SignalingTransport>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    bus: EventBus,
    policy: ReconnectPolicy,
    state: ConnectionState,
    epoch: u64,
    pending: Option<u64>,
    channel: Option<Box<dyn SignalingChannel>>,
    identity: Option<PeerIdentity>,
    hint: Option<String>,
    intentional: bool,
}

impl SignalingLink {
    /// Create a new signaling link. Transport events are delivered on
    /// `events_tx` and must be fed back through [`SignalingLink::on_transport_lost`]
    /// and [`SignalingLink::accepts`].
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        bus: EventBus,
        policy: ReconnectPolicy,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            transport,
            events_tx,
            bus,
            policy,
            state: ConnectionState::Disconnected,
            epoch: 0,
            pending: None,
            channel: None,
            identity: None,
            hint: None,
            intentional: false,
        }
    }

    /// Current connection state
    pub fn current_state(&self) -> ConnectionState {
        self.state
    }

    /// Identity registered by the latest attempt
    pub fn identity(&self) -> Option<&PeerIdentity> {
        self.identity.as_ref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Whether an event stamped with `epoch` comes from the live connection
    pub fn accepts(&self, epoch: u64) -> bool {
        epoch == self.epoch && self.state == ConnectionState::Connected && !self.intentional
    }

    /// Start connecting under a fresh identity built from `hint`.
    ///
    /// Returns `None` while already connected or while an attempt is in
    /// flight.
    pub fn prepare_connect(&mut self, hint: &str) -> Option<ConnectAttempt> {
        if self.state == ConnectionState::Connected || self.pending.is_some() {
            debug!("Connect requested while {}, ignoring", self.state);
            return None;
        }

        self.intentional = false;
        self.hint = Some(hint.to_string());
        if self.state == ConnectionState::Disconnected {
            // A fresh connect gets the full retry budget again
            self.policy.reset();
            self.state = ConnectionState::Connecting;
        }
        Some(self.next_attempt(hint))
    }

    /// Start the retry scheduled by [`LinkStep::Retry`]
    pub fn retry(&mut self, epoch: u64) -> Option<ConnectAttempt> {
        if epoch != self.epoch || self.intentional || self.pending.is_some() {
            debug!("Dropping stale reconnect for epoch {}", epoch);
            return None;
        }
        if self.state != ConnectionState::Reconnecting {
            return None;
        }
        let hint = self.hint.clone()?;
        info!(
            "Reconnecting (attempt {}/{})",
            self.policy.attempt_count(),
            self.policy.max_attempts()
        );
        Some(self.next_attempt(&hint))
    }

    fn next_attempt(&mut self, hint: &str) -> ConnectAttempt {
        self.epoch += 1;
        self.pending = Some(self.epoch);
        let identity = PeerIdentity::mint(hint);
        self.identity = Some(identity.clone());

        ConnectAttempt {
            epoch: self.epoch,
            identity,
            transport: self.transport.clone(),
            events: self.events_tx.clone(),
        }
    }

    /// Complete an attempt started by [`SignalingLink::prepare_connect`] or
    /// [`SignalingLink::retry`]
    pub fn finish_connect(&mut self, outcome: ConnectOutcome) -> LinkStep {
        if Some(outcome.epoch) != self.pending || outcome.epoch != self.epoch {
            if let Ok(channel) = outcome.result {
                channel.close();
            }
            return LinkStep::Ignored;
        }
        self.pending = None;

        match outcome.result {
            Ok(channel) => {
                info!("Signaling connected as {}", outcome.identity);
                self.channel = Some(channel);
                self.state = ConnectionState::Connected;
                self.policy.reset();
                self.bus.publish(MeshEvent::Connected {
                    id: outcome.identity.clone(),
                });
                LinkStep::Connected(outcome.identity)
            }
            Err(e) => {
                warn!("Signaling connect failed: {}", e);
                self.schedule_retry()
            }
        }
    }

    /// The transport opened at `epoch` dropped
    pub fn on_transport_lost(&mut self, epoch: u64, reason: &str) -> LinkStep {
        if !self.accepts(epoch) {
            debug!("Ignoring loss of stale connection (epoch {})", epoch);
            return LinkStep::Ignored;
        }

        warn!("Signaling connection lost: {}", reason);
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.schedule_retry()
    }

    fn schedule_retry(&mut self) -> LinkStep {
        self.state = ConnectionState::Reconnecting;
        match self.policy.next_delay() {
            Some(delay) => {
                debug!(
                    "Retrying in {:?} (attempt {}/{})",
                    delay,
                    self.policy.attempt_count(),
                    self.policy.max_attempts()
                );
                LinkStep::Retry {
                    delay,
                    epoch: self.epoch,
                }
            }
            None => {
                warn!(
                    "Giving up after {} reconnection attempts",
                    self.policy.max_attempts()
                );
                self.state = ConnectionState::Disconnected;
                LinkStep::GaveUp
            }
        }
    }

    /// Connect and keep retrying per the policy until registered or
    /// exhausted. A no-op returning the current identity when already
    /// connected.
    pub async fn connect(&mut self, hint: &str) -> Result<PeerIdentity, Error> {
        if self.state == ConnectionState::Connected {
            if let Some(identity) = &self.identity {
                return Ok(identity.clone());
            }
        }

        let mut attempt = self.prepare_connect(hint).ok_or_else(|| {
            Error::InvalidState("A connection attempt is already in flight".to_string())
        })?;

        loop {
            let outcome = attempt.open().await;
            let failure = outcome.error();
            match self.finish_connect(outcome) {
                LinkStep::Connected(identity) => return Ok(identity),
                LinkStep::Retry { delay, epoch } => {
                    tokio::time::sleep(delay).await;
                    attempt = self.retry(epoch).ok_or(Error::Cancelled)?;
                }
                LinkStep::GaveUp => {
                    return Err(Error::Signaling(failure.unwrap_or_else(|| {
                        "Reconnection attempts exhausted".to_string()
                    })))
                }
                LinkStep::Ignored => return Err(Error::Cancelled),
            }
        }
    }

    /// Forward a negotiation message on the live connection
    pub fn send(&self, signal: Signal) {
        match (&self.channel, self.state) {
            (Some(channel), ConnectionState::Connected) => {
                if let Err(e) = channel.send(signal) {
                    debug!("Failed to send signal: {}", e);
                }
            }
            _ => debug!(
                "Dropping signal for {} while {}",
                signal.dst, self.state
            ),
        }
    }

    /// Leave on purpose: no reconnection follows
    pub fn disconnect(&mut self) {
        self.intentional = true;
        // Invalidate in-flight attempts and scheduled retries
        self.epoch += 1;
        self.pending = None;
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.policy.reset();
        self.state = ConnectionState::Disconnected;
        info!("Signaling disconnected");
        self.bus.publish(MeshEvent::Disconnected);
    }
}
