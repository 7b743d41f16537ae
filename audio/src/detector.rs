//! Speaking activity detection.
//!
//! Every active remote stream gets its own sampling loop. The loop reads the
//! stream energy at a fixed interval, classifies it against a threshold and
//! reports classification edges only. It stops as soon as its
//! [`DetachHandle`] is detached or dropped, or the liveness token of the
//! owning session is cancelled; both are checked before every sample.

use crate::analyser::SpectrumAnalyser;
use log::{debug, trace};
use mesh_core::{PeerIdentity, RemoteStream};
use settings_manager::SpeakingSettings;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Something that can report the current audio energy on a 0..=255 scale
pub trait EnergySource: Send {
    fn energy(&mut self) -> f32;
}

/// Energy of the newest window of a remote stream
pub struct StreamEnergy {
    stream: RemoteStream,
    analyser: SpectrumAnalyser,
}

impl StreamEnergy {
    /// Create a new energy source over `stream`
    pub fn new(stream: RemoteStream, fft_size: usize, smoothing: f32) -> Self {
        Self {
            stream,
            analyser: SpectrumAnalyser::new(fft_size, smoothing),
        }
    }
}

impl EnergySource for StreamEnergy {
    fn energy(&mut self) -> f32 {
        let window = self.stream.latest(self.analyser.fft_size());
        self.analyser.energy(&window)
    }
}

/// Speaking classification of one remote participant
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakingState {
    pub peer: PeerIdentity,
    pub is_speaking: bool,
    pub last_sample: f32,
}

impl SpeakingState {
    /// Create a new state; participants start out silent
    pub fn new(peer: PeerIdentity) -> Self {
        Self {
            peer,
            is_speaking: false,
            last_sample: 0.0,
        }
    }

    /// Record an energy sample. Returns the new classification when it
    /// changed.
    pub fn observe(&mut self, energy: f32, threshold: f32) -> Option<bool> {
        self.last_sample = energy;
        let speaking = energy > threshold;
        if speaking == self.is_speaking {
            return None;
        }
        self.is_speaking = speaking;
        Some(speaking)
    }
}

/// Identifies one attached sampling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DetectorId(pub u64);

/// A speaking classification edge
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakingEdge {
    pub peer: PeerIdentity,
    pub detector: DetectorId,
    pub is_speaking: bool,
    pub energy: f32,
}

/// Stops a sampling loop. Dropping the handle detaches too.
#[derive(Debug)]
pub struct DetachHandle {
    id: DetectorId,
    cancel: CancellationToken,
}

impl DetachHandle {
    pub fn id(&self) -> DetectorId {
        self.id
    }

    /// Stop sampling. Takes effect before the next sample.
    pub fn detach(&self) {
        self.cancel.cancel();
    }

    pub fn is_detached(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for DetachHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawns one sampling loop per attached stream
pub struct SpeakingActivityDetector {
    threshold: f32,
    interval: Duration,
    fft_size: usize,
    smoothing: f32,
    edges: mpsc::UnboundedSender<SpeakingEdge>,
    next_id: AtomicU64,
}

impl SpeakingActivityDetector {
    /// Create a new detector reporting edges on `edges`
    pub fn new(settings: &SpeakingSettings, edges: mpsc::UnboundedSender<SpeakingEdge>) -> Self {
        Self {
            threshold: settings.threshold,
            interval: settings.sample_interval().max(Duration::from_millis(1)),
            fft_size: settings.fft_size,
            smoothing: settings.smoothing,
            edges,
            next_id: AtomicU64::new(1),
        }
    }

    /// Start classifying `stream`. Sampling stops when the handle is
    /// detached or `liveness` is cancelled.
    pub fn attach(
        &self,
        peer: PeerIdentity,
        stream: RemoteStream,
        liveness: CancellationToken,
    ) -> DetachHandle {
        let source = StreamEnergy::new(stream, self.fft_size, self.smoothing);
        self.attach_source(peer, Box::new(source), liveness)
    }

    /// Start classifying an arbitrary energy source
    pub fn attach_source(
        &self,
        peer: PeerIdentity,
        mut source: Box<dyn EnergySource>,
        liveness: CancellationToken,
    ) -> DetachHandle {
        let id = DetectorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = CancellationToken::new();
        let handle = DetachHandle {
            id,
            cancel: cancel.clone(),
        };

        let threshold = self.threshold;
        let period = self.interval;
        let edges = self.edges.clone();
        debug!("Attaching speaking detector {:?} for {}", id, peer);

        tokio::spawn(async move {
            let mut state = SpeakingState::new(peer);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = liveness.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if cancel.is_cancelled() || liveness.is_cancelled() {
                    break;
                }

                let energy = source.energy();
                trace!("{} energy {:.1}", state.peer, energy);
                if let Some(is_speaking) = state.observe(energy, threshold) {
                    let edge = SpeakingEdge {
                        peer: state.peer.clone(),
                        detector: id,
                        is_speaking,
                        energy,
                    };
                    if edges.send(edge).is_err() {
                        break;
                    }
                }
            }
            debug!("Speaking detector {:?} for {} stopped", id, state.peer);
        });

        handle
    }
}
