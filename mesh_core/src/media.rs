//! Media stream handles shared between capture, transport and analysis.
//!
//! Both handles are cheap to clone; every clone refers to the same stream.

use crate::{AudioBuffer, PeerIdentity};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Frames buffered per subscriber before a slow consumer starts lagging
const LOCAL_FRAME_BACKLOG: usize = 64;

/// Samples kept for analysis of a remote stream
const ANALYSIS_WINDOW: usize = 4096;

/// Upper bound on queued playout, in seconds of audio
const PLAYOUT_SECONDS: usize = 1;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle on the local capture. Owned by the capture controller; every other
/// holder only reads frames from it.
#[derive(Clone)]
pub struct LocalStream {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    id: String,
    sample_rate: u32,
    muted: AtomicBool,
    frames: broadcast::Sender<AudioBuffer>,
    ended: CancellationToken,
}

impl LocalStream {
    /// Create a stream carrying mono frames at `sample_rate`
    pub fn new(sample_rate: u32) -> Self {
        let (frames, _) = broadcast::channel(LOCAL_FRAME_BACKLOG);
        Self {
            inner: Arc::new(LocalInner {
                id: uuid::Uuid::new_v4().to_string(),
                sample_rate,
                muted: AtomicBool::new(false),
                frames,
                ended: CancellationToken::new(),
            }),
        }
    }

    /// Unique id of this capture
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Sample rate of the frames
    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    /// Whether outbound audio is currently replaced with silence
    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::SeqCst)
    }

    /// Mute or unmute. Frames keep flowing so sessions stay untouched.
    pub fn set_muted(&self, muted: bool) {
        self.inner.muted.store(muted, Ordering::SeqCst);
    }

    /// Publish a captured frame to every consumer
    pub fn push_frame(&self, frame: AudioBuffer) {
        if self.is_ended() {
            return;
        }
        let frame = if self.is_muted() {
            vec![0.0; frame.len()]
        } else {
            frame
        };
        // No receivers is fine: nobody is in a call yet
        let _ = self.inner.frames.send(frame);
    }

    /// Receive frames pushed from now on
    pub fn subscribe(&self) -> broadcast::Receiver<AudioBuffer> {
        self.inner.frames.subscribe()
    }

    /// Mark the capture as finished
    pub fn end(&self) {
        self.inner.ended.cancel();
    }

    /// Whether the capture has been released
    pub fn is_ended(&self) -> bool {
        self.inner.ended.is_cancelled()
    }

    /// Resolves once the capture is released
    pub fn ended(&self) -> WaitForCancellationFuture<'_> {
        self.inner.ended.cancelled()
    }
}

impl PartialEq for LocalStream {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.inner.id)
            .field("sample_rate", &self.inner.sample_rate)
            .field("muted", &self.is_muted())
            .finish()
    }
}

/// Handle on audio received from one remote participant.
///
/// The transport pushes decoded samples in; the speaking detector reads the
/// most recent window and the playback mixer drains the playout queue.
#[derive(Clone)]
pub struct RemoteStream {
    inner: Arc<RemoteInner>,
}

struct RemoteInner {
    id: String,
    peer: PeerIdentity,
    sample_rate: u32,
    window: Mutex<VecDeque<f32>>,
    playout: Mutex<VecDeque<f32>>,
    samples_received: AtomicU64,
    ended: CancellationToken,
}

impl RemoteStream {
    /// Create an empty stream for `peer`
    pub fn new(id: impl Into<String>, peer: PeerIdentity, sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(RemoteInner {
                id: id.into(),
                peer,
                sample_rate,
                window: Mutex::new(VecDeque::with_capacity(ANALYSIS_WINDOW)),
                playout: Mutex::new(VecDeque::new()),
                samples_received: AtomicU64::new(0),
                ended: CancellationToken::new(),
            }),
        }
    }

    /// Transport-level id of the stream
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The participant the audio comes from
    pub fn peer(&self) -> &PeerIdentity {
        &self.inner.peer
    }

    /// Sample rate of the decoded audio
    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    /// Append decoded samples
    pub fn push_samples(&self, samples: &[f32]) {
        if self.is_ended() {
            return;
        }

        {
            let mut window = lock(&self.inner.window);
            window.extend(samples.iter().copied());
            let excess = window.len().saturating_sub(ANALYSIS_WINDOW);
            window.drain(..excess);
        }

        {
            let limit = self.inner.sample_rate as usize * PLAYOUT_SECONDS;
            let mut playout = lock(&self.inner.playout);
            playout.extend(samples.iter().copied());
            let excess = playout.len().saturating_sub(limit);
            playout.drain(..excess);
        }

        self.inner
            .samples_received
            .fetch_add(samples.len() as u64, Ordering::Relaxed);
    }

    /// The most recent `count` samples, zero-padded at the front when fewer
    /// have arrived
    pub fn latest(&self, count: usize) -> Vec<f32> {
        let window = lock(&self.inner.window);
        let available = window.len().min(count);
        let mut out = vec![0.0; count - available];
        out.extend(window.iter().skip(window.len() - available).copied());
        out
    }

    /// Move queued playout samples into `out`, returning how many were written
    pub fn drain_playout(&self, out: &mut [f32]) -> usize {
        let mut playout = lock(&self.inner.playout);
        let n = playout.len().min(out.len());
        for (slot, sample) in out.iter_mut().zip(playout.drain(..n)) {
            *slot = sample;
        }
        n
    }

    /// Total samples received so far
    pub fn samples_received(&self) -> u64 {
        self.inner.samples_received.load(Ordering::Relaxed)
    }

    /// Mark the stream as finished and drop buffered audio
    pub fn end(&self) {
        self.inner.ended.cancel();
        lock(&self.inner.window).clear();
        lock(&self.inner.playout).clear();
    }

    /// Whether the stream has ended
    pub fn is_ended(&self) -> bool {
        self.inner.ended.is_cancelled()
    }

    /// Resolves once the stream ends
    pub fn ended(&self) -> WaitForCancellationFuture<'_> {
        self.inner.ended.cancelled()
    }
}

impl PartialEq for RemoteStream {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("sample_rate", &self.inner.sample_rate)
            .finish()
    }
}

/// Linear-interpolating sample-rate conversion
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(last)];
            let b = samples[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}
