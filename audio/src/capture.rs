//! Local audio capture.
//!
//! [`MediaCaptureController`] owns the capture resource and the
//! [`LocalStream`] handle consumers read from. The device side sits behind
//! [`CaptureBackend`]: cpal for real microphones, a synthetic generator for
//! machines without one.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{debug, error, info, warn};
use mesh_core::{Error, LocalStream, CHANNELS, SAMPLE_RATE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ringbuf::HeapRb;
use settings_manager::CaptureSettings;
use std::f32::consts::PI;
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Something that produces local audio frames
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CaptureBackend: Send {
    /// Open the device and start producing frames into a new stream
    async fn start(&mut self) -> Result<LocalStream, Error>;

    /// Stop producing frames and release the device
    fn stop(&mut self);
}

/// Acquires and releases the local capture, and mutes it
pub struct MediaCaptureController {
    backend: Box<dyn CaptureBackend>,
    stream: Option<LocalStream>,
    muted: bool,
}

impl MediaCaptureController {
    /// Create a new controller over `backend`
    pub fn new(backend: Box<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            stream: None,
            muted: false,
        }
    }

    /// Start capturing. Returns the live stream when already capturing.
    pub async fn acquire(&mut self) -> Result<LocalStream, Error> {
        if let Some(stream) = self.stream.as_ref().filter(|s| !s.is_ended()) {
            return Ok(stream.clone());
        }

        let stream = self.backend.start().await.map_err(|e| match e {
            Error::Capture(_) => e,
            other => Error::Capture(other.to_string()),
        })?;
        stream.set_muted(self.muted);
        info!(
            "Capture acquired ({} Hz{})",
            stream.sample_rate(),
            if self.muted { ", muted" } else { "" }
        );
        self.stream = Some(stream.clone());
        Ok(stream)
    }

    /// Stop capturing and end the stream
    pub fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.backend.stop();
            stream.end();
            info!("Capture released");
        }
    }

    /// Replace outbound audio with silence, or restore it
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if let Some(stream) = &self.stream {
            stream.set_muted(muted);
        }
        debug!("Capture {}", if muted { "muted" } else { "unmuted" });
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// The live stream, if capturing
    pub fn stream(&self) -> Option<&LocalStream> {
        self.stream.as_ref().filter(|s| !s.is_ended())
    }

    pub fn is_active(&self) -> bool {
        self.stream().is_some()
    }
}

impl Drop for MediaCaptureController {
    fn drop(&mut self) {
        self.release();
    }
}

/// One-pole DC blocking filter
struct DcBlocker {
    prev_in: f32,
    prev_out: f32,
}

impl DcBlocker {
    const POLE: f32 = 0.995;

    fn new() -> Self {
        Self {
            prev_in: 0.0,
            prev_out: 0.0,
        }
    }

    fn process(&mut self, frame: &mut [f32]) {
        for sample in frame.iter_mut() {
            let out = *sample - self.prev_in + Self::POLE * self.prev_out;
            self.prev_in = *sample;
            self.prev_out = out;
            *sample = out;
        }
    }
}

struct CaptureWorker {
    stop_tx: std_mpsc::Sender<()>,
    thread: thread::JoinHandle<()>,
}

impl CaptureWorker {
    /// Signal the thread to stop. Inside a runtime the join happens on the
    /// blocking pool so the calling task is not held up.
    fn retire(self) {
        let _ = self.stop_tx.send(());
        let thread = self.thread;
        let join = move || {
            if thread.join().is_err() {
                error!("Capture thread panicked");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(join);
            }
            Err(_) => join(),
        }
    }
}

/// Microphone capture through cpal.
///
/// cpal streams cannot move between threads, so each capture runs on its own
/// thread: the device callback fills a ring buffer and the thread cuts it
/// into frames for the [`LocalStream`].
pub struct CpalCapture {
    settings: CaptureSettings,
    worker: Option<CaptureWorker>,
}

impl CpalCapture {
    /// Create a new capture backend for the configured device
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            settings,
            worker: None,
        }
    }
}

#[async_trait]
impl CaptureBackend for CpalCapture {
    async fn start(&mut self) -> Result<LocalStream, Error> {
        self.stop();

        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel();
        let settings = self.settings.clone();

        let thread = thread::Builder::new()
            .name("huddle-capture".to_string())
            .spawn(move || run_capture(settings, ready_tx, stop_rx))
            .map_err(|e| Error::Capture(format!("Failed to spawn capture thread: {}", e)))?;

        let stream = ready_rx
            .await
            .map_err(|_| Error::Capture("Capture thread exited".to_string()))??;
        self.worker = Some(CaptureWorker { stop_tx, thread });
        Ok(stream)
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.retire();
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Find the configured input device, falling back to the default one
fn input_device(host: &cpal::Host, name: &str) -> Result<cpal::Device, Error> {
    if !name.is_empty() {
        let found = host
            .input_devices()
            .map_err(|e| Error::Capture(format!("Failed to get input devices: {}", e)))?
            .find(|d| d.name().map_or(false, |n| n == name));
        match found {
            Some(device) => return Ok(device),
            None => warn!("Input device '{}' not found, using default", name),
        }
    }
    host.default_input_device()
        .ok_or_else(|| Error::Capture("No input device found".to_string()))
}

fn run_capture(
    settings: CaptureSettings,
    ready: oneshot::Sender<Result<LocalStream, Error>>,
    stop: std_mpsc::Receiver<()>,
) {
    let opened = open_input(&settings);
    let (stream, mut consumer, sample_rate) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let local = LocalStream::new(sample_rate);
    if ready.send(Ok(local.clone())).is_err() {
        // Nobody is waiting for the capture anymore
        return;
    }

    let frame_ms = settings.frame_ms.max(1);
    let frame_len = (sample_rate * frame_ms / 1000) as usize;
    let mut high_pass = settings.noise_suppression.then(DcBlocker::new);
    let mut pending: Vec<f32> = Vec::with_capacity(frame_len * 2);

    loop {
        match stop.recv_timeout(Duration::from_millis(frame_ms as u64)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if local.is_ended() {
            break;
        }

        while let Some(sample) = consumer.pop() {
            pending.push(sample);
        }
        while pending.len() >= frame_len {
            let mut frame: Vec<f32> = pending.drain(..frame_len).collect();
            if let Some(filter) = high_pass.as_mut() {
                filter.process(&mut frame);
            }
            local.push_frame(frame);
        }
    }

    drop(stream);
    local.end();
    debug!("Capture thread finished");
}

type OpenedInput = (cpal::Stream, ringbuf::HeapConsumer<f32>, u32);

fn open_input(settings: &CaptureSettings) -> Result<OpenedInput, Error> {
    let host = cpal::default_host();
    let device = input_device(&host, &settings.input_device)?;
    let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let config = device
        .default_input_config()
        .map_err(|e| Error::Capture(format!("Default config not supported: {}", e)))?;
    let sample_rate = config.sample_rate().0;
    let channels = config.channels() as usize;
    info!(
        "Opening {} ({} Hz, {} ch, echo_cancellation={}, noise_suppression={}, auto_gain_control={})",
        device_name,
        sample_rate,
        channels,
        settings.echo_cancellation,
        settings.noise_suppression,
        settings.auto_gain_control
    );

    // Create a ring buffer for audio samples
    let rb = HeapRb::<f32>::new(sample_rate as usize);
    let (mut prod, consumer) = rb.split();

    let err_fn = |err| error!("An error occurred on the input stream: {}", err);
    let stream_config: cpal::StreamConfig = config.clone().into();

    // Downmix interleaved frames to mono
    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for frame in data.chunks(channels) {
                    let _ = prod.push(frame.iter().sum::<f32>() / frame.len() as f32);
                }
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                for frame in data.chunks(channels) {
                    let sum: f32 = frame.iter().map(|&s| s as f32 / i16::MAX as f32).sum();
                    let _ = prod.push(sum / frame.len() as f32);
                }
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::U16 => device.build_input_stream(
            &stream_config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                for frame in data.chunks(channels) {
                    let sum: f32 = frame
                        .iter()
                        .map(|&s| (s as f32 / u16::MAX as f32) * 2.0 - 1.0)
                        .sum();
                    let _ = prod.push(sum / frame.len() as f32);
                }
            },
            err_fn,
            None,
        ),
        other => {
            return Err(Error::Capture(format!(
                "Unsupported sample format {:?}",
                other
            )))
        }
    }
    .map_err(|e| Error::Capture(format!("Failed to build input stream: {}", e)))?;

    stream
        .play()
        .map_err(|e| Error::Capture(format!("Failed to start input stream: {}", e)))?;

    Ok((stream, consumer, sample_rate))
}

/// What a [`SyntheticCapture`] generates
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Waveform {
    Silence,
    /// Sine at the given frequency in Hz
    Tone(f32),
    /// Uniform white noise, broadband like speech
    Noise,
}

/// Generated audio instead of a microphone
pub struct SyntheticCapture {
    sample_rate: u32,
    frame: Duration,
    waveform: Waveform,
    amplitude: f32,
    cancel: Option<CancellationToken>,
}

impl SyntheticCapture {
    /// Create a new generator producing `frame_ms` frames
    pub fn new(frame_ms: u32, waveform: Waveform, amplitude: f32) -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            frame: Duration::from_millis(frame_ms.max(1) as u64),
            waveform,
            amplitude: amplitude.abs(),
            cancel: None,
        }
    }

    /// A generator producing digital silence
    pub fn silent(frame_ms: u32) -> Self {
        Self::new(frame_ms, Waveform::Silence, 0.0)
    }
}

#[async_trait]
impl CaptureBackend for SyntheticCapture {
    async fn start(&mut self) -> Result<LocalStream, Error> {
        self.stop();

        let stream = LocalStream::new(self.sample_rate);
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        let frame_len = (self.sample_rate as u128 * self.frame.as_millis() / 1000) as usize;
        let sample_rate = self.sample_rate as f32;
        let waveform = self.waveform;
        let amplitude = self.amplitude;
        let period = self.frame;
        let out = stream.clone();
        debug!(
            "Synthetic capture: {:?}, {} ch, {:?} frames",
            waveform, CHANNELS, period
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut rng = StdRng::from_entropy();
            let mut phase = 0.0f32;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = out.ended() => break,
                    _ = ticker.tick() => {}
                }
                let frame: Vec<f32> = (0..frame_len)
                    .map(|_| match waveform {
                        Waveform::Silence => 0.0,
                        Waveform::Tone(hz) => {
                            let sample = phase.sin() * amplitude;
                            phase = (phase + 2.0 * PI * hz / sample_rate) % (2.0 * PI);
                            sample
                        }
                        Waveform::Noise => rng.gen_range(-amplitude..=amplitude),
                    })
                    .collect();
                out.push_frame(frame);
            }
        });

        Ok(stream)
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn slow_worker(done: Arc<AtomicBool>) -> CaptureWorker {
        let (stop_tx, stop_rx) = std_mpsc::channel();
        let thread = thread::spawn(move || {
            let _ = stop_rx.recv();
            thread::sleep(Duration::from_millis(300));
            done.store(true, Ordering::SeqCst);
        });
        CaptureWorker { stop_tx, thread }
    }

    #[tokio::test]
    async fn stopping_capture_does_not_block_the_runtime() {
        let done = Arc::new(AtomicBool::new(false));
        let started = Instant::now();
        slow_worker(done.clone()).retire();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(!done.load(Ordering::SeqCst));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !done.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "capture thread never finished");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn stopping_capture_outside_a_runtime_waits_for_the_thread() {
        let done = Arc::new(AtomicBool::new(false));
        slow_worker(done.clone()).retire();
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn acquire_is_idempotent() {
        let mut backend = MockCaptureBackend::new();
        backend
            .expect_start()
            .times(1)
            .returning(|| Ok(LocalStream::new(48000)));
        backend.expect_stop().times(1).return_const(());

        let mut controller = MediaCaptureController::new(Box::new(backend));
        let first = controller.acquire().await.unwrap();
        let second = controller.acquire().await.unwrap();
        assert_eq!(first, second);

        controller.release();
        assert!(first.is_ended());
        assert!(!controller.is_active());
    }

    #[tokio::test]
    async fn device_failure_is_a_capture_error() {
        let mut backend = MockCaptureBackend::new();
        backend
            .expect_start()
            .returning(|| Err(Error::Other(anyhow::anyhow!("permission denied"))));
        backend.expect_stop().return_const(());

        let mut controller = MediaCaptureController::new(Box::new(backend));
        match controller.acquire().await {
            Err(Error::Capture(msg)) => assert!(msg.contains("permission denied")),
            other => panic!("Expected capture error, got {:?}", other.map(|_| ())),
        }
        assert!(controller.stream().is_none());
    }

    #[tokio::test]
    async fn mute_applies_before_and_after_acquire() {
        let mut controller = MediaCaptureController::new(Box::new(SyntheticCapture::silent(20)));
        controller.set_muted(true);

        let stream = controller.acquire().await.unwrap();
        assert!(stream.is_muted());

        controller.set_muted(false);
        assert!(!stream.is_muted());
        controller.release();
    }

    #[tokio::test(start_paused = true)]
    async fn synthetic_capture_produces_frames_until_released() {
        let mut controller =
            MediaCaptureController::new(Box::new(SyntheticCapture::new(20, Waveform::Tone(440.0), 0.5)));
        let stream = controller.acquire().await.unwrap();
        let mut frames = stream.subscribe();

        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.len(), 960);
        assert!(frame.iter().any(|s| s.abs() > 0.1));

        controller.set_muted(true);
        let muted = frames.recv().await.unwrap();
        assert!(muted.iter().all(|&s| s == 0.0));

        controller.release();
        assert!(stream.is_ended());
    }

    #[test]
    fn dc_blocker_removes_offset() {
        let mut dc = DcBlocker::new();
        let mut frame = vec![0.5; 4000];
        dc.process(&mut frame);
        assert!(frame[3999].abs() < 0.01);
    }
}
