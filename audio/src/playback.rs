//! Playback of remote participants.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{debug, error, info};
use mesh_core::{resample, AudioBuffer, Error, PeerIdentity, RemoteStream};
use std::collections::HashMap;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use tokio::sync::oneshot;

/// Mix audio from multiple peers
pub fn mix_audio(peer_buffers: &HashMap<PeerIdentity, AudioBuffer>, buffer_size: usize) -> AudioBuffer {
    let mut mixed_buffer = vec![0.0; buffer_size];

    if peer_buffers.is_empty() {
        return mixed_buffer;
    }

    for buffer in peer_buffers.values() {
        for (out, sample) in mixed_buffer.iter_mut().zip(buffer) {
            *out += sample;
        }
    }

    // Normalize the mixed audio to prevent clipping
    let num_peers = peer_buffers.len() as f32;
    if num_peers > 1.0 {
        for sample in mixed_buffer.iter_mut() {
            *sample /= num_peers;
        }
    }

    mixed_buffer
}

/// The set of remote streams currently being played
#[derive(Clone, Default)]
pub struct PlaybackMixer {
    streams: Arc<Mutex<HashMap<PeerIdentity, RemoteStream>>>,
}

impl PlaybackMixer {
    /// Create a new, empty mixer
    pub fn new() -> Self {
        Self::default()
    }

    /// Start playing `stream`, replacing any earlier stream of the same peer
    pub fn add(&self, stream: RemoteStream) {
        let peer = stream.peer().clone();
        debug!("Mixing stream {} from {}", stream.id(), peer);
        self.lock().insert(peer, stream);
    }

    pub fn remove(&self, peer: &PeerIdentity) {
        if self.lock().remove(peer).is_some() {
            debug!("Stopped mixing {}", peer);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Produce `frames` mono samples at `out_rate` from everything queued.
    ///
    /// Streams that have ended are dropped from the mix.
    pub fn fill(&self, frames: usize, out_rate: u32) -> AudioBuffer {
        let mut streams = self.lock();
        streams.retain(|_, stream| !stream.is_ended());

        let buffers: HashMap<PeerIdentity, AudioBuffer> = streams
            .iter()
            .map(|(peer, stream)| {
                let in_rate = stream.sample_rate();
                let wanted = (frames as u64 * in_rate as u64).div_ceil(out_rate.max(1) as u64);
                let mut queued = vec![0.0; wanted as usize];
                stream.drain_playout(&mut queued);

                let mut buffer = resample(&queued, in_rate, out_rate);
                buffer.resize(frames, 0.0);
                (peer.clone(), buffer)
            })
            .collect();

        mix_audio(&buffers, frames)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PeerIdentity, RemoteStream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Plays a [`PlaybackMixer`] on the default output device.
///
/// Like capture, the cpal stream lives on a thread of its own until the
/// player is dropped.
pub struct CpalPlayback {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CpalPlayback {
    /// Open the default output device and start playing `mixer`
    pub async fn start(mixer: PlaybackMixer) -> Result<Self, Error> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("huddle-playback".to_string())
            .spawn(move || {
                let stream = match open_output(mixer) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Blocks until stop is requested or the player is dropped
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Playback thread finished");
            })
            .map_err(Error::Io)?;

        ready_rx
            .await
            .map_err(|_| Error::Other(anyhow::anyhow!("Playback thread exited")))??;

        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Stop playback and close the device
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Playback thread panicked");
            }
            info!("Playback stopped");
        }
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_output(mixer: PlaybackMixer) -> Result<cpal::Stream, Error> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Other(anyhow::anyhow!("No output device found")))?;
    let config = device
        .default_output_config()
        .map_err(|e| Error::Other(anyhow::anyhow!("Default output config not supported: {}", e)))?;

    let sample_rate = config.sample_rate().0;
    let channels = config.channels() as usize;
    info!(
        "Playing on {} ({} Hz, {} ch)",
        device.name().unwrap_or_else(|_| "unknown".to_string()),
        sample_rate,
        channels
    );

    let err_fn = |err| error!("An error occurred on the output stream: {}", err);
    let stream_config: cpal::StreamConfig = config.clone().into();

    // Mono mix duplicated onto every output channel
    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mixed = mixer.fill(data.len() / channels, sample_rate);
                for (frame, sample) in data.chunks_mut(channels).zip(mixed) {
                    frame.fill(sample);
                }
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_output_stream(
            &stream_config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                let mixed = mixer.fill(data.len() / channels, sample_rate);
                for (frame, sample) in data.chunks_mut(channels).zip(mixed) {
                    frame.fill((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16);
                }
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::U16 => device.build_output_stream(
            &stream_config,
            move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                let mixed = mixer.fill(data.len() / channels, sample_rate);
                for (frame, sample) in data.chunks_mut(channels).zip(mixed) {
                    let scaled = (sample.clamp(-1.0, 1.0) + 1.0) * 0.5 * u16::MAX as f32;
                    frame.fill(scaled as u16);
                }
            },
            err_fn,
            None,
        ),
        other => {
            return Err(Error::Other(anyhow::anyhow!(
                "Unsupported sample format {:?}",
                other
            )))
        }
    }
    .map_err(|e| Error::Other(anyhow::anyhow!("Failed to build output stream: {}", e)))?;

    stream
        .play()
        .map_err(|e| Error::Other(anyhow::anyhow!("Failed to start output stream: {}", e)))?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> PeerIdentity {
        PeerIdentity::format(name, 1)
    }

    #[test]
    fn test_mix_audio() {
        let mut peer_buffers = HashMap::new();
        peer_buffers.insert(peer("a"), vec![0.5, 0.5, 0.5, 0.5]);
        peer_buffers.insert(peer("b"), vec![0.3, 0.3, 0.3, 0.3]);

        let mixed = mix_audio(&peer_buffers, 4);

        // (0.5 + 0.3) / 2 = 0.4
        assert_eq!(mixed.len(), 4);
        for sample in mixed {
            assert!((sample - 0.4).abs() < 0.001);
        }
    }

    #[test]
    fn short_buffers_are_padded() {
        let mut peer_buffers = HashMap::new();
        peer_buffers.insert(peer("a"), vec![0.5]);
        assert_eq!(mix_audio(&peer_buffers, 3), vec![0.5, 0.0, 0.0]);
        assert_eq!(mix_audio(&HashMap::new(), 2), vec![0.0, 0.0]);
    }

    #[test]
    fn mixer_resamples_and_drains() {
        let mixer = PlaybackMixer::new();
        let stream = RemoteStream::new("t1", peer("a"), 8000);
        stream.push_samples(&[0.25; 160]);
        mixer.add(stream.clone());

        let out = mixer.fill(960, 48000);
        assert_eq!(out.len(), 960);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));

        // Everything queued was consumed
        let silent = mixer.fill(960, 48000);
        assert!(silent.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn ended_streams_leave_the_mix() {
        let mixer = PlaybackMixer::new();
        let stream = RemoteStream::new("t1", peer("a"), 48000);
        mixer.add(stream.clone());
        mixer.add(RemoteStream::new("t2", peer("b"), 48000));
        assert_eq!(mixer.len(), 2);

        stream.end();
        mixer.fill(10, 48000);
        assert_eq!(mixer.len(), 1);

        mixer.remove(&peer("b"));
        assert!(mixer.is_empty());
    }
}
