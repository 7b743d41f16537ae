//! Audio subsystem for huddle
//!
//! This crate owns everything that touches sound: local capture and muting,
//! per-peer speaking detection on remote streams, and playback of the mixed
//! remote audio.

pub mod analyser;
pub mod capture;
pub mod detector;
pub mod playback;

// Re-export commonly used types
pub use analyser::SpectrumAnalyser;
pub use capture::{
    CaptureBackend, CpalCapture, MediaCaptureController, SyntheticCapture, Waveform,
};
pub use detector::{
    DetachHandle, DetectorId, EnergySource, SpeakingActivityDetector, SpeakingEdge,
    SpeakingState, StreamEnergy,
};
pub use playback::{mix_audio, CpalPlayback, PlaybackMixer};
