//! Spectrum energy of an audio window.
//!
//! Mirrors what a browser `AnalyserNode` reports through
//! `getByteFrequencyData`: Blackman window, FFT, per-bin time smoothing,
//! decibel conversion and a byte scale between `MIN_DB` and `MAX_DB`. The
//! energy of a window is the mean of those bytes, so 0..=255.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Floor of the byte scale
pub const MIN_DB: f32 = -100.0;
/// Ceiling of the byte scale
pub const MAX_DB: f32 = -30.0;

/// Stateful spectrum analyser over fixed-size windows
pub struct SpectrumAnalyser {
    fft: Arc<dyn Fft<f32>>,
    fft_size: usize,
    smoothing: f32,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    scratch: Vec<Complex<f32>>,
}

impl SpectrumAnalyser {
    /// Create a new analyser. `fft_size` is rounded up to a power of two and
    /// `smoothing` is clamped to 0.0..=1.0.
    pub fn new(fft_size: usize, smoothing: f32) -> Self {
        let fft_size = fft_size.max(32).next_power_of_two();
        let fft = FftPlanner::<f32>::new().plan_fft_forward(fft_size);

        // Blackman window
        let n = fft_size as f32;
        let window = (0..fft_size)
            .map(|i| {
                let x = 2.0 * std::f32::consts::PI * i as f32 / n;
                0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
            })
            .collect();

        Self {
            fft,
            fft_size,
            smoothing: smoothing.clamp(0.0, 1.0),
            window,
            smoothed: vec![0.0; fft_size / 2],
            scratch: vec![Complex::new(0.0, 0.0); fft_size],
        }
    }

    /// Samples per analysis window
    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Byte-scaled magnitude of each frequency bin for the newest window.
    ///
    /// Only the last `fft_size` samples are used; shorter input is padded
    /// with silence at the front.
    pub fn frequency_data(&mut self, samples: &[f32]) -> Vec<u8> {
        let tail = &samples[samples.len().saturating_sub(self.fft_size)..];
        let pad = self.fft_size - tail.len();

        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let sample = if i < pad { 0.0 } else { tail[i - pad] };
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        let scale = 1.0 / self.fft_size as f32;
        let smoothing = self.smoothing;
        let range = MAX_DB - MIN_DB;
        self.smoothed
            .iter_mut()
            .zip(&self.scratch)
            .map(|(smoothed, bin)| {
                let magnitude = bin.norm() * scale;
                *smoothed = smoothing * *smoothed + (1.0 - smoothing) * magnitude;

                let db = if *smoothed > 0.0 {
                    20.0 * smoothed.log10()
                } else {
                    f32::NEG_INFINITY
                };
                let scaled = 255.0 * (db - MIN_DB) / range;
                scaled.clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    /// Mean byte-scaled bin magnitude of the newest window
    pub fn energy(&mut self, samples: &[f32]) -> f32 {
        let bins = self.frequency_data(samples);
        if bins.is_empty() {
            return 0.0;
        }
        bins.iter().map(|&b| b as f32).sum::<f32>() / bins.len() as f32
    }
}

impl std::fmt::Debug for SpectrumAnalyser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrumAnalyser")
            .field("fft_size", &self.fft_size)
            .field("smoothing", &self.smoothing)
            .finish()
    }
}
