//! Windowed FFT magnitude spectrum with time-normalized smoothing
//!
//! Produces `fft_size / 2 + 1` linear magnitudes of a Hann-windowed block. Values
//! are scaled by `1 / max(1, fft_size / 2)` so a full-scale sine lands near 0.5.
//! Decibel conversion is left to consumers.

use rustfft::{Fft, FftPlanner, num_complex::Complex};
use std::sync::Arc;
use std::time::Duration;

/// Cadence at which the configured smoothing factor applies unchanged
const REFERENCE_RATE_HZ: f32 = 60.0;

pub struct SpectrumAnalyzer {
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
}

impl SpectrumAnalyzer {
    pub fn new(fft_size: usize) -> Self {
        let fft = FftPlanner::new().plan_fft_forward(fft_size);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        Self {
            fft_size,
            fft,
            window: hann_window(fft_size),
            buffer: Vec::with_capacity(fft_size),
            scratch,
            smoothed: Vec::new(),
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn bins(&self) -> usize {
        self.fft_size / 2 + 1
    }

    /// Magnitude spectrum of `samples` without smoothing.
    ///
    /// Short input is zero-padded and long input truncated to the FFT size.
    /// Non-finite samples are treated as silence.
    pub fn magnitudes(&mut self, samples: &[f32]) -> Vec<f32> {
        self.buffer.clear();
        self.buffer.extend(
            samples
                .iter()
                .chain(std::iter::repeat(&0.0))
                .take(self.fft_size)
                .zip(&self.window)
                .map(|(&s, &w)| {
                    let s = if s.is_finite() { s } else { 0.0 };
                    Complex::new(s * w, 0.0)
                }),
        );

        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        let scale = 1.0 / (self.fft_size as f32 / 2.0).max(1.0);
        self.buffer[..self.bins()]
            .iter()
            .map(|c| c.norm() * scale)
            .collect()
    }

    /// Compute the spectrum and fold it into the running average.
    ///
    /// `elapsed` is the wall-clock time since the previous update; the smoothing
    /// factor is rescaled so the decay per second is the same at any cadence.
    /// Returns the smoothed (ungained) spectrum.
    pub fn process(&mut self, samples: &[f32], smoothing: f32, elapsed: Option<Duration>) -> &[f32] {
        let current = self.magnitudes(samples);

        let alpha = match elapsed {
            Some(dt) if smoothing > 0.0 && self.smoothed.len() == current.len() => {
                let dt = dt.as_secs_f32().clamp(0.0, 1.0);
                smoothing.clamp(0.0, 1.0).powf(dt * REFERENCE_RATE_HZ)
            }
            _ => 0.0,
        };

        if alpha <= 0.0 {
            self.smoothed = current;
        } else {
            for (prev, now) in self.smoothed.iter_mut().zip(current) {
                *prev = alpha * *prev + (1.0 - alpha) * now;
            }
        }

        &self.smoothed
    }

    /// Drop smoothing history
    pub fn reset(&mut self) {
        self.smoothed.clear();
    }
}

/// Symmetric Hann window
fn hann_window(size: usize) -> Vec<f32> {
    if size <= 1 {
        return vec![1.0; size];
    }
    let denom = (size - 1) as f32;
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / denom).cos()))
        .collect()
}

/// Index of the largest bin
pub fn peak_bin(spectrum: &[f32]) -> Option<usize> {
    spectrum
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i)
}
