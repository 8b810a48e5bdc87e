//! Spectral analysis of the captured signal
//!
//! The analyzer wakes on its own timer, independent of the hardware callback rate,
//! reads the most recent FFT window from the ring buffer and publishes one
//! [`AnalysisSnapshot`] per cycle to the state store.
//!
//! Gain is applied to spectrum magnitudes only at publication. RMS, peak and
//! correlation are always computed on the raw samples, and the smoothing history is
//! kept pre-gain, so gain can change live without disturbing either.

mod metrics;
mod spectrum;

pub use metrics::{channel_levels, correlation};
pub use spectrum::{SpectrumAnalyzer, peak_bin};

use crate::audio::{RingBuffer, RingSlot};
use crate::config::PipelineConfig;
use crate::state::StateStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Time-domain metrics for one analysis window
#[derive(Serialize, Debug, Clone, PartialEq, Default)]
pub struct Metrics {
    /// Per-channel root-mean-square amplitude (linear)
    pub rms: Vec<f32>,
    /// Per-channel maximum absolute amplitude (linear)
    pub peak: Vec<f32>,
    /// Correlation of the first two channels; absent for mono or silent input
    pub correlation: Option<f32>,
}

/// One published analysis cycle
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisSnapshot {
    /// Strictly increasing for the lifetime of the analyzer
    pub id: u64,
    /// Seconds since the pipeline started
    pub timestamp: f64,
    pub channels: u16,
    pub sample_rate: u32,
    /// Frames per channel in `time_domain`
    pub time_domain_len: usize,
    /// Interleaved, subsampled copy of the analysis window
    pub time_domain: Vec<f32>,
    /// Linear magnitudes, `fft_size / 2 + 1` bins, gain applied
    pub spectrum: Vec<f32>,
    pub metrics: Metrics,
}

/// The subset of the pipeline configuration the analyzer consumes
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumConfig {
    pub fft_size: usize,
    pub fps_cap: u32,
    pub smoothing: f32,
    pub gain: f32,
    pub time_domain_len: usize,
}

impl From<&PipelineConfig> for SpectrumConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            fft_size: config.fft_size,
            fps_cap: config.fps_cap,
            smoothing: config.smoothing,
            gain: config.gain,
            time_domain_len: config.time_domain_len.min(config.fft_size),
        }
    }
}

impl SpectrumConfig {
    fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps_cap.max(1)))
    }
}

pub struct Analyzer {
    store: Arc<StateStore>,
    ring: RingSlot,
    config_rx: watch::Receiver<SpectrumConfig>,
    config: SpectrumConfig,
    spectrum: SpectrumAnalyzer,
    clock: Instant,
    next_id: u64,
    last_seen: Option<(Arc<RingBuffer>, u64)>,
    last_update: Option<Instant>,
    window: Vec<f32>,
    mono: Vec<f32>,
}

impl Analyzer {
    /// `clock` is the pipeline start; snapshot timestamps are relative to it
    pub fn new(
        store: Arc<StateStore>,
        ring: RingSlot,
        mut config_rx: watch::Receiver<SpectrumConfig>,
        clock: Instant,
    ) -> Self {
        let config = config_rx.borrow_and_update().clone();
        Self {
            store,
            ring,
            spectrum: SpectrumAnalyzer::new(config.fft_size),
            config,
            config_rx,
            clock,
            next_id: 1,
            last_seen: None,
            last_update: None,
            window: Vec::new(),
            mono: Vec::new(),
        }
    }

    /// Run analysis cycles until `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut period = self.config.period();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        log::debug!("Analyzer running at {:?} per cycle", period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(Instant::now());

                    let next = self.config.period();
                    if next != period {
                        period = next;
                        ticker = tokio::time::interval(period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    }
                }
            }
        }

        log::debug!("Analyzer stopped");
    }

    /// Run one cycle and publish its snapshot, if any.
    ///
    /// Holds (returns `None`) while no ring buffer is installed, while fewer than one
    /// FFT window of frames has been captured, or when nothing new arrived since the
    /// previous cycle.
    pub fn tick(&mut self, now: Instant) -> Option<Arc<AnalysisSnapshot>> {
        self.refresh_config();

        let ring = self.ring.get()?;
        let written = ring.frames_written();
        if let Some((last_ring, last_written)) = &self.last_seen
            && Arc::ptr_eq(last_ring, &ring)
            && *last_written == written
        {
            return None;
        }

        let n = self.config.fft_size;
        if ring.read_latest_into(&mut self.window, n) < n {
            return None;
        }
        self.last_seen = Some((Arc::clone(&ring), written));

        let elapsed = self.last_update.map(|t| now.saturating_duration_since(t));
        self.last_update = Some(now);

        let snapshot = Arc::new(self.analyze(ring.channels(), ring.sample_rate(), now, elapsed));
        self.store.publish(Arc::clone(&snapshot));
        Some(snapshot)
    }

    fn analyze(
        &mut self,
        channels: u16,
        sample_rate: u32,
        now: Instant,
        elapsed: Option<Duration>,
    ) -> AnalysisSnapshot {
        let ch = channels.max(1) as usize;

        for sample in self.window.iter_mut() {
            if !sample.is_finite() {
                *sample = 0.0;
            }
        }

        let (rms, peak) = channel_levels(&self.window, ch);
        let correlation = correlation(&self.window, ch);

        self.mono.clear();
        self.mono.extend(
            self.window
                .chunks_exact(ch)
                .map(|frame| frame.iter().sum::<f32>() / ch as f32),
        );

        let gain = self.config.gain;
        let spectrum = self
            .spectrum
            .process(&self.mono, self.config.smoothing, elapsed)
            .iter()
            .map(|&m| m * gain)
            .collect();

        let (time_domain, time_domain_len) =
            subsample(&self.window, ch, self.config.time_domain_len);

        let id = self.next_id;
        self.next_id += 1;

        AnalysisSnapshot {
            id,
            timestamp: now.saturating_duration_since(self.clock).as_secs_f64(),
            channels: ch as u16,
            sample_rate,
            time_domain_len,
            time_domain,
            spectrum,
            metrics: Metrics {
                rms,
                peak,
                correlation,
            },
        }
    }

    fn refresh_config(&mut self) {
        if !self.config_rx.has_changed().unwrap_or(false) {
            return;
        }

        let next = self.config_rx.borrow_and_update().clone();
        if next.fft_size != self.spectrum.fft_size() {
            self.spectrum = SpectrumAnalyzer::new(next.fft_size);
            // Force a fresh read at the new window size
            self.last_seen = None;
        }
        self.config = next;
    }
}

/// Keep at most `target` frames, evenly strided and ending at the newest frame
fn subsample(window: &[f32], channels: usize, target: usize) -> (Vec<f32>, usize) {
    let frames = window.len() / channels;
    let target = target.max(1);
    let stride = (frames / target).max(1);
    let count = (frames / stride).min(target);
    let start = frames - count * stride;

    let mut out = Vec::with_capacity(count * channels);
    for i in 0..count {
        let frame = start + i * stride + (stride - 1);
        out.extend_from_slice(&window[frame * channels..(frame + 1) * channels]);
    }
    (out, count)
}
