//! Fixed-capacity circular store for interleaved capture samples
//!
//! The capture callback is the only writer; the analyzer and tests read the most
//! recent window. Every operation takes the same mutex and holds it only for the
//! memory copy, so the hardware callback never waits on anything slower than a
//! `memcpy` from a reader.

use std::sync::{Mutex, MutexGuard};

/// Circular buffer of interleaved `f32` frames with overwrite-on-full semantics
#[derive(Debug)]
pub struct RingBuffer {
    channels: u16,
    capacity: usize,
    /// Zero when the buffer was not created for a known stream format
    sample_rate: u32,
    inner: Mutex<RingState>,
}

#[derive(Debug)]
struct RingState {
    data: Vec<f32>,
    /// Next frame index to write
    cursor: usize,
    /// Number of valid frames (saturates at capacity)
    filled: usize,
    frames_written: u64,
    blocks_written: u64,
}

impl RingBuffer {
    /// Create a ring buffer holding `capacity` frames of `channels` samples each
    pub fn new(capacity: usize, channels: u16) -> Self {
        let capacity = capacity.max(1);
        let channels = channels.max(1);
        Self {
            channels,
            capacity,
            sample_rate: 0,
            inner: Mutex::new(RingState {
                data: vec![0.0; capacity * channels as usize],
                cursor: 0,
                filled: 0,
                frames_written: 0,
                blocks_written: 0,
            }),
        }
    }

    /// Create a ring buffer sized for `seconds` of audio at `sample_rate`
    pub fn with_duration(seconds: f32, sample_rate: u32, channels: u16) -> Self {
        Self::with_min_frames(seconds, sample_rate, channels, 0)
    }

    /// Like [`with_duration`](Self::with_duration), but holding at least `min_frames`
    pub fn with_min_frames(seconds: f32, sample_rate: u32, channels: u16, min_frames: usize) -> Self {
        let frames = (seconds.max(0.0) * sample_rate as f32).round() as usize;
        let frames = frames.max(min_frames);
        Self {
            sample_rate,
            ..Self::new(frames, channels)
        }
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Capacity in frames
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of valid frames currently stored
    pub fn len(&self) -> usize {
        self.lock().filled
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total frames written since creation
    pub fn frames_written(&self) -> u64 {
        self.lock().frames_written
    }

    /// Number of non-empty `write` calls since creation. The capture path splits
    /// large callbacks, so one callback may count more than once.
    pub fn blocks_written(&self) -> u64 {
        self.lock().blocks_written
    }

    /// Copy interleaved samples in at the cursor, wrapping and overwriting the oldest data.
    ///
    /// Trailing samples that do not form a whole frame are ignored. A block longer than
    /// the capacity keeps only its last `capacity` frames. Never allocates.
    pub fn write(&self, samples: &[f32]) {
        let ch = self.channels as usize;
        let mut frames = samples.len() / ch;
        if frames == 0 {
            return;
        }

        let mut src = &samples[..frames * ch];
        let total = frames as u64;
        if frames > self.capacity {
            src = &src[(frames - self.capacity) * ch..];
            frames = self.capacity;
        }

        let mut state = self.lock();
        let cursor = state.cursor;
        let first = frames.min(self.capacity - cursor);
        state.data[cursor * ch..(cursor + first) * ch].copy_from_slice(&src[..first * ch]);
        if first < frames {
            let rest = frames - first;
            state.data[..rest * ch].copy_from_slice(&src[first * ch..]);
        }

        state.cursor = (cursor + frames) % self.capacity;
        state.filled = (state.filled + frames).min(self.capacity);
        state.frames_written += total;
        state.blocks_written += 1;
    }

    /// Return a copy of the most recent `count` frames in chronological order.
    ///
    /// Returns fewer frames when the buffer has not filled yet; `count` is clamped to
    /// the capacity.
    pub fn read_latest(&self, count: usize) -> Vec<f32> {
        let mut out = Vec::new();
        self.read_latest_into(&mut out, count);
        out
    }

    /// Like [`read_latest`](Self::read_latest) but reuses `out`. Returns the number of
    /// frames copied.
    pub fn read_latest_into(&self, out: &mut Vec<f32>, count: usize) -> usize {
        let ch = self.channels as usize;
        out.clear();

        let state = self.lock();
        let frames = count.min(state.filled);
        if frames == 0 {
            return 0;
        }

        let start = (state.cursor + self.capacity - frames) % self.capacity;
        let first = frames.min(self.capacity - start);
        out.extend_from_slice(&state.data[start * ch..(start + first) * ch]);
        if first < frames {
            out.extend_from_slice(&state.data[..(frames - first) * ch]);
        }
        frames
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        // A panic while holding the lock cannot leave torn frames behind: the copy is
        // the only mutation, so the data is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
