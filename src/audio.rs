//! Audio input
//!
//! Device enumeration, the capture engine that owns the cpal input stream, and the
//! ring buffer the hardware callback writes into.

mod capture;
mod devices;
mod ring_buffer;

pub use capture::{ActiveDevice, CaptureEngine, CaptureRequest, ChannelMapper};
pub use devices::{DeviceInfo, DeviceSelector, list_input_devices};
pub use ring_buffer::RingBuffer;

use crate::state::RunStatus;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Capture error types
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No input devices found")]
    NoInputDevice,
    #[error("Failed to enumerate input devices: {0}")]
    Enumerate(#[from] cpal::DevicesError),
    #[error("Failed to query device configuration: {0}")]
    Config(String),
    #[error("Unsupported sample format: {0}")]
    UnsupportedFormat(String),
    #[error("Failed to open input stream: {0}")]
    Build(#[from] cpal::BuildStreamError),
    #[error("Failed to start input stream: {0}")]
    Play(#[from] cpal::PlayStreamError),
    #[error("Cannot {action} while capture is {}", .phase.as_str())]
    InvalidTransition {
        action: &'static str,
        phase: RunStatus,
    },
    #[error("Capture thread failed: {0}")]
    Thread(String),
}

/// Shared handle to the ring buffer of the currently open stream.
///
/// The capture engine installs a freshly sized buffer on every start and clears it
/// on stop; the analyzer picks up whichever buffer is current on each cycle.
#[derive(Clone, Default, Debug)]
pub struct RingSlot(Arc<RwLock<Option<Arc<RingBuffer>>>>);

impl RingSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<RingBuffer>> {
        match self.0.read() {
            Ok(ring) => ring.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn install(&self, ring: Arc<RingBuffer>) {
        self.replace(Some(ring));
    }

    pub fn clear(&self) {
        self.replace(None);
    }

    fn replace(&self, ring: Option<Arc<RingBuffer>>) {
        match self.0.write() {
            Ok(mut slot) => *slot = ring,
            Err(poisoned) => *poisoned.into_inner() = ring,
        }
    }
}
