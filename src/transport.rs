//! Wire format for analysis snapshots
//!
//! Every snapshot is pushed to WebSocket clients as one binary `AVF1` frame:
//! a fixed 24 byte little-endian header followed by `f32` payload arrays.
//!
//! ```text
//! magic        4 bytes   "AVF1"
//! frame_id     u32       snapshot id (low 32 bits)
//! timestamp    f64       seconds since pipeline start
//! channels     u16       C
//! td_len       u16       frames per channel in the time domain
//! spectrum_len u16       bins
//! reserved     u16       zero
//! rms          C x f32
//! peak         C x f32
//! correlation  f32       NaN when absent
//! time_domain  td_len x C x f32, interleaved
//! spectrum     spectrum_len x f32
//! ```

use thiserror::Error;

mod codec;

pub use codec::{WireFrame, decode_frame, encode_frame, frame_id};

pub const FRAME_MAGIC: &[u8; 4] = b"AVF1";
pub const HEADER_LEN: usize = 24;

/// Frame decoding error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Bad frame magic {0:?}")]
    BadMagic([u8; 4]),
    #[error("Frame truncated: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("Reserved header field is {0}, expected 0")]
    Reserved(u16),
    #[error("{0} unexpected trailing byte(s) after frame")]
    TrailingBytes(usize),
}
