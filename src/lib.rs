//! Real-time audio analysis service
//!
//! Captures an input device, computes spectrum and level metrics on a fixed
//! cadence, and streams them to WebSocket clients as binary `AVF1` frames.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod pipeline;
pub mod protocol;
pub mod server;
pub mod state;
pub mod transport;
