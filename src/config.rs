//! Resolved pipeline options
//!
//! The service only consumes resolved values: defaults, an optional read-only
//! `config.toml`, and command-line overrides are merged in `main`, then clamped and
//! validated here before anything touches the audio device.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8787;

pub const MIN_FFT_SIZE: usize = 256;
pub const MAX_FFT_SIZE: usize = 16384;
pub const MAX_CHANNELS: u16 = 8;

pub const MIN_GAIN: f32 = 0.2;
pub const MAX_GAIN: f32 = 4.0;
pub const MAX_SMOOTHING: f32 = 0.95;

/// Configuration errors rejected at the reconfiguration boundary
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("FFT size must be a power of two between {MIN_FFT_SIZE} and {MAX_FFT_SIZE}, got {0}")]
    InvalidFftSize(usize),
    #[error("channel count must be between 1 and {MAX_CHANNELS}, got {0}")]
    InvalidChannels(u16),
    #[error("sample rate must be non-zero")]
    ZeroSampleRate,
    #[error("{0} must be a finite number")]
    NotFinite(&'static str),
    #[error("FFT size {fft_size} exceeds the {frames} frame capture buffer")]
    BufferTooShort { fft_size: usize, frames: usize },
}

/// Options consumed by the capture engine and the spectral analyzer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Input device index as reported by `devices`
    pub device_id: Option<usize>,
    /// Input device name, used when the index no longer matches
    pub device_name: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
    pub fft_size: usize,
    /// Upper bound on analysis cycles per second
    pub fps_cap: u32,
    /// Linear multiplier applied to published spectrum magnitudes
    pub gain: f32,
    /// Per-bin exponential smoothing factor at a 60 Hz reference cadence
    pub smoothing: f32,
    /// Frames per channel in the transported time-domain window; the analyzer
    /// never sends more than `fft_size`
    pub time_domain_len: usize,
    /// Ring buffer depth
    pub buffer_seconds: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            device_name: None,
            sample_rate: 48000,
            channels: 1,
            fft_size: 2048,
            fps_cap: 60,
            gain: 1.0,
            smoothing: 0.65,
            time_domain_len: 1024,
            buffer_seconds: 4.0,
        }
    }
}

impl PipelineConfig {
    /// Clamp tunables into their recognized ranges.
    ///
    /// Structural values (FFT size, channel count, sample rate) are left alone so
    /// [`validate`](Self::validate) can reject them.
    pub fn clamped(mut self) -> Self {
        if self.gain.is_finite() {
            self.gain = self.gain.clamp(MIN_GAIN, MAX_GAIN);
        }
        if self.smoothing.is_finite() {
            self.smoothing = self.smoothing.clamp(0.0, MAX_SMOOTHING);
        }
        if self.buffer_seconds.is_finite() {
            self.buffer_seconds = self.buffer_seconds.clamp(1.0, 10.0);
        }
        self.fps_cap = self.fps_cap.clamp(10, 120);
        self.time_domain_len = self.time_domain_len.clamp(64, MAX_FFT_SIZE);
        if self.sample_rate > 0 {
            self.sample_rate = self.sample_rate.clamp(8000, 192_000);
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.fft_size.is_power_of_two()
            || !(MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&self.fft_size)
        {
            return Err(ConfigError::InvalidFftSize(self.fft_size));
        }
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(ConfigError::InvalidChannels(self.channels));
        }
        if self.sample_rate == 0 {
            return Err(ConfigError::ZeroSampleRate);
        }
        if !self.gain.is_finite() {
            return Err(ConfigError::NotFinite("gain"));
        }
        if !self.smoothing.is_finite() {
            return Err(ConfigError::NotFinite("smoothing"));
        }
        if !self.buffer_seconds.is_finite() {
            return Err(ConfigError::NotFinite("buffer_seconds"));
        }
        let frames = self.buffer_frames();
        if self.fft_size > frames {
            return Err(ConfigError::BufferTooShort {
                fft_size: self.fft_size,
                frames,
            });
        }
        Ok(())
    }

    /// Frames the capture buffer holds at the configured rate
    pub fn buffer_frames(&self) -> usize {
        (self.buffer_seconds.max(0.0) * self.sample_rate as f32).round() as usize
    }

    /// Merge a partial update, clamp, and validate the result
    pub fn apply(&self, update: &ConfigUpdate) -> Result<Self, ConfigError> {
        let mut next = self.clone();
        // A device selection replaces the previous one as a whole
        if update.device_id.is_some() || update.device_name.is_some() {
            next.device_id = update.device_id;
            next.device_name = update.device_name.clone();
        }
        if let Some(rate) = update.sample_rate {
            next.sample_rate = rate;
        }
        if let Some(channels) = update.channels {
            next.channels = channels;
        }
        if let Some(fft_size) = update.fft_size {
            next.fft_size = fft_size;
        }
        if let Some(fps_cap) = update.fps_cap {
            next.fps_cap = fps_cap;
        }
        if let Some(gain) = update.gain {
            next.gain = gain;
        }
        if let Some(smoothing) = update.smoothing {
            next.smoothing = smoothing;
        }

        let next = next.clamped();
        next.validate()?;
        Ok(next)
    }

    /// Whether switching to `other` requires reopening the input stream
    pub fn needs_capture_restart(&self, other: &PipelineConfig) -> bool {
        self.device_id != other.device_id
            || self.device_name != other.device_name
            || self.sample_rate != other.sample_rate
            || self.channels != other.channels
            || self.buffer_seconds != other.buffer_seconds
    }
}

/// Partial configuration change, as accepted by the reconfiguration command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fft_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps_cap: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gain: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smoothing: Option<f32>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Listener address for the HTTP/WebSocket surface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// Contents of `config.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub audio: PipelineConfig,
}

impl Settings {
    /// Load settings from `path`, or from the default location when `None`.
    ///
    /// Returns defaults if the file is missing or fails to parse; the file is never
    /// written back.
    pub fn load(path: Option<&Path>) -> Self {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match config_path() {
                Some(path) => path,
                None => {
                    log::warn!("Could not determine config directory, using defaults");
                    return Self::default();
                }
            },
        };

        match fs::read_to_string(&path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(settings) => {
                    log::info!("Loaded settings from {}", path.display());
                    settings
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                log::debug!("No config file at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

/// Default settings location, e.g. `~/.config/vizhost/config.toml`
pub fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "vizhost").map(|dirs| dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(PipelineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_rejects_non_power_of_two_fft() {
        let config = PipelineConfig {
            fft_size: 1000,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidFftSize(1000)));

        let config = PipelineConfig {
            fft_size: 32768,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidFftSize(32768)));
    }

    #[test]
    fn test_rejects_zero_channels() {
        let update = ConfigUpdate {
            channels: Some(0),
            ..Default::default()
        };
        let result = PipelineConfig::default().apply(&update);
        assert_eq!(result, Err(ConfigError::InvalidChannels(0)));
    }

    #[test]
    fn test_apply_clamps_gain_and_smoothing() {
        let update = ConfigUpdate {
            gain: Some(10.0),
            smoothing: Some(0.99),
            ..Default::default()
        };
        let config = PipelineConfig::default().apply(&update).unwrap();
        assert_eq!(config.gain, MAX_GAIN);
        assert_eq!(config.smoothing, MAX_SMOOTHING);

        let update = ConfigUpdate {
            gain: Some(0.0),
            smoothing: Some(-1.0),
            ..Default::default()
        };
        let config = PipelineConfig::default().apply(&update).unwrap();
        assert_eq!(config.gain, MIN_GAIN);
        assert_eq!(config.smoothing, 0.0);
    }

    #[test]
    fn test_apply_rejects_nan_gain() {
        let update = ConfigUpdate {
            gain: Some(f32::NAN),
            ..Default::default()
        };
        assert_eq!(
            PipelineConfig::default().apply(&update),
            Err(ConfigError::NotFinite("gain"))
        );
    }

    #[test]
    fn test_rejects_fft_longer_than_buffer() {
        let config = PipelineConfig {
            sample_rate: 8000,
            buffer_seconds: 1.0,
            fft_size: 16384,
            ..Default::default()
        };
        assert_eq!(
            config.clone().clamped().validate(),
            Err(ConfigError::BufferTooShort {
                fft_size: 16384,
                frames: 8000
            })
        );

        let update = ConfigUpdate {
            fft_size: Some(8192),
            ..Default::default()
        };
        assert!(config.apply(&update).is_ok());
    }

    #[test]
    fn test_time_domain_len_survives_fft_round_trip() {
        let base = PipelineConfig::default();
        let small = base
            .apply(&ConfigUpdate {
                fft_size: Some(256),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(small.time_domain_len, 1024);

        let back = small
            .apply(&ConfigUpdate {
                fft_size: Some(2048),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(back.time_domain_len, 1024);
    }

    #[test]
    fn test_capture_restart_only_for_format_changes() {
        let base = PipelineConfig::default();

        let tuned = base
            .apply(&ConfigUpdate {
                gain: Some(2.0),
                fft_size: Some(4096),
                ..Default::default()
            })
            .unwrap();
        assert!(!base.needs_capture_restart(&tuned));

        let stereo = base
            .apply(&ConfigUpdate {
                channels: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert!(base.needs_capture_restart(&stereo));
    }

    #[test]
    fn test_device_selection_replaces_previous() {
        let base = PipelineConfig {
            device_id: Some(3),
            ..Default::default()
        };
        let by_name = base
            .apply(&ConfigUpdate {
                device_name: Some("USB Interface".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_name.device_id, None);
        assert_eq!(by_name.device_name.as_deref(), Some("USB Interface"));

        let untouched = by_name
            .apply(&ConfigUpdate {
                gain: Some(1.5),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(untouched.device_name.as_deref(), Some("USB Interface"));
    }

    #[test]
    fn test_parse_partial_settings() {
        let settings = Settings::parse(
            r#"
            [server]
            port = 9000

            [audio]
            channels = 2
            fft_size = 4096
            "#,
        )
        .unwrap();

        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.host, DEFAULT_HOST);
        assert_eq!(settings.audio.channels, 2);
        assert_eq!(settings.audio.fft_size, 4096);
        assert_eq!(settings.audio.sample_rate, 48000);
    }
}
