//! JSON bodies of the HTTP control surface

use crate::config::PipelineConfig;
use crate::state::{AppState, DeviceIdentity, RunStatus};
use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// Reply to every command endpoint
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
        }
    }
}

/// `POST /api/device`
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DeviceRequest {
    #[serde(default)]
    pub device_id: Option<usize>,
    #[serde(default)]
    pub device_name: Option<String>,
}

/// Metrics of the most recent snapshot
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LatestMetrics {
    pub frame_id: u64,
    pub timestamp: f64,
    pub rms: Vec<f32>,
    pub peak: Vec<f32>,
    pub correlation: Option<f32>,
    pub spectrum_len: usize,
}

/// `GET /api/state`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusResponse {
    pub status: RunStatus,
    pub last_error: Option<String>,
    pub device: Option<DeviceIdentity>,
    pub config: PipelineConfig,
    pub clients: usize,
    pub started_at: String,
    pub uptime_seconds: i64,
    pub version: u64,
    pub metrics: Option<LatestMetrics>,
}

impl StatusResponse {
    pub fn from_state(state: &AppState, now: Timestamp) -> Self {
        let uptime_seconds = now.duration_since(state.started_at).as_secs().max(0);

        Self {
            status: state.status,
            last_error: state.last_error.clone(),
            device: state.device.clone(),
            config: state.config.clone(),
            clients: state.clients,
            started_at: state.started_at.to_string(),
            uptime_seconds,
            version: state.version,
            metrics: state.snapshot.as_ref().map(|s| LatestMetrics {
                frame_id: s.id,
                timestamp: s.timestamp,
                rms: s.metrics.rms.clone(),
                peak: s.metrics.peak.clone(),
                correlation: s.metrics.correlation,
                spectrum_len: s.spectrum.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateStore;

    #[test]
    fn test_command_response_omits_absent_error() {
        let json = serde_json::to_string(&CommandResponse::ok()).unwrap();
        assert_eq!(json, r#"{"ok":true}"#);

        let json = serde_json::to_string(&CommandResponse::error("bad fft size")).unwrap();
        assert_eq!(json, r#"{"ok":false,"error":"bad fft size"}"#);
    }

    #[test]
    fn test_device_request_fields_are_optional() {
        let request: DeviceRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request, DeviceRequest::default());

        let request: DeviceRequest = serde_json::from_str(r#"{"device_name":"Loopback"}"#).unwrap();
        assert_eq!(request.device_name.as_deref(), Some("Loopback"));
    }

    #[test]
    fn test_status_response_roundtrip() {
        let store = StateStore::new(PipelineConfig::default());
        store.set_error("no input device");

        let state = store.get();
        let response = StatusResponse::from_state(&state, state.started_at);
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""status":"error""#));

        let parsed: StatusResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, response);
        assert_eq!(parsed.uptime_seconds, 0);
        assert!(parsed.metrics.is_none());
    }
}
