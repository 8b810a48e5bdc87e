//! Input device enumeration and selection

use super::CaptureError;
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, Host};
use serde::Serialize;

/// Information about an available audio input device
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// Position in the host's input device enumeration
    pub id: usize,
    pub name: String,
    pub max_input_channels: u16,
    pub default_sample_rate: u32,
    pub is_default: bool,
    /// Audio backend the device belongs to, e.g. "ALSA" or "CoreAudio"
    pub host_api: String,
}

/// Which device to open. Both fields empty means "host default".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSelector {
    pub id: Option<usize>,
    pub name: Option<String>,
}

/// List all input devices on the default host.
///
/// Devices that fail to report a name or configuration are skipped rather than
/// failing the whole listing.
pub fn list_input_devices() -> Result<Vec<DeviceInfo>, CaptureError> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    let host_api = host.id().name();

    let mut infos = Vec::new();
    for (id, device) in host.input_devices()?.enumerate() {
        match describe(id, &device, default_name.as_deref(), host_api) {
            Ok(Some(info)) => infos.push(info),
            Ok(None) => {}
            Err(e) => log::debug!("Skipping input device {}: {}", id, e),
        }
    }

    Ok(infos)
}

fn describe(
    id: usize,
    device: &Device,
    default_name: Option<&str>,
    host_api: &str,
) -> Result<Option<DeviceInfo>, CaptureError> {
    let name = device
        .name()
        .map_err(|e| CaptureError::Config(e.to_string()))?;

    let max_input_channels = device
        .supported_input_configs()
        .map_err(|e| CaptureError::Config(e.to_string()))?
        .map(|c| c.channels())
        .max()
        .unwrap_or(0);
    if max_input_channels == 0 {
        return Ok(None);
    }

    let default_sample_rate = device
        .default_input_config()
        .map(|c| c.sample_rate().0)
        .unwrap_or(48000);

    Ok(Some(DeviceInfo {
        id,
        is_default: default_name == Some(name.as_str()),
        name,
        max_input_channels,
        default_sample_rate,
        host_api: host_api.to_string(),
    }))
}

/// Open the device matching `selector`, falling back to the host default and then
/// to the first input device.
pub(crate) fn resolve_device(
    host: &Host,
    selector: &DeviceSelector,
) -> Result<(usize, Device, String), CaptureError> {
    let devices: Vec<(Device, String)> = host
        .input_devices()?
        .map(|d| {
            let name = d.name().unwrap_or_else(|_| "Unknown Device".to_string());
            (d, name)
        })
        .collect();

    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    let names: Vec<&str> = devices.iter().map(|(_, name)| name.as_str()).collect();

    let index = pick_device(&names, selector, default_name.as_deref())
        .ok_or(CaptureError::NoInputDevice)?;

    if selector.id.is_some_and(|id| id != index)
        || selector.name.as_deref().is_some_and(|name| name != names[index])
    {
        log::warn!(
            "Requested input device {:?} not available, falling back to '{}'",
            selector,
            names[index]
        );
    }

    let (device, name) = devices
        .into_iter()
        .nth(index)
        .ok_or(CaptureError::NoInputDevice)?;
    Ok((index, device, name))
}

/// Resolution order: id, then exact name, then host default, then first device
fn pick_device(names: &[&str], selector: &DeviceSelector, default_name: Option<&str>) -> Option<usize> {
    if names.is_empty() {
        return None;
    }

    if let Some(id) = selector.id
        && id < names.len()
    {
        return Some(id);
    }

    let by_name = |wanted: &str| names.iter().position(|&name| name == wanted);

    selector
        .name
        .as_deref()
        .and_then(by_name)
        .or_else(|| default_name.and_then(by_name))
        .or(Some(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAMES: [&str; 3] = ["Built-in Mic", "USB Interface", "Loopback"];

    #[test]
    fn test_pick_by_id() {
        let selector = DeviceSelector {
            id: Some(2),
            name: Some("USB Interface".to_string()),
        };
        assert_eq!(pick_device(&NAMES, &selector, None), Some(2));
    }

    #[test]
    fn test_stale_id_falls_back_to_name() {
        let selector = DeviceSelector {
            id: Some(7),
            name: Some("USB Interface".to_string()),
        };
        assert_eq!(pick_device(&NAMES, &selector, Some("Loopback")), Some(1));
    }

    #[test]
    fn test_unknown_device_falls_back_to_default_then_first() {
        let selector = DeviceSelector {
            id: None,
            name: Some("Unplugged Headset".to_string()),
        };
        assert_eq!(pick_device(&NAMES, &selector, Some("Loopback")), Some(2));
        assert_eq!(pick_device(&NAMES, &selector, Some("Gone")), Some(0));
        assert_eq!(pick_device(&NAMES, &DeviceSelector::default(), None), Some(0));
    }

    #[test]
    fn test_no_devices() {
        assert_eq!(pick_device(&[], &DeviceSelector::default(), None), None);
    }

    #[test]
    fn test_device_info_json_includes_host_api() {
        let info = DeviceInfo {
            id: 0,
            name: "Built-in Mic".to_string(),
            max_input_channels: 2,
            default_sample_rate: 48000,
            is_default: true,
            host_api: "ALSA".to_string(),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["host_api"], "ALSA");
        assert_eq!(json["max_input_channels"], 2);
    }
}
