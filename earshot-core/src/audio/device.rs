//! Input device enumeration and capability probing.

use serde::{Deserialize, Serialize};

/// Metadata about an audio input device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default input device.
    pub is_default: bool,
    /// Sample rate of the device's default input configuration (Hz).
    pub default_sample_rate: u32,
    /// Input channel count of the default configuration.
    pub input_channels: u16,
}

/// Sample rates tried, in order, when none is requested explicitly.
///
/// 44.1 kHz first: universally supported and what the downstream analysis
/// assumes by default.
pub const CANDIDATE_RATES: &[u32] = &[44_100, 48_000, 32_000, 22_050, 16_000, 11_025, 8_000];

/// List all input-capable devices that pass the capability probe.
///
/// Returns an empty `Vec` if cpal is not available or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    match host.input_devices() {
        Ok(devices) => devices
            .enumerate()
            .filter_map(|(idx, device)| {
                let config = probe_input(&device)?;
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                Some(DeviceInfo {
                    is_default: default_name.as_deref() == Some(name.as_str()),
                    name,
                    default_sample_rate: config.sample_rate().0,
                    input_channels: config.channels(),
                })
            })
            .collect(),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            Vec::new()
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

/// Open/close capability probe: a device qualifies when it reports a default
/// input configuration with a nonzero channel count.
#[cfg(feature = "audio-cpal")]
pub(crate) fn probe_input(device: &cpal::Device) -> Option<cpal::SupportedStreamConfig> {
    use cpal::traits::DeviceTrait;

    device
        .default_input_config()
        .ok()
        .filter(|config| config.channels() > 0)
}

/// Pick a working input configuration for `device`.
///
/// An explicitly requested rate must fall inside one of the device's supported
/// ranges; otherwise the candidate list is tried in order, then the device's
/// reported default rate. Fails with `NoValidConfiguration` when nothing fits.
#[cfg(feature = "audio-cpal")]
pub(crate) fn resolve_input_config(
    device: &cpal::Device,
    device_name: &str,
    requested_rate: Option<u32>,
) -> crate::error::Result<cpal::SupportedStreamConfig> {
    use cpal::traits::DeviceTrait;
    use cpal::SampleRate;

    use crate::error::EarshotError;

    let no_valid = || EarshotError::NoValidConfiguration {
        device: device_name.to_string(),
    };

    let ranges: Vec<_> = device
        .supported_input_configs()
        .map_err(|e| {
            tracing::warn!(device = device_name, "supported_input_configs failed: {e}");
            no_valid()
        })?
        .filter(|range| range.channels() > 0)
        .collect();

    let pick = |rate: u32| {
        ranges
            .iter()
            .find(|range| {
                range.min_sample_rate() <= SampleRate(rate)
                    && SampleRate(rate) <= range.max_sample_rate()
            })
            .map(|range| range.clone().with_sample_rate(SampleRate(rate)))
    };

    if let Some(rate) = requested_rate {
        return pick(rate).ok_or_else(no_valid);
    }

    if let Some(config) = CANDIDATE_RATES.iter().find_map(|rate| pick(*rate)) {
        return Ok(config);
    }

    // None of the candidates fit; fall back to whatever the device reports
    // as its default input configuration.
    probe_input(device).ok_or_else(no_valid)
}
