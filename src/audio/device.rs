//! Audio device enumeration and lookup

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};

/// Device description for listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    /// `input:<name>` or `output:<name>`
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// Wrapper around a cpal device
pub struct AudioDevice {
    inner: cpal::Device,
    pub name: String,
}

impl AudioDevice {
    pub fn from_cpal(device: cpal::Device) -> Self {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        Self {
            inner: device,
            name,
        }
    }

    pub fn into_inner(self) -> cpal::Device {
        self.inner
    }

    pub fn default_input_config(&self) -> Result<cpal::SupportedStreamConfig, String> {
        self.inner.default_input_config().map_err(|e| e.to_string())
    }

    pub fn default_output_config(&self) -> Result<cpal::SupportedStreamConfig, String> {
        self.inner.default_output_config().map_err(|e| e.to_string())
    }
}

/// List all input and output devices of the default host
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(inputs) = host.input_devices() {
        for device in inputs {
            let Ok(name) = device.name() else { continue };
            let (sample_rates, channels) = capabilities(&device, true);
            devices.push(AudioDeviceInfo {
                id: format!("input:{}", name),
                is_default: default_input.as_ref() == Some(&name),
                name,
                is_input: true,
                is_output: false,
                sample_rates,
                channels,
            });
        }
    }

    if let Ok(outputs) = host.output_devices() {
        for device in outputs {
            let Ok(name) = device.name() else { continue };
            let (sample_rates, channels) = capabilities(&device, false);
            devices.push(AudioDeviceInfo {
                id: format!("output:{}", name),
                is_default: default_output.as_ref() == Some(&name),
                name,
                is_input: false,
                is_output: true,
                sample_rates,
                channels,
            });
        }
    }

    devices
}

fn capabilities(device: &cpal::Device, is_input: bool) -> (Vec<u32>, Vec<u16>) {
    let configs: Vec<cpal::SupportedStreamConfigRange> = if is_input {
        device
            .supported_input_configs()
            .map(|c| c.collect())
            .unwrap_or_default()
    } else {
        device
            .supported_output_configs()
            .map(|c| c.collect())
            .unwrap_or_default()
    };

    let mut rates = Vec::new();
    let mut channels = Vec::new();
    for config in configs {
        for rate in [16_000u32, 24_000, 44_100, 48_000] {
            let sr = cpal::SampleRate(rate);
            if sr >= config.min_sample_rate() && sr <= config.max_sample_rate() && !rates.contains(&rate) {
                rates.push(rate);
            }
        }
        if !channels.contains(&config.channels()) {
            channels.push(config.channels());
        }
    }
    rates.sort_unstable();
    channels.sort_unstable();
    (rates, channels)
}

/// Split `input:<name>` / `output:<name>`; bare names are taken as-is
fn parse_id(id: &str) -> &str {
    id.strip_prefix("input:")
        .or_else(|| id.strip_prefix("output:"))
        .unwrap_or(id)
}

/// Input device by id, or the host default
pub fn resolve_input(id: Option<&str>) -> Result<AudioDevice, String> {
    let host = cpal::default_host();
    match id {
        None => host
            .default_input_device()
            .map(AudioDevice::from_cpal)
            .ok_or_else(|| "no default input device".to_string()),
        Some(id) => {
            let wanted = parse_id(id);
            host.input_devices()
                .map_err(|e| e.to_string())?
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                .map(AudioDevice::from_cpal)
                .ok_or_else(|| format!("input device not found: {}", id))
        }
    }
}

/// Output device by id, or the host default
pub fn resolve_output(id: Option<&str>) -> Result<AudioDevice, String> {
    let host = cpal::default_host();
    match id {
        None => host
            .default_output_device()
            .map(AudioDevice::from_cpal)
            .ok_or_else(|| "no default output device".to_string()),
        Some(id) => {
            let wanted = parse_id(id);
            host.output_devices()
                .map_err(|e| e.to_string())?
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                .map(AudioDevice::from_cpal)
                .ok_or_else(|| format!("output device not found: {}", id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id("input:USB Mic"), "USB Mic");
        assert_eq!(parse_id("output:Speakers"), "Speakers");
        assert_eq!(parse_id("Line In"), "Line In");
    }

    #[test]
    fn test_list_devices_ids_are_prefixed() {
        // Hosts without audio hardware simply list nothing
        for device in list_devices() {
            assert!(device.id.starts_with("input:") || device.id.starts_with("output:"));
            assert_ne!(device.is_input, device.is_output);
        }
    }
}
