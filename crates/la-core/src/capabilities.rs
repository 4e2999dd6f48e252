//! Device capability descriptions.
//!
//! Capabilities come either from a static per-model table or from a live
//! capability response. A driver keeps one immutable snapshot and swaps it
//! wholesale when a newer authoritative answer arrives; snapshots are never
//! merged in place.

use crate::capture::{CaptureLimits, CaptureMode, TriggerType};
use serde::{Deserialize, Serialize};

/// What the trigger engine of a device can do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerCapabilities {
    pub types: Vec<TriggerType>,
    /// Widest pattern accepted by pattern triggers (0 if unsupported).
    pub max_pattern_width: u8,
    /// Whether sequential (multi-stage) triggers are available.
    pub sequential: bool,
}

impl Default for TriggerCapabilities {
    fn default() -> Self {
        Self {
            types: vec![TriggerType::Edge, TriggerType::None],
            max_pattern_width: 0,
            sequential: false,
        }
    }
}

/// How the device is reached.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Connectivity {
    /// Physical interfaces, e.g. `usb`, `ethernet`, `wifi`.
    pub interfaces: Vec<String>,
    /// Wire protocols, e.g. `binary`, `scpi`, `json-api`, `sigrok`.
    pub protocols: Vec<String>,
}

impl Connectivity {
    pub fn new(interfaces: &[&str], protocols: &[&str]) -> Self {
        Self {
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
            protocols: protocols.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Immutable capability snapshot for one connected device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub channel_count: u32,
    pub min_frequency: u64,
    pub max_frequency: u64,
    pub blast_frequency: u64,
    /// Buffer size in samples (8-channel grouping).
    pub buffer_size: u32,
    pub capture_modes: Vec<CaptureMode>,
    pub triggers: TriggerCapabilities,
    pub connectivity: Connectivity,
}

impl DeviceCapabilities {
    /// Floor of `max_frequency * 2 / 65535`, the slowest divider the sampling
    /// clock supports.
    pub fn derive_min_frequency(max_frequency: u64) -> u64 {
        max_frequency.saturating_mul(2) / 65_535
    }

    /// Limits for every capture mode this device supports.
    pub fn mode_limits(&self) -> Vec<(CaptureMode, CaptureLimits)> {
        self.capture_modes
            .iter()
            .map(|mode| (*mode, CaptureLimits::for_mode(*mode, self.buffer_size)))
            .collect()
    }

    /// Capture modes whose channel width fits in `channel_count`.
    pub fn modes_for_channel_count(channel_count: u32) -> Vec<CaptureMode> {
        CaptureMode::all()
            .into_iter()
            .filter(|m| u32::from(m.channel_count()) <= channel_count.max(8))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_frequency_derivation() {
        assert_eq!(DeviceCapabilities::derive_min_frequency(100_000_000), 3051);
        assert_eq!(DeviceCapabilities::derive_min_frequency(0), 0);
    }

    #[test]
    fn test_modes_for_channel_count() {
        assert_eq!(
            DeviceCapabilities::modes_for_channel_count(24),
            CaptureMode::all().to_vec()
        );
        assert_eq!(
            DeviceCapabilities::modes_for_channel_count(16),
            vec![CaptureMode::Channels8, CaptureMode::Channels16]
        );
        assert_eq!(
            DeviceCapabilities::modes_for_channel_count(4),
            vec![CaptureMode::Channels8]
        );
    }
}
