//! The analyzer driver contract.
//!
//! Every transport (binary serial/TCP, SCPI, vendor JSON API, sigrok, the
//! emulator) and the multi-device synchronizer implement [`AnalyzerDriver`].
//! Callers hold drivers as `Arc<dyn AnalyzerDriver>`.
//!
//! Capability getters have default implementations backed by the driver's
//! [`DriverState`] snapshot, so a transport only has to provide `state()` and
//! the I/O operations.
//!
//! # Lifecycle
//!
//! ```text
//! new(conn) ──► connect ──► start_capture ──► (completion) ──► disconnect
//!                  ▲              │                                 │
//!                  └──────────────┴──── stop_capture ◄──────────────┘
//! ```
//!
//! Calling `connect` on a connected driver is a caller error; check
//! `is_connected()` first.

use crate::capabilities::DeviceCapabilities;
use crate::capture::{CaptureLimits, CaptureMode, CaptureSession};
use crate::completion::{CaptureHandle, CaptureRejection};
use crate::error::ConnectError;
use crate::limits::CONNECT_TIMEOUT;
use crate::state::{DriverEvent, DriverState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Shared handle to any driver.
pub type SharedDriver = Arc<dyn AnalyzerDriver>;

// =============================================================================
// Supporting Types
// =============================================================================

/// Broad family of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverType {
    Serial,
    Network,
    Multi,
    Emulated,
}

impl fmt::Display for DriverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriverType::Serial => "serial",
            DriverType::Network => "network",
            DriverType::Multi => "multi",
            DriverType::Emulated => "emulated",
        };
        f.write_str(s)
    }
}

/// Options for `connect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Bound on transport setup and negotiation.
    pub timeout: Duration,
    /// Serial baud rate override.
    pub baud_rate: Option<u32>,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            timeout: CONNECT_TIMEOUT,
            baud_rate: None,
        }
    }
}

/// What `connect` learned about the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionResult {
    pub device_name: String,
    pub device_version: Option<String>,
    pub capabilities: DeviceCapabilities,
}

/// Snapshot returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub is_connected: bool,
    pub is_capturing: bool,
    /// Supply voltage for boards that report it.
    pub battery_voltage: Option<f32>,
}

/// Descriptive summary of a driver and its device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub driver_type: DriverType,
    pub version: Option<String>,
    pub channel_count: u32,
    pub max_frequency: u64,
    pub min_frequency: u64,
    pub blast_frequency: u64,
    pub buffer_size: u32,
    pub is_network: bool,
    pub modes: Vec<(CaptureMode, CaptureLimits)>,
}

// =============================================================================
// Driver Trait
// =============================================================================

/// Uniform control surface over one logic analyzer (or an ensemble of them).
#[async_trait]
pub trait AnalyzerDriver: Send + Sync {
    /// Connection/capture state shared with capture tasks.
    fn state(&self) -> &Arc<DriverState>;

    fn driver_type(&self) -> DriverType;

    /// True for drivers whose transport is a network socket.
    fn is_network(&self) -> bool;

    /// Human-readable driver name for logs and listings.
    fn name(&self) -> String {
        self.state()
            .device_name()
            .unwrap_or_else(|| self.driver_type().to_string())
    }

    fn device_version(&self) -> Option<String> {
        self.state().device_version()
    }

    fn capabilities(&self) -> Option<Arc<DeviceCapabilities>> {
        self.state().capabilities()
    }

    fn channel_count(&self) -> u32 {
        self.state().capability(0, |c| c.channel_count)
    }

    fn max_frequency(&self) -> u64 {
        self.state().capability(0, |c| c.max_frequency)
    }

    fn min_frequency(&self) -> u64 {
        self.state().capability(0, |c| c.min_frequency)
    }

    fn blast_frequency(&self) -> u64 {
        self.state().capability(0, |c| c.blast_frequency)
    }

    fn buffer_size(&self) -> u32 {
        self.state().capability(0, |c| c.buffer_size)
    }

    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    fn is_capturing(&self) -> bool {
        self.state().is_capturing()
    }

    /// Sample limits for a capture using `channels`.
    fn limits(&self, channels: &[u16]) -> CaptureLimits {
        CaptureLimits::for_mode(CaptureMode::for_channels(channels), self.buffer_size())
    }

    /// Open the transport and negotiate identity, version and capabilities.
    ///
    /// On failure the driver is left disconnected.
    async fn connect(&self, params: &ConnectionParams) -> Result<ConnectionResult, ConnectError>;

    /// Close the transport. Safe to call when already disconnected.
    async fn disconnect(&self);

    /// Validate, configure and arm a capture, returning once armed.
    ///
    /// The result arrives later through the returned handle.
    async fn start_capture(
        &self,
        session: CaptureSession,
    ) -> Result<CaptureHandle, CaptureRejection>;

    /// Request cancellation. `true` when idle or when the request was accepted.
    async fn stop_capture(&self) -> bool;

    /// Reboot into the firmware loader. Unsupported drivers return `false`.
    async fn enter_bootloader(&self) -> bool {
        false
    }

    async fn get_status(&self) -> DeviceStatus {
        DeviceStatus {
            is_connected: self.is_connected(),
            is_capturing: self.is_capturing(),
            battery_voltage: None,
        }
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.name(),
            driver_type: self.driver_type(),
            version: self.device_version(),
            channel_count: self.channel_count(),
            max_frequency: self.max_frequency(),
            min_frequency: self.min_frequency(),
            blast_frequency: self.blast_frequency(),
            buffer_size: self.buffer_size(),
            is_network: self.is_network(),
            modes: self
                .capabilities()
                .map(|c| c.mode_limits())
                .unwrap_or_default(),
        }
    }

    /// Lifecycle events for this driver.
    fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.state().subscribe()
    }
}
